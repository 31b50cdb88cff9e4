//! Parsing and rewriting of `vless://`, `vmess://` and `trojan://` share links.
//!
//! A link is used as a template: every discovered edge address is written back
//! into it, producing a ready-to-use link for that address.
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::{Map, Value};
use thiserror::Error;
use url::{Host, Url};

use crate::scanner::http::is_https_port;

const DEFAULT_PORT: u16 = 443;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Vless,
    Vmess,
    Trojan,
}

impl Protocol {
    fn scheme(self) -> &'static str {
        match self {
            Self::Vless => "vless",
            Self::Vmess => "vmess",
            Self::Trojan => "trojan",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

#[derive(Debug, Error)]
pub enum TunnelParseError {
    #[error("empty tunnel config")]
    Empty,
    #[error("unsupported scheme in '{0}', expected vless://, vmess:// or trojan://")]
    Scheme(String),
    #[error("missing '<credential>@' before the host")]
    MissingCredential,
    #[error("missing host")]
    MissingHost,
    #[error("invalid port in '{0}'")]
    Port(String),
    #[error("malformed link: {0}")]
    Url(url::ParseError),
    #[error("vmess payload is not base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("vmess payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("vmess payload is not a JSON object")]
    NotAnObject,
}

/// What `rebuild` rewrites.
#[derive(Debug, Clone, PartialEq)]
enum Template {
    Uri(Url),
    /// The full vmess document.
    Vmess(Map<String, Value>),
}

/// A parsed tunnel share link.
#[derive(Debug, Clone, PartialEq)]
pub struct TunnelConfig {
    protocol: Protocol,
    host: String,
    port: u16,
    /// Query parameters in their original order. For vmess these are the
    /// string and number fields of the JSON document.
    params: Vec<(String, String)>,
    fragment: String,
    template: Template,
}

impl FromStr for TunnelConfig {
    type Err = TunnelParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let input = input.trim();
        if input.is_empty() {
            return Err(TunnelParseError::Empty);
        }
        if let Some(encoded) = input.strip_prefix("vmess://") {
            return parse_vmess(encoded);
        }

        let protocol = match input.split_once("://").map(|(scheme, _)| scheme) {
            Some("vless") => Protocol::Vless,
            Some("trojan") => Protocol::Trojan,
            _ => return Err(TunnelParseError::Scheme(input.to_owned())),
        };
        parse_uri(protocol, input)
    }
}

/// `scheme://credential@host:port?query#fragment`
fn parse_uri(protocol: Protocol, input: &str) -> Result<TunnelConfig, TunnelParseError> {
    let url = Url::parse(input).map_err(|e| match e {
        url::ParseError::InvalidPort => TunnelParseError::Port(input.to_owned()),
        url::ParseError::EmptyHost => TunnelParseError::MissingHost,
        other => TunnelParseError::Url(other),
    })?;
    if url.username().is_empty() {
        return Err(TunnelParseError::MissingCredential);
    }

    let host = match url.host() {
        Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_owned(),
        Some(Host::Ipv4(ip)) => ip.to_string(),
        Some(Host::Ipv6(ip)) => ip.to_string(),
        _ => return Err(TunnelParseError::MissingHost),
    };
    let params = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    Ok(TunnelConfig {
        protocol,
        host,
        port: url.port().unwrap_or(DEFAULT_PORT),
        params,
        fragment: url.fragment().unwrap_or_default().to_owned(),
        template: Template::Uri(url),
    })
}

fn parse_vmess(encoded: &str) -> Result<TunnelConfig, TunnelParseError> {
    let mut padded = encoded.trim_end_matches('=').to_owned();
    while padded.len() % 4 != 0 {
        padded.push('=');
    }
    let decoded = STANDARD.decode(padded)?;
    let Value::Object(document) = serde_json::from_slice(&decoded)? else {
        return Err(TunnelParseError::NotAnObject);
    };

    let text = |key: &str| document.get(key).and_then(value_text).unwrap_or_default();
    let port = match document.get("port") {
        None => DEFAULT_PORT,
        Some(value) => {
            let raw = value_text(value).unwrap_or_default();
            raw.parse().map_err(|_| TunnelParseError::Port(raw))?
        }
    };

    let mut params: Vec<(String, String)> = document
        .iter()
        .filter_map(|(k, v)| value_text(v).map(|v| (k.clone(), v)))
        .collect();
    // vmess keeps the transport security under "tls".
    if let Some(tls) = document.get("tls").and_then(value_text) {
        params.push(("security".to_owned(), tls));
    }

    Ok(TunnelConfig {
        protocol: Protocol::Vmess,
        host: text("add"),
        port,
        params,
        fragment: text("ps"),
        template: Template::Vmess(document),
    })
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl TunnelConfig {
    pub const fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub const fn port(&self) -> u16 {
        self.port
    }

    /// First value of a query parameter; empty values count as absent.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .filter(|v| !v.is_empty())
    }

    /// `sni`, else `host`, else the probed address itself.
    pub fn server_name(&self, addr: IpAddr) -> String {
        self.param("sni")
            .or_else(|| self.param("host"))
            .map_or_else(|| addr.to_string(), str::to_owned)
    }

    pub fn is_tls(&self) -> bool {
        self.param("security") == Some("tls") || is_https_port(self.port)
    }

    /// The same link pointing at `addr`.
    ///
    /// ```rust
    /// # use cdnscan::tunnel::TunnelConfig;
    /// let config: TunnelConfig = "trojan://pw@old.example:443?security=tls#edge".parse().unwrap();
    /// let rebuilt = config.rebuild("104.16.0.9".parse().unwrap());
    /// assert_eq!(rebuilt, "trojan://pw@104.16.0.9:443?security=tls#edge");
    /// ```
    pub fn rebuild(&self, addr: IpAddr) -> String {
        match &self.template {
            Template::Vmess(document) => {
                let mut document = document.clone();
                document.insert("add".to_owned(), Value::String(addr.to_string()));
                let json = Value::Object(document).to_string();
                format!("vmess://{}", STANDARD.encode(json))
            }
            Template::Uri(url) => {
                let mut url = url.clone();
                // Only links without a host refuse a new one, and parsing
                // already rejected those.
                if url.set_ip_host(addr).is_ok() {
                    let _ = url.set_port(Some(self.port));
                }
                url.into()
            }
        }
    }
}

impl fmt::Display for TunnelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}:{}", self.protocol, self.host, self.port)
    }
}
