//! Minimal HTTP/1.1 client used to hit the trace endpoint of an edge node.
//!
//! The connection goes to the literal address while the `Host` header (and
//! TLS server name) carry the well-known hostname, so a keep-alive session
//! can be reused across consecutive attempts.
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;

use log::trace;
use once_cell::sync::Lazy;
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, ServerName};
use tokio::io::{self, AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

/// Diagnostic endpoint answered by every edge node.
pub const TRACE_PATH: &str = "/cdn-cgi/trace";
/// Hostname that makes the node answer for the CDN itself.
pub const TRACE_HOST: &str = "www.cloudflare.com";
/// Ports the edge terminates TLS on.
pub const HTTPS_PORTS: [u16; 6] = [443, 8443, 2053, 2083, 2087, 2096];

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";
const MAX_HEADER_LINES: usize = 100;
const MAX_BODY_BYTES: usize = 1 << 20;

pub fn is_https_port(port: u16) -> bool {
    HTTPS_PORTS.contains(&port)
}

pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// Edge nodes are addressed by IP, so their certificates are not checked.
struct AcceptAnyCertificate;

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

static TLS: Lazy<TlsConnector> = Lazy::new(|| {
    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
});

/// Opens a TCP connection, wrapped in TLS when `server_name` is given.
pub async fn open(addr: SocketAddr, server_name: Option<&ServerName>) -> io::Result<Box<dyn Stream>> {
    let tcp = TcpStream::connect(addr).await?;
    tcp.set_nodelay(true)?;
    match server_name {
        Some(name) => {
            let tls = TLS.connect(name.clone(), tcp).await?;
            Ok(Box::new(tls))
        }
        None => Ok(Box::new(tcp)),
    }
}

/// Builds a `GET` request for `path` with the given `Host` header.
pub fn request(path: &str, host: &str, keep_alive: bool) -> String {
    let connection = if keep_alive { "keep-alive" } else { "close" };
    format!(
        "GET {path} HTTP/1.1\r\nHost: {host}\r\nUser-Agent: {USER_AGENT}\r\nAccept: */*\r\nAccept-Encoding: identity\r\nConnection: {connection}\r\n\r\n"
    )
}

/// Why an exchange did not produce a response.
#[derive(Debug)]
pub enum ExchangeError {
    /// Connect, TLS or socket failure.
    Network(io::Error),
    /// The peer answered, but not with something we could parse.
    Protocol(String),
}

impl From<io::Error> for ExchangeError {
    fn from(e: io::Error) -> Self {
        Self::Network(e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub body_len: usize,
    keep_alive: bool,
}

/// A keep-alive session against one `address:port`.
pub struct Session {
    addr: SocketAddr,
    host: String,
    server_name: Option<ServerName>,
    conn: Option<BufReader<Box<dyn Stream>>>,
}

impl Session {
    pub fn new(addr: SocketAddr, host: &str, server_name: Option<ServerName>) -> Self {
        Self {
            addr,
            host: host.to_owned(),
            server_name,
            conn: None,
        }
    }

    /// Sends one `GET`, reusing the open connection when there is one.
    ///
    /// A reused connection that turns out to be closed is replaced once
    /// before giving up.
    pub async fn get(&mut self, path: &str) -> Result<Response, ExchangeError> {
        if let Some(conn) = self.conn.take() {
            match self.exchange(conn, path).await {
                Err(ExchangeError::Network(e)) => {
                    trace!("Stale connection to {}: {e}, reconnecting", self.addr);
                }
                result => return result,
            }
        }

        let conn = BufReader::new(open(self.addr, self.server_name.as_ref()).await?);
        self.exchange(conn, path).await
    }

    async fn exchange(
        &mut self,
        mut conn: BufReader<Box<dyn Stream>>,
        path: &str,
    ) -> Result<Response, ExchangeError> {
        conn.write_all(request(path, &self.host, true).as_bytes()).await?;
        conn.flush().await?;

        let response = read_response(&mut conn).await?;
        if response.keep_alive {
            self.conn = Some(conn);
        }
        Ok(response)
    }
}

/// Reads one response, consuming its body so the connection can be reused.
pub async fn read_response<R>(conn: &mut R) -> Result<Response, ExchangeError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    if conn.read_line(&mut line).await? == 0 {
        return Err(ExchangeError::Network(io::ErrorKind::UnexpectedEof.into()));
    }
    let status = parse_status_line(&line)?;

    let mut content_length = None;
    let mut chunked = false;
    let mut keep_alive = true;
    for _ in 0..MAX_HEADER_LINES {
        line.clear();
        if conn.read_line(&mut line).await? == 0 {
            return Err(ExchangeError::Network(io::ErrorKind::UnexpectedEof.into()));
        }
        let header = line.trim_end();
        if header.is_empty() {
            let body_len = match (chunked, content_length) {
                _ if status < 200 || status == 204 || status == 304 => 0,
                (true, _) => read_chunked(conn).await?,
                (false, Some(len)) => read_sized(conn, len).await?,
                (false, None) => {
                    keep_alive = false;
                    read_to_close(conn).await?
                }
            };
            return Ok(Response {
                status,
                body_len,
                keep_alive,
            });
        }

        let Some((name, value)) = header.split_once(':') else {
            return Err(ExchangeError::Protocol(format!("malformed header {header:?}")));
        };
        let value = value.trim();
        match name.trim().to_ascii_lowercase().as_str() {
            "content-length" => {
                let len = value
                    .parse::<usize>()
                    .map_err(|_| ExchangeError::Protocol(format!("bad content-length {value:?}")))?;
                content_length = Some(len);
            }
            "transfer-encoding" => chunked = value.to_ascii_lowercase().contains("chunked"),
            "connection" => keep_alive = !value.eq_ignore_ascii_case("close"),
            _ => {}
        }
    }

    Err(ExchangeError::Protocol("too many headers".to_owned()))
}

fn parse_status_line(line: &str) -> Result<u16, ExchangeError> {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(version), Some(code)) if version.starts_with("HTTP/1.") => code
            .parse()
            .map_err(|_| ExchangeError::Protocol(format!("bad status code {code:?}"))),
        _ => Err(ExchangeError::Protocol(format!("bad status line {:?}", line.trim_end()))),
    }
}

async fn read_sized<R>(conn: &mut R, len: usize) -> Result<usize, ExchangeError>
where
    R: AsyncBufRead + Unpin,
{
    if len > MAX_BODY_BYTES {
        return Err(ExchangeError::Protocol(format!("body of {len} bytes")));
    }
    let mut body = vec![0; len];
    conn.read_exact(&mut body).await?;
    Ok(len)
}

async fn read_chunked<R>(conn: &mut R) -> Result<usize, ExchangeError>
where
    R: AsyncBufRead + Unpin,
{
    let mut total = 0;
    let mut line = String::new();
    loop {
        line.clear();
        conn.read_line(&mut line).await?;
        let size = line.trim().split(';').next().unwrap_or_default();
        let size = usize::from_str_radix(size, 16)
            .map_err(|_| ExchangeError::Protocol(format!("bad chunk size {size:?}")))?;

        if size > MAX_BODY_BYTES - total {
            return Err(ExchangeError::Protocol(format!("chunk of {size} bytes")));
        }
        if size == 0 {
            // Trailers end with an empty line.
            loop {
                line.clear();
                if conn.read_line(&mut line).await? == 0 || line.trim().is_empty() {
                    return Ok(total);
                }
            }
        }

        read_sized(conn, size + 2).await?;
        total += size;
    }
}

async fn read_to_close<R>(conn: &mut R) -> Result<usize, ExchangeError>
where
    R: AsyncBufRead + Unpin,
{
    let mut body = Vec::new();
    conn.take(MAX_BODY_BYTES as u64).read_to_end(&mut body).await?;
    Ok(body.len())
}
