//! Provides functions to parse input IP addresses, CIDRs or range files.

use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;
use cidr_utils::cidr::{Ipv4Cidr, Ipv4Inet};
use log::debug;
use thiserror::Error;
use tokio::fs;
use tokio::io;

/// A range supplied by the caller: either one literal address or an IPv4 block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressRange {
    Single(IpAddr),
    Block(Ipv4Cidr),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RangeParseError {
    #[error("empty range")]
    Empty,
    #[error("invalid address '{0}'")]
    Address(String),
    #[error("invalid prefix length '{0}'")]
    Prefix(String),
    #[error("only IPv4 blocks can be sampled, got '{0}'")]
    NotIpv4(String),
}

impl FromStr for AddressRange {
    type Err = RangeParseError;

    /// Parses `a.b.c.d/n` or a literal address. Host bits of a block are
    /// masked off, so `104.16.3.9/20` means `104.16.0.0/20`.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let input = input.trim();
        if input.is_empty() {
            return Err(RangeParseError::Empty);
        }

        let Some((addr, prefix)) = input.split_once('/') else {
            return input
                .parse::<IpAddr>()
                .map(AddressRange::Single)
                .map_err(|_| RangeParseError::Address(input.to_owned()));
        };

        match addr.parse::<IpAddr>() {
            Ok(IpAddr::V4(_)) => {}
            Ok(IpAddr::V6(_)) => return Err(RangeParseError::NotIpv4(input.to_owned())),
            Err(_) => return Err(RangeParseError::Address(addr.to_owned())),
        }

        Ipv4Inet::from_str(input)
            .map(|inet| AddressRange::Block(inet.network()))
            .map_err(|_| RangeParseError::Prefix(prefix.to_owned()))
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(ip) => write!(f, "{ip}"),
            Self::Block(cidr) => write!(f, "{}/{}", cidr.first_address(), cidr.network_length()),
        }
    }
}

impl AddressRange {
    /// Whether `ip` falls inside this range.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self, ip) {
            (Self::Single(single), _) => single == ip,
            (Self::Block(cidr), IpAddr::V4(v4)) => cidr.contains(v4),
            (Self::Block(_), IpAddr::V6(_)) => false,
        }
    }
}

/// Parses every input string, silently dropping the ones that are not a
/// valid address or block.
///
/// ```rust
/// # use cdnscan::address::parse_ranges;
/// let ranges = parse_ranges(&["104.16.0.0/20", "nonsense", "1.1.1.1"]);
/// assert_eq!(ranges.len(), 2);
/// ```
pub fn parse_ranges<S: AsRef<str>>(inputs: &[S]) -> Vec<AddressRange> {
    inputs
        .iter()
        .map(AsRef::as_ref)
        .filter(|raw| !raw.trim().is_empty())
        .filter_map(|raw| match raw.parse::<AddressRange>() {
            Ok(range) => Some(range),
            Err(e) => {
                debug!("Dropping range {raw:?}: {e}");
                None
            }
        })
        .collect()
}

/// Anything that can hand the engine a list of range strings, such as a
/// registry fetcher. Implementations may return an empty or partial list.
#[async_trait]
pub trait RangeSource: Send + Sync {
    async fn fetch(&self) -> io::Result<Vec<String>>;
}

/// Ranges given directly on the command line or in the config file.
#[derive(Debug, Clone, Default)]
pub struct StaticRanges(pub Vec<String>);

#[async_trait]
impl RangeSource for StaticRanges {
    async fn fetch(&self) -> io::Result<Vec<String>> {
        Ok(self.0.clone())
    }
}

/// A newline-delimited file of ranges. Blank lines and `#` comments are skipped.
#[derive(Debug, Clone)]
pub struct FileRanges(pub PathBuf);

#[async_trait]
impl RangeSource for FileRanges {
    async fn fetch(&self) -> io::Result<Vec<String>> {
        let content = fs::read_to_string(&self.0).await?;
        Ok(content
            .lines()
            .map(|line| line.split('#').next().unwrap_or_default().trim())
            .filter(|line| !line.is_empty())
            .map(str::to_owned)
            .collect())
    }
}
