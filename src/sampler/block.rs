use std::fmt;
use std::net::Ipv4Addr;

use cidr_utils::cidr::Ipv4Cidr;
use rand::seq::index;
use rand::Rng;

/// Usable host octets in a /24: `.1` through `.254`.
pub const HOSTS_PER_BLOCK: usize = 254;

/// A /24 prefix, stored as its first three octets, plus the window of
/// usable host octets inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Block24 {
    prefix: [u8; 3],
    first: u8,
    last: u8,
}

impl Block24 {
    /// The /24 that `addr` lives in, hosts `.1` through `.254`.
    pub fn containing(addr: u32) -> Self {
        let [a, b, c, _] = addr.to_be_bytes();
        Self {
            prefix: [a, b, c],
            first: 1,
            last: 254,
        }
    }

    /// Splits a block into its /24 prefixes.
    ///
    /// Blocks of /24 or longer collapse into the single /24 holding their
    /// network address, narrowed to the block's own hosts. Shorter ones are
    /// walked from the network to the broadcast address in steps of 256.
    pub fn split(cidr: &Ipv4Cidr) -> Vec<Self> {
        let first = u32::from(cidr.first_address());
        let last = u32::from(cidr.last_address());
        if cidr.network_length() >= 24 {
            let [a, b, c, low] = first.to_be_bytes();
            let high = last.to_be_bytes()[3];
            return vec![Self {
                prefix: [a, b, c],
                first: low.max(1),
                last: high.min(254),
            }];
        }

        (first..=last).step_by(256).map(Self::containing).collect()
    }

    /// Usable hosts in the block, at most 254.
    pub fn len(&self) -> usize {
        if self.last < self.first {
            return 0;
        }
        usize::from(self.last - self.first) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Draws up to `count` distinct hosts uniformly from the block.
    pub fn sample<R: Rng + ?Sized>(&self, count: usize, rng: &mut R) -> Vec<Ipv4Addr> {
        let hosts = self.len();
        index::sample(rng, hosts, count.min(hosts))
            .into_iter()
            .map(|i| self.host(i))
            .collect()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn host(self, offset: usize) -> Ipv4Addr {
        let [a, b, c] = self.prefix;
        Ipv4Addr::new(a, b, c, self.first + offset as u8)
    }
}

impl fmt::Display for Block24 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c] = self.prefix;
        write!(f, "{a}.{b}.{c}")
    }
}
