//! Turns caller-supplied ranges into a bounded, fairly interleaved batch of
//! candidate addresses.
mod block;

pub use block::{Block24, HOSTS_PER_BLOCK};

use std::net::IpAddr;

use itertools::Itertools;
use log::debug;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::address::AddressRange;

/// Samples candidates with the thread-local RNG.
///
/// ```rust
/// # use cdnscan::address::parse_ranges;
/// # use cdnscan::sampler::generate;
/// let ranges = parse_ranges(&["203.0.113.0/24"]);
/// let batch = generate(&ranges, 5, Some(5), true);
/// assert_eq!(batch.len(), 5);
/// ```
pub fn generate(
    ranges: &[AddressRange],
    addresses_per_block: usize,
    max_total: Option<usize>,
    shuffle: bool,
) -> Vec<IpAddr> {
    generate_with_rng(
        ranges,
        addresses_per_block,
        max_total,
        shuffle,
        &mut rand::rng(),
    )
}

/// Samples candidates from `ranges`.
///
/// Blocks are picked round-robin across ranges, after shuffling each range's
/// blocks independently, so every range is represented before any range gets
/// a second block. Selection stops after the first round that brings
/// `blocks * addresses_per_block` up to `max_total`.
///
/// Literal addresses come first, followed by the sampled hosts in round order.
/// The sequence is cut to `max_total` before the final shuffle, which keeps
/// the first round (one block per range) whenever the budget allows it. The
/// last, partially kept round is shuffled on its own beforehand so the cut
/// does not always fall on the same ranges.
pub fn generate_with_rng<R: Rng + ?Sized>(
    ranges: &[AddressRange],
    addresses_per_block: usize,
    max_total: Option<usize>,
    shuffle: bool,
    rng: &mut R,
) -> Vec<IpAddr> {
    if max_total == Some(0) {
        return Vec::new();
    }

    let mut candidates = Vec::new();
    let mut per_range = Vec::new();
    for range in ranges {
        match range {
            AddressRange::Single(ip) => candidates.push(*ip),
            AddressRange::Block(cidr) => {
                let mut blocks = Block24::split(cidr);
                blocks.shuffle(rng);
                per_range.push(blocks);
            }
        }
    }

    let per_block = addresses_per_block.min(HOSTS_PER_BLOCK);
    let rounds = select_rounds(&per_range, per_block, max_total);
    debug!(
        "Sampling {} rounds over {} ranges, {} hosts per block",
        rounds.len(),
        per_range.len(),
        per_block
    );

    let last = rounds.len().saturating_sub(1);
    for (i, round) in rounds.iter().enumerate() {
        let mut drawn: Vec<IpAddr> = round
            .iter()
            .flat_map(|block| block.sample(per_block, rng))
            .map(IpAddr::V4)
            .collect();
        if shuffle && i == last {
            drawn.shuffle(rng);
        }
        candidates.extend(drawn);
    }

    let mut candidates: Vec<IpAddr> = candidates.into_iter().unique().collect();
    if let Some(max_total) = max_total {
        candidates.truncate(max_total);
    }
    if shuffle {
        candidates.shuffle(rng);
    }
    candidates
}

/// Round `r` holds the `r`-th block of every range that still has one.
fn select_rounds(
    per_range: &[Vec<Block24>],
    per_block: usize,
    max_total: Option<usize>,
) -> Vec<Vec<Block24>> {
    if per_block == 0 {
        return Vec::new();
    }

    let longest = per_range.iter().map(Vec::len).max().unwrap_or(0);
    let mut rounds = Vec::new();
    let mut selected = 0;
    for r in 0..longest {
        let round: Vec<Block24> = per_range
            .iter()
            .filter_map(|blocks| blocks.get(r).copied())
            .collect();
        selected += round.len();
        rounds.push(round);

        if max_total.is_some_and(|max| selected * per_block >= max) {
            break;
        }
    }
    rounds
}
