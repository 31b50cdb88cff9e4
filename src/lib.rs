//! This crate exposes the internal functionality of the cdnscan edge
//! discovery engine.
//!
//! cdnscan samples addresses from large CDN ranges, verifies each candidate
//! against the edge trace endpoint and ranks the ones that answer quickly.
//!
//! ## Architecture Overview
//!
//! A [`Campaign`](crate::campaign::Campaign) runs rounds until it has found
//! enough addresses:
//!
//! 1. **Sampling**: [`sampler::generate`] draws a bounded batch from the
//!    ranges, one /24 per range at a time so small ranges are never crowded
//!    out.
//! 2. **Probing**: the [`Scanner`](crate::scanner::Scanner) fans the batch out
//!    over a bounded pool of [`Prober`](crate::scanner::Prober)s.
//! 3. **Scoring**: every valid verdict inside the latency window is scored with
//!    [`score::score`] and streamed to the caller.
//!
//! Addresses that fail are remembered in a
//! [`FailureCache`](crate::cache::FailureCache) and never probed twice in the
//! same campaign.
//!
//! ## Basic Usage Example
//!
//! ```rust,no_run
//! use cdnscan::campaign::{Campaign, CampaignEvent, CampaignOptions, ScanMethod, TargetCount};
//! use cdnscan::input::{SpeedProfile, DEFAULT_PORTS};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let options = CampaignOptions {
//!         ranges: vec!["104.16.0.0/13".to_owned(), "172.64.0.0/13".to_owned()],
//!         ports: DEFAULT_PORTS.to_vec(),
//!         profile: SpeedProfile::Hyper,
//!         target: TargetCount::Bounded(10),
//!         ping_min: 0,
//!         ping_max: 800,
//!         method: ScanMethod::Trace,
//!         shuffle: true,
//!         workers: None,
//!     };
//!
//!     let mut campaign = Campaign::new(options, CancellationToken::new());
//!     let summary = campaign
//!         .run(|event| {
//!             if let CampaignEvent::Result(found) = event {
//!                 println!("{} {:?}ms", found.address, found.ping_ms);
//!             }
//!         })
//!         .await?;
//!
//!     println!("{} found in {} scanned", summary.total_found, summary.total_scanned);
//!     Ok(())
//! }
//! ```
#![allow(clippy::needless_doctest_main)]

pub mod tui;

pub mod input;

pub mod address;

pub mod sampler;

pub mod scanner;

pub mod score;

pub mod campaign;

pub mod cache;

pub mod tunnel;

pub mod error;
