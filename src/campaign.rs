//! Drives repeated sample-and-probe rounds until enough edge addresses are
//! found, the ranges run dry, or the caller stops the campaign.
use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Local};
use log::{debug, info, warn};
use serde::de::{self, Deserializer};
use serde::Deserialize;
use serde_derive::Serialize;
use tokio_util::sync::CancellationToken;

use crate::address::{parse_ranges, AddressRange};
use crate::cache::{FailureCache, FailureStore};
use crate::error::{Result, ScanError};
use crate::input::SpeedProfile;
use crate::sampler;
use crate::scanner::{
    tunnel_worker_count, worker_count, BatchEvent, Progress, Prober, Scanner, TraceProber,
    TunnelProber, Verdict,
};
use crate::score::score;
use crate::tunnel::TunnelConfig;

/// Addresses probed in one campaign never exceed this.
pub const SAFETY_CEILING: usize = 500_000;
/// Smallest batch drawn for a bounded target.
pub const MIN_BATCH: usize = 5_000;
/// Batch drawn for the single round of an unbounded campaign.
pub const UNBOUNDED_BATCH: usize = 100_000;
const BATCH_PER_TARGET: usize = 100;
/// Fresh draws tried before the ranges count as exhausted.
const RESAMPLE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Idle,
    Running,
    Stopping,
    Completed,
    Error,
}

impl CampaignStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

/// How many valid addresses the campaign is after.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetCount {
    Bounded(usize),
    /// Probe one large batch and report everything found in it.
    Unbounded,
}

impl TargetCount {
    pub fn batch_size(self) -> usize {
        match self {
            Self::Bounded(target) => target.saturating_mul(BATCH_PER_TARGET).max(MIN_BATCH),
            Self::Unbounded => UNBOUNDED_BATCH,
        }
    }

    pub const fn is_reached(self, found: usize) -> bool {
        match self {
            Self::Bounded(target) => found >= target,
            Self::Unbounded => false,
        }
    }

    pub const fn limit(self) -> Option<usize> {
        match self {
            Self::Bounded(target) => Some(target),
            Self::Unbounded => None,
        }
    }
}

impl FromStr for TargetCount {
    type Err = String;

    /// A positive count, or `all`.
    fn from_str(input: &str) -> std::result::Result<Self, Self::Err> {
        let input = input.trim();
        if input.eq_ignore_ascii_case("all") {
            return Ok(Self::Unbounded);
        }
        match input.parse::<usize>() {
            Ok(0) => Err("target must be at least 1".to_owned()),
            Ok(target) => Ok(Self::Bounded(target)),
            Err(_) => Err(format!("'{input}' is neither a number nor 'all'")),
        }
    }
}

/// Accepts `target = 40` as well as `target = "all"` in the config file.
impl<'de> Deserialize<'de> for TargetCount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(serde_derive::Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Count(u64),
            Word(String),
        }

        let parsed = match Raw::deserialize(deserializer)? {
            Raw::Count(count) => count.to_string().parse::<Self>(),
            Raw::Word(word) => word.parse(),
        };
        parsed.map_err(de::Error::custom)
    }
}

impl fmt::Display for TargetCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bounded(target) => write!(f, "{target}"),
            Self::Unbounded => f.write_str("all"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    TargetReached,
    RangesExhausted,
    SafetyCeiling,
    SingleRound,
    Stopped,
    NoRanges,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::TargetReached => "target reached",
            Self::RangesExhausted => "ranges exhausted",
            Self::SafetyCeiling => "safety ceiling hit",
            Self::SingleRound => "single round finished",
            Self::Stopped => "stopped",
            Self::NoRanges => "no usable ranges",
        };
        f.write_str(reason)
    }
}

#[derive(Debug, Clone)]
pub struct CampaignState {
    pub status: CampaignStatus,
    pub target: TargetCount,
    pub found: usize,
    pub scanned: usize,
    pub started_at: Option<DateTime<Local>>,
}

#[derive(Debug, Clone)]
pub enum ScanMethod {
    Trace,
    Tunnel(TunnelConfig),
}

/// Everything a campaign needs before it starts.
#[derive(Debug, Clone)]
pub struct CampaignOptions {
    pub ranges: Vec<String>,
    pub ports: Vec<u16>,
    pub profile: SpeedProfile,
    pub target: TargetCount,
    /// Inclusive latency window for reported results, in milliseconds. The
    /// upper bound doubles as the probers' latency ceiling.
    pub ping_min: u32,
    pub ping_max: u32,
    pub method: ScanMethod,
    pub shuffle: bool,
    /// Pool size override; inferred from the profile when `None`.
    pub workers: Option<usize>,
}

/// A valid address that passed the latency window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredResult {
    pub address: IpAddr,
    pub open_ports: Vec<u16>,
    pub ping_ms: Option<f64>,
    pub score: f64,
    /// The tunnel link rewritten for this address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub total_scanned: usize,
    pub total_found: usize,
    pub elapsed_sec: f64,
    pub status: CampaignStatus,
    pub reason: StopReason,
    pub started_at: DateTime<Local>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CampaignEvent {
    Result(ScoredResult),
    Progress(Progress),
    Warning { message: String },
    Summary(Summary),
}

/// One discovery campaign. Build a fresh one per run.
pub struct Campaign {
    options: CampaignOptions,
    cancel: CancellationToken,
    state: CampaignState,
    failures: Arc<FailureCache>,
    prober: Option<Arc<dyn Prober>>,
    store: Option<Box<dyn FailureStore>>,
}

impl Campaign {
    pub fn new(options: CampaignOptions, cancel: CancellationToken) -> Self {
        let state = CampaignState {
            status: CampaignStatus::Idle,
            target: options.target,
            found: 0,
            scanned: 0,
            started_at: None,
        };
        Self {
            options,
            cancel,
            state,
            failures: Arc::new(FailureCache::new()),
            prober: None,
            store: None,
        }
    }

    /// Replaces the prober picked from [`ScanMethod`].
    #[must_use]
    pub fn with_prober(mut self, prober: Arc<dyn Prober>) -> Self {
        self.prober = Some(prober);
        self
    }

    /// Loads known failures before the first round and saves them at the end.
    #[must_use]
    pub fn with_failure_store(mut self, store: Box<dyn FailureStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub const fn state(&self) -> &CampaignState {
        &self.state
    }

    /// The failure cache shared with the probers.
    pub fn failures(&self) -> Arc<FailureCache> {
        Arc::clone(&self.failures)
    }

    /// Runs the campaign to its end, streaming events to `on_event`.
    ///
    /// Configuration problems are reported before anything is probed. A fault
    /// during a round moves the campaign to `Error` and is returned as is.
    pub async fn run<F>(&mut self, mut on_event: F) -> Result<Summary>
    where
        F: FnMut(CampaignEvent),
    {
        if self.state.status != CampaignStatus::Idle {
            let when = if self.state.status.is_terminal() { "already ran" } else { "is running" };
            return Err(ScanError::config(format!(
                "campaign {when} (status {:?})",
                self.state.status
            )));
        }
        self.validate()?;

        let started_at = Local::now();
        let started = Instant::now();
        self.state.status = CampaignStatus::Running;
        self.state.started_at = Some(started_at);
        self.load_failures(&mut on_event);

        let ranges = parse_ranges(&self.options.ranges);
        let outcome = if ranges.is_empty() {
            warn!("No usable ranges supplied");
            on_event(CampaignEvent::Warning {
                message: "No usable ranges supplied".to_owned(),
            });
            Ok(StopReason::NoRanges)
        } else {
            self.rounds(&ranges, &mut on_event).await
        };

        self.save_failures(&mut on_event);

        match outcome {
            Ok(reason) => {
                self.state.status = CampaignStatus::Completed;
                let summary = Summary {
                    total_scanned: self.state.scanned,
                    total_found: self.state.found,
                    elapsed_sec: started.elapsed().as_secs_f64(),
                    status: self.state.status,
                    reason,
                    started_at,
                };
                info!(
                    "Campaign finished: {reason}, {} found in {} scanned",
                    summary.total_found, summary.total_scanned
                );
                on_event(CampaignEvent::Summary(summary.clone()));
                Ok(summary)
            }
            Err(e) => {
                self.state.status = CampaignStatus::Error;
                Err(e)
            }
        }
    }

    fn validate(&self) -> Result<()> {
        let options = &self.options;
        if options.ports.is_empty() {
            return Err(ScanError::config("no ports to probe"));
        }
        if options.ports.contains(&0) {
            return Err(ScanError::config("port 0 cannot be probed"));
        }
        if options.profile.addresses_per_block() == 0 {
            return Err(ScanError::config("addresses per block must be at least 1"));
        }
        if options.target == TargetCount::Bounded(0) {
            return Err(ScanError::config("target must be at least 1"));
        }
        if options.ping_min > options.ping_max {
            return Err(ScanError::config(format!(
                "ping window {}..{} is empty",
                options.ping_min, options.ping_max
            )));
        }
        Ok(())
    }

    fn prober(&self) -> Result<Arc<dyn Prober>> {
        if let Some(prober) = &self.prober {
            return Ok(Arc::clone(prober));
        }
        let failures = Arc::clone(&self.failures);
        let max_latency_ms = self.options.ping_max;
        Ok(match &self.options.method {
            ScanMethod::Trace => Arc::new(TraceProber::new(failures, max_latency_ms)?),
            ScanMethod::Tunnel(config) => Arc::new(TunnelProber::new(
                Arc::new(config.clone()),
                failures,
                max_latency_ms,
            )),
        })
    }

    fn workers(&self) -> usize {
        let fraction = self.options.profile.resource_fraction();
        self.options.workers.unwrap_or_else(|| match self.options.method {
            ScanMethod::Trace => worker_count(fraction, num_cpus::get()),
            ScanMethod::Tunnel(_) => tunnel_worker_count(fraction),
        })
    }

    async fn rounds<F>(&mut self, ranges: &[AddressRange], on_event: &mut F) -> Result<StopReason>
    where
        F: FnMut(CampaignEvent),
    {
        let scanner = Scanner::new(self.prober()?, self.workers());
        let target = self.options.target;
        let batch_size = target.batch_size();
        let (ping_min, ping_max) = (
            f64::from(self.options.ping_min),
            f64::from(self.options.ping_max),
        );
        let tunnel = match &self.options.method {
            ScanMethod::Tunnel(config) => Some(config.clone()),
            ScanMethod::Trace => None,
        };
        info!(
            "Probing {} ranges on ports {:?} with {} workers, target {target}",
            ranges.len(),
            self.options.ports,
            scanner.workers()
        );

        // Addresses that already produced a valid verdict.
        let mut verified: HashSet<IpAddr> = HashSet::new();
        let mut round = 0;
        loop {
            if target.is_reached(self.state.found) {
                return Ok(StopReason::TargetReached);
            }
            if self.cancel.is_cancelled() {
                self.state.status = CampaignStatus::Stopping;
                return Ok(StopReason::Stopped);
            }
            if self.state.scanned >= SAFETY_CEILING {
                warn!("Stopping after {} addresses", self.state.scanned);
                on_event(CampaignEvent::Warning {
                    message: format!(
                        "Safety ceiling of {SAFETY_CEILING} probed addresses reached"
                    ),
                });
                return Ok(StopReason::SafetyCeiling);
            }

            let batch = self.draw(ranges, batch_size, &verified);
            if batch.is_empty() {
                warn!("No fresh addresses left in the supplied ranges");
                on_event(CampaignEvent::Warning {
                    message: "No fresh addresses left in the supplied ranges".to_owned(),
                });
                return Ok(StopReason::RangesExhausted);
            }

            round += 1;
            info!("Round {round}: probing {} addresses", batch.len());
            let round_cancel = self.cancel.child_token();
            let mut found = self.state.found;
            scanner
                .run_batch(&batch, &self.options.ports, &round_cancel, |event| match event {
                    BatchEvent::Progress(progress) => on_event(CampaignEvent::Progress(progress)),
                    BatchEvent::Result(verdict) => {
                        verified.insert(verdict.address);
                        if target.is_reached(found) {
                            return;
                        }
                        if !verdict.ping_ms.is_some_and(|ping| (ping_min..=ping_max).contains(&ping)) {
                            debug!("{}: outside the ping window", verdict.address);
                            return;
                        }
                        found += 1;
                        on_event(CampaignEvent::Result(scored(verdict, tunnel.as_ref())));
                        if target.is_reached(found) {
                            round_cancel.cancel();
                        }
                    }
                })
                .await?;

            self.state.found = found;
            self.state.scanned += batch.len();

            // A stopped single round is reported as stopped by the next check.
            if target == TargetCount::Unbounded && !self.cancel.is_cancelled() {
                return Ok(StopReason::SingleRound);
            }
        }
    }

    /// Samples a batch, leaving out addresses already settled in this campaign.
    fn draw(
        &self,
        ranges: &[AddressRange],
        batch_size: usize,
        verified: &HashSet<IpAddr>,
    ) -> Vec<IpAddr> {
        let per_block = self.options.profile.addresses_per_block();
        for _ in 0..RESAMPLE_ATTEMPTS {
            let batch: Vec<IpAddr> =
                sampler::generate(ranges, per_block, Some(batch_size), self.options.shuffle)
                    .into_iter()
                    .filter(|ip| !verified.contains(ip) && !self.failures.contains(ip))
                    .collect();
            if !batch.is_empty() {
                return batch;
            }
        }
        Vec::new()
    }

    fn load_failures<F: FnMut(CampaignEvent)>(&self, on_event: &mut F) {
        let Some(store) = &self.store else { return };
        match store.load() {
            Ok(known) => {
                debug!("Loaded {} known failures", known.len());
                self.failures.extend(known);
            }
            Err(e) => {
                warn!("Could not load failure cache: {e}");
                on_event(CampaignEvent::Warning {
                    message: format!("Could not load failure cache: {e}"),
                });
            }
        }
    }

    fn save_failures<F: FnMut(CampaignEvent)>(&self, on_event: &mut F) {
        let Some(store) = &self.store else { return };
        if let Err(e) = store.save(&self.failures.snapshot()) {
            warn!("Could not save failure cache: {e}");
            on_event(CampaignEvent::Warning {
                message: format!("Could not save failure cache: {e}"),
            });
        }
    }
}

fn scored(verdict: Verdict, tunnel: Option<&TunnelConfig>) -> ScoredResult {
    ScoredResult {
        score: score(&verdict),
        config: tunnel.map(|config| config.rebuild(verdict.address)),
        address: verdict.address,
        open_ports: verdict.open_ports,
        ping_ms: verdict.ping_ms,
    }
}
