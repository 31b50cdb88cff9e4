//! Core functionality for actual scanning behaviour.
//!
//! A [`Prober`] checks one address. The [`Scanner`] fans a batch of addresses
//! out over a bounded pool of probes and reports completions as they happen.
pub mod http;
pub mod timeouts;
pub mod trace;
pub mod tunnel;

pub use trace::TraceProber;
pub use tunnel::TunnelProber;

use std::any::Any;
use std::cell::Cell;
use std::net::IpAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use log::debug;
use serde_derive::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::{Phase, Result, ScanError};

/// Smallest trace pool, whatever the speed profile.
pub const MIN_TRACE_WORKERS: usize = 150;
/// Smallest tunnel pool, whatever the speed profile.
pub const MIN_TUNNEL_WORKERS: usize = 20;
const TUNNEL_WORKERS_BASE: usize = 50;

tokio::task_local! {
    static PHASE: Cell<Phase>;
}

/// Records the step the current probe is in, so a fault can name it.
///
/// Outside a [`Scanner`] task this does nothing.
pub fn enter(phase: Phase) {
    let _ = PHASE.try_with(|current| current.set(phase));
}

/// The outcome of probing one address. Only valid verdicts ever leave a prober.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    pub address: IpAddr,
    pub success: bool,
    /// The primary port first, then the other reachable ports in input order.
    pub open_ports: Vec<u16>,
    pub ping_ms: Option<f64>,
}

impl Verdict {
    pub fn valid(address: IpAddr, open_ports: Vec<u16>, ping_ms: Option<f64>) -> Self {
        Self {
            address,
            success: true,
            open_ports,
            ping_ms,
        }
    }
}

/// A probing strategy for a single address.
///
/// `Ok(None)` means the address is not usable; network failures never surface
/// as errors. An `Err` is an internal fault and aborts the round.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(
        &self,
        addr: IpAddr,
        ports: &[u16],
        cancel: &CancellationToken,
    ) -> Result<Option<Verdict>>;
}

/// Round-scoped progress, sent after every completed probe.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
    pub throughput_per_sec: f64,
    pub elapsed_sec: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchEvent {
    Progress(Progress),
    Result(Verdict),
}

/// Pool size for trace probing.
///
/// The base scales with the CPU count between 800 and 2000 workers and is
/// then reduced by the speed profile's resource fraction.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn worker_count(resource_fraction: f64, cpus: usize) -> usize {
    let base = cpus.saturating_mul(200).clamp(800, 2000);
    MIN_TRACE_WORKERS.max((base as f64 * resource_fraction).floor() as usize)
}

/// Pool size for tunnel probing, which holds TLS sessions open.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn tunnel_worker_count(resource_fraction: f64) -> usize {
    MIN_TUNNEL_WORKERS.max((TUNNEL_WORKERS_BASE as f64 * resource_fraction).floor() as usize)
}

/// Runs batches of probes through a bounded worker pool.
pub struct Scanner {
    prober: Arc<dyn Prober>,
    workers: usize,
}

impl Scanner {
    pub fn new(prober: Arc<dyn Prober>, workers: usize) -> Self {
        Self {
            prober,
            workers: workers.max(1),
        }
    }

    pub const fn workers(&self) -> usize {
        self.workers
    }

    /// Probes every address and returns the valid verdicts in completion order.
    ///
    /// One task per address is spawned up front and admitted by a semaphore
    /// of `workers` permits. `on_event` sees a progress update for every
    /// completion and each valid verdict as soon as it arrives.
    ///
    /// On cancellation the call returns straight away with what it has. Tasks
    /// still waiting for a permit never start, and running probes are left to
    /// finish on their own deadlines.
    pub async fn run_batch<F>(
        &self,
        addrs: &[IpAddr],
        ports: &[u16],
        cancel: &CancellationToken,
        mut on_event: F,
    ) -> Result<Vec<Verdict>>
    where
        F: FnMut(BatchEvent),
    {
        let total = addrs.len();
        let permits = Arc::new(Semaphore::new(self.workers));
        let ports: Arc<[u16]> = Arc::from(ports);
        let mut tasks = JoinSet::new();

        debug!(
            "Start probing. \nWorkers {}\nAddresses {}\nPorts {:?}",
            self.workers, total, ports
        );

        for &addr in addrs {
            let prober = Arc::clone(&self.prober);
            let permits = Arc::clone(&permits);
            let ports = Arc::clone(&ports);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return Ok(None);
                };
                if cancel.is_cancelled() {
                    return Ok(None);
                }
                PHASE
                    .scope(Cell::new(Phase::Task), async {
                        AssertUnwindSafe(prober.probe(addr, &ports, &cancel))
                            .catch_unwind()
                            .await
                            .unwrap_or_else(|payload| {
                                let phase = PHASE.try_with(Cell::get).unwrap_or(Phase::Task);
                                Err(ScanError::fault(addr, phase, panic_message(&*payload)))
                            })
                    })
                    .await
            });
        }

        let started = Instant::now();
        let mut completed = 0;
        let mut verdicts = Vec::new();
        loop {
            let joined = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!("Round cancelled after {completed}/{total} probes");
                    break;
                }
                joined = tasks.join_next() => joined,
            };
            let Some(joined) = joined else { break };

            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    debug!("Probe task ended abnormally: {e}");
                    Ok(None)
                }
            };
            let verdict = match outcome {
                Ok(verdict) => verdict,
                Err(fault) => {
                    permits.close();
                    tasks.detach_all();
                    return Err(fault);
                }
            };

            completed += 1;
            on_event(BatchEvent::Progress(progress(completed, total, started)));
            if let Some(verdict) = verdict.filter(|v| v.success) {
                on_event(BatchEvent::Result(verdict.clone()));
                verdicts.push(verdict);
            }
        }

        permits.close();
        tasks.detach_all();
        debug!("Valid verdicts found: {}", verdicts.len());
        Ok(verdicts)
    }
}

#[allow(clippy::cast_precision_loss)]
fn progress(completed: usize, total: usize, started: Instant) -> Progress {
    let elapsed_sec = started.elapsed().as_secs_f64();
    let throughput_per_sec = if elapsed_sec > 0.0 {
        completed as f64 / elapsed_sec
    } else {
        0.0
    };
    Progress {
        completed,
        total,
        throughput_per_sec,
        elapsed_sec,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "probe panicked".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parameterized::parameterized;
    use std::collections::HashSet;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn addrs(n: u8) -> Vec<IpAddr> {
        (1..=n).map(|i| IpAddr::V4(Ipv4Addr::new(203, 0, 113, i))).collect()
    }

    /// Accepts addresses with an even last octet after `delay`.
    #[derive(Default)]
    struct FakeProber {
        delay: Duration,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        panic_on: Option<IpAddr>,
    }

    impl FakeProber {
        fn slow(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl Prober for FakeProber {
        async fn probe(
            &self,
            addr: IpAddr,
            ports: &[u16],
            _cancel: &CancellationToken,
        ) -> Result<Option<Verdict>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            enter(Phase::Sweep);
            assert_ne!(self.panic_on, Some(addr), "bad state for {addr}");
            let IpAddr::V4(v4) = addr else { return Ok(None) };
            Ok((v4.octets()[3] % 2 == 0).then(|| Verdict::valid(addr, ports.to_vec(), Some(42.0))))
        }
    }

    #[tokio::test]
    async fn reports_results_and_progress() {
        let prober = Arc::new(FakeProber::slow(Duration::from_millis(5)));
        let scanner = Scanner::new(prober, 4);
        let mut progress = Vec::new();
        let mut streamed = Vec::new();

        let verdicts = scanner
            .run_batch(&addrs(20), &[443, 80], &CancellationToken::new(), |event| match event {
                BatchEvent::Progress(p) => progress.push(p),
                BatchEvent::Result(v) => streamed.push(v.address),
            })
            .await
            .unwrap();

        assert_eq!(verdicts.len(), 10);
        assert_eq!(streamed, verdicts.iter().map(|v| v.address).collect::<Vec<_>>());
        assert!(verdicts.iter().all(|v| v.open_ports == [443, 80]));

        assert_eq!(progress.len(), 20);
        let counts: Vec<usize> = progress.iter().map(|p| p.completed).collect();
        assert_eq!(counts, (1..=20).collect::<Vec<_>>());
        assert!(progress.iter().all(|p| p.total == 20));
    }

    #[tokio::test]
    async fn pool_bounds_concurrency() {
        let prober = Arc::new(FakeProber::slow(Duration::from_millis(10)));
        let scanner = Scanner::new(Arc::clone(&prober) as Arc<dyn Prober>, 3);

        scanner
            .run_batch(&addrs(30), &[443], &CancellationToken::new(), |_| {})
            .await
            .unwrap();

        assert_eq!(prober.calls.load(Ordering::SeqCst), 30);
        assert!(prober.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn cancellation_returns_promptly() {
        let prober = Arc::new(FakeProber::slow(Duration::from_secs(30)));
        let scanner = Scanner::new(Arc::clone(&prober) as Arc<dyn Prober>, 2);
        let cancel = CancellationToken::new();

        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.cancel();
        });

        let verdicts = tokio::time::timeout(
            Duration::from_secs(2),
            scanner.run_batch(&addrs(50), &[443], &cancel, |_| {}),
        )
        .await
        .expect("run_batch should return soon after cancellation")
        .unwrap();

        assert!(verdicts.is_empty());
        // Only the admitted probes ever started.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(prober.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancelled_before_start_probes_nothing() {
        let prober = Arc::new(FakeProber::default());
        let scanner = Scanner::new(Arc::clone(&prober) as Arc<dyn Prober>, 8);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let verdicts = scanner.run_batch(&addrs(10), &[443], &cancel, |_| {}).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(verdicts.is_empty());
        assert_eq!(prober.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn panicking_probe_becomes_a_fault() {
        let bad = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 3));
        let prober = Arc::new(FakeProber {
            panic_on: Some(bad),
            ..FakeProber::default()
        });
        let scanner = Scanner::new(prober, 4);

        let err = scanner
            .run_batch(&addrs(5), &[443], &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();

        match err {
            ScanError::Fault { address, phase, message } => {
                assert_eq!(address, bad);
                assert_eq!(phase, Phase::Sweep);
                assert!(message.contains("bad state"));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    /// Panics before naming any step.
    struct PanicsAtOnce;

    #[async_trait]
    impl Prober for PanicsAtOnce {
        async fn probe(
            &self,
            addr: IpAddr,
            _ports: &[u16],
            _cancel: &CancellationToken,
        ) -> Result<Option<Verdict>> {
            panic!("no phase for {addr}");
        }
    }

    #[tokio::test]
    async fn fault_before_any_phase_names_the_task() {
        let scanner = Scanner::new(Arc::new(PanicsAtOnce), 2);
        let err = scanner
            .run_batch(&addrs(1), &[443], &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::Fault { phase: Phase::Task, .. }));
    }

    #[test]
    fn entering_a_phase_outside_a_task_is_harmless() {
        enter(Phase::Verify);
    }

    #[tokio::test]
    async fn empty_batch_is_a_no_op() {
        let scanner = Scanner::new(Arc::new(FakeProber::default()), 0);
        assert_eq!(scanner.workers(), 1);
        let verdicts = scanner
            .run_batch(&[], &[443], &CancellationToken::new(), |_| panic!("no events"))
            .await
            .unwrap();
        assert!(verdicts.is_empty());
    }

    #[tokio::test]
    async fn duplicate_addresses_are_each_probed() {
        let prober = Arc::new(FakeProber::default());
        let scanner = Scanner::new(Arc::clone(&prober) as Arc<dyn Prober>, 4);
        let batch = vec![addrs(2)[1]; 3];

        let verdicts = scanner
            .run_batch(&batch, &[443], &CancellationToken::new(), |_| {})
            .await
            .unwrap();
        let unique: HashSet<_> = verdicts.iter().map(|v| v.address).collect();
        assert_eq!(unique.len(), 1);
        assert_eq!(prober.calls.load(Ordering::SeqCst), 3);
    }

    #[parameterized(
        input = {(0.15, 1), (0.2, 1), (0.2, 8), (0.8, 8), (0.8, 16), (1.0, 64), (0.6, 4)},
        expected = {150, 160, 320, 1280, 1600, 2000, 480}
    )]
    fn trace_pool_size(input: (f64, usize), expected: usize) {
        assert_eq!(worker_count(input.0, input.1), expected);
    }

    #[parameterized(fraction = {0.2, 0.4, 0.6, 0.8}, expected = {20, 20, 30, 40})]
    fn tunnel_pool_size(fraction: f64, expected: usize) {
        assert_eq!(tunnel_worker_count(fraction), expected);
    }
}
