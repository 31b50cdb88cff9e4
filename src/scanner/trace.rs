//! Probes an address by hitting the CDN trace endpoint several times.
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, trace};
use rustls::ServerName;
use tokio::net::TcpStream;
use tokio::time;
use tokio_util::sync::CancellationToken;

use super::http::{is_https_port, ExchangeError, Session, TRACE_HOST, TRACE_PATH};
use super::timeouts::{self, ATTEMPTS, MIN_SUCCESSES};
use super::{enter, Prober, Verdict};
use crate::cache::FailureCache;
use crate::error::{Phase, Result, ScanError};

/// Outcome of the sequential trace requests against one address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempts {
    pub successes: usize,
    pub elapsed: Duration,
}

impl Attempts {
    /// Always divided by the full attempt count, even when the sequence was
    /// cut short, so aborted sequences look slower.
    #[allow(clippy::cast_precision_loss)]
    pub fn avg_latency_ms(&self) -> f64 {
        self.elapsed.as_secs_f64() * 1000.0 / ATTEMPTS as f64
    }

    pub fn is_valid(&self, max_latency_ms: u32) -> bool {
        self.successes >= MIN_SUCCESSES && self.avg_latency_ms() <= f64::from(max_latency_ms)
    }
}

/// The default strategy: TCP pre-filter, trace verification on the primary
/// port, then a connect sweep over the remaining ports.
pub struct TraceProber {
    failures: Arc<FailureCache>,
    max_latency_ms: u32,
    server_name: ServerName,
}

impl TraceProber {
    pub fn new(failures: Arc<FailureCache>, max_latency_ms: u32) -> Result<Self> {
        let server_name = ServerName::try_from(TRACE_HOST)
            .map_err(|e| ScanError::config(format!("trace host {TRACE_HOST}: {e}")))?;
        Ok(Self {
            failures,
            max_latency_ms,
            server_name,
        })
    }

    /// Runs up to five sequential requests over one reused session.
    ///
    /// Stops at the first timeout or network error, when the sequence runs
    /// past its wall-clock cap, or on cancellation. A response that cannot be
    /// parsed still counts as a success.
    pub async fn verify(&self, addr: IpAddr, port: u16, cancel: &CancellationToken) -> Attempts {
        let server_name = is_https_port(port).then(|| self.server_name.clone());
        let mut session = Session::new(SocketAddr::new(addr, port), TRACE_HOST, server_name);
        let cap = timeouts::sequence_cap(self.max_latency_ms);

        let started = Instant::now();
        let mut successes = 0;
        for attempt in 0..ATTEMPTS {
            if cancel.is_cancelled() || started.elapsed() > cap {
                break;
            }

            let deadline = timeouts::attempt(attempt, self.max_latency_ms);
            match time::timeout(deadline, session.get(TRACE_PATH)).await {
                Ok(Ok(response)) => {
                    trace!("{addr}:{port} attempt {attempt} -> {}", response.status);
                    successes += 1;
                }
                Ok(Err(ExchangeError::Protocol(reason))) => {
                    trace!("{addr}:{port} attempt {attempt} answered oddly: {reason}");
                    successes += 1;
                }
                Ok(Err(ExchangeError::Network(e))) => {
                    trace!("{addr}:{port} attempt {attempt} failed: {e}");
                    break;
                }
                Err(_) => {
                    trace!("{addr}:{port} attempt {attempt} timed out after {deadline:?}");
                    break;
                }
            }
        }

        Attempts {
            successes,
            elapsed: started.elapsed(),
        }
    }
}

#[async_trait]
impl Prober for TraceProber {
    async fn probe(
        &self,
        addr: IpAddr,
        ports: &[u16],
        cancel: &CancellationToken,
    ) -> Result<Option<Verdict>> {
        enter(Phase::Dedup);
        if self.failures.contains(&addr) {
            return Ok(None);
        }
        let Some((&primary, secondary)) = ports.split_first() else {
            return Ok(None);
        };

        enter(Phase::Prefilter);
        let prefilter = timeouts::prefilter(self.max_latency_ms);
        if !connects(SocketAddr::new(addr, primary), prefilter).await {
            self.failures.insert(addr);
            return Ok(None);
        }

        enter(Phase::Verify);
        let attempts = self.verify(addr, primary, cancel).await;
        if !attempts.is_valid(self.max_latency_ms) {
            trace!(
                "{addr}: {} successes, {:.0}ms average, rejected",
                attempts.successes,
                attempts.avg_latency_ms()
            );
            self.failures.insert(addr);
            return Ok(None);
        }

        enter(Phase::Sweep);
        let mut open_ports = vec![primary];
        let sweep = timeouts::sweep(self.max_latency_ms);
        for &port in secondary {
            if cancel.is_cancelled() {
                break;
            }
            if connects(SocketAddr::new(addr, port), sweep).await {
                open_ports.push(port);
            }
        }

        let ping_ms = attempts.avg_latency_ms();
        debug!("{addr}: open={open_ports:?} ping={ping_ms:.0}ms");
        Ok(Some(Verdict::valid(addr, open_ports, Some(ping_ms))))
    }
}

/// Plain TCP connect with a deadline.
pub(crate) async fn connects(socket: SocketAddr, deadline: Duration) -> bool {
    matches!(
        time::timeout(deadline, TcpStream::connect(socket)).await,
        Ok(Ok(_))
    )
}
