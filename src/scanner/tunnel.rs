//! Probes an address by connecting with a tunnel share link's transport
//! settings and the address swapped in.
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, trace};
use rustls::ServerName;
use tokio::io::{self, AsyncReadExt, AsyncWriteExt};
use tokio::time;
use tokio_util::sync::CancellationToken;

use super::http::{self, Stream, TRACE_PATH};
use super::timeouts;
use super::{enter, Prober, Verdict};
use crate::cache::FailureCache;
use crate::error::{Phase, Result};
use crate::tunnel::TunnelConfig;

/// Bytes read from the best-effort trace answer.
const READ_LIMIT: usize = 4096;
/// How long the trace answer may take once the handshake is done.
const GREETING_TIMEOUT: Duration = Duration::from_millis(1500);

pub struct TunnelProber {
    config: Arc<TunnelConfig>,
    failures: Arc<FailureCache>,
    max_latency_ms: u32,
}

impl TunnelProber {
    pub const fn new(
        config: Arc<TunnelConfig>,
        failures: Arc<FailureCache>,
        max_latency_ms: u32,
    ) -> Self {
        Self {
            config,
            failures,
            max_latency_ms,
        }
    }

    /// Opens the connection and returns it with its setup time: the TLS
    /// handshake, or the TCP connect for plain configs.
    async fn handshake(&self, addr: IpAddr) -> io::Result<(Box<dyn Stream>, Duration)> {
        let socket = SocketAddr::new(addr, self.config.port());
        let name = if self.config.is_tls() {
            let sni = self.config.server_name(addr);
            let name = ServerName::try_from(sni.as_str())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("{sni}: {e}")))?;
            Some(name)
        } else {
            None
        };

        let started = Instant::now();
        let stream = http::open(socket, name.as_ref()).await?;
        Ok((stream, started.elapsed()))
    }

    /// Sends a trace request over an established TLS session and drops the
    /// answer.
    async fn greet(&self, addr: IpAddr, mut stream: Box<dyn Stream>) {
        let request = http::request(TRACE_PATH, &self.config.server_name(addr), false);
        if let Err(e) = stream.write_all(request.as_bytes()).await {
            trace!("{addr}: trace request failed: {e}");
            return;
        }
        let mut buf = vec![0; READ_LIMIT];
        match stream.read(&mut buf).await {
            Ok(n) => trace!("{addr}: trace answered with {n} bytes"),
            Err(e) => trace!("{addr}: trace read failed: {e}"),
        }
    }
}

#[async_trait]
impl Prober for TunnelProber {
    /// Probes `config.port` only; `ports` is not consulted.
    ///
    /// A completed handshake is a valid verdict whatever happens to the
    /// trace request sent after it.
    async fn probe(
        &self,
        addr: IpAddr,
        _ports: &[u16],
        cancel: &CancellationToken,
    ) -> Result<Option<Verdict>> {
        enter(Phase::Dedup);
        if self.failures.contains(&addr) || cancel.is_cancelled() {
            return Ok(None);
        }

        enter(Phase::Handshake);
        let budget = timeouts::tunnel(self.max_latency_ms);
        let outcome = tokio::select! {
            outcome = time::timeout(budget, self.handshake(addr)) => outcome,
            () = cancel.cancelled() => return Ok(None),
        };

        let (stream, latency) = match outcome {
            Ok(Ok(opened)) => opened,
            Ok(Err(e)) => {
                trace!("{addr}: {e}");
                self.failures.insert(addr);
                return Ok(None);
            }
            Err(_) => {
                trace!("{addr}: no handshake within {budget:?}");
                self.failures.insert(addr);
                return Ok(None);
            }
        };

        let ping_ms = latency.as_secs_f64() * 1000.0;
        debug!("{addr}: {} handshake in {ping_ms:.0}ms", self.config.protocol());

        if self.config.is_tls() {
            tokio::select! {
                greeted = time::timeout(GREETING_TIMEOUT, self.greet(addr, stream)) => {
                    if greeted.is_err() {
                        trace!("{addr}: no trace answer within {GREETING_TIMEOUT:?}");
                    }
                }
                () = cancel.cancelled() => {}
            }
        }

        Ok(Some(Verdict::valid(
            addr,
            vec![self.config.port()],
            Some(ping_ms),
        )))
    }
}
