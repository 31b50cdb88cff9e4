//! Error types shared by the probing engine.
//!
//! Network failures (timeouts, refused connections) are never represented here:
//! they are absorbed by the probers and only show up as "no verdict".
use std::fmt;
use std::net::IpAddr;

use thiserror::Error;

/// Result alias used across the engine.
pub type Result<T> = std::result::Result<T, ScanError>;

/// The step of a probe that was running when something went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Dedup,
    Prefilter,
    Verify,
    Sweep,
    Handshake,
    /// The task running the probe itself failed.
    Task,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Dedup => "dedup check",
            Self::Prefilter => "tcp pre-filter",
            Self::Verify => "trace verification",
            Self::Sweep => "port sweep",
            Self::Handshake => "tls handshake",
            Self::Task => "probe task",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum ScanError {
    /// Input that prevents a campaign from starting at all.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Unexpected internal failure during a round.
    #[error("fault while probing {address} ({phase}): {message}")]
    Fault {
        address: IpAddr,
        phase: Phase,
        message: String,
    },
}

impl ScanError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn fault(address: IpAddr, phase: Phase, message: impl Into<String>) -> Self {
        Self::Fault {
            address,
            phase,
            message: message.into(),
        }
    }
}
