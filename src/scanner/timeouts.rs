//! Deadlines derived from the caller's latency ceiling.
//!
//! Every network operation gets its own deadline; there is no global watchdog.
use std::time::Duration;

/// Sequential trace requests per address.
pub const ATTEMPTS: usize = 5;
/// Successful requests needed for an address to count as valid.
pub const MIN_SUCCESSES: usize = 3;

const ATTEMPT_FACTORS: [f64; ATTEMPTS] = [1.5, 1.2, 1.0, 1.0, 1.0];
/// Above this ceiling every attempt gets the flat timeout.
const FLAT_ABOVE_MS: u32 = 3000;
const FLAT_ATTEMPT_SECS: f64 = 3.0;

fn ceiling_secs(max_latency_ms: u32) -> f64 {
    f64::from(max_latency_ms) / 1000.0
}

fn clamped(secs: f64, low: f64, high: f64) -> Duration {
    Duration::from_secs_f64(secs.clamp(low, high))
}

/// Timeout of the raw TCP connect that screens out dead addresses.
pub fn prefilter(max_latency_ms: u32) -> Duration {
    clamped(ceiling_secs(max_latency_ms) * 0.5, 1.5, 2.5)
}

/// Steps down as the ceiling grows: tight ceilings get more headroom.
pub fn latency_class_multiplier(max_latency_ms: u32) -> f64 {
    match max_latency_ms {
        0..=300 => 2.0,
        301..=500 => 1.8,
        501..=1000 => 1.5,
        1001..=3000 => 1.2,
        _ => 1.0,
    }
}

/// Timeout of trace attempt `attempt` (0-based).
pub fn attempt(attempt: usize, max_latency_ms: u32) -> Duration {
    if max_latency_ms > FLAT_ABOVE_MS {
        return Duration::from_secs_f64(FLAT_ATTEMPT_SECS);
    }
    let factor = ATTEMPT_FACTORS[attempt.min(ATTEMPTS - 1)];
    clamped(
        factor * latency_class_multiplier(max_latency_ms) * ceiling_secs(max_latency_ms),
        1.5,
        4.0,
    )
}

/// Wall-clock budget of the whole attempt sequence.
pub fn sequence_cap(max_latency_ms: u32) -> Duration {
    clamped(ceiling_secs(max_latency_ms) * 3.0, 8.0, 15.0)
}

/// Timeout of the connect on each secondary port.
pub fn sweep(max_latency_ms: u32) -> Duration {
    clamped(ceiling_secs(max_latency_ms), 1.5, 3.0)
}

/// Budget of a whole tunnel handshake check.
pub fn tunnel(max_latency_ms: u32) -> Duration {
    clamped(ceiling_secs(max_latency_ms) * 1.5, 1.0, 8.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parameterized::parameterized;

    fn assert_secs(actual: Duration, expected: f64) {
        assert!(
            (actual.as_secs_f64() - expected).abs() < 1e-6,
            "expected {expected}s, got {actual:?}"
        );
    }

    #[parameterized(max = {
        100, 1000, 1000, 1000, 3000, 3000, 9999, 500,
    }, index = {
        0, 0, 1, 4, 0, 2, 3, 0,
    }, expected = {
        1.5, 2.25, 1.8, 1.5, 4.0, 3.6, 3.0, 1.5,
    })]
    fn attempt_timeouts(max: u32, index: usize, expected: f64) {
        assert_secs(attempt(index, max), expected);
    }

    #[parameterized(max = { 0, 300, 301, 500, 1000, 3000, 3001 }, expected = { 2.0, 2.0, 1.8, 1.8, 1.5, 1.2, 1.0 })]
    fn latency_classes(max: u32, expected: f64) {
        assert!((latency_class_multiplier(max) - expected).abs() < f64::EPSILON);
    }

    #[test]
    fn prefilter_bounds() {
        assert_secs(prefilter(100), 1.5);
        assert_secs(prefilter(4000), 2.0);
        assert_secs(prefilter(9999), 2.5);
    }

    #[test]
    fn sequence_cap_bounds() {
        assert_secs(sequence_cap(100), 8.0);
        assert_secs(sequence_cap(4000), 12.0);
        assert_secs(sequence_cap(9999), 15.0);
    }

    #[test]
    fn sweep_and_tunnel_bounds() {
        assert_secs(sweep(200), 1.5);
        assert_secs(sweep(2000), 2.0);
        assert_secs(sweep(9999), 3.0);
        assert_secs(tunnel(0), 1.0);
        assert_secs(tunnel(2000), 3.0);
        assert_secs(tunnel(9999), 8.0);
    }
}
