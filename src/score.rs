//! Ranks verdicts by how useful the address is likely to be.
use crate::scanner::Verdict;

/// Points for latency, best band first.
const LATENCY_BANDS: [(f64, f64); 5] = [
    (50.0, 35.0),
    (100.0, 28.0),
    (200.0, 20.0),
    (500.0, 10.0),
    (1000.0, 3.0),
];

const PER_OPEN_PORT: f64 = 3.0;

/// Bonus points for well-known ports.
const PORT_BONUSES: [(u16, f64); 4] = [(443, 12.0), (80, 10.0), (8080, 4.0), (8443, 4.0)];

/// Scores a verdict on a 0 to 100 scale. Higher is better.
///
/// ```rust
/// # use cdnscan::scanner::Verdict;
/// # use cdnscan::score::score;
/// let verdict = Verdict::valid("104.16.0.1".parse().unwrap(), vec![443, 80], Some(42.0));
/// assert_eq!(score(&verdict), 35.0 + 6.0 + 12.0 + 10.0);
/// ```
#[allow(clippy::cast_precision_loss)]
pub fn score(verdict: &Verdict) -> f64 {
    let latency = verdict.ping_ms.map_or(0.0, |ping| {
        LATENCY_BANDS
            .iter()
            .find(|(limit, _)| ping < *limit)
            .map_or(0.0, |(_, points)| *points)
    });

    let ports = verdict.open_ports.len() as f64 * PER_OPEN_PORT;
    let bonus: f64 = PORT_BONUSES
        .iter()
        .filter(|(port, _)| verdict.open_ports.contains(port))
        .map(|(_, points)| points)
        .sum();

    (latency + ports + bonus).clamp(0.0, 100.0)
}
