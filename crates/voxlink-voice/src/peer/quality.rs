use std::fmt;
use std::time::Duration;

use serde::Serialize;

use super::transport::TransportStats;

/// Connection-quality indicator. Ordered worst to best.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Poor,
    Fair,
    Good,
    Excellent,
}

impl fmt::Display for ConnectionQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionQuality::Poor => "poor",
            ConnectionQuality::Fair => "fair",
            ConnectionQuality::Good => "good",
            ConnectionQuality::Excellent => "excellent",
        };
        f.write_str(s)
    }
}

/// Classify a loss fraction (0.0-1.0) and round-trip time.
pub fn assess(loss: f64, rtt: Option<Duration>) -> ConnectionQuality {
    let rtt_ms = rtt.map_or(0, |d| d.as_millis());
    if loss > 0.05 || rtt_ms > 300 {
        ConnectionQuality::Poor
    } else if loss > 0.02 || rtt_ms > 150 {
        ConnectionQuality::Fair
    } else if loss > 0.005 || rtt_ms > 80 {
        ConnectionQuality::Good
    } else {
        ConnectionQuality::Excellent
    }
}

/// Quality over the interval between two cumulative snapshots.
pub fn assess_delta(previous: Option<&TransportStats>, current: &TransportStats) -> ConnectionQuality {
    let (received, lost) = match previous {
        Some(prev) => (
            current.packets_received.saturating_sub(prev.packets_received),
            current.packets_lost.saturating_sub(prev.packets_lost),
        ),
        None => (current.packets_received, current.packets_lost),
    };
    let total = received + lost;
    let loss = if total == 0 {
        0.0
    } else {
        lost as f64 / total as f64
    };
    assess(loss, current.round_trip_time)
}
