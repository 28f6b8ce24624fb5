use serde::{Deserialize, Serialize};

/// Per-peer recovery and monitoring settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Delay before a `disconnected` peer is re-checked and ICE-restarted.
    pub disconnect_recheck_ms: u64,
    /// A peer still negotiating after this long is failed and retried.
    pub negotiation_timeout_ms: u64,
    /// Offer retries after a terminal failure, per peer.
    pub retry_max_attempts: u32,
    /// First retry delay; doubles on each further attempt.
    pub retry_base_ms: u64,
    /// Transport stats polling interval for the quality indicator.
    pub stats_interval_ms: u64,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            disconnect_recheck_ms: 5_000,
            negotiation_timeout_ms: 15_000,
            retry_max_attempts: 3,
            retry_base_ms: 1_000,
            stats_interval_ms: 2_000,
        }
    }
}
