use std::time::Duration;

use voxlink_config::schema::SignalingConfig;

/// Reconnect delay schedule: `min(base * factor^(attempt-1), max)`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base_ms: u64,
    factor: f64,
    max_ms: u64,
    max_attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, factor: f64, max: Duration, max_attempts: u32) -> Self {
        let base_ms = base.as_millis() as u64;
        Self {
            base_ms,
            factor: factor.max(1.0),
            max_ms: (max.as_millis() as u64).max(base_ms),
            max_attempts,
        }
    }

    pub fn from_config(config: &SignalingConfig) -> Self {
        Self::new(
            Duration::from_millis(config.reconnect_base_ms),
            config.reconnect_factor,
            Duration::from_millis(config.reconnect_max_ms),
            config.max_reconnect_attempts,
        )
    }

    /// Delay before reconnect attempt `attempt` (1-based; 0 is treated as 1).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(64) as i32;
        let ms = self.base_ms as f64 * self.factor.powi(exp);
        if !ms.is_finite() || ms >= self.max_ms as f64 {
            Duration::from_millis(self.max_ms)
        } else {
            Duration::from_millis(ms as u64)
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }

    /// Whether attempt number `attempt` is still allowed.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }
}
