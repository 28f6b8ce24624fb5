use serde::{Deserialize, Serialize};

/// Voice-activity detection settings.
///
/// Levels are on the 0-255 scale produced by mapping the band magnitude
/// from `[min_db, max_db]` onto a byte.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    pub tick_ms: u64,
    pub fft_size: usize,
    pub band_low_hz: f64,
    pub band_high_hz: f64,
    /// Weight of the previous level in the exponential smoother.
    pub smoothing: f64,
    pub min_db: f64,
    pub max_db: f64,
    /// Threshold for the local microphone (user adjustable).
    pub local_threshold: f64,
    /// Threshold for every remote stream (fixed at runtime).
    pub remote_threshold: f64,
    pub local_hold_ms: u64,
    pub remote_hold_ms: u64,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            tick_ms: 20,
            fft_size: 512,
            band_low_hz: 300.0,
            band_high_hz: 3_400.0,
            smoothing: 0.7,
            min_db: -100.0,
            max_db: -30.0,
            local_threshold: 15.0,
            remote_threshold: 15.0,
            local_hold_ms: 160,
            remote_hold_ms: 200,
        }
    }
}
