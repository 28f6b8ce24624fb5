/// Edge-triggered speaking detector over a stream of levels.
///
/// Levels are smoothed exponentially. Speaking starts the first tick the
/// smoothed level exceeds the threshold and ends after `hold_ticks`
/// consecutive ticks at or below it.
#[derive(Debug, Clone)]
pub struct SpeakingDetector {
    smoothing: f32,
    threshold: f32,
    hold_ticks: u32,
    smoothed: f32,
    below: u32,
    speaking: bool,
}

impl SpeakingDetector {
    pub fn new(smoothing: f32, threshold: f32, hold_ticks: u32) -> Self {
        Self {
            smoothing: smoothing.clamp(0.0, 0.99),
            threshold,
            hold_ticks: hold_ticks.max(1),
            smoothed: 0.0,
            below: 0,
            speaking: false,
        }
    }

    pub fn set_threshold(&mut self, threshold: f32) {
        self.threshold = threshold;
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    pub fn smoothed(&self) -> f32 {
        self.smoothed
    }

    /// Feed one level. Returns `Some(state)` only when the state flips.
    pub fn update(&mut self, level: f32) -> Option<bool> {
        self.smoothed = self.smoothing * self.smoothed + (1.0 - self.smoothing) * level;

        if self.smoothed > self.threshold {
            self.below = 0;
            if !self.speaking {
                self.speaking = true;
                return Some(true);
            }
            return None;
        }

        if self.speaking {
            self.below += 1;
            if self.below >= self.hold_ticks {
                self.below = 0;
                self.speaking = false;
                return Some(false);
            }
        }
        None
    }
}

/// Ticks needed to cover `hold_ms`, at least one.
pub fn hold_ticks(hold_ms: u64, tick_ms: u64) -> u32 {
    let tick = tick_ms.max(1);
    u32::try_from(hold_ms.div_ceil(tick)).unwrap_or(u32::MAX).max(1)
}
