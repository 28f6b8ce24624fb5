//! Sample-by-sample processing blocks.
//!
//! All state is kept in `f64`; samples cross the boundary as `f32`.

use std::f64::consts::PI;

use voxlink_config::schema::CompressorConfig;

const BUTTERWORTH_Q: f64 = std::f64::consts::FRAC_1_SQRT_2;

// ---------------------------------------------------------------------------
// Biquad
// ---------------------------------------------------------------------------

/// Second-order IIR filter (RBJ cookbook coefficients, transposed direct form II).
#[derive(Debug, Clone)]
pub struct Biquad {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
    z1: f64,
    z2: f64,
}

impl Biquad {
    pub fn highpass(cutoff_hz: f64, sample_rate: f64) -> Self {
        let (cos, alpha) = Self::prewarp(cutoff_hz, sample_rate);
        Self::normalized(
            (1.0 + cos) / 2.0,
            -(1.0 + cos),
            (1.0 + cos) / 2.0,
            1.0 + alpha,
            -2.0 * cos,
            1.0 - alpha,
        )
    }

    pub fn lowpass(cutoff_hz: f64, sample_rate: f64) -> Self {
        let (cos, alpha) = Self::prewarp(cutoff_hz, sample_rate);
        Self::normalized(
            (1.0 - cos) / 2.0,
            1.0 - cos,
            (1.0 - cos) / 2.0,
            1.0 + alpha,
            -2.0 * cos,
            1.0 - alpha,
        )
    }

    fn prewarp(cutoff_hz: f64, sample_rate: f64) -> (f64, f64) {
        // Keep the cutoff strictly inside (0, nyquist).
        let nyquist = sample_rate / 2.0;
        let f0 = cutoff_hz.clamp(1.0, nyquist * 0.999);
        let w0 = 2.0 * PI * f0 / sample_rate;
        (w0.cos(), w0.sin() / (2.0 * BUTTERWORTH_Q))
    }

    fn normalized(b0: f64, b1: f64, b2: f64, a0: f64, a1: f64, a2: f64) -> Self {
        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
            z1: 0.0,
            z2: 0.0,
        }
    }

    pub fn process(&mut self, x: f32) -> f32 {
        let x = f64::from(x);
        let y = self.b0 * x + self.z1;
        self.z1 = self.b1 * x - self.a1 * y + self.z2;
        self.z2 = self.b2 * x - self.a2 * y;
        y as f32
    }

    pub fn reset(&mut self) {
        self.z1 = 0.0;
        self.z2 = 0.0;
    }
}

// ---------------------------------------------------------------------------
// Compressor
// ---------------------------------------------------------------------------

/// Feed-forward peak compressor with a soft knee.
#[derive(Debug, Clone)]
pub struct Compressor {
    threshold_db: f64,
    knee_db: f64,
    ratio: f64,
    attack_coeff: f64,
    release_coeff: f64,
    /// Current gain reduction in dB, always <= 0.
    gain_db: f64,
}

impl Compressor {
    pub fn new(config: &CompressorConfig, sample_rate: f64) -> Self {
        Self {
            threshold_db: config.threshold_db,
            knee_db: config.knee_db.max(0.0),
            ratio: config.ratio.max(1.0),
            attack_coeff: time_coeff(config.attack_ms, sample_rate),
            release_coeff: time_coeff(config.release_ms, sample_rate),
            gain_db: 0.0,
        }
    }

    /// Static gain curve: reduction in dB for an input level in dBFS.
    pub fn static_gain_db(&self, level_db: f64) -> f64 {
        let over = level_db - self.threshold_db;
        let out = if 2.0 * over < -self.knee_db {
            level_db
        } else if self.knee_db > 0.0 && 2.0 * over.abs() <= self.knee_db {
            let x = over + self.knee_db / 2.0;
            level_db + (1.0 / self.ratio - 1.0) * x * x / (2.0 * self.knee_db)
        } else {
            self.threshold_db + over / self.ratio
        };
        out - level_db
    }

    pub fn process(&mut self, x: f32) -> f32 {
        let level_db = 20.0 * f64::from(x.abs()).max(1e-9).log10();
        let target = self.static_gain_db(level_db);
        let coeff = if target < self.gain_db {
            self.attack_coeff
        } else {
            self.release_coeff
        };
        self.gain_db = coeff * self.gain_db + (1.0 - coeff) * target;
        x * db_to_linear(self.gain_db) as f32
    }

    pub fn gain_reduction_db(&self) -> f64 {
        self.gain_db
    }
}

fn time_coeff(ms: f64, sample_rate: f64) -> f64 {
    if ms <= 0.0 {
        return 0.0;
    }
    (-1.0 / (ms / 1000.0 * sample_rate)).exp()
}

fn db_to_linear(db: f64) -> f64 {
    10f64.powf(db / 20.0)
}

// ---------------------------------------------------------------------------
// Noise gate
// ---------------------------------------------------------------------------

/// Gain stage driven by an external open/closed decision, ramped to avoid clicks.
#[derive(Debug, Clone)]
pub struct NoiseGate {
    gain: f64,
    step: f64,
}

impl NoiseGate {
    pub fn new(ramp_ms: f64, sample_rate: f64) -> Self {
        let ramp_samples = ramp_ms / 1000.0 * sample_rate;
        let step = if ramp_samples >= 1.0 {
            1.0 / ramp_samples
        } else {
            1.0
        };
        Self { gain: 0.0, step }
    }

    pub fn process(&mut self, x: f32, open: bool) -> f32 {
        let target = if open { 1.0 } else { 0.0 };
        if self.gain < target {
            self.gain = (self.gain + self.step).min(target);
        } else if self.gain > target {
            self.gain = (self.gain - self.step).max(target);
        }
        x * self.gain as f32
    }

    pub fn gain(&self) -> f64 {
        self.gain
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: f64 = 48_000.0;

    fn sine(freq: f64, amplitude: f32, seconds: f64) -> Vec<f32> {
        let n = (RATE * seconds) as usize;
        (0..n)
            .map(|i| amplitude * (2.0 * PI * freq * i as f64 / RATE).sin() as f32)
            .collect()
    }

    /// RMS after the first 200 ms, once the filter has settled.
    fn settled_rms(samples: &[f32]) -> f64 {
        let tail = &samples[(RATE * 0.2) as usize..];
        let sum: f64 = tail.iter().map(|s| f64::from(*s) * f64::from(*s)).sum();
        (sum / tail.len() as f64).sqrt()
    }

    fn gain_through(filter: &mut Biquad, freq: f64) -> f64 {
        let input = sine(freq, 0.5, 1.0);
        let output: Vec<f32> = input.iter().map(|s| filter.process(*s)).collect();
        settled_rms(&output) / settled_rms(&input)
    }

    #[test]
    fn highpass_removes_rumble_and_keeps_voice() {
        let mut hp = Biquad::highpass(80.0, RATE);
        assert!(gain_through(&mut hp, 20.0) < 0.1);
        hp.reset();
        assert!(gain_through(&mut hp, 1_000.0) > 0.95);
    }

    #[test]
    fn lowpass_removes_hiss_and_keeps_voice() {
        let mut lp = Biquad::lowpass(12_000.0, RATE);
        assert!(gain_through(&mut lp, 20_000.0) < 0.4);
        lp.reset();
        assert!(gain_through(&mut lp, 1_000.0) > 0.95);
    }

    #[test]
    fn cutoff_is_half_power() {
        let mut hp = Biquad::highpass(80.0, RATE);
        let g = gain_through(&mut hp, 80.0);
        assert!((g - std::f64::consts::FRAC_1_SQRT_2).abs() < 0.05, "gain {g}");
    }

    #[test]
    fn static_curve_shape() {
        let c = Compressor::new(&CompressorConfig::default(), RATE);
        // Well below the knee: untouched.
        assert_eq!(c.static_gain_db(-60.0), 0.0);
        // Above the knee: threshold + over/ratio.
        let expected = (-24.0 + 24.0 / 12.0) - 0.0;
        assert!((c.static_gain_db(0.0) - expected).abs() < 1e-9);
        // Inside the knee the reduction is between the two.
        let knee = c.static_gain_db(-24.0);
        assert!(knee < 0.0 && knee > expected);
    }

    #[test]
    fn compressor_squashes_loud_input() {
        let mut c = Compressor::new(&CompressorConfig::default(), RATE);
        let input = sine(1_000.0, 0.9, 0.5);
        let output: Vec<f32> = input.iter().map(|s| c.process(*s)).collect();
        let peak = output[(RATE * 0.3) as usize..]
            .iter()
            .fold(0.0f32, |m, s| m.max(s.abs()));
        assert!(peak < 0.3, "peak {peak}");
        assert!(c.gain_reduction_db() < -10.0);
    }

    #[test]
    fn compressor_leaves_quiet_input_alone() {
        let mut c = Compressor::new(&CompressorConfig::default(), RATE);
        let input = sine(1_000.0, 0.001, 0.5);
        let output: Vec<f32> = input.iter().map(|s| c.process(*s)).collect();
        assert!(settled_rms(&output) / settled_rms(&input) > 0.9);
    }

    #[test]
    fn gate_ramps_instead_of_jumping() {
        let mut gate = NoiseGate::new(10.0, RATE);
        let first = gate.process(1.0, true);
        assert!(first > 0.0 && first < 0.01);

        for _ in 0..480 {
            gate.process(1.0, true);
        }
        assert_eq!(gate.gain(), 1.0);

        let closing = gate.process(1.0, false);
        assert!(closing < 1.0 && closing > 0.99);
        for _ in 0..480 {
            gate.process(1.0, false);
        }
        assert_eq!(gate.process(1.0, false), 0.0);
    }

    #[test]
    fn zero_ramp_switches_immediately() {
        let mut gate = NoiseGate::new(0.0, RATE);
        assert_eq!(gate.process(0.5, true), 0.5);
        assert_eq!(gate.process(0.5, false), 0.0);
    }
}
