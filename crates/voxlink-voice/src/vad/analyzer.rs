use std::collections::VecDeque;
use std::f32::consts::PI;
use std::ops::Range;
use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

/// Parameters of the band-energy analysis.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzerSettings {
    pub fft_size: usize,
    pub band_low_hz: f64,
    pub band_high_hz: f64,
    pub min_db: f64,
    pub max_db: f64,
}

/// Sliding-window spectrum analyser reporting the average in-band level on a
/// 0-255 scale.
pub struct SpectrumAnalyzer {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    history: VecDeque<f32>,
    scratch: Vec<Complex<f32>>,
    bins: Range<usize>,
    min_db: f64,
    max_db: f64,
}

impl SpectrumAnalyzer {
    pub fn new(settings: &AnalyzerSettings, sample_rate: u32) -> Self {
        let size = settings.fft_size.max(2);
        let fft = FftPlanner::new().plan_fft_forward(size);
        Self {
            fft,
            window: blackman(size),
            history: VecDeque::with_capacity(size),
            scratch: vec![Complex::default(); size],
            bins: band_bins(size, sample_rate, settings.band_low_hz, settings.band_high_hz),
            min_db: settings.min_db,
            max_db: settings.max_db,
        }
    }

    pub fn bins(&self) -> Range<usize> {
        self.bins.clone()
    }

    /// Append samples, keeping only the most recent window.
    pub fn push(&mut self, samples: &[f32]) {
        let size = self.window.len();
        let skip = samples.len().saturating_sub(size);
        self.history.extend(&samples[skip..]);
        while self.history.len() > size {
            self.history.pop_front();
        }
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }

    /// Average level over the band, 0.0-255.0.
    pub fn level(&mut self) -> f32 {
        if self.bins.is_empty() || self.history.is_empty() {
            return 0.0;
        }
        let size = self.window.len();
        let pad = size - self.history.len();
        for (i, slot) in self.scratch.iter_mut().enumerate() {
            let sample = if i < pad { 0.0 } else { self.history[i - pad] };
            *slot = Complex::new(sample * self.window[i], 0.0);
        }
        self.fft.process(&mut self.scratch);

        let span = self.max_db - self.min_db;
        let norm = 1.0 / size as f32;
        let total: f64 = self.scratch[self.bins.clone()]
            .iter()
            .map(|c| {
                let magnitude = f64::from(c.norm() * norm);
                let db = if magnitude > 0.0 {
                    20.0 * magnitude.log10()
                } else {
                    self.min_db
                };
                (255.0 * (db - self.min_db) / span).clamp(0.0, 255.0)
            })
            .sum();
        (total / self.bins.len() as f64) as f32
    }
}

fn blackman(size: usize) -> Vec<f32> {
    let n = size as f32;
    (0..size)
        .map(|i| {
            let x = i as f32 / n;
            0.42 - 0.5 * (2.0 * PI * x).cos() + 0.08 * (4.0 * PI * x).cos()
        })
        .collect()
}

/// FFT bins covering `[low_hz, high_hz]`, clamped to the positive half.
fn band_bins(size: usize, sample_rate: u32, low_hz: f64, high_hz: f64) -> Range<usize> {
    let hz_per_bin = f64::from(sample_rate) / size as f64;
    let half = size / 2;
    let low = ((low_hz / hz_per_bin).round() as usize).clamp(1, half);
    let high = ((high_hz / hz_per_bin).round() as usize + 1).clamp(low, half);
    low..high
}
