use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use voxlink_config::schema::AudioConfig;

use super::dsp::{Biquad, Compressor, NoiseGate};

/// Live controls shared between the pipeline owner, the processing task and
/// the local voice-activity loop.
#[derive(Debug)]
pub struct PipelineControls {
    volume: AtomicU32,
    gate_threshold: AtomicU32,
    gate_open: AtomicBool,
    muted: AtomicBool,
}

impl PipelineControls {
    pub const MAX_VOLUME: f32 = 2.0;
    pub const MAX_GATE_THRESHOLD: f32 = 255.0;

    pub fn new(volume: f32, gate_threshold: f32) -> Self {
        let controls = Self {
            volume: AtomicU32::new(0),
            gate_threshold: AtomicU32::new(0),
            gate_open: AtomicBool::new(false),
            muted: AtomicBool::new(false),
        };
        controls.set_volume(volume);
        controls.set_gate_threshold(gate_threshold);
        controls
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Relaxed))
    }

    /// Clamped to `0.0..=2.0`.
    pub fn set_volume(&self, volume: f32) {
        let v = if volume.is_nan() { 1.0 } else { volume.clamp(0.0, Self::MAX_VOLUME) };
        self.volume.store(v.to_bits(), Ordering::Relaxed);
    }

    pub fn gate_threshold(&self) -> f32 {
        f32::from_bits(self.gate_threshold.load(Ordering::Relaxed))
    }

    /// Clamped to the 0-255 level scale.
    pub fn set_gate_threshold(&self, threshold: f32) {
        let t = if threshold.is_nan() {
            0.0
        } else {
            threshold.clamp(0.0, Self::MAX_GATE_THRESHOLD)
        };
        self.gate_threshold.store(t.to_bits(), Ordering::Relaxed);
    }

    pub fn gate_open(&self) -> bool {
        self.gate_open.load(Ordering::Relaxed)
    }

    pub fn set_gate_open(&self, open: bool) {
        self.gate_open.store(open, Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }
}

/// Output of one processed block.
pub struct ProcessedBlock {
    /// Post-compressor signal, before gate and gain.
    pub analysis: Vec<f32>,
    /// What peers hear.
    pub output: Vec<f32>,
}

/// The fixed chain: high-pass, low-pass, compressor, analysis tap, gate, gain.
pub struct ProcessingGraph {
    highpass: Biquad,
    lowpass: Biquad,
    compressor: Compressor,
    gate: NoiseGate,
    controls: Arc<PipelineControls>,
}

impl ProcessingGraph {
    pub fn new(config: &AudioConfig, controls: Arc<PipelineControls>) -> Self {
        let rate = f64::from(config.sample_rate);
        Self {
            highpass: Biquad::highpass(config.highpass_hz, rate),
            lowpass: Biquad::lowpass(config.lowpass_hz, rate),
            compressor: Compressor::new(&config.compressor, rate),
            gate: NoiseGate::new(config.gate_ramp_ms, rate),
            controls,
        }
    }

    pub fn process(&mut self, input: &[f32]) -> ProcessedBlock {
        let muted = self.controls.is_muted();
        let analysis: Vec<f32> = input
            .iter()
            .map(|&x| {
                let x = if muted { 0.0 } else { x };
                let y = self.highpass.process(x);
                let y = self.lowpass.process(y);
                self.compressor.process(y)
            })
            .collect();

        let open = self.controls.gate_open();
        let volume = self.controls.volume();
        let output = analysis
            .iter()
            .map(|&y| self.gate.process(y, open) * volume)
            .collect();

        ProcessedBlock { analysis, output }
    }
}
