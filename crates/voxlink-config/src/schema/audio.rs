//! Local media pipeline settings.

use serde::{Deserialize, Serialize};

/// Fixed dynamics-compressor parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressorConfig {
    pub threshold_db: f64,
    pub knee_db: f64,
    pub ratio: f64,
    pub attack_ms: f64,
    pub release_ms: f64,
}

impl Default for CompressorConfig {
    fn default() -> Self {
        Self {
            threshold_db: -24.0,
            knee_db: 30.0,
            ratio: 12.0,
            attack_ms: 3.0,
            release_ms: 250.0,
        }
    }
}

/// Capture constraints for camera and screen tracks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoCaptureConfig {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

impl Default for VideoCaptureConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            frame_rate: 30,
        }
    }
}

/// Audio capture and processing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    /// Capture block length in milliseconds.
    pub frame_ms: u32,
    pub highpass_hz: f64,
    pub lowpass_hz: f64,
    pub compressor: CompressorConfig,
    /// Noise gate open/close ramp in milliseconds.
    pub gate_ramp_ms: f64,
    /// Output gain, 1.0 = unity. Range 0.0-2.0.
    pub input_volume: f64,
    /// Max bitrate applied to outgoing audio senders (bits/s).
    pub max_audio_bitrate: u32,
    pub camera: VideoCaptureConfig,
    pub screen: VideoCaptureConfig,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            frame_ms: 20,
            highpass_hz: 80.0,
            lowpass_hz: 12_000.0,
            compressor: CompressorConfig::default(),
            gate_ramp_ms: 10.0,
            input_volume: 1.0,
            max_audio_bitrate: 128_000,
            camera: VideoCaptureConfig::default(),
            screen: VideoCaptureConfig {
                width: 1920,
                height: 1080,
                frame_rate: 30,
            },
        }
    }
}
