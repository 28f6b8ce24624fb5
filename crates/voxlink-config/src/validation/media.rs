use super::helpers::{validate_range, validate_range_f64};
use crate::schema::VoxlinkConfig;

pub(super) fn validate_audio(errors: &mut Vec<String>, config: &VoxlinkConfig) {
    let a = &config.audio;
    validate_range(errors, "audio.sample_rate", u64::from(a.sample_rate), 8_000, 96_000);
    validate_range(errors, "audio.frame_ms", u64::from(a.frame_ms), 5, 100);
    let nyquist = f64::from(a.sample_rate) / 2.0;
    validate_range_f64(errors, "audio.highpass_hz", a.highpass_hz, 10.0, 1_000.0);
    validate_range_f64(errors, "audio.lowpass_hz", a.lowpass_hz, 1_000.0, nyquist);
    validate_range_f64(errors, "audio.gate_ramp_ms", a.gate_ramp_ms, 0.0, 500.0);
    validate_range_f64(errors, "audio.input_volume", a.input_volume, 0.0, 2.0);
    validate_range(errors, "audio.max_audio_bitrate", u64::from(a.max_audio_bitrate), 6_000, 510_000);

    let c = &a.compressor;
    validate_range_f64(errors, "audio.compressor.threshold_db", c.threshold_db, -100.0, 0.0);
    validate_range_f64(errors, "audio.compressor.knee_db", c.knee_db, 0.0, 40.0);
    validate_range_f64(errors, "audio.compressor.ratio", c.ratio, 1.0, 20.0);
    validate_range_f64(errors, "audio.compressor.attack_ms", c.attack_ms, 0.0, 1_000.0);
    validate_range_f64(errors, "audio.compressor.release_ms", c.release_ms, 0.0, 1_000.0);

    for (name, v) in [("audio.camera", &a.camera), ("audio.screen", &a.screen)] {
        validate_range(errors, &format!("{name}.width"), u64::from(v.width), 16, 7_680);
        validate_range(errors, &format!("{name}.height"), u64::from(v.height), 16, 4_320);
        validate_range(errors, &format!("{name}.frame_rate"), u64::from(v.frame_rate), 1, 120);
    }
}

pub(super) fn validate_vad(errors: &mut Vec<String>, config: &VoxlinkConfig) {
    let v = &config.vad;
    validate_range(errors, "vad.tick_ms", v.tick_ms, 5, 200);
    validate_range(errors, "vad.fft_size", v.fft_size as u64, 64, 8_192);
    if !v.fft_size.is_power_of_two() {
        errors.push(format!("vad.fft_size = {} must be a power of two", v.fft_size));
    }
    validate_range_f64(errors, "vad.smoothing", v.smoothing, 0.0, 0.99);
    validate_range_f64(errors, "vad.local_threshold", v.local_threshold, 0.0, 255.0);
    validate_range_f64(errors, "vad.remote_threshold", v.remote_threshold, 0.0, 255.0);
    validate_range(errors, "vad.local_hold_ms", v.local_hold_ms, 0, 5_000);
    validate_range(errors, "vad.remote_hold_ms", v.remote_hold_ms, 0, 5_000);
    if v.band_low_hz <= 0.0 || v.band_low_hz >= v.band_high_hz {
        errors.push(format!(
            "vad band [{}, {}] must satisfy 0 < low < high",
            v.band_low_hz, v.band_high_hz
        ));
    }
    if v.min_db >= v.max_db {
        errors.push(format!("vad.min_db = {} must be below max_db = {}", v.min_db, v.max_db));
    }
}
