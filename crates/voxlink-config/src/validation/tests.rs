use super::*;
use crate::schema::*;

#[test]
fn default_config_validates() {
    assert!(validate(&VoxlinkConfig::default()).is_ok());
}

#[test]
fn catches_non_websocket_signaling_url() {
    let mut config = VoxlinkConfig::default();
    config.signaling.url = "http://example.com/ws".into();
    let err = validate(&config).unwrap_err().to_string();
    assert!(err.contains("signaling.url"));
}

#[test]
fn catches_reconnect_cap_below_base() {
    let mut config = VoxlinkConfig::default();
    config.signaling.reconnect_max_ms = 1_000;
    let err = validate(&config).unwrap_err().to_string();
    assert!(err.contains("reconnect_max_ms"));
}

#[test]
fn catches_blank_token() {
    let mut config = VoxlinkConfig::default();
    config.signaling.token = Some("   ".into());
    let err = validate(&config).unwrap_err().to_string();
    assert!(err.contains("signaling.token"));
}

#[test]
fn catches_empty_stun_list() {
    let mut config = VoxlinkConfig::default();
    config.ice.fallback_stun_urls.clear();
    let err = validate(&config).unwrap_err().to_string();
    assert!(err.contains("ice.fallback_stun_urls"));
}

#[test]
fn catches_volume_out_of_range() {
    let mut config = VoxlinkConfig::default();
    config.audio.input_volume = 2.5;
    let err = validate(&config).unwrap_err().to_string();
    assert!(err.contains("audio.input_volume"));
}

#[test]
fn catches_lowpass_above_nyquist() {
    let mut config = VoxlinkConfig::default();
    config.audio.sample_rate = 16_000;
    let err = validate(&config).unwrap_err().to_string();
    assert!(err.contains("audio.lowpass_hz"));
}

#[test]
fn catches_fft_size_not_power_of_two() {
    let mut config = VoxlinkConfig::default();
    config.vad.fft_size = 500;
    let err = validate(&config).unwrap_err().to_string();
    assert!(err.contains("power of two"));
}

#[test]
fn catches_inverted_vad_band() {
    let mut config = VoxlinkConfig::default();
    config.vad.band_low_hz = 4_000.0;
    let err = validate(&config).unwrap_err().to_string();
    assert!(err.contains("vad band"));
}

#[test]
fn collects_multiple_errors() {
    let mut config = VoxlinkConfig::default();
    config.vad.smoothing = 1.5;
    config.peer.retry_max_attempts = 50;
    let err = validate(&config).unwrap_err().to_string();
    assert!(err.contains("vad.smoothing"));
    assert!(err.contains("peer.retry_max_attempts"));
}
