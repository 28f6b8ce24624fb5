use super::*;
use std::path::Path;
use voxlink_common::ConfigError;

#[test]
fn load_from_nonexistent_returns_file_not_found() {
    let err = load_from_path(Path::new("/tmp/nonexistent_voxlink_config.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::FileNotFound(_)));
}

#[test]
fn load_valid_partial_toml() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
[signaling]
url = "wss://chat.example.com/ws"
token = "abc"

[vad]
local_threshold = 30.0
"#,
    )
    .unwrap();

    let config = load_from_path(&path).unwrap();
    assert_eq!(config.signaling.url, "wss://chat.example.com/ws");
    assert_eq!(config.signaling.token.as_deref(), Some("abc"));
    assert_eq!(config.vad.local_threshold, 30.0);
    // Defaults preserved
    assert_eq!(config.signaling.max_reconnect_attempts, 5);
    assert_eq!(config.vad.remote_hold_ms, 200);
    assert_eq!(config.audio.highpass_hz, 80.0);
}

#[test]
fn load_invalid_toml_returns_parse_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "this is not valid toml {{{").unwrap();

    let err = load_from_path(&path).unwrap_err();
    assert!(matches!(err, ConfigError::ParseError(_)));
}

#[test]
fn invalid_values_are_returned_with_a_warning() {
    let config = load_from_str("[audio]\ninput_volume = 5.0\n").unwrap();
    assert_eq!(config.audio.input_volume, 5.0);
}

#[test]
fn create_and_load_default_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("voxlink").join("config.toml");

    create_default_config(&path).unwrap();
    assert!(path.exists());

    let config = load_from_path(&path).unwrap();
    assert_eq!(config.signaling.reconnect_base_ms, 5_000);
    assert!(config.signaling.token.is_none());
}

#[test]
fn default_template_parses_to_defaults() {
    let config = load_from_str(&super::template::default_config_toml()).unwrap();
    assert!(crate::validation::validate(&config).is_ok());
    assert_eq!(config.peer.retry_max_attempts, 3);
}

#[test]
fn default_config_path_ends_with_voxlink() {
    if let Ok(path) = default_config_path() {
        assert!(path.ends_with("voxlink/config.toml"));
    }
}
