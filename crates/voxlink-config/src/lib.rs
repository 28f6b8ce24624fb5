//! Voxlink configuration system.
//!
//! TOML-based configuration for the signaling transport, the REST
//! collaborator, ICE fallback, the audio pipeline, voice-activity
//! detection and peer recovery. Every section has defaults so a partial
//! file (or no file at all) works.
//!
//! ```rust,no_run
//! use voxlink_config::{load_config, config_to_json};
//!
//! let config = load_config().expect("failed to load config");
//! println!("{}", config_to_json(&config));
//! ```

pub mod schema;
pub mod toml_loader;
pub mod validation;

pub use schema::{VoxlinkConfig, CONFIG_SCHEMA_VERSION};

use voxlink_common::ConfigError;

/// Load config from the platform default path and validate it.
///
/// Creates a commented default file on first run.
pub fn load_config() -> Result<VoxlinkConfig, ConfigError> {
    let config = toml_loader::load_default()?;
    validation::validate(&config)?;
    Ok(config)
}

/// Serialize a config to a pretty-printed JSON string.
pub fn config_to_json(config: &VoxlinkConfig) -> String {
    serde_json::to_string_pretty(config)
        .unwrap_or_else(|e| format!("{{\"error\": \"failed to serialize config: {e}\"}}"))
}
