//! Full configuration validation.
//!
//! Each section has its own validator; this orchestrator runs them all and
//! collects every error into a single `ConfigError`.

mod helpers;
mod media;
mod network;

#[cfg(test)]
mod tests;

use crate::schema::VoxlinkConfig;
use voxlink_common::ConfigError;

/// Run all validations on a config, collecting all errors.
pub fn validate(config: &VoxlinkConfig) -> Result<(), ConfigError> {
    let mut errors: Vec<String> = Vec::new();

    network::validate_signaling(&mut errors, config);
    network::validate_api(&mut errors, config);
    network::validate_ice(&mut errors, config);
    network::validate_peer(&mut errors, config);
    media::validate_audio(&mut errors, config);
    media::validate_vad(&mut errors, config);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationError(errors.join("; ")))
    }
}
