use crate::schema::VoxlinkConfig;
use crate::validation;
use std::path::Path;
use tracing::{info, warn};
use voxlink_common::ConfigError;

use super::paths::{create_default_config, default_config_path};

/// Parse config from TOML text, filling missing fields with defaults.
pub fn load_from_str(content: &str) -> Result<VoxlinkConfig, ConfigError> {
    toml::from_str(content).map_err(|e| ConfigError::ParseError(format!("failed to parse TOML: {e}")))
}

/// Load config from a specific TOML file path.
///
/// Validation failures are logged and the parsed config is returned as-is;
/// callers that need a hard failure run [`validation::validate`] themselves.
pub fn load_from_path(path: &Path) -> Result<VoxlinkConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ConfigError::FileNotFound(path.to_path_buf())
        } else {
            ConfigError::ParseError(format!("failed to read {}: {e}", path.display()))
        }
    })?;

    let config = load_from_str(&content)?;

    if let Err(e) = validation::validate(&config) {
        warn!("config validation warning: {e}");
    }

    info!("loaded config from {}", path.display());
    Ok(config)
}

/// Load config from the platform-specific default path.
///
/// On Linux: `~/.config/voxlink/config.toml`
/// On macOS: `~/Library/Application Support/voxlink/config.toml`
///
/// If the file does not exist, writes a default file and returns defaults.
pub fn load_default() -> Result<VoxlinkConfig, ConfigError> {
    let path = default_config_path()?;

    match load_from_path(&path) {
        Ok(config) => Ok(config),
        Err(ConfigError::FileNotFound(_)) => {
            info!("no config found at {}, creating default", path.display());
            create_default_config(&path)?;
            Ok(VoxlinkConfig::default())
        }
        Err(e) => Err(e),
    }
}
