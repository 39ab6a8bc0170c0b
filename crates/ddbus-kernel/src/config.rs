//! Configuration loading from `~/.ddbus/config.toml` with defaults.

use crate::error::{KernelError, KernelResult};
use ddbus_types::{BusConfig, DdError};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Load bus configuration from a TOML file, with defaults.
///
/// A missing, unreadable or malformed file yields [`BusConfig::default`].
pub fn load_config(path: Option<&Path>) -> BusConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return BusConfig::default();
    }

    match read_config(&config_path) {
        Ok(config) => {
            info!(path = %config_path.display(), "Loaded configuration");
            config
        }
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to load config, using defaults"
            );
            BusConfig::default()
        }
    }
}

/// Load and validate a configuration file, failing instead of falling back.
pub fn load_config_strict(path: &Path) -> KernelResult<BusConfig> {
    let config = read_config(path)?;
    validate(&config)?;
    Ok(config)
}

fn read_config(path: &Path) -> Result<BusConfig, DdError> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| DdError::Config(format!("{}: {e}", path.display())))?;
    toml::from_str::<BusConfig>(&contents)
        .map_err(|e| DdError::Config(format!("{}: {e}", path.display())))
}

/// Reject configurations no connection could run with.
pub fn validate(config: &BusConfig) -> KernelResult<()> {
    if config.name_prefix.is_empty() {
        return Err(KernelError::BootFailed(
            "name_prefix must not be empty".to_string(),
        ));
    }
    if config.service_port == 0 {
        return Err(KernelError::BootFailed(
            "service_port must be non-zero".to_string(),
        ));
    }
    if config.probe_interval_secs == 0 {
        return Err(KernelError::BootFailed(
            "probe_interval_secs must be at least 1".to_string(),
        ));
    }
    if config.probe_miss_threshold == 0 {
        return Err(KernelError::BootFailed(
            "probe_miss_threshold must be at least 1".to_string(),
        ));
    }
    Ok(())
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    ddbus_home().join("config.toml")
}

/// Get the default ddbus home directory.
pub fn ddbus_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".ddbus")
}
