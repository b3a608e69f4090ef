//! Configuration loading
//!
//! A missing config file yields built-in defaults (first run); a present
//! but malformed file is a fatal startup error with no side effects.

use std::path::Path;

use tracing::debug;

use super::types::Config;
use crate::error::ConfigError;

/// Load configuration from a JSON file, falling back to defaults when the
/// file does not exist.
///
/// # Errors
///
/// Returns `ConfigError` when the file exists but cannot be read, parsed,
/// or validated.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "config file missing, using defaults");
            let config = Config::default();
            config.validate()?;
            return Ok(config);
        }
        Err(e) => return Err(e.into()),
    };

    let config: Config = serde_json::from_str(&contents)
        .map_err(|e| ConfigError::ParseError(format!("{e} in {}", path.display())))?;
    config.validate()?;

    debug!(path = %path.display(), "configuration loaded");
    Ok(config)
}

/// Load configuration with environment overrides applied.
///
/// `BYPASS_ROUTER_LOG_LEVEL` overrides `log.level`.
///
/// # Errors
///
/// Returns `ConfigError` on load, parse, or validation failure.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let mut config = load_config(path)?;

    if let Ok(level) = std::env::var("BYPASS_ROUTER_LOG_LEVEL") {
        debug!(level, "log level overridden from environment");
        config.log.level = level;
    }

    config.validate()?;
    Ok(config)
}

/// Write a default configuration file at the given path
///
/// # Errors
///
/// Returns `ConfigError` when the file cannot be written.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let config = Config::default();
    let json = serde_json::to_string_pretty(&config)
        .map_err(|e| ConfigError::ParseError(e.to_string()))?;
    if let Some(dir) = path.as_ref().parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(path, json)?;
    Ok(())
}
