//! Configuration file structures for the wasi-sandbox.
//!
//! This module defines structures for TOML configuration files:
//! - [`ConfigFile`]: Top-level configuration file structure
//! - [`LoggingConfig`]: Diagnostic output settings for the CLI

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::SandboxConfig;

/// Top-level configuration file structure.
///
/// # Example
///
/// ```toml
/// [sandbox]
/// cache_dir = "./cache"
///
/// [sandbox.engine]
/// epoch_tick_ms = 5
///
/// [sandbox.execution]
/// timeout_ms = 10_000
///
/// [sandbox.environment]
/// clock = "deterministic"
/// entropy = "seeded"
/// seed = 7
///
/// [sandbox.environment.vars]
/// MODE = "render"
///
/// [logging]
/// format = "json"
/// filter = "info,wasi_sandbox=debug"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Sandbox configuration (engine, execution, environment).
    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ConfigFile {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigFileError::Io {
            path: path.display().to_string(),
            source: e,
        })?;

        debug!(path = %path.display(), "Loaded config file");

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed as TOML.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })
    }
}

/// Diagnostic logging configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Output format.
    #[serde(default)]
    pub format: LogFormat,

    /// `EnvFilter` directive; `RUST_LOG` takes precedence when set.
    #[serde(default)]
    pub filter: Option<String>,
}

/// Diagnostic log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration file.
    #[error("Failed to parse config file: {message}")]
    Parse { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ClockMode, EntropyMode};
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_default_config_file() {
        let config = ConfigFile::default();

        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert!(config.logging.filter.is_none());
        assert!(config.sandbox.cache_dir.is_none());
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
            [sandbox.execution]
            timeout_ms = 250
        "#;

        let config = assert_ok!(ConfigFile::from_toml(toml));

        assert_eq!(config.sandbox.execution.timeout_ms, 250);
        // Defaults applied
        assert_eq!(config.sandbox.engine.epoch_tick_ms, 5);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [sandbox]
            cache_dir = "./cache"

            [sandbox.engine]
            pooling_allocator = true
            max_instances = 4
            opt_level = "speed_and_size"

            [sandbox.execution]
            timeout_ms = 1_000
            max_fuel = 5_000_000
            stdout_capacity = 4096

            [sandbox.environment]
            clock = "deterministic"
            clock_start_secs = 1_700_000_000
            entropy = "seeded"
            seed = 7

            [sandbox.environment.vars]
            MODE = "render"

            [logging]
            format = "json"
            filter = "debug"
        "#;

        let config = assert_ok!(ConfigFile::from_toml(toml));

        assert_eq!(config.sandbox.cache_dir.as_deref(), Some("./cache"));
        assert!(config.sandbox.engine.pooling_allocator);
        assert_eq!(config.sandbox.engine.max_instances, 4);
        assert_eq!(config.sandbox.execution.max_fuel, 5_000_000);
        assert_eq!(config.sandbox.execution.stdout_capacity, 4096);
        assert_eq!(config.sandbox.environment.clock, ClockMode::Deterministic);
        assert_eq!(config.sandbox.environment.clock_start_secs, 1_700_000_000);
        assert_eq!(config.sandbox.environment.entropy, EntropyMode::Seeded);
        assert_eq!(
            config.sandbox.environment.vars.get("MODE").map(String::as_str),
            Some("render")
        );
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.filter.as_deref(), Some("debug"));
    }

    #[test]
    fn test_parse_invalid_toml() {
        let invalid = "this is not valid toml [";
        assert_err!(ConfigFile::from_toml(invalid));
    }

    #[test]
    fn test_missing_file() {
        let err = ConfigFile::from_file("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigFileError::Io { .. }));
    }
}
