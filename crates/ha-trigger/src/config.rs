//! Engine configuration
//!
//! Loaded from a YAML file; every key is optional.
//!
//! ```yaml
//! event_channel_capacity: 1024
//! handler_mode:
//!   mode: queued
//!   max: 4
//! wait_until_timeout: 30
//! log_level: info
//! script_dirs:
//!   - /config/pyscripts
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::handler::ExecutionMode;

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors that can occur during configuration loading
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read a file
    #[error("failed to read file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse YAML
    #[error("failed to parse YAML in {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// Invalid configuration value
    #[error("invalid configuration value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },
}

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error", "off"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Buffer size of each event type's broadcast channel
    pub event_channel_capacity: usize,

    /// How handler invocations of one trigger overlap
    pub handler_mode: ExecutionMode,

    /// Timeout in seconds applied to `wait_until` calls that set none
    pub wait_until_timeout: Option<f64>,

    /// Default log filter when RUST_LOG is not set
    pub log_level: String,

    /// Directories scanned for `*.py` scripts
    pub script_dirs: Vec<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_channel_capacity: 1024,
            handler_mode: ExecutionMode::default(),
            wait_until_timeout: None,
            log_level: "info".to_string(),
            script_dirs: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Load and validate a configuration file
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        debug!("Loading engine config: {:?}", path);
        let content = fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_yaml_str(&content, path)
    }

    /// Parse and validate configuration from YAML text
    pub fn from_yaml_str(content: &str, source_path: &Path) -> ConfigResult<Self> {
        // An empty file is an empty mapping, not an error
        let config: EngineConfig = if content.trim().is_empty() {
            EngineConfig::default()
        } else {
            serde_yaml::from_str(content).map_err(|e| ConfigError::ParseYaml {
                path: source_path.to_path_buf(),
                source: e,
            })?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.event_channel_capacity == 0 {
            return Err(invalid("event_channel_capacity", "must be at least 1"));
        }
        match self.handler_mode {
            ExecutionMode::Queued { max: 0 } | ExecutionMode::Parallel { max: 0 } => {
                return Err(invalid("handler_mode.max", "must be at least 1"));
            }
            _ => {}
        }
        if let Some(timeout) = self.wait_until_timeout {
            if !timeout.is_finite() || timeout < 0.0 {
                return Err(invalid(
                    "wait_until_timeout",
                    "must be a non-negative number of seconds",
                ));
            }
        }
        if !LOG_LEVELS.contains(&self.log_level.to_ascii_lowercase().as_str()) {
            return Err(invalid(
                "log_level",
                &format!("expected one of {}", LOG_LEVELS.join(", ")),
            ));
        }
        Ok(())
    }

    pub fn wait_until_timeout(&self) -> Option<Duration> {
        self.wait_until_timeout.map(Duration::from_secs_f64)
    }
}

fn invalid(key: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}
