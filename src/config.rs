//! Configuration System
//!
//! Handles loading compaction and logging settings from TOML files.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub compaction: CompactionConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Compaction writer configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CompactionConfig {
    #[serde(default = "default_write_buffer_size")]
    pub write_buffer_size: usize,

    #[serde(default = "default_sync_on_complete")]
    pub sync_on_complete: bool,

    #[serde(default = "default_temp_suffix")]
    pub temp_suffix: String,
}

fn default_write_buffer_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_sync_on_complete() -> bool {
    true
}

fn default_temp_suffix() -> String {
    "compacting".to_string()
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            write_buffer_size: default_write_buffer_size(),
            sync_on_complete: default_sync_on_complete(),
            temp_suffix: default_temp_suffix(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        config.validate()?;
        tracing::debug!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::from("<string>"),
            error: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.compaction.write_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "compaction.write_buffer_size must be greater than zero".to_string(),
            ));
        }
        if self.compaction.temp_suffix.is_empty() {
            return Err(ConfigError::Invalid(
                "compaction.temp_suffix must not be empty".to_string(),
            ));
        }
        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(ConfigError::Invalid(format!(
                "logging.format must be \"pretty\" or \"json\", got {:?}",
                self.logging.format
            )));
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to initialise logging: {0}")]
    Logging(String),
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# Chronicle TSI Configuration

[compaction]
# Buffer size for the compaction writer (bytes)
write_buffer_size = 65536

# fsync the output file and its directory before returning
sync_on_complete = true

# Suffix of the temporary file written next to the target
temp_suffix = "compacting"

[logging]
# Log level or filter directive: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}
