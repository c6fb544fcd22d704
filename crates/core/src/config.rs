//! Service configuration, loaded from YAML.
//!
//! Every field has a default, so an empty document is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::StoreConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub debug_info: DebugInfoConfig,
    pub symbolizer: SymbolizerConfig,
    pub logging: LoggingConfig,
}

impl Config {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        // serde_yaml rejects a completely empty document.
        if yaml.trim().is_empty() {
            return Ok(Config::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let yaml = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        Self::from_yaml(&yaml)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Resolve relative paths (database file, debug-info directory) against `base`.
    pub fn resolve_paths(mut self, base: &Path) -> Self {
        self.store = self.store.resolved(base);
        if self.debug_info.directory.is_relative() {
            self.debug_info.directory = base.join(&self.debug_info.directory);
        }
        self
    }
}

/// Location of the filesystem debug-info store (`<directory>/<build_id>/debuginfo`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugInfoConfig {
    pub directory: PathBuf,
}

impl Default for DebugInfoConfig {
    fn default() -> Self {
        Self { directory: PathBuf::from("debuginfo") }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SymbolizerConfig {
    /// Time between two background passes.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Number of mapping partitions resolved concurrently within one pass.
    pub concurrency: usize,
    /// Delay before retrying a location whose address resolved to nothing.
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Upper bound for the per-location retry delay.
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for SymbolizerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            concurrency: 4,
            initial_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default `tracing` filter directive; `RUST_LOG` takes precedence.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: LogFormat::Pretty }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}
