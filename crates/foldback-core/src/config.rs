//! Engine configuration.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use thiserror::Error;

/// Default cap on a folded message (64 KiB).
const DEFAULT_MAX_FOLD_BYTES: usize = 64 * 1024;

/// Default event history size limit (100 MB).
const DEFAULT_EVENT_HISTORY_BYTES: usize = 100_000 * 1024;

const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 10_000;

fn default_max_fold_bytes() -> usize {
    DEFAULT_MAX_FOLD_BYTES
}

fn default_event_history_bytes() -> usize {
    DEFAULT_EVENT_HISTORY_BYTES
}

fn default_event_channel_capacity() -> usize {
    DEFAULT_EVENT_CHANNEL_CAPACITY
}

/// Where session state is persisted.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageConfig {
    /// Keep everything in memory. Lost on restart.
    #[default]
    Memory,
    /// One JSONL journal per session under `dir`.
    Jsonl { dir: PathBuf },
}

/// Configuration for the session engine.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct EngineConfig {
    /// Largest accepted folded message, in bytes.
    #[serde(default = "default_max_fold_bytes")]
    pub max_fold_bytes: usize,
    /// Byte budget for replayable event history.
    #[serde(default = "default_event_history_bytes")]
    pub event_history_bytes: usize,
    /// Capacity of the live event broadcast channel.
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
    /// Persistence backend.
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_fold_bytes: DEFAULT_MAX_FOLD_BYTES,
            event_history_bytes: DEFAULT_EVENT_HISTORY_BYTES,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            storage: StorageConfig::default(),
        }
    }
}

/// Configuration loading error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config value: {0}")]
    Invalid(String),
}

impl EngineConfig {
    /// Parse configuration from TOML text.
    ///
    /// # Errors
    /// Returns error if the text is not valid TOML or fails validation.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_fold_bytes == 0 {
            return Err(ConfigError::Invalid("max_fold_bytes must be positive".into()));
        }
        if self.event_channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "event_channel_capacity must be positive".into(),
            ));
        }
        Ok(())
    }
}
