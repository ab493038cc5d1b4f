// Engine Configuration
//
// Defines configuration for the grading engine: the database location and
// the tuning knobs of the per-snapshot reconcilers (batch sizes, restart
// ceiling, retry backoff, notification buffering).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// SQLite database path
    pub database_path: PathBuf,

    /// Reconciler settings, shared by every per-snapshot reconciler
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
}

/// Settings for per-snapshot grading reconcilers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Maximum pending pairs handed to the grading process per step
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Grading-process restarts allowed within one reconciliation episode
    /// before the reconciler gives up and waits for operator intervention
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Transient store failures retried per step before surfacing the error
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Base delay for exponential backoff between retries (in seconds)
    #[serde(default = "default_retry_backoff", with = "serde_duration")]
    pub retry_backoff: Duration,

    /// Ceiling for the backoff delay (in seconds)
    #[serde(default = "default_retry_backoff_cap", with = "serde_duration")]
    pub retry_backoff_cap: Duration,

    /// Change-notification channel depth; notifications beyond this are
    /// coalesced into the already-pending wakeup
    #[serde(default = "default_notification_buffer")]
    pub notification_buffer: usize,
}

fn default_batch_size() -> usize {
    16
}

fn default_max_restarts() -> u32 {
    10
}

fn default_retry_attempts() -> u32 {
    5
}

fn default_retry_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_retry_backoff_cap() -> Duration {
    Duration::from_secs(30)
}

fn default_notification_buffer() -> usize {
    64
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_restarts: default_max_restarts(),
            retry_attempts: default_retry_attempts(),
            retry_backoff: default_retry_backoff(),
            retry_backoff_cap: default_retry_backoff_cap(),
            notification_buffer: default_notification_buffer(),
        }
    }
}

// Custom serde module for Duration (serialize/deserialize as seconds)
mod serde_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

impl EngineConfig {
    /// Load configuration from TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_path.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "database_path must not be empty".to_string(),
            ));
        }
        self.reconciler.validate()
    }
}

impl ReconcilerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 || self.batch_size > 1000 {
            return Err(ConfigError::ValidationError(
                "reconciler: batch_size must be between 1 and 1000".to_string(),
            ));
        }
        if self.max_restarts == 0 {
            return Err(ConfigError::ValidationError(
                "reconciler: max_restarts must be at least 1".to_string(),
            ));
        }
        if self.retry_backoff.is_zero() {
            return Err(ConfigError::ValidationError(
                "reconciler: retry_backoff must be non-zero".to_string(),
            ));
        }
        if self.retry_backoff_cap < self.retry_backoff {
            return Err(ConfigError::ValidationError(
                "reconciler: retry_backoff_cap must be >= retry_backoff".to_string(),
            ));
        }
        if self.notification_buffer == 0 {
            return Err(ConfigError::ValidationError(
                "reconciler: notification_buffer must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
