//! TOML configuration.
//!
//! ```toml
//! [store]
//! path = "queues.db"
//! busy_timeout_ms = 5000
//!
//! [queue]
//! lease_timeout_secs = 300.0
//! sweep_probability = 0.05
//! max_size = 1024
//!
//! [pipeline]
//! poll_interval_ms = 100
//! max_passes = 1000
//! ```
//!
//! Every section and key is optional.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::app::RunLimits;
use crate::queue::QueueOptions;
use crate::store::StoreOptions;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SluiceConfig {
    pub store: StoreConfig,
    /// Defaults applied to every queue.
    pub queue: QueueOptions,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
    #[serde(flatten)]
    pub options: StoreOptions,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("queues.db"),
            options: StoreOptions::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub poll_interval_ms: u64,
    pub max_passes: Option<u64>,
    pub deadline_secs: Option<f64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            max_passes: None,
            deadline_secs: None,
        }
    }
}

impl PipelineConfig {
    pub fn limits(&self) -> RunLimits {
        RunLimits {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_passes: self.max_passes,
            deadline: self
                .deadline_secs
                .map(|s| Duration::try_from_secs_f64(s.max(0.0)).unwrap_or(Duration::MAX)),
        }
    }
}

impl SluiceConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let q = &self.queue;
        if !(0.0..=1.0).contains(&q.sweep_probability) {
            return Err(ConfigError::Invalid(format!(
                "queue.sweep_probability must be within [0, 1], got {}",
                q.sweep_probability
            )));
        }
        if !q.lease_timeout_secs.is_finite() || q.lease_timeout_secs < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "queue.lease_timeout_secs must be non-negative, got {}",
                q.lease_timeout_secs
            )));
        }
        if !q.count_ttl_secs.is_finite() || q.count_ttl_secs < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "queue.count_ttl_secs must be finite and non-negative, got {}",
                q.count_ttl_secs
            )));
        }
        if q.max_size == Some(0) {
            return Err(ConfigError::Invalid("queue.max_size must be positive".to_string()));
        }
        if self.pipeline.deadline_secs.is_some_and(|d| !d.is_finite() || d < 0.0) {
            return Err(ConfigError::Invalid(
                "pipeline.deadline_secs must be non-negative".to_string(),
            ));
        }
        Ok(())
    }
}
