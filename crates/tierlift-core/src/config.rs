//! tierlift.toml configuration parser.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierliftConfig {
    pub upgrader: UpgraderConfig,
    pub confidence: ConfidenceConfig,
    pub jobs: JobsConfig,
}

/// Maintenance loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpgraderConfig {
    /// Seconds between maintenance ticks.
    pub interval_secs: u64,
    /// Upper bound on a single call into the job queue.
    pub queue_timeout_ms: u64,
}

impl Default for UpgraderConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            queue_timeout_ms: 5000,
        }
    }
}

impl UpgraderConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }
}

/// Thresholds at which a candidate version is considered broken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceConfig {
    /// Failing share of attempted non-canary applications that must be exceeded.
    pub broken_failure_fraction: f64,
    /// Minimum number of failing non-canary applications.
    pub broken_min_failures: u32,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            broken_failure_fraction: 0.4,
            broken_min_failures: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// Retries per job before the queue reports a terminal failure.
    pub retry_budget: u32,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self { retry_budget: 1 }
    }
}

impl TierliftConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: TierliftConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fraction = self.confidence.broken_failure_fraction;
        if !(0.0..=1.0).contains(&fraction) {
            return Err(ConfigError::Invalid(format!(
                "confidence.broken_failure_fraction must be within [0, 1], got {fraction}"
            )));
        }
        if self.confidence.broken_min_failures == 0 {
            return Err(ConfigError::Invalid(
                "confidence.broken_min_failures must be at least 1".to_string(),
            ));
        }
        if self.upgrader.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "upgrader.interval_secs must be positive".to_string(),
            ));
        }
        if self.upgrader.queue_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "upgrader.queue_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
