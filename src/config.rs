//! Retry and polling configuration
//!
//! Plain serde structs with millisecond fields, so they can be read from JSON
//! alongside the rest of an application's settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid sync configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid sync configuration: {0}")]
    Invalid(String),
}

/// Bounded exponential backoff.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt, in millis.
    pub initial_delay_ms: u64,
    /// Upper bound for any single delay, in millis.
    pub max_delay_ms: u64,
    /// Growth factor applied per failed attempt.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 50,
            max_delay_ms: 2_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: initial_delay.as_millis() as u64,
            max_delay_ms: max_delay.as_millis() as u64,
            ..Self::default()
        }
    }

    /// Retry without waiting. Mostly useful in tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1.0,
        }
    }

    /// Delay to wait after `failures` failed attempts (1-based).
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 || self.initial_delay_ms == 0 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.max(1.0).powi(failures.saturating_sub(1) as i32);
        let millis = (self.initial_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(millis as u64)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid(format!(
                "{}.max_attempts must be at least 1",
                name
            )));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "{}.multiplier must be a finite number >= 1",
                name
            )));
        }
        Ok(())
    }
}

/// Settings for one document's sync stack.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Retries of merge-commit pushes on the server side.
    pub merge_retry: RetryPolicy,
    /// Retries of client pushes rejected with a conflict.
    pub sync_retry: RetryPolicy,
    /// Interval of the background sync loop, in millis.
    pub poll_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            merge_retry: RetryPolicy::default(),
            sync_retry: RetryPolicy::default(),
            poll_interval_ms: 1_000,
        }
    }
}

impl SyncConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig = serde_json::from_str(json)?;
        config.merge_retry.validate("merge_retry")?;
        config.sync_retry.validate("sync_retry")?;
        if config.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_ms must be positive".to_string(),
            ));
        }
        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
