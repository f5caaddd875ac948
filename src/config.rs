//! Outbox configuration.
//!
//! Loaded from JSON (camelCase keys, every field optional) and then
//! overridden from `OUTBOX_*` environment variables:
//!
//! ```json
//! {
//!   "enabled": true,
//!   "poller": { "batchSize": 50, "intervalMs": 2000 },
//!   "cleanup": { "schedule": "0 30 2 * * *", "retentionDays": 14 }
//! }
//! ```

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use cron::Schedule;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::drainer::{DEFAULT_BATCH_SIZE, DEFAULT_MAX_RETRY};

pub const DEFAULT_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_PUBLISH_TIMEOUT_MS: u64 = 10_000;
/// Every day at 03:00 UTC (`sec min hour day month weekday`).
pub const DEFAULT_CLEANUP_SCHEDULE: &str = "0 0 3 * * *";
pub const DEFAULT_RETENTION_DAYS: u32 = 7;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid value for {key}: {value:?}")]
    InvalidEnv { key: &'static str, value: String },

    #[error("invalid cleanup schedule {expression:?}: {reason}")]
    Schedule { expression: String, reason: String },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutboxConfig {
    /// Durable outbox path when true, direct broker publish when false.
    /// The drain task is governed by `poller.enabled` alone.
    pub enabled: bool,
    pub poller: PollerConfig,
    pub cleanup: CleanupConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PollerConfig {
    pub enabled: bool,
    pub batch_size: usize,
    pub max_retry: u32,
    /// Delay between the end of one drain and the start of the next.
    pub interval_ms: u64,
    pub publish_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CleanupConfig {
    /// Six-field cron expression, evaluated in UTC.
    pub schedule: String,
    pub retention_days: u32,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            poller: PollerConfig::default(),
            cleanup: CleanupConfig::default(),
        }
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: DEFAULT_BATCH_SIZE,
            max_retry: DEFAULT_MAX_RETRY,
            interval_ms: DEFAULT_INTERVAL_MS,
            publish_timeout_ms: DEFAULT_PUBLISH_TIMEOUT_MS,
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            schedule: DEFAULT_CLEANUP_SCHEDULE.to_string(),
            retention_days: DEFAULT_RETENTION_DAYS,
        }
    }
}

impl OutboxConfig {
    /// Defaults overridden from the process environment.
    pub fn from_env() -> ConfigResult<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    pub fn from_json_str(json: &str) -> ConfigResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load from a JSON file, then apply environment overrides.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_json_str(&content)?;
        config.apply_env()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> ConfigResult<()> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup; `apply_env` uses the process
    /// environment.
    pub fn apply_vars<F>(&mut self, var: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = var("OUTBOX_ENABLED") {
            self.enabled = parse_var("OUTBOX_ENABLED", v)?;
        }
        if let Some(v) = var("OUTBOX_POLLER_ENABLED") {
            self.poller.enabled = parse_var("OUTBOX_POLLER_ENABLED", v)?;
        }
        if let Some(v) = var("OUTBOX_POLLER_BATCH_SIZE") {
            self.poller.batch_size = parse_var("OUTBOX_POLLER_BATCH_SIZE", v)?;
        }
        if let Some(v) = var("OUTBOX_POLLER_MAX_RETRY") {
            self.poller.max_retry = parse_var("OUTBOX_POLLER_MAX_RETRY", v)?;
        }
        if let Some(v) = var("OUTBOX_POLLER_INTERVAL_MS") {
            self.poller.interval_ms = parse_var("OUTBOX_POLLER_INTERVAL_MS", v)?;
        }
        if let Some(v) = var("OUTBOX_POLLER_PUBLISH_TIMEOUT_MS") {
            self.poller.publish_timeout_ms = parse_var("OUTBOX_POLLER_PUBLISH_TIMEOUT_MS", v)?;
        }
        if let Some(v) = var("OUTBOX_CLEANUP_SCHEDULE") {
            self.cleanup.schedule = v;
        }
        if let Some(v) = var("OUTBOX_CLEANUP_RETENTION_DAYS") {
            self.cleanup.retention_days = parse_var("OUTBOX_CLEANUP_RETENTION_DAYS", v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.poller.batch_size == 0 {
            return Err(ConfigError::Zero("poller.batchSize"));
        }
        if self.poller.max_retry == 0 {
            return Err(ConfigError::Zero("poller.maxRetry"));
        }
        if self.poller.interval_ms == 0 {
            return Err(ConfigError::Zero("poller.intervalMs"));
        }
        if self.poller.publish_timeout_ms == 0 {
            return Err(ConfigError::Zero("poller.publishTimeoutMs"));
        }
        self.cleanup_schedule()?;
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.poller.interval_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.poller.publish_timeout_ms)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.cleanup.retention_days))
    }

    pub fn cleanup_schedule(&self) -> ConfigResult<Schedule> {
        Schedule::from_str(&self.cleanup.schedule).map_err(|err| ConfigError::Schedule {
            expression: self.cleanup.schedule.clone(),
            reason: err.to_string(),
        })
    }
}

fn parse_var<T: FromStr>(key: &'static str, value: String) -> ConfigResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { key, value })
}
