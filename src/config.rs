//! Process configuration.
//!
//! Every crawlfleet process (worker, monitor, CLI client) reads the same
//! `CrawlfleetConfig`. Values come from, in increasing precedence:
//! built-in defaults, an optional YAML file, and `CRAWLFLEET_*` environment
//! variables. Durations are expressed in whole seconds.
//!
//! ```yaml
//! store:
//!   redis_url: redis://localhost:6379
//!   key_prefix: crawlfleet
//! worker:
//!   name: scraper
//!   heartbeat_interval: 30
//! monitor:
//!   stale_threshold: 120
//! autoscaler:
//!   min_workers: 1
//!   max_workers: 10
//! resources:
//!   max_cpu_percent: 80.0
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scaling::{AutoScalerConfig, ResourceLimits};
use crate::scheduler::{MonitorConfig, WorkerConfig};
use crate::store::StoreConfig;

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A setting has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid YAML for this schema.
    #[error("Invalid configuration file: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Top-level configuration shared by every process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlfleetConfig {
    pub store: StoreConfig,
    pub worker: WorkerConfig,
    pub monitor: MonitorConfig,
    pub autoscaler: AutoScalerConfig,
    pub resources: ResourceLimits,
}

impl CrawlfleetConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a YAML file. Missing sections and fields keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Io` if the file cannot be read and
    /// `ConfigError::Yaml` if it cannot be parsed.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&content)
    }

    /// Parses configuration from a YAML string.
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Creates configuration from defaults overridden by the environment.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a variable cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Overrides fields from `CRAWLFLEET_*` environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `CRAWLFLEET_REDIS_URL`, `CRAWLFLEET_KEY_PREFIX`
    /// - `CRAWLFLEET_WORKER_NAME`, `CRAWLFLEET_HEARTBEAT_INTERVAL`,
    ///   `CRAWLFLEET_IDLE_BACKOFF`, `CRAWLFLEET_JOB_TIMEOUT`
    /// - `CRAWLFLEET_CHECK_INTERVAL`, `CRAWLFLEET_STALE_THRESHOLD`,
    ///   `CRAWLFLEET_WORKER_RECORD_TTL`, `CRAWLFLEET_JOB_RECORD_TTL`
    /// - `CRAWLFLEET_MIN_WORKERS`, `CRAWLFLEET_MAX_WORKERS`,
    ///   `CRAWLFLEET_SCALE_UP_THRESHOLD`, `CRAWLFLEET_SCALE_DOWN_THRESHOLD`,
    ///   `CRAWLFLEET_SCALE_UP_COOLDOWN`, `CRAWLFLEET_SCALE_DOWN_COOLDOWN`,
    ///   `CRAWLFLEET_EVALUATION_INTERVAL`, `CRAWLFLEET_AUTOSCALER_ENABLED`
    /// - `CRAWLFLEET_MAX_CPU_PERCENT`, `CRAWLFLEET_MAX_MEMORY_PERCENT`,
    ///   `CRAWLFLEET_MAX_DISK_PERCENT`, `CRAWLFLEET_MAX_LOAD_AVERAGE`
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    fn apply_vars<F>(&mut self, var: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str| var(key);
        let secs = |key: &str| -> Result<Option<Duration>, ConfigError> {
            var(key)
                .map(|v| parse_env_value::<u64>(&v, key).map(Duration::from_secs))
                .transpose()
        };

        // Store
        if let Some(url) = text("CRAWLFLEET_REDIS_URL") {
            self.store.redis_url = url;
        }
        if let Some(prefix) = text("CRAWLFLEET_KEY_PREFIX") {
            self.store.key_prefix = prefix;
        }

        // Worker
        if let Some(name) = text("CRAWLFLEET_WORKER_NAME") {
            self.worker.name = name;
        }
        if let Some(d) = secs("CRAWLFLEET_HEARTBEAT_INTERVAL")? {
            self.worker.heartbeat_interval = d;
        }
        if let Some(d) = secs("CRAWLFLEET_IDLE_BACKOFF")? {
            self.worker.idle_backoff = d;
        }
        if let Some(d) = secs("CRAWLFLEET_JOB_TIMEOUT")? {
            self.worker.default_job_timeout = d;
        }

        // Monitor
        if let Some(d) = secs("CRAWLFLEET_CHECK_INTERVAL")? {
            self.monitor.check_interval = d;
        }
        if let Some(d) = secs("CRAWLFLEET_STALE_THRESHOLD")? {
            self.monitor.stale_threshold = d;
        }
        if let Some(d) = secs("CRAWLFLEET_WORKER_RECORD_TTL")? {
            self.monitor.worker_record_ttl = d;
        }
        if let Some(d) = secs("CRAWLFLEET_JOB_RECORD_TTL")? {
            self.monitor.job_record_ttl = d;
        }

        // Auto-scaler
        if let Some(v) = var("CRAWLFLEET_MIN_WORKERS") {
            self.autoscaler.min_workers = parse_env_value(&v, "CRAWLFLEET_MIN_WORKERS")?;
        }
        if let Some(v) = var("CRAWLFLEET_MAX_WORKERS") {
            self.autoscaler.max_workers = parse_env_value(&v, "CRAWLFLEET_MAX_WORKERS")?;
        }
        if let Some(v) = var("CRAWLFLEET_SCALE_UP_THRESHOLD") {
            self.autoscaler.scale_up_threshold =
                parse_env_value(&v, "CRAWLFLEET_SCALE_UP_THRESHOLD")?;
        }
        if let Some(v) = var("CRAWLFLEET_SCALE_DOWN_THRESHOLD") {
            self.autoscaler.scale_down_threshold =
                parse_env_value(&v, "CRAWLFLEET_SCALE_DOWN_THRESHOLD")?;
        }
        if let Some(d) = secs("CRAWLFLEET_SCALE_UP_COOLDOWN")? {
            self.autoscaler.scale_up_cooldown = d;
        }
        if let Some(d) = secs("CRAWLFLEET_SCALE_DOWN_COOLDOWN")? {
            self.autoscaler.scale_down_cooldown = d;
        }
        if let Some(d) = secs("CRAWLFLEET_EVALUATION_INTERVAL")? {
            self.autoscaler.evaluation_interval = d;
        }
        if let Some(v) = var("CRAWLFLEET_AUTOSCALER_ENABLED") {
            self.autoscaler.enabled = parse_env_bool(&v, "CRAWLFLEET_AUTOSCALER_ENABLED")?;
        }

        // Resource ceilings
        if let Some(v) = var("CRAWLFLEET_MAX_CPU_PERCENT") {
            self.resources.max_cpu_percent = parse_env_value(&v, "CRAWLFLEET_MAX_CPU_PERCENT")?;
        }
        if let Some(v) = var("CRAWLFLEET_MAX_MEMORY_PERCENT") {
            self.resources.max_memory_percent =
                parse_env_value(&v, "CRAWLFLEET_MAX_MEMORY_PERCENT")?;
        }
        if let Some(v) = var("CRAWLFLEET_MAX_DISK_PERCENT") {
            self.resources.max_disk_percent = parse_env_value(&v, "CRAWLFLEET_MAX_DISK_PERCENT")?;
        }
        if let Some(v) = var("CRAWLFLEET_MAX_LOAD_AVERAGE") {
            self.resources.max_load_average = parse_env_value(&v, "CRAWLFLEET_MAX_LOAD_AVERAGE")?;
        }

        Ok(())
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.redis_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "store.redis_url cannot be empty".to_string(),
            ));
        }
        if self.store.key_prefix.is_empty() || self.store.key_prefix.contains(char::is_whitespace)
        {
            return Err(ConfigError::ValidationFailed(
                "store.key_prefix must be a non-empty word".to_string(),
            ));
        }

        if self.worker.name.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "worker.name cannot be empty".to_string(),
            ));
        }
        if self.worker.heartbeat_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "worker.heartbeat_interval must be at least 1 second".to_string(),
            ));
        }
        if self.worker.default_job_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "worker.default_job_timeout must be at least 1 second".to_string(),
            ));
        }

        if self.monitor.check_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "monitor.check_interval must be at least 1 second".to_string(),
            ));
        }
        if self.monitor.stale_threshold <= self.worker.heartbeat_interval {
            return Err(ConfigError::ValidationFailed(format!(
                "monitor.stale_threshold ({}s) must exceed worker.heartbeat_interval ({}s)",
                self.monitor.stale_threshold.as_secs(),
                self.worker.heartbeat_interval.as_secs()
            )));
        }
        if self.monitor.worker_record_ttl < self.monitor.stale_threshold {
            return Err(ConfigError::ValidationFailed(
                "monitor.worker_record_ttl cannot be shorter than monitor.stale_threshold"
                    .to_string(),
            ));
        }
        if self.monitor.job_record_ttl.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "monitor.job_record_ttl must be at least 1 second".to_string(),
            ));
        }

        self.autoscaler
            .validate()
            .map_err(ConfigError::ValidationFailed)?;
        self.resources
            .validate()
            .map_err(ConfigError::ValidationFailed)?;

        Ok(())
    }

    /// Builder method to set the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.store.redis_url = url.into();
        self
    }

    /// Builder method to set the key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.store.key_prefix = prefix.into();
        self
    }
}

/// Serde adapter that writes a `Duration` as whole seconds.
pub mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Helper function to parse environment variable values.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("cannot parse '{}'", value),
    })
}

/// Helper function to parse boolean environment variables.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}
