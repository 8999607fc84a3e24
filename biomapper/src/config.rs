//! Engine and execution configuration.
//!
//! Configuration is plain serde data with defaults for every field. An
//! [`EngineConfig`] can be read from JSON and then overridden from
//! `BIOMAPPER_*` environment variables.

use crate::errors::{BiomapperError, ValidationError};
use crate::resources::ResourceConfig;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Result cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Whether actions may use the shared cache.
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,
    /// Entry lifetime in seconds. Must be positive.
    #[serde(default = "default_cache_ttl")]
    pub ttl_seconds: u64,
}

fn default_cache_enabled() -> bool {
    true
}

fn default_cache_ttl() -> u64 {
    3600
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            ttl_seconds: default_cache_ttl(),
        }
    }
}

impl CacheConfig {
    /// Returns the TTL as a `Duration`.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

/// Batching settings applied to every stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Maximum entities handed to one action invocation. Must be positive.
    #[serde(default = "default_batch_size")]
    pub size: usize,
    /// Whether the batches of one stage run concurrently.
    #[serde(default)]
    pub parallel: bool,
}

fn default_batch_size() -> usize {
    100
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            size: default_batch_size(),
            parallel: false,
        }
    }
}

/// Settings for a single strategy run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Cache settings.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Batch settings.
    #[serde(default)]
    pub batch: BatchConfig,
    /// Job wall-clock limit in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: f64,
    /// Additional attempts for a failing stage action.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Base delay for the retry backoff, in milliseconds.
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,
}

fn default_timeout() -> f64 {
    300.0
}

fn default_retry_attempts() -> u32 {
    2
}

fn default_retry_base_delay() -> u64 {
    500
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            batch: BatchConfig::default(),
            timeout_seconds: default_timeout(),
            retry_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay(),
        }
    }
}

impl ExecutionConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the job timeout.
    #[must_use]
    pub fn with_timeout_seconds(mut self, seconds: f64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    /// Sets the number of retry attempts.
    #[must_use]
    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    /// Sets the retry base delay.
    #[must_use]
    pub fn with_retry_base_delay_ms(mut self, delay_ms: u64) -> Self {
        self.retry_base_delay_ms = delay_ms;
        self
    }

    /// Sets the batch settings.
    #[must_use]
    pub fn with_batch(mut self, size: usize, parallel: bool) -> Self {
        self.batch = BatchConfig { size, parallel };
        self
    }

    /// Sets the cache settings.
    #[must_use]
    pub fn with_cache(mut self, enabled: bool, ttl_seconds: u64) -> Self {
        self.cache = CacheConfig {
            enabled,
            ttl_seconds,
        };
        self
    }

    /// Returns the job timeout as a `Duration`.
    ///
    /// Only meaningful for a configuration that passed [`validate`](Self::validate);
    /// anything else falls back to the default limit.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout_seconds)
            .unwrap_or_else(|_| Duration::from_secs_f64(default_timeout()))
    }

    /// Checks the numeric invariants.
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` naming the first offending field.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.cache.ttl_seconds == 0 {
            return Err(ValidationError::new("cache.ttl_seconds", "must be greater than 0"));
        }
        if self.batch.size == 0 {
            return Err(ValidationError::new("batch.size", "must be greater than 0"));
        }
        if !self.timeout_seconds.is_finite() || self.timeout_seconds <= 0.0 {
            return Err(ValidationError::new(
                "timeout_seconds",
                "must be a positive number of seconds",
            ));
        }
        if Duration::try_from_secs_f64(self.timeout_seconds).is_err() {
            return Err(ValidationError::new("timeout_seconds", "is too large"));
        }
        Ok(())
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Defaults for every run.
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Resources to register at startup.
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
    /// Whether background resource monitoring starts with the engine.
    #[serde(default = "default_monitoring")]
    pub monitoring_enabled: bool,
    /// How long finished jobs are kept before pruning, in seconds.
    #[serde(default = "default_retention")]
    pub job_retention_seconds: u64,
    /// Default client polling interval, in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub default_poll_interval_ms: u64,
}

fn default_monitoring() -> bool {
    true
}

fn default_retention() -> u64 {
    24 * 3600
}

fn default_poll_interval() -> u64 {
    1000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            execution: ExecutionConfig::default(),
            resources: Vec::new(),
            monitoring_enabled: default_monitoring(),
            job_retention_seconds: default_retention(),
            default_poll_interval_ms: default_poll_interval(),
        }
    }
}

impl EngineConfig {
    /// Parses a configuration from a JSON document.
    ///
    /// # Errors
    ///
    /// Returns `BiomapperError::Configuration` on malformed JSON or invalid values.
    pub fn from_json_str(json: &str) -> Result<Self, BiomapperError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| BiomapperError::Configuration(format!("invalid engine config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Builds a configuration from defaults and the process environment.
    ///
    /// # Errors
    ///
    /// Returns `BiomapperError::Configuration` if a variable cannot be parsed.
    pub fn from_env() -> Result<Self, BiomapperError> {
        Self::default().apply_env()
    }

    /// Overrides fields from `BIOMAPPER_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns `BiomapperError::Configuration` if a variable cannot be parsed
    /// or the result fails validation.
    pub fn apply_env(self) -> Result<Self, BiomapperError> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    fn apply_vars<F>(mut self, lookup: F) -> Result<Self, BiomapperError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_var::<f64, _>(&lookup, "BIOMAPPER_TIMEOUT_SECONDS")? {
            self.execution.timeout_seconds = v;
        }
        if let Some(v) = parse_var::<u32, _>(&lookup, "BIOMAPPER_RETRY_ATTEMPTS")? {
            self.execution.retry_attempts = v;
        }
        if let Some(v) = parse_var::<usize, _>(&lookup, "BIOMAPPER_BATCH_SIZE")? {
            self.execution.batch.size = v;
        }
        if let Some(v) = parse_var::<bool, _>(&lookup, "BIOMAPPER_BATCH_PARALLEL")? {
            self.execution.batch.parallel = v;
        }
        if let Some(v) = parse_var::<bool, _>(&lookup, "BIOMAPPER_CACHE_ENABLED")? {
            self.execution.cache.enabled = v;
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "BIOMAPPER_CACHE_TTL_SECONDS")? {
            self.execution.cache.ttl_seconds = v;
        }
        if let Some(v) = parse_var::<bool, _>(&lookup, "BIOMAPPER_MONITORING")? {
            self.monitoring_enabled = v;
        }
        self.validate()?;
        Ok(self)
    }

    /// Validates the execution settings and every resource entry.
    ///
    /// # Errors
    ///
    /// Returns `BiomapperError::Configuration` describing the first problem.
    pub fn validate(&self) -> Result<(), BiomapperError> {
        self.execution
            .validate()
            .map_err(|e| BiomapperError::Configuration(e.to_string()))?;
        for resource in &self.resources {
            resource
                .validate()
                .map_err(|e| BiomapperError::Configuration(e.to_string()))?;
        }
        Ok(())
    }

    /// Returns the default client polling interval.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.default_poll_interval_ms)
    }

    /// Returns the finished-job retention window.
    #[must_use]
    pub fn job_retention(&self) -> Duration {
        Duration::from_secs(self.job_retention_seconds)
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, BiomapperError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| BiomapperError::Configuration(format!("{key}={raw}: {e}"))),
    }
}
