//! Resource descriptions and status.

use crate::errors::ValidationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// The kind of external dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    /// A vector database (embedding similarity search).
    VectorStore,
    /// A remote HTTP API.
    ExternalApi,
    /// A locally managed container.
    Container,
    /// A database.
    Database,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::VectorStore => "vector_store",
            Self::ExternalApi => "external_api",
            Self::Container => "container",
            Self::Database => "database",
        };
        f.write_str(s)
    }
}

/// Health of a managed resource.
///
/// Every resource starts `Unknown` and only moves on an explicit probe
/// result. A probe cannot move it back to `Unknown`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    /// Not probed yet.
    #[default]
    Unknown,
    /// The last probe succeeded.
    Healthy,
    /// Reachable but returning client errors or timing out.
    Degraded,
    /// Unreachable, or the managed process is absent.
    Unavailable,
}

impl ResourceStatus {
    /// Returns true for `Healthy`.
    #[must_use]
    pub fn is_healthy(self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// Returns true for `Degraded` and `Unavailable`.
    #[must_use]
    pub fn needs_recovery(self) -> bool {
        matches!(self, Self::Degraded | Self::Unavailable)
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unavailable => "unavailable",
        };
        f.write_str(s)
    }
}

/// Static configuration of one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Unique resource name.
    pub name: String,
    /// Resource kind. Used to pick a probe when none is registered by name.
    pub resource_type: ResourceType,
    /// Whether strategies may not start while this resource is down.
    #[serde(default)]
    pub required: bool,
    /// Whether the manager may try to start the resource.
    #[serde(default)]
    pub auto_start: bool,
    /// Monitoring interval, also used as the recovery backoff.
    #[serde(default = "default_interval")]
    pub health_check_interval_seconds: f64,
    /// Start attempts per recovery.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Wait between a start and the follow-up health check.
    #[serde(default)]
    pub startup_grace_seconds: f64,
    /// Probe-specific settings.
    #[serde(default)]
    pub config: serde_json::Value,
}

fn default_interval() -> f64 {
    30.0
}

fn default_max_retries() -> u32 {
    3
}

/// Longest accepted health check interval or startup grace, in seconds.
pub const MAX_INTERVAL_SECONDS: f64 = 86_400.0;

impl ResourceConfig {
    /// Creates an optional resource with default timings.
    #[must_use]
    pub fn new(name: impl Into<String>, resource_type: ResourceType) -> Self {
        Self {
            name: name.into(),
            resource_type,
            required: false,
            auto_start: false,
            health_check_interval_seconds: default_interval(),
            max_retries: default_max_retries(),
            startup_grace_seconds: 0.0,
            config: serde_json::Value::Null,
        }
    }

    /// Marks the resource as required.
    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Allows the manager to start the resource.
    #[must_use]
    pub fn auto_start(mut self) -> Self {
        self.auto_start = true;
        self
    }

    /// Sets the health check interval.
    #[must_use]
    pub fn with_interval_seconds(mut self, seconds: f64) -> Self {
        self.health_check_interval_seconds = seconds;
        self
    }

    /// Sets the number of start attempts.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the post-start grace period.
    #[must_use]
    pub fn with_startup_grace_seconds(mut self, seconds: f64) -> Self {
        self.startup_grace_seconds = seconds;
        self
    }

    /// Sets the probe settings.
    #[must_use]
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    /// The health check interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        bounded_secs(self.health_check_interval_seconds)
    }

    /// The post-start grace period.
    #[must_use]
    pub fn startup_grace(&self) -> Duration {
        bounded_secs(self.startup_grace_seconds)
    }

    /// Checks that the name is set and the timings are usable.
    ///
    /// Timings above [`MAX_INTERVAL_SECONDS`] are rejected.
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` naming the offending field.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::empty("resource.name"));
        }
        if !self.health_check_interval_seconds.is_finite()
            || self.health_check_interval_seconds <= 0.0
            || self.health_check_interval_seconds > MAX_INTERVAL_SECONDS
        {
            return Err(ValidationError::new(
                format!("resources.{}.health_check_interval_seconds", self.name),
                "must be a positive number of seconds, at most one day",
            ));
        }
        if !self.startup_grace_seconds.is_finite()
            || self.startup_grace_seconds < 0.0
            || self.startup_grace_seconds > MAX_INTERVAL_SECONDS
        {
            return Err(ValidationError::new(
                format!("resources.{}.startup_grace_seconds", self.name),
                "must be between 0 and one day",
            ));
        }
        Ok(())
    }
}

fn bounded_secs(seconds: f64) -> Duration {
    if seconds.is_nan() {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(seconds.clamp(0.0, MAX_INTERVAL_SECONDS))
}

/// Current state of a registered resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedResource {
    /// Resource name.
    pub name: String,
    /// Resource kind.
    pub resource_type: ResourceType,
    /// Status after the last probe.
    pub status: ResourceStatus,
    /// When the last probe finished.
    pub last_check: Option<DateTime<Utc>>,
    /// Details reported by the last probe.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ManagedResource {
    pub(crate) fn unknown(config: &ResourceConfig) -> Self {
        Self {
            name: config.name.clone(),
            resource_type: config.resource_type,
            status: ResourceStatus::Unknown,
            last_check: None,
            details: None,
        }
    }
}

/// One start attempt made while recovering a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    /// Resource name.
    pub resource: String,
    /// 1-based attempt number within this recovery.
    pub attempt: u32,
    /// Whether the resource was healthy afterwards.
    pub success: bool,
    /// When the attempt finished.
    pub timestamp: DateTime<Utc>,
    /// Error message of a failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
