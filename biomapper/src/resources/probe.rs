//! Resource probes and their registry.

use super::types::{ResourceStatus, ResourceType};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Result of one health check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeReport {
    /// The observed status.
    pub status: ResourceStatus,
    /// Probe-specific details.
    pub details: Option<serde_json::Value>,
}

impl ProbeReport {
    /// A healthy report.
    #[must_use]
    pub fn healthy() -> Self {
        Self {
            status: ResourceStatus::Healthy,
            details: None,
        }
    }

    /// A degraded report with a reason.
    #[must_use]
    pub fn degraded(reason: impl Into<String>) -> Self {
        Self {
            status: ResourceStatus::Degraded,
            details: Some(serde_json::json!({ "reason": reason.into() })),
        }
    }

    /// An unavailable report with `details.error` set.
    #[must_use]
    pub fn unavailable(error: impl Into<String>) -> Self {
        Self {
            status: ResourceStatus::Unavailable,
            details: Some(serde_json::json!({ "error": error.into() })),
        }
    }

    /// Replaces the details.
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Errors raised by probes.
#[derive(Debug, Clone, Error)]
pub enum ProbeError {
    /// The probe configuration is missing a field or malformed.
    #[error("invalid probe config: {0}")]
    InvalidConfig(String),

    /// The resource could not be reached.
    #[error("unreachable: {0}")]
    Unreachable(String),

    /// An external command failed.
    #[error("command failed: {0}")]
    Command(String),

    /// The probe does not support the operation.
    #[error("operation not supported: {0}")]
    Unsupported(String),
}

/// Checks, and optionally starts, one kind of resource.
///
/// Probes receive the opaque `config` blob of the resource they serve.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResourceProbe: Send + Sync {
    /// Checks health. Must not change the resource.
    async fn check(&self, config: &serde_json::Value) -> Result<ProbeReport, ProbeError>;

    /// Starts or recovers the resource.
    ///
    /// Returns true if the start command was accepted. The default does not
    /// support starting.
    async fn start(&self, _config: &serde_json::Value) -> Result<bool, ProbeError> {
        Ok(false)
    }
}

type CheckFn = dyn Fn(&serde_json::Value) -> ProbeReport + Send + Sync;
type StartFn = dyn Fn(&serde_json::Value) -> bool + Send + Sync;

/// A closure-backed probe.
pub struct FnProbe {
    check: Box<CheckFn>,
    start: Option<Box<StartFn>>,
}

impl FnProbe {
    /// Creates a probe from a check function.
    pub fn new<F>(check: F) -> Self
    where
        F: Fn(&serde_json::Value) -> ProbeReport + Send + Sync + 'static,
    {
        Self {
            check: Box::new(check),
            start: None,
        }
    }

    /// Adds a start function.
    #[must_use]
    pub fn with_start<F>(mut self, start: F) -> Self
    where
        F: Fn(&serde_json::Value) -> bool + Send + Sync + 'static,
    {
        self.start = Some(Box::new(start));
        self
    }
}

impl std::fmt::Debug for FnProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnProbe")
            .field("can_start", &self.start.is_some())
            .finish()
    }
}

#[async_trait]
impl ResourceProbe for FnProbe {
    async fn check(&self, config: &serde_json::Value) -> Result<ProbeReport, ProbeError> {
        Ok((self.check)(config))
    }

    async fn start(&self, config: &serde_json::Value) -> Result<bool, ProbeError> {
        Ok(self.start.as_ref().is_some_and(|start| start(config)))
    }
}

/// Finds the probe for a resource.
///
/// A probe registered under the resource's name wins over one registered
/// for its type.
#[derive(Default)]
pub struct ProbeRegistry {
    by_name: RwLock<HashMap<String, Arc<dyn ResourceProbe>>>,
    by_type: RwLock<HashMap<ResourceType, Arc<dyn ResourceProbe>>>,
}

impl ProbeRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a probe for one named resource.
    pub fn register(&self, name: impl Into<String>, probe: Arc<dyn ResourceProbe>) {
        self.by_name.write().insert(name.into(), probe);
    }

    /// Registers a fallback probe for a resource type.
    pub fn register_for_type(&self, resource_type: ResourceType, probe: Arc<dyn ResourceProbe>) {
        self.by_type.write().insert(resource_type, probe);
    }

    /// Resolves the probe for a resource.
    #[must_use]
    pub fn resolve(&self, name: &str, resource_type: ResourceType) -> Option<Arc<dyn ResourceProbe>> {
        if let Some(probe) = self.by_name.read().get(name) {
            return Some(Arc::clone(probe));
        }
        self.by_type.read().get(&resource_type).cloned()
    }
}

impl std::fmt::Debug for ProbeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeRegistry")
            .field("named", &self.by_name.read().len())
            .field("typed", &self.by_type.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fn_probe_without_start() {
        let probe = FnProbe::new(|_| ProbeReport::healthy());
        let config = serde_json::Value::Null;
        assert_eq!(probe.check(&config).await.unwrap().status, ResourceStatus::Healthy);
        assert!(!probe.start(&config).await.unwrap());
    }

    #[tokio::test]
    async fn test_unavailable_report_sets_error_detail() {
        let report = ProbeReport::unavailable("connection refused");
        assert_eq!(report.details.unwrap()["error"], "connection refused");
    }

    #[tokio::test]
    async fn test_registry_prefers_name_over_type() {
        let registry = ProbeRegistry::new();
        registry.register_for_type(
            ResourceType::Database,
            Arc::new(FnProbe::new(|_| ProbeReport::degraded("slow"))),
        );
        registry.register("metadata_store", Arc::new(FnProbe::new(|_| ProbeReport::healthy())));

        let config = serde_json::Value::Null;
        let named = registry.resolve("metadata_store", ResourceType::Database).unwrap();
        assert!(named.check(&config).await.unwrap().status.is_healthy());

        let typed = registry.resolve("other_db", ResourceType::Database).unwrap();
        assert_eq!(typed.check(&config).await.unwrap().status, ResourceStatus::Degraded);

        assert!(registry.resolve("qdrant", ResourceType::VectorStore).is_none());
    }

    #[tokio::test]
    async fn test_mocked_probe() {
        let mut probe = MockResourceProbe::new();
        probe
            .expect_check()
            .returning(|_| Err(ProbeError::Unreachable("refused".into())));
        assert!(probe.check(&serde_json::Value::Null).await.is_err());
    }
}
