//! The resource manager.
//!
//! Owns the status of every registered resource, runs preflight checks for
//! jobs and drives one background monitor per resource.

use super::monitor::{spawn_monitor, MonitorGuard};
use super::probe::{ProbeRegistry, ProbeReport};
use super::requirements::RequirementTable;
use super::types::{ManagedResource, RecoveryAttempt, ResourceConfig, ResourceStatus};
use crate::errors::ValidationError;
use crate::events::{default_sink, EventSink};
use crate::strategy::StrategyDefinition;
use chrono::Utc;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const RECOVERY_LOG_CAPACITY: usize = 256;
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Verifies, starts and monitors external dependencies.
pub struct ResourceManager {
    configs: DashMap<String, ResourceConfig>,
    resources: DashMap<String, ManagedResource>,
    probes: Arc<ProbeRegistry>,
    requirements: RequirementTable,
    recovery_log: Mutex<VecDeque<RecoveryAttempt>>,
    monitors: Mutex<HashMap<String, JoinHandle<()>>>,
    live_monitors: Arc<AtomicUsize>,
    shutdown: watch::Sender<bool>,
    shutdown_grace: Duration,
    event_sink: Arc<dyn EventSink>,
}

impl ResourceManager {
    /// Creates a manager using the given probes.
    #[must_use]
    pub fn new(probes: Arc<ProbeRegistry>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            configs: DashMap::new(),
            resources: DashMap::new(),
            probes,
            requirements: RequirementTable::default(),
            recovery_log: Mutex::new(VecDeque::new()),
            monitors: Mutex::new(HashMap::new()),
            live_monitors: Arc::new(AtomicUsize::new(0)),
            shutdown,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            event_sink: default_sink(),
        }
    }

    /// Replaces the action to resource table.
    #[must_use]
    pub fn with_requirements(mut self, requirements: RequirementTable) -> Self {
        self.requirements = requirements;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Sets how long `cleanup` waits for a monitor before aborting it.
    #[must_use]
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Registers a resource.
    ///
    /// Re-registering replaces the config and keeps the current status.
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` if the config is invalid.
    pub fn register_resource(&self, config: ResourceConfig) -> Result<(), ValidationError> {
        config.validate()?;
        self.resources
            .entry(config.name.clone())
            .or_insert_with(|| ManagedResource::unknown(&config));
        debug!(resource = %config.name, resource_type = %config.resource_type, "Registered resource");
        self.configs.insert(config.name.clone(), config);
        Ok(())
    }

    /// Returns the config of a registered resource.
    #[must_use]
    pub fn config(&self, name: &str) -> Option<ResourceConfig> {
        self.configs.get(name).map(|c| c.clone())
    }

    /// Returns the state of a registered resource.
    #[must_use]
    pub fn resource(&self, name: &str) -> Option<ManagedResource> {
        self.resources.get(name).map(|r| r.clone())
    }

    /// Current status of every resource, by name.
    #[must_use]
    pub fn statuses(&self) -> BTreeMap<String, ResourceStatus> {
        self.resources
            .iter()
            .map(|entry| (entry.key().clone(), entry.status))
            .collect()
    }

    /// Start attempts recorded by recoveries, oldest first.
    #[must_use]
    pub fn recovery_history(&self) -> Vec<RecoveryAttempt> {
        self.recovery_log.lock().iter().cloned().collect()
    }

    /// Number of monitoring loops still running.
    #[must_use]
    pub fn monitor_count(&self) -> usize {
        self.live_monitors.load(Ordering::SeqCst)
    }

    /// Runs the resource's probe once and stores the result.
    ///
    /// Never fails: probe errors, panics, unknown names and missing probes
    /// all produce `Unavailable` with `details.error` set.
    pub async fn check_resource(&self, name: &str) -> ResourceStatus {
        let Some(config) = self.config(name) else {
            warn!(resource = %name, "Health check for unregistered resource");
            return ResourceStatus::Unavailable;
        };

        let report = match self.probes.resolve(name, config.resource_type) {
            None => ProbeReport::unavailable(format!("no probe registered for '{name}'")),
            Some(probe) => match AssertUnwindSafe(probe.check(&config.config)).catch_unwind().await {
                Ok(Ok(report)) => report,
                Ok(Err(e)) => ProbeReport::unavailable(e.to_string()),
                Err(_) => ProbeReport::unavailable("probe panicked"),
            },
        };

        self.store_report(name, report)
    }

    fn store_report(&self, name: &str, mut report: ProbeReport) -> ResourceStatus {
        if report.status == ResourceStatus::Unknown {
            report = ProbeReport::unavailable("probe could not determine the status");
        }
        let status = report.status;
        let previous = self.resources.get_mut(name).map(|mut entry| {
            let previous = entry.status;
            entry.status = status;
            entry.last_check = Some(Utc::now());
            entry.details = report.details.clone();
            previous
        });

        if previous.is_some_and(|p| p != status) {
            info!(resource = %name, from = ?previous, to = %status, "Resource status changed");
            self.event_sink.try_emit(
                "resource.status_changed",
                Some(serde_json::json!({
                    "resource": name,
                    "from": previous,
                    "to": status,
                    "details": report.details,
                })),
            );
        } else {
            debug!(resource = %name, status = %status, "Resource checked");
        }
        status
    }

    /// Starts a resource and re-checks it.
    ///
    /// Only resources with `auto_start` are started. Returns true only if
    /// the check after the start reports `Healthy`.
    pub async fn start_resource(&self, name: &str) -> bool {
        self.try_start(name).await.is_ok()
    }

    async fn try_start(&self, name: &str) -> Result<(), String> {
        let config = self
            .config(name)
            .ok_or_else(|| format!("resource '{name}' is not registered"))?;
        if !config.auto_start {
            return Err(format!("resource '{name}' does not allow auto start"));
        }
        let probe = self
            .probes
            .resolve(name, config.resource_type)
            .ok_or_else(|| format!("no probe registered for '{name}'"))?;

        info!(resource = %name, "Starting resource");
        match AssertUnwindSafe(probe.start(&config.config)).catch_unwind().await {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => return Err(format!("probe for '{name}' cannot start it")),
            Ok(Err(e)) => return Err(e.to_string()),
            Err(_) => return Err("probe panicked during start".to_string()),
        }

        let grace = config.startup_grace();
        if !grace.is_zero() {
            tokio::time::sleep(grace).await;
        }

        match self.check_resource(name).await {
            ResourceStatus::Healthy => Ok(()),
            status => Err(format!("resource '{name}' is {status} after start")),
        }
    }

    /// Tries up to `max_retries` starts (at least one), sleeping the check
    /// interval between attempts.
    pub(crate) async fn recover(&self, config: &ResourceConfig) -> bool {
        let attempts = config.max_retries.max(1);
        for attempt in 1..=attempts {
            let result = self.try_start(&config.name).await;
            let success = result.is_ok();
            self.record_attempt(RecoveryAttempt {
                resource: config.name.clone(),
                attempt,
                success,
                timestamp: Utc::now(),
                error: result.err(),
            });
            if success {
                return true;
            }
            if attempt < attempts {
                tokio::time::sleep(config.interval()).await;
            }
        }
        false
    }

    fn record_attempt(&self, attempt: RecoveryAttempt) {
        if attempt.success {
            info!(resource = %attempt.resource, attempt = attempt.attempt, "Recovery attempt succeeded");
        } else {
            warn!(
                resource = %attempt.resource,
                attempt = attempt.attempt,
                error = attempt.error.as_deref().unwrap_or_default(),
                "Recovery attempt failed"
            );
        }
        self.event_sink.try_emit(
            "resource.recovery_attempt",
            serde_json::to_value(&attempt).ok(),
        );

        let mut log = self.recovery_log.lock();
        if log.len() == RECOVERY_LOG_CAPACITY {
            log.pop_front();
        }
        log.push_back(attempt);
    }

    async fn ensure_one(&self, config: ResourceConfig) -> (String, bool) {
        if self.check_resource(&config.name).await.is_healthy() {
            return (config.name, true);
        }
        let ok = config.auto_start && self.recover(&config).await;
        if !ok {
            warn!(resource = %config.name, "Required resource is unavailable");
        }
        (config.name, ok)
    }

    /// Checks every required resource, starting those that allow it.
    ///
    /// A strategy must not run while any entry is false.
    pub async fn ensure_required_resources(&self) -> BTreeMap<String, bool> {
        self.ensure_resources(&[]).await
    }

    /// Like [`ensure_required_resources`](Self::ensure_required_resources),
    /// also covering the named resources.
    ///
    /// Names that are not registered are skipped.
    pub async fn ensure_resources(&self, extra: &[String]) -> BTreeMap<String, bool> {
        let mut wanted: BTreeMap<String, ResourceConfig> = self
            .configs
            .iter()
            .filter(|c| c.required)
            .map(|c| (c.key().clone(), c.value().clone()))
            .collect();
        for name in extra {
            match self.config(name) {
                Some(config) => {
                    wanted.entry(name.clone()).or_insert(config);
                }
                None => debug!(resource = %name, "Needed resource is not registered, skipping"),
            }
        }

        futures::future::join_all(wanted.into_values().map(|config| self.ensure_one(config)))
            .await
            .into_iter()
            .collect()
    }

    /// Resources a strategy needs, sorted and deduplicated.
    #[must_use]
    pub fn get_resource_requirements(&self, strategy: &StrategyDefinition) -> Vec<String> {
        self.requirements.requirements_for(strategy.action_types())
    }

    /// Starts one monitoring loop per registered resource.
    ///
    /// Resources that already have a running loop are skipped.
    pub fn start_monitoring(self: &Arc<Self>) {
        if *self.shutdown.borrow() {
            self.shutdown.send_replace(false);
        }

        let mut monitors = self.monitors.lock();
        monitors.retain(|_, handle| !handle.is_finished());
        for entry in &self.configs {
            let name = entry.key().clone();
            if monitors.contains_key(&name) {
                continue;
            }
            let guard = MonitorGuard::new(Arc::clone(&self.live_monitors));
            let handle = spawn_monitor(
                Arc::downgrade(self),
                name.clone(),
                entry.interval(),
                self.shutdown.subscribe(),
                guard,
            );
            monitors.insert(name, handle);
        }
        info!(monitors = monitors.len(), "Resource monitoring started");
    }

    /// Stops every monitoring loop and waits until they have exited.
    ///
    /// Loops that do not stop within the shutdown grace period are
    /// aborted. When this returns, `monitor_count()` is zero.
    pub async fn cleanup(&self) {
        self.shutdown.send_replace(true);
        let handles: Vec<_> = self.monitors.lock().drain().collect();

        for (name, mut handle) in handles {
            if tokio::time::timeout(self.shutdown_grace, &mut handle).await.is_err() {
                warn!(resource = %name, "Monitor did not stop in time, aborting");
                handle.abort();
                let _ = handle.await;
            }
        }
        info!(remaining = self.monitor_count(), "Resource monitoring stopped");
    }

    pub(crate) async fn monitor_tick(&self, name: &str) {
        let status = self.check_resource(name).await;
        let Some(config) = self.config(name) else {
            return;
        };
        if status.needs_recovery() && config.required && config.auto_start {
            warn!(resource = %name, status = %status, "Monitored resource unhealthy, recovering");
            self.recover(&config).await;
        }
    }
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManager")
            .field("resources", &self.statuses())
            .field("monitors", &self.monitor_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::probe::{MockResourceProbe, ProbeError};
    use crate::resources::{FnProbe, ResourceType};
    use crate::testing::CountingProbe;
    use pretty_assertions::assert_eq;

    fn manager_with(name: &str, probe: Arc<dyn crate::resources::ResourceProbe>) -> ResourceManager {
        let probes = Arc::new(ProbeRegistry::new());
        probes.register(name, probe);
        ResourceManager::new(probes)
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let manager = manager_with("db", Arc::new(FnProbe::new(|_| ProbeReport::healthy())));
        let config = ResourceConfig::new("db", ResourceType::Database);
        manager.register_resource(config.clone()).unwrap();
        assert_eq!(manager.resource("db").unwrap().status, ResourceStatus::Unknown);

        assert_eq!(manager.check_resource("db").await, ResourceStatus::Healthy);
        manager.register_resource(config.required()).unwrap();

        assert_eq!(manager.resource("db").unwrap().status, ResourceStatus::Healthy);
        assert!(manager.config("db").unwrap().required);
    }

    #[tokio::test]
    async fn test_check_maps_probe_errors_to_unavailable() {
        let mut probe = MockResourceProbe::new();
        probe
            .expect_check()
            .times(1)
            .returning(|_| Err(ProbeError::Unreachable("connection refused".into())));
        let manager = manager_with("api", Arc::new(probe));
        manager
            .register_resource(ResourceConfig::new("api", ResourceType::ExternalApi))
            .unwrap();

        assert_eq!(manager.check_resource("api").await, ResourceStatus::Unavailable);
        let resource = manager.resource("api").unwrap();
        assert!(resource.last_check.is_some());
        assert!(resource.details.unwrap()["error"]
            .as_str()
            .unwrap()
            .contains("connection refused"));
    }

    #[tokio::test]
    async fn test_check_unknown_resource() {
        let manager = ResourceManager::new(Arc::new(ProbeRegistry::new()));
        assert_eq!(manager.check_resource("missing").await, ResourceStatus::Unavailable);
    }

    #[tokio::test]
    async fn test_check_survives_probe_panic() {
        let manager = manager_with("db", Arc::new(FnProbe::new(|_| panic!("probe bug"))));
        manager
            .register_resource(ResourceConfig::new("db", ResourceType::Database))
            .unwrap();
        assert_eq!(manager.check_resource("db").await, ResourceStatus::Unavailable);
    }

    #[tokio::test]
    async fn test_unknown_probe_result_counts_as_unavailable() {
        let manager = manager_with(
            "db",
            Arc::new(FnProbe::new(|_| ProbeReport {
                status: ResourceStatus::Unknown,
                details: None,
            })),
        );
        manager
            .register_resource(ResourceConfig::new("db", ResourceType::Database))
            .unwrap();

        assert_eq!(manager.check_resource("db").await, ResourceStatus::Unavailable);
        let resource = manager.resource("db").unwrap();
        assert_eq!(resource.status, ResourceStatus::Unavailable);
        assert!(resource.details.unwrap()["error"].is_string());
    }

    #[tokio::test]
    async fn test_start_requires_auto_start() {
        let probe = Arc::new(CountingProbe::healthy_after_start());
        let manager = manager_with("qdrant", probe.clone());
        manager
            .register_resource(ResourceConfig::new("qdrant", ResourceType::Container))
            .unwrap();

        assert!(!manager.start_resource("qdrant").await);
        assert_eq!(probe.start_calls(), 0);
    }

    #[tokio::test]
    async fn test_start_rechecks_health() {
        let probe = Arc::new(CountingProbe::healthy_after_start());
        let manager = manager_with("qdrant", probe.clone());
        manager
            .register_resource(ResourceConfig::new("qdrant", ResourceType::Container).auto_start())
            .unwrap();

        assert!(manager.start_resource("qdrant").await);
        assert_eq!(probe.start_calls(), 1);
        assert_eq!(manager.resource("qdrant").unwrap().status, ResourceStatus::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_history_is_recorded() {
        let probe = Arc::new(CountingProbe::always_unavailable());
        let manager = manager_with("qdrant", probe.clone());
        let config = ResourceConfig::new("qdrant", ResourceType::Container)
            .required()
            .auto_start()
            .with_max_retries(2)
            .with_interval_seconds(1.0);
        manager.register_resource(config.clone()).unwrap();

        assert!(!manager.recover(&config).await);
        let history = manager.recovery_history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].attempt, 2);
        assert!(history.iter().all(|a| !a.success && a.error.is_some()));
    }
}
