//! The job lifecycle manager.
//!
//! `submit` resolves and compiles the strategy up front, so unknown
//! strategies, unknown actions and malformed parameters are rejected before
//! a job exists. Everything after that happens on the job's own task:
//! preflight, the waterfall run and the final transition, all under the
//! job's wall-clock limit.

use super::job::{Job, JobHandle, JobResult, JobStatusReport, StrategySource};
use super::progress::{ProgressEvent, ProgressHub};
use super::JobStatus;
use crate::actions::{ActionRegistry, Entity};
use crate::cache::ActionCache;
use crate::cancellation::CancellationToken;
use crate::config::{EngineConfig, ExecutionConfig};
use crate::context::{ContextSnapshot, ExecutionContext, JsonMap, OntologyType};
use crate::errors::{BiomapperError, ResourcePrerequisiteError, Result, ValidationError};
use crate::events::{default_sink, EventSink};
use crate::pipeline::{MatchedEntity, RunHooks, WaterfallPipeline};
use crate::resources::{ProbeRegistry, ResourceManager};
use crate::strategy::{compile, merge_parameters, StrategyDefinition, StrategyRegistry};
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 3600);
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Shared state of one job.
struct JobRecord {
    job: Mutex<Job>,
    hub: Mutex<ProgressHub>,
    cancel: Arc<CancellationToken>,
    task: Mutex<Option<JoinHandle<()>>>,
    snapshot: Mutex<Option<ContextSnapshot>>,
    result: Mutex<Option<Arc<JobResult>>>,
    retained: Mutex<Vec<MatchedEntity>>,
}

impl JobRecord {
    fn new(job: Job) -> Self {
        Self {
            job: Mutex::new(job),
            hub: Mutex::new(ProgressHub::new()),
            cancel: Arc::new(CancellationToken::new()),
            task: Mutex::new(None),
            snapshot: Mutex::new(None),
            result: Mutex::new(None),
            retained: Mutex::new(Vec::new()),
        }
    }

    fn report(&self) -> JobStatusReport {
        self.job.lock().report()
    }

    fn status(&self) -> JobStatus {
        self.job.lock().status()
    }

    /// Applies `change` and publishes the new state if it took effect.
    ///
    /// The job lock is held while publishing so subscribers see changes in
    /// the order they were made.
    fn update(&self, change: impl FnOnce(&mut Job) -> bool) -> bool {
        let mut job = self.job.lock();
        if !change(&mut job) {
            return false;
        }
        self.hub.lock().publish(ProgressEvent::from(&job.report()));
        true
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ProgressEvent> {
        let job = self.job.lock();
        self.hub.lock().subscribe_from(ProgressEvent::from(&job.report()))
    }
}

/// Everything a job task needs, moved onto the task.
struct JobRun {
    record: Arc<JobRecord>,
    job_id: String,
    strategy: Arc<StrategyDefinition>,
    pipeline: WaterfallPipeline,
    parameters: JsonMap,
    entities: Vec<Entity>,
    identifier: String,
    ontology: OntologyType,
    config: ExecutionConfig,
    resources: Arc<ResourceManager>,
    cache: Arc<ActionCache>,
    event_sink: Arc<dyn EventSink>,
}

impl JobRun {
    async fn execute(self) -> Result<JobResult> {
        let Self {
            record,
            job_id,
            strategy,
            pipeline,
            parameters,
            entities,
            identifier,
            ontology,
            config,
            resources,
            cache,
            event_sink,
        } = self;

        check_cancelled(&record.cancel)?;
        let needed = resources.get_resource_requirements(&strategy);
        let checks = resources.ensure_resources(&needed).await;
        let unavailable: Vec<String> = checks
            .into_iter()
            .filter(|(_, ok)| !ok)
            .map(|(name, _)| name)
            .collect();
        if !unavailable.is_empty() {
            return Err(ResourcePrerequisiteError::new(unavailable).into());
        }
        check_cancelled(&record.cancel)?;

        if !record.update(|job| job.transition(JobStatus::Running)) {
            return Err(BiomapperError::Cancelled("job is no longer pending".to_string()));
        }
        info!(job_id = %job_id, strategy = %strategy.name, entities = entities.len(), "Job running");
        event_sink.try_emit("job.running", Some(serde_json::json!({"job_id": job_id})));

        let mut ctx = ExecutionContext::new(identifier, ontology, config)?.with_cache(cache);
        ctx.set_action_data("parameters", &parameters)?;

        let progress_record = Arc::clone(&record);
        let hooks = RunHooks::default()
            .with_cancel(Arc::clone(&record.cancel))
            .with_progress(Arc::new(move |done: usize, total: usize, step: &str| {
                #[allow(clippy::cast_precision_loss)]
                let percentage = done as f64 * 100.0 / total.max(1) as f64;
                progress_record.update(|job| job.record_progress(percentage, step));
            }));

        let run = pipeline.run_with(entities, &mut ctx, &hooks).await;
        let snapshot = ctx.into_snapshot();
        *record.snapshot.lock() = Some(snapshot.clone());

        Ok(JobResult {
            job_id,
            strategy_name: strategy.name.clone(),
            parameters,
            outcome: run?,
            context: snapshot,
        })
    }
}

fn check_cancelled(token: &CancellationToken) -> Result<()> {
    if token.is_cancelled() {
        return Err(BiomapperError::Cancelled(
            token.reason().unwrap_or_else(|| "cancelled".to_string()),
        ));
    }
    Ok(())
}

/// Runs a job to a terminal state.
async fn drive(run: JobRun) {
    let record = Arc::clone(&run.record);
    let sink = Arc::clone(&run.event_sink);
    let job_id = run.job_id.clone();
    let limit = run.config.timeout();
    let seconds = run.config.timeout_seconds;

    let outcome = match tokio::time::timeout(limit, AssertUnwindSafe(run.execute()).catch_unwind()).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(BiomapperError::Internal("job task panicked".to_string())),
        Err(_) => {
            warn!(job_id = %job_id, seconds, "Job timed out");
            Err(BiomapperError::Timeout { seconds })
        }
    };

    match outcome {
        Ok(result) => {
            let handle = result.context.run_id.to_string();
            let matched = result.outcome.matched.len();
            *record.result.lock() = Some(Arc::new(result));
            if record.update(|job| job.complete(handle)) {
                info!(job_id = %job_id, matched, "Job completed");
                sink.try_emit("job.completed", Some(serde_json::json!({"job_id": job_id, "matched": matched})));
            }
        }
        Err(err) => {
            if let BiomapperError::StageExecution(failure) = &err {
                *record.retained.lock() = failure.retained.clone();
            }
            if record.update(|job| job.fail(&err)) {
                let event = if err.kind() == crate::errors::ErrorKind::Cancelled {
                    info!(job_id = %job_id, reason = %err, "Job cancelled");
                    "job.cancelled"
                } else {
                    warn!(job_id = %job_id, kind = %err.kind(), error = %err, "Job failed");
                    "job.failed"
                };
                let mut data = err.to_dict();
                data.insert("job_id".to_string(), serde_json::json!(job_id));
                sink.try_emit(event, Some(serde_json::json!(data)));
            }
        }
    }
}

/// Reads the `entities` parameter.
///
/// Accepts an array of ids or of objects with an `id` field; the other
/// fields become attributes.
fn parse_entities(value: Option<&Value>) -> Result<Vec<Entity>, ValidationError> {
    let items = match value {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(items)) => items,
        Some(_) => return Err(ValidationError::new("parameters.entities", "must be an array")),
    };

    items
        .iter()
        .enumerate()
        .map(|(index, item)| match item {
            Value::String(id) if !id.is_empty() => Ok(Entity::new(id)),
            Value::Object(map) => {
                let mut attributes = map.clone();
                match attributes.remove("id") {
                    Some(Value::String(id)) if !id.is_empty() => Ok(Entity { id, attributes }),
                    Some(Value::Number(n)) => Ok(Entity {
                        id: n.to_string(),
                        attributes,
                    }),
                    _ => Err(ValidationError::empty(format!("parameters.entities[{index}].id"))),
                }
            }
            _ => Err(ValidationError::new(
                format!("parameters.entities[{index}]"),
                "must be an id or an object with an id",
            )),
        })
        .collect()
}

/// Submits, tracks and cancels strategy executions.
pub struct JobManager {
    jobs: DashMap<String, Arc<JobRecord>>,
    strategies: Arc<StrategyRegistry>,
    actions: Arc<ActionRegistry>,
    resources: Arc<ResourceManager>,
    config: ExecutionConfig,
    cache: Arc<ActionCache>,
    retention: Duration,
    shutdown_grace: Duration,
    event_sink: Arc<dyn EventSink>,
}

impl JobManager {
    /// Creates a manager with default execution settings and a fresh cache.
    #[must_use]
    pub fn new(actions: Arc<ActionRegistry>, resources: Arc<ResourceManager>) -> Self {
        let config = ExecutionConfig::default();
        Self {
            jobs: DashMap::new(),
            strategies: Arc::new(StrategyRegistry::new()),
            actions,
            resources,
            cache: Arc::new(ActionCache::new(&config.cache)),
            config,
            retention: DEFAULT_RETENTION,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            event_sink: default_sink(),
        }
    }

    /// Builds a manager from engine configuration.
    ///
    /// Registers the configured resources and, when enabled, starts
    /// monitoring them. Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` or `Validation` errors for invalid settings.
    pub fn from_engine_config(
        config: &EngineConfig,
        actions: Arc<ActionRegistry>,
        probes: Arc<ProbeRegistry>,
    ) -> Result<Self> {
        config.validate()?;
        let resources = Arc::new(ResourceManager::new(probes));
        for resource in &config.resources {
            resources.register_resource(resource.clone())?;
        }
        if config.monitoring_enabled {
            resources.start_monitoring();
        }
        Ok(Self::new(actions, resources)
            .with_config(config.execution.clone())
            .with_job_retention(config.job_retention()))
    }

    /// Uses a shared strategy registry.
    #[must_use]
    pub fn with_strategies(mut self, strategies: Arc<StrategyRegistry>) -> Self {
        self.strategies = strategies;
        self
    }

    /// Sets the execution settings and rebuilds the cache from them.
    #[must_use]
    pub fn with_config(mut self, config: ExecutionConfig) -> Self {
        self.cache = Arc::new(ActionCache::new(&config.cache));
        self.config = config;
        self
    }

    /// Uses an existing cache.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<ActionCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Sets how long finished jobs are kept by [`prune_expired`](Self::prune_expired).
    #[must_use]
    pub fn with_job_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Sets how long `shutdown` waits for a job before aborting it.
    #[must_use]
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Sets the event sink used for job and pipeline events.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Registered strategies.
    #[must_use]
    pub fn strategies(&self) -> &Arc<StrategyRegistry> {
        &self.strategies
    }

    /// The resource manager used for preflight.
    #[must_use]
    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    /// The cache handed to every run.
    #[must_use]
    pub fn cache(&self) -> &Arc<ActionCache> {
        &self.cache
    }

    /// Submits a strategy run and returns immediately with a pending job.
    ///
    /// Parameters are merged over the strategy defaults. Recognised keys:
    /// `entities` (ids or objects with an `id`), `identifier`,
    /// `ontology_type` and `timeout_seconds`.
    ///
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// - `NotFound` for an unknown strategy or action type
    /// - `Validation` for malformed definitions or parameters
    pub fn submit(&self, source: StrategySource, parameters: JsonMap) -> Result<JobHandle> {
        self.sweep_expired();
        let strategy = match source {
            StrategySource::Named(name) => self
                .strategies
                .get(&name)
                .ok_or_else(|| BiomapperError::NotFound(format!("strategy '{name}'")))?,
            StrategySource::Inline(definition) => {
                definition.validate()?;
                Arc::new(definition)
            }
        };

        let parameters = merge_parameters(&strategy.parameters, &parameters);
        let entities = parse_entities(parameters.get("entities"))?;
        let config = self.config_for(&parameters)?;
        let ontology = match parameters.get("ontology_type").and_then(Value::as_str) {
            Some(name) => name.parse()?,
            None => strategy.ontology_type()?.unwrap_or(OntologyType::Protein),
        };
        let identifier = parameters
            .get("identifier")
            .and_then(Value::as_str)
            .map_or_else(|| strategy.name.clone(), str::to_string);
        if identifier.trim().is_empty() {
            return Err(ValidationError::empty("parameters.identifier").into());
        }
        let pipeline = compile(&strategy, &parameters, &self.actions)?.with_event_sink(Arc::clone(&self.event_sink));

        let record = Arc::new(JobRecord::new(Job::new(&strategy.name)));
        let job_id = record.job.lock().id().to_string();
        self.jobs.insert(job_id.clone(), Arc::clone(&record));

        info!(job_id = %job_id, strategy = %strategy.name, stages = pipeline.len(), "Job submitted");
        self.event_sink.try_emit(
            "job.submitted",
            Some(serde_json::json!({"job_id": job_id, "strategy": strategy.name})),
        );

        let run = JobRun {
            record: Arc::clone(&record),
            job_id: job_id.clone(),
            strategy,
            pipeline,
            parameters,
            entities,
            identifier,
            ontology,
            config,
            resources: Arc::clone(&self.resources),
            cache: Arc::clone(&self.cache),
            event_sink: Arc::clone(&self.event_sink),
        };
        *record.task.lock() = Some(tokio::spawn(drive(run)));

        Ok(JobHandle {
            job_id,
            status: JobStatus::Pending,
        })
    }

    fn config_for(&self, parameters: &JsonMap) -> Result<ExecutionConfig, ValidationError> {
        let mut config = self.config.clone();
        if let Some(value) = parameters.get("timeout_seconds") {
            let seconds = value
                .as_f64()
                .ok_or_else(|| ValidationError::new("parameters.timeout_seconds", "must be a number"))?;
            config = config.with_timeout_seconds(seconds);
        }
        config.validate()?;
        Ok(config)
    }

    fn record(&self, job_id: &str) -> Result<Arc<JobRecord>> {
        self.jobs
            .get(job_id)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| BiomapperError::NotFound(format!("job '{job_id}'")))
    }

    /// A copy of the job.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id.
    pub fn job(&self, job_id: &str) -> Result<Job> {
        Ok(self.record(job_id)?.job.lock().clone())
    }

    /// Current status of a job.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id.
    pub fn status(&self, job_id: &str) -> Result<JobStatusReport> {
        Ok(self.record(job_id)?.report())
    }

    /// The result of a completed job.
    ///
    /// # Errors
    ///
    /// - `NotFound` for an unknown id
    /// - `JobNotReady` for any job that is not completed
    pub fn result(&self, job_id: &str) -> Result<Arc<JobResult>> {
        let record = self.record(job_id)?;
        let status = record.status();
        let stored = record.result.lock().clone();
        match (status, stored) {
            (JobStatus::Completed, Some(result)) => Ok(result),
            _ => Err(BiomapperError::JobNotReady {
                job_id: job_id.to_string(),
                status: status.to_string(),
            }),
        }
    }

    /// Matches accepted before a stage failure.
    ///
    /// Empty unless the job failed in a stage after earlier stages had
    /// accepted matches.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id.
    pub fn retained_matches(&self, job_id: &str) -> Result<Vec<MatchedEntity>> {
        let record = self.record(job_id)?;
        let retained = record.retained.lock().clone();
        Ok(retained)
    }

    /// The final context of a finished run, if it got that far.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id.
    pub fn context_snapshot(&self, job_id: &str) -> Result<Option<ContextSnapshot>> {
        Ok(self.record(job_id)?.snapshot.lock().clone())
    }

    /// Requests cooperative cancellation.
    ///
    /// Returns false if the job had already finished. A running stage is
    /// never interrupted; the job stops before the next one.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id.
    pub fn cancel(&self, job_id: &str, reason: impl Into<String>) -> Result<bool> {
        let record = self.record(job_id)?;
        if record.status().is_terminal() {
            return Ok(false);
        }
        let reason = reason.into();
        record.cancel.cancel(reason.clone());
        info!(job_id = %job_id, reason = %reason, "Job cancellation requested");
        self.event_sink.try_emit(
            "job.cancel_requested",
            Some(serde_json::json!({"job_id": job_id, "reason": reason})),
        );
        Ok(true)
    }

    /// Status of every known job, oldest first.
    #[must_use]
    pub fn list_jobs(&self) -> Vec<JobStatusReport> {
        let mut jobs: Vec<_> = self
            .jobs
            .iter()
            .map(|r| {
                let job = r.job.lock();
                (job.created_at(), job.report())
            })
            .collect();
        jobs.sort_by_key(|(created, _)| *created);
        jobs.into_iter().map(|(_, report)| report).collect()
    }

    /// Number of jobs that have not finished.
    #[must_use]
    pub fn active_jobs(&self) -> usize {
        self.jobs.iter().filter(|r| !r.status().is_terminal()).count()
    }

    /// Opens a progress channel for a job.
    ///
    /// The first event is the job's current state. The channel closes right
    /// after the terminal event.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id.
    pub fn subscribe(&self, job_id: &str) -> Result<mpsc::UnboundedReceiver<ProgressEvent>> {
        Ok(self.record(job_id)?.subscribe())
    }

    /// Forgets finished jobs last updated more than `max_age` ago.
    ///
    /// Returns how many were removed.
    pub fn prune_finished(&self, max_age: Duration) -> usize {
        let Ok(age) = chrono::Duration::from_std(max_age) else {
            return 0;
        };
        let cutoff = chrono::Utc::now() - age;
        let mut removed = 0;
        self.jobs.retain(|_, record| {
            let job = record.job.lock();
            let expired = job.status().is_terminal() && job.updated_at() <= cutoff;
            if expired {
                removed += 1;
            }
            !expired
        });
        if removed > 0 {
            debug!(removed, "Pruned finished jobs");
        }
        removed
    }

    /// Prunes with the configured retention.
    pub fn prune_expired(&self) -> usize {
        self.prune_finished(self.retention)
    }

    /// Drops expired jobs and cache entries. Runs on every submission.
    fn sweep_expired(&self) {
        let jobs = self.prune_expired();
        let entries = self.cache.purge_expired();
        if jobs + entries > 0 {
            debug!(jobs, cache_entries = entries, "Swept expired state");
        }
    }

    /// Cancels every unfinished job, waits for their tasks, stops resource
    /// monitoring and tears down the cache.
    ///
    /// Tasks that do not stop within the shutdown grace period are aborted
    /// and their jobs marked cancelled.
    pub async fn shutdown(&self) {
        let records: Vec<_> = self.jobs.iter().map(|r| Arc::clone(r.value())).collect();
        for record in &records {
            if !record.status().is_terminal() {
                record.cancel.cancel("engine shutdown");
            }
        }

        for record in records {
            let handle = record.task.lock().take();
            if let Some(mut handle) = handle {
                if tokio::time::timeout(self.shutdown_grace, &mut handle).await.is_err() {
                    handle.abort();
                    let _ = handle.await;
                }
            }
            record.update(|job| job.fail(&BiomapperError::Cancelled("engine shutdown".to_string())));
        }

        self.resources.cleanup().await;
        self.cache.teardown();
        info!("Job manager shut down");
    }
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("jobs", &self.jobs.len())
            .field("strategies", &self.strategies.names())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::events::CollectingEventSink;
    use crate::resources::{ResourceConfig, ResourceType, METADATA_STORE};
    use crate::strategy::StepDescriptor;
    use crate::testing::{fast_config, CountingProbe, FailingAction, HangingAction, ScriptedAction};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn params(value: Value) -> JsonMap {
        match value {
            Value::Object(map) => map,
            _ => JsonMap::new(),
        }
    }

    fn manager(actions: ActionRegistry) -> JobManager {
        let resources = Arc::new(ResourceManager::new(Arc::new(ProbeRegistry::new())));
        JobManager::new(Arc::new(actions), resources).with_config(fast_config())
    }

    async fn wait_terminal(manager: &JobManager, job_id: &str) -> JobStatusReport {
        loop {
            let report = manager.status(job_id).unwrap();
            if report.is_terminal() {
                return report;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_zero_step_job_completes() {
        let manager = manager(ActionRegistry::new());
        let handle = manager
            .submit(StrategyDefinition::new("empty").into(), JsonMap::new())
            .unwrap();
        assert_eq!(handle.status, JobStatus::Pending);

        let report = wait_terminal(&manager, &handle.job_id).await;
        assert_eq!(report.status, JobStatus::Completed);
        assert!((report.progress - 100.0).abs() < f64::EPSILON);

        let result = manager.result(&handle.job_id).unwrap();
        assert!(result.outcome.matched.is_empty());
        assert!(manager.job(&handle.job_id).unwrap().result_handle().is_some());
    }

    #[tokio::test]
    async fn test_named_strategy_runs_entities() {
        let actions = ActionRegistry::new().with_action(Arc::new(ScriptedAction::new("exact_match").with_match("A", "P1", 0.99)));
        let manager = manager(actions);
        manager
            .strategies()
            .register(
                StrategyDefinition::new("proteins")
                    .with_step(StepDescriptor::new("exact", "exact_match").with_param("confidence_threshold", json!(0.9))),
            )
            .unwrap();

        let handle = manager
            .submit(StrategySource::named("proteins"), params(json!({"entities": ["A", {"id": "B", "name": "x"}]})))
            .unwrap();
        wait_terminal(&manager, &handle.job_id).await;

        let result = manager.result(&handle.job_id).unwrap();
        assert_eq!(result.outcome.matched[0].target, "P1");
        assert_eq!(result.outcome.unmapped[0].attribute_str("name"), Some("x"));
        let snapshot = manager.context_snapshot(&handle.job_id).unwrap().unwrap();
        assert_eq!(snapshot.initial_identifier, "proteins");
        assert!(snapshot.custom_data.contains_key("parameters"));
    }

    #[tokio::test]
    async fn test_unknown_strategy_is_rejected_at_submit() {
        let manager = manager(ActionRegistry::new());
        let err = manager.submit(StrategySource::named("missing"), JsonMap::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(manager.list_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_bad_entities_are_rejected_at_submit() {
        let manager = manager(ActionRegistry::new());
        let err = manager
            .submit(StrategyDefinition::new("s").into(), params(json!({"entities": [{"name": "no id"}]})))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_stage_failure_fails_job() {
        let actions = ActionRegistry::new().with_action(Arc::new(FailingAction::new("api_resolve")));
        let manager = manager(actions);
        let strategy = StrategyDefinition::new("s").with_step(StepDescriptor::new("api", "api_resolve"));

        let handle = manager.submit(strategy.into(), params(json!({"entities": ["A"]}))).unwrap();
        let report = wait_terminal(&manager, &handle.job_id).await;

        assert_eq!(report.status, JobStatus::Failed);
        assert_eq!(report.error_kind, Some(ErrorKind::StageExecution));
        assert!(report.message.unwrap().contains("api_resolve is down"));
        assert!(matches!(
            manager.result(&handle.job_id),
            Err(BiomapperError::JobNotReady { .. })
        ));
        assert!(manager.context_snapshot(&handle.job_id).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_preflight_failure_never_runs_pipeline() {
        let action = Arc::new(ScriptedAction::new("exact_match"));
        let probes = Arc::new(ProbeRegistry::new());
        probes.register(METADATA_STORE, Arc::new(CountingProbe::always_unavailable()));
        let resources = Arc::new(ResourceManager::new(probes));
        resources
            .register_resource(ResourceConfig::new(METADATA_STORE, ResourceType::Database).required())
            .unwrap();
        let manager = JobManager::new(Arc::new(ActionRegistry::new().with_action(action.clone())), resources)
            .with_config(fast_config());

        let strategy = StrategyDefinition::new("s").with_step(StepDescriptor::new("exact", "exact_match"));
        let handle = manager.submit(strategy.into(), params(json!({"entities": ["A"]}))).unwrap();
        let report = wait_terminal(&manager, &handle.job_id).await;

        assert_eq!(report.status, JobStatus::Failed);
        assert_eq!(report.error_kind, Some(ErrorKind::ResourcePrerequisite));
        assert_eq!(action.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails_job() {
        let actions = ActionRegistry::new().with_action(Arc::new(HangingAction::new("llm_validate")));
        let manager = manager(actions);
        let strategy = StrategyDefinition::new("s").with_step(StepDescriptor::new("llm", "llm_validate"));

        let handle = manager
            .submit(strategy.into(), params(json!({"entities": ["A"], "timeout_seconds": 1.0})))
            .unwrap();
        let report = wait_terminal(&manager, &handle.job_id).await;

        assert_eq!(report.status, JobStatus::Failed);
        assert_eq!(report.error_kind, Some(ErrorKind::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_start_cancels_job() {
        let hanging = Arc::new(HangingAction::new("llm_validate"));
        let actions = ActionRegistry::new()
            .with_action(Arc::new(ScriptedAction::new("exact_match")))
            .with_action(hanging.clone());
        let manager = manager(actions);
        let strategy = StrategyDefinition::new("s")
            .with_step(StepDescriptor::new("exact", "exact_match"))
            .with_step(StepDescriptor::new("llm", "llm_validate"));

        let handle = manager.submit(strategy.into(), params(json!({"entities": ["A"]}))).unwrap();
        assert!(manager.cancel(&handle.job_id, "user request").unwrap());
        let report = wait_terminal(&manager, &handle.job_id).await;

        assert_eq!(report.status, JobStatus::Cancelled);
        assert!(!hanging.was_started());
        assert!(!manager.cancel(&handle.job_id, "again").unwrap());
    }

    #[tokio::test]
    async fn test_subscribe_sees_every_transition_then_closes() {
        let actions = ActionRegistry::new()
            .with_action(Arc::new(ScriptedAction::new("a")))
            .with_action(Arc::new(ScriptedAction::new("b")));
        let manager = manager(actions);
        let strategy = StrategyDefinition::new("s")
            .with_step(StepDescriptor::new("a", "a"))
            .with_step(StepDescriptor::new("b", "b"));

        let handle = manager.submit(strategy.into(), params(json!({"entities": ["A"]}))).unwrap();
        let mut rx = manager.subscribe(&handle.job_id).unwrap();

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }

        let last = events.last().unwrap();
        assert_eq!(last.status, JobStatus::Completed);
        assert_eq!(events.iter().filter(|e| e.is_final()).count(), 1);
        assert!(events.windows(2).all(|w| w[0].progress <= w[1].progress));

        let mut late = manager.subscribe(&handle.job_id).unwrap();
        assert!(late.recv().await.unwrap().is_final());
        assert!(late.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_events_and_pruning() {
        let sink = Arc::new(CollectingEventSink::new());
        let manager = manager(ActionRegistry::new()).with_event_sink(sink.clone());
        let handle = manager.submit(StrategyDefinition::new("s").into(), JsonMap::new()).unwrap();
        wait_terminal(&manager, &handle.job_id).await;

        assert_eq!(sink.events_of_type("job.submitted").len(), 1);
        assert_eq!(sink.events_of_type("job.completed").len(), 1);
        assert_eq!(manager.active_jobs(), 0);

        assert_eq!(manager.prune_finished(Duration::from_secs(3600)), 0);
        assert_eq!(manager.prune_finished(Duration::ZERO), 1);
        assert!(manager.status(&handle.job_id).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_running_jobs() {
        let actions = ActionRegistry::new().with_action(Arc::new(HangingAction::new("llm_validate")));
        let manager = manager(actions)
            .with_config(fast_config().with_cache(true, 60))
            .with_shutdown_grace(Duration::from_millis(10));
        manager.cache().insert("k", json!(1));
        let strategy = StrategyDefinition::new("s").with_step(StepDescriptor::new("llm", "llm_validate"));
        let handle = manager.submit(strategy.into(), params(json!({"entities": ["A"]}))).unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        manager.shutdown().await;

        assert_eq!(manager.status(&handle.job_id).unwrap().status, JobStatus::Cancelled);
        assert_eq!(manager.cache().stats().entries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_resource_monitors() {
        let mut config = EngineConfig::default();
        config.resources.push(ResourceConfig::new("db", ResourceType::Database));
        let probes = Arc::new(ProbeRegistry::new());
        probes.register("db", Arc::new(CountingProbe::always_healthy()));

        let manager = JobManager::from_engine_config(&config, Arc::new(ActionRegistry::new()), probes).unwrap();
        assert_eq!(manager.resources().monitor_count(), 1);

        manager.shutdown().await;
        assert_eq!(manager.resources().monitor_count(), 0);
    }

    #[tokio::test]
    async fn test_submit_sweeps_jobs_past_retention() {
        let manager = manager(ActionRegistry::new()).with_job_retention(Duration::ZERO);
        let first = manager.submit(StrategyDefinition::new("s").into(), JsonMap::new()).unwrap();
        wait_terminal(&manager, &first.job_id).await;

        let second = manager.submit(StrategyDefinition::new("s").into(), JsonMap::new()).unwrap();

        assert_eq!(manager.status(&first.job_id).unwrap_err().kind(), ErrorKind::NotFound);
        assert!(manager.status(&second.job_id).is_ok());
        assert_eq!(manager.list_jobs().len(), 1);
    }

    #[tokio::test]
    async fn test_submit_keeps_jobs_within_retention() {
        let manager = manager(ActionRegistry::new());
        let first = manager.submit(StrategyDefinition::new("s").into(), JsonMap::new()).unwrap();
        wait_terminal(&manager, &first.job_id).await;

        manager.submit(StrategyDefinition::new("s").into(), JsonMap::new()).unwrap();
        assert!(manager.status(&first.job_id).is_ok());
    }

    #[tokio::test]
    async fn test_stage_failure_exposes_retained_matches() {
        let actions = ActionRegistry::new()
            .with_action(Arc::new(ScriptedAction::new("exact_match").with_match("A", "P1", 0.99)))
            .with_action(Arc::new(FailingAction::new("api_resolve")));
        let manager = manager(actions);
        let strategy = StrategyDefinition::new("s")
            .with_step(StepDescriptor::new("exact", "exact_match"))
            .with_step(StepDescriptor::new("api", "api_resolve"));

        let handle = manager.submit(strategy.into(), params(json!({"entities": ["A", "B"]}))).unwrap();
        let report = wait_terminal(&manager, &handle.job_id).await;
        assert_eq!(report.status, JobStatus::Failed);

        let retained = manager.retained_matches(&handle.job_id).unwrap();
        assert_eq!(retained.len(), 1);
        assert_eq!(retained[0].entity.id, "A");
        assert_eq!(retained[0].target, "P1");
    }

    #[tokio::test]
    async fn test_empty_identifier_is_rejected_at_submit() {
        let manager = manager(ActionRegistry::new());
        let err = manager
            .submit(StrategyDefinition::new("s").into(), params(json!({"identifier": "  "})))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(manager.list_jobs().is_empty());
    }

    #[test]
    fn test_parse_entities_shapes() {
        let parsed = parse_entities(Some(&json!(["A", {"id": 7, "n": 1}]))).unwrap();
        assert_eq!(parsed[0].id, "A");
        assert_eq!(parsed[1].id, "7");
        assert_eq!(parsed[1].attributes["n"], 1);

        assert!(parse_entities(None).unwrap().is_empty());
        assert!(parse_entities(Some(&json!("A"))).is_err());
        assert!(parse_entities(Some(&json!([""]))).is_err());
    }
}
