//! The waterfall pipeline.
//!
//! Stages run strictly in declaration order. Each stage sees only the
//! entities every earlier stage left unresolved; accepted matches leave
//! circulation for good. The pipeline, not the actions, enforces
//! deduplication, so every input entity ends up either matched exactly once
//! or unmapped.

use super::outcome::{coverage, MatchedEntity, StageMetrics, WaterfallOutcome};
use super::retry::RetryPolicy;
use super::stage::WaterfallStage;
use crate::actions::{ActionError, ActionOutput, CallBudget, Entity, EntityMatch};
use crate::cancellation::CancellationToken;
use crate::context::{ExecutionContext, JsonMap, ProvenanceRecord, StepResult};
use crate::errors::{BiomapperError, Result, StageExecutionError, ValidationError};
use crate::events::{default_sink, EventSink};
use futures::FutureExt;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Called after every stage with `(completed, total, stage_id)`.
pub type ProgressCallback = Arc<dyn Fn(usize, usize, &str) + Send + Sync>;

/// Optional hooks for one run.
#[derive(Clone, Default)]
pub struct RunHooks {
    /// Checked before every stage.
    pub cancel: Option<Arc<CancellationToken>>,
    /// Invoked after every stage, skipped ones included.
    pub on_stage_complete: Option<ProgressCallback>,
}

impl RunHooks {
    /// Hooks with a cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, token: Arc<CancellationToken>) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Hooks with a progress callback.
    #[must_use]
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.on_stage_complete = Some(callback);
        self
    }
}

impl std::fmt::Debug for RunHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHooks")
            .field("cancel", &self.cancel)
            .field("on_stage_complete", &self.on_stage_complete.is_some())
            .finish()
    }
}

type InvokeResult = std::result::Result<(ActionOutput, u32), (ActionError, u32)>;

/// An ordered list of matching stages.
#[derive(Clone)]
pub struct WaterfallPipeline {
    name: String,
    stages: Vec<WaterfallStage>,
    retry: Option<RetryPolicy>,
    event_sink: Arc<dyn EventSink>,
}

impl WaterfallPipeline {
    /// Creates an empty pipeline.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            retry: None,
            event_sink: default_sink(),
        }
    }

    /// Appends a stage.
    #[must_use]
    pub fn with_stage(mut self, stage: WaterfallStage) -> Self {
        self.stages.push(stage);
        self
    }

    /// Overrides the retry policy derived from the context config.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stages in execution order.
    #[must_use]
    pub fn stages(&self) -> &[WaterfallStage] {
        &self.stages
    }

    /// Number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if the pipeline has no stages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Checks every stage and that stage ids are unique.
    ///
    /// # Errors
    ///
    /// Returns the first `ValidationError` found.
    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        let mut seen = HashSet::new();
        for stage in &self.stages {
            stage.validate()?;
            if !seen.insert(stage.id.as_str()) {
                return Err(ValidationError::new(
                    format!("stages.{}", stage.id),
                    "duplicate stage id",
                ));
            }
        }
        Ok(())
    }

    /// Runs the pipeline without hooks.
    ///
    /// # Errors
    ///
    /// See [`run_with`](Self::run_with).
    pub async fn run(&self, input: Vec<Entity>, ctx: &mut ExecutionContext) -> Result<WaterfallOutcome> {
        self.run_with(input, ctx, &RunHooks::default()).await
    }

    /// Runs the pipeline over `input`, recording step results, provenance
    /// and datasets in `ctx`.
    ///
    /// # Errors
    ///
    /// - `Validation` if a stage is misconfigured
    /// - `Cancelled` if the token was set before a stage
    /// - `StageExecution` if an action still fails after its retries; the
    ///   error carries the matches accepted so far
    pub async fn run_with(
        &self,
        input: Vec<Entity>,
        ctx: &mut ExecutionContext,
        hooks: &RunHooks,
    ) -> Result<WaterfallOutcome> {
        self.validate()?;
        let policy = self
            .retry
            .clone()
            .unwrap_or_else(|| RetryPolicy::from_config(ctx.config()));

        let (mut unresolved, duplicate_ids) = dedup_input(input);
        if !duplicate_ids.is_empty() {
            warn!(pipeline = %self.name, duplicates = duplicate_ids.len(), "Dropped duplicate input entities");
        }
        let total_input = unresolved.len();
        let stage_count = self.stages.len();
        let mut matched: Vec<MatchedEntity> = Vec::new();
        let mut metrics: Vec<StageMetrics> = Vec::with_capacity(stage_count);

        info!(pipeline = %self.name, stages = stage_count, entities = total_input, "Waterfall started");
        self.event_sink.try_emit(
            "waterfall.started",
            Some(serde_json::json!({
                "pipeline": self.name,
                "stages": stage_count,
                "entities": total_input,
            })),
        );

        for (index, stage) in self.stages.iter().enumerate() {
            if let Some(token) = &hooks.cancel {
                if token.is_cancelled() {
                    let reason = token.reason().unwrap_or_else(|| "cancelled".to_string());
                    info!(pipeline = %self.name, stage = %stage.id, reason = %reason, "Waterfall cancelled");
                    self.event_sink.try_emit(
                        "waterfall.cancelled",
                        Some(serde_json::json!({"stage_id": stage.id, "reason": reason})),
                    );
                    return Err(BiomapperError::Cancelled(reason));
                }
            }

            if unresolved.is_empty() {
                debug!(stage = %stage.id, "Nothing left to resolve, skipping stage");
                metrics.push(StageMetrics {
                    stage_id: stage.id.clone(),
                    method: stage.method.clone(),
                    cumulative_unique_matches: matched.len(),
                    cumulative_coverage: coverage(matched.len(), total_input),
                    skipped: true,
                    ..StageMetrics::default()
                });
                self.event_sink
                    .try_emit("stage.skipped", Some(serde_json::json!({"stage_id": stage.id})));
                notify(hooks, index, stage_count, &stage.id);
                continue;
            }

            self.event_sink.try_emit(
                "stage.started",
                Some(serde_json::json!({
                    "stage_id": stage.id,
                    "method": stage.method,
                    "entities": unresolved.len(),
                })),
            );

            let started = Instant::now();
            let budget = CallBudget::from_limit(stage.cost_budget);
            let result = invoke_stage(stage, &unresolved, ctx, &budget, &policy).await;

            let (output, attempts) = match result {
                Ok(ok) => ok,
                Err((error, attempts)) => {
                    warn!(stage = %stage.id, attempts, error = %error, "Stage failed");
                    ctx.add_step_result(&stage.id, StepResult::failed(&stage.method, error.to_string())?)?;
                    self.event_sink.try_emit(
                        "stage.failed",
                        Some(serde_json::json!({
                            "stage_id": stage.id,
                            "error": error.to_string(),
                            "attempts": attempts,
                        })),
                    );
                    return Err(StageExecutionError::new(&stage.id, error.to_string(), attempts)
                        .with_retained(matched)
                        .into());
                }
            };

            let partition = partition_output(stage, &unresolved, output);
            ctx.merge_custom_data(partition.side_effects);

            #[allow(clippy::cast_precision_loss)]
            let cost_estimate = budget.used() as f64 * stage.cost_per_call;
            let stage_metrics = StageMetrics {
                stage_id: stage.id.clone(),
                method: stage.method.clone(),
                entities_offered: unresolved.len(),
                new_unique_matches: partition.accepted.len(),
                rejected_below_threshold: partition.rejected,
                cumulative_unique_matches: matched.len() + partition.accepted.len(),
                cumulative_coverage: coverage(matched.len() + partition.accepted.len(), total_input),
                cost_estimate,
                api_calls_made: budget.used(),
                budget_exhausted: budget.was_refused(),
                attempts,
                duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                skipped: false,
            };

            self.record_stage(ctx, stage, &stage_metrics, &partition.accepted)?;
            if stage_metrics.budget_exhausted {
                let exceeded = BiomapperError::BudgetExceeded {
                    stage_id: stage.id.clone(),
                    budget: stage.cost_budget.unwrap_or_default(),
                    calls_made: stage_metrics.api_calls_made,
                };
                warn!(stage = %stage.id, "{exceeded}");
                self.event_sink
                    .try_emit("stage.budget_exhausted", Some(serde_json::json!(exceeded.to_dict())));
            }

            info!(
                stage = %stage.id,
                offered = stage_metrics.entities_offered,
                accepted = stage_metrics.new_unique_matches,
                rejected = stage_metrics.rejected_below_threshold,
                remaining = partition.remaining.len(),
                "Stage completed"
            );
            self.event_sink
                .try_emit("stage.completed", serde_json::to_value(&stage_metrics).ok());

            matched.extend(partition.accepted);
            unresolved = partition.remaining;
            metrics.push(stage_metrics);
            notify(hooks, index, stage_count, &stage.id);
        }

        let outcome = WaterfallOutcome {
            matched,
            unmapped: unresolved,
            stages: metrics,
            total_input,
            duplicate_ids,
        };

        ctx.set_dataset("matched", outcome.matched.iter().map(MatchedEntity::to_record).collect())?;
        ctx.set_dataset("unmapped", outcome.unmapped.iter().map(Entity::to_record).collect())?;

        info!(
            pipeline = %self.name,
            matched = outcome.matched.len(),
            unmapped = outcome.unmapped.len(),
            coverage = outcome.coverage(),
            "Waterfall completed"
        );
        self.event_sink.try_emit(
            "waterfall.completed",
            Some(serde_json::json!({
                "pipeline": self.name,
                "matched": outcome.matched.len(),
                "unmapped": outcome.unmapped.len(),
                "coverage": outcome.coverage(),
            })),
        );
        Ok(outcome)
    }

    fn record_stage(
        &self,
        ctx: &mut ExecutionContext,
        stage: &WaterfallStage,
        metrics: &StageMetrics,
        accepted: &[MatchedEntity],
    ) -> Result<()> {
        let data = match serde_json::to_value(metrics) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => JsonMap::new(),
        };
        ctx.add_step_result(&stage.id, StepResult::succeeded(&stage.method, data)?)?;
        ctx.add_provenance(
            ProvenanceRecord::new(&stage.id, &stage.method)
                .with_detail("pipeline", serde_json::json!(self.name))
                .with_detail("accepted", serde_json::json!(metrics.new_unique_matches))
                .with_detail("rejected", serde_json::json!(metrics.rejected_below_threshold))
                .with_detail("api_calls", serde_json::json!(metrics.api_calls_made)),
        )?;
        ctx.set_dataset(
            format!("{}.matched", stage.id),
            accepted.iter().map(MatchedEntity::to_record).collect(),
        )?;
        Ok(())
    }
}

impl std::fmt::Debug for WaterfallPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaterfallPipeline")
            .field("name", &self.name)
            .field("stages", &self.stages.iter().map(|s| s.id.as_str()).collect::<Vec<_>>())
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

fn notify(hooks: &RunHooks, index: usize, total: usize, stage_id: &str) {
    if let Some(callback) = &hooks.on_stage_complete {
        callback(index + 1, total, stage_id);
    }
}

/// Keeps the first occurrence of every id.
fn dedup_input(input: Vec<Entity>) -> (Vec<Entity>, Vec<String>) {
    let mut seen = HashSet::with_capacity(input.len());
    let mut unique = Vec::with_capacity(input.len());
    let mut duplicates = Vec::new();
    for entity in input {
        if seen.insert(entity.id.clone()) {
            unique.push(entity);
        } else {
            duplicates.push(entity.id);
        }
    }
    (unique, duplicates)
}

/// Calls the stage action on every batch, retrying each batch on its own.
async fn invoke_stage(
    stage: &WaterfallStage,
    entities: &[Entity],
    ctx: &ExecutionContext,
    budget: &CallBudget,
    policy: &RetryPolicy,
) -> InvokeResult {
    let batch = &ctx.config().batch;
    let chunks = entities.chunks(batch.size.max(1));

    let mut merged = ActionOutput::default();
    let mut max_attempts = 0;
    if batch.parallel {
        let results = futures::future::join_all(
            chunks.map(|chunk| invoke_batch(stage, chunk, ctx, budget, policy)),
        )
        .await;
        for result in results {
            let (output, attempts) = result?;
            merged.merge(output);
            max_attempts = max_attempts.max(attempts);
        }
    } else {
        for chunk in chunks {
            let (output, attempts) = invoke_batch(stage, chunk, ctx, budget, policy).await?;
            merged.merge(output);
            max_attempts = max_attempts.max(attempts);
        }
    }
    Ok((merged, max_attempts))
}

async fn invoke_batch(
    stage: &WaterfallStage,
    chunk: &[Entity],
    ctx: &ExecutionContext,
    budget: &CallBudget,
    policy: &RetryPolicy,
) -> InvokeResult {
    policy
        .run(&stage.id, ActionError::is_retryable, |_| {
            AssertUnwindSafe(stage.action.execute(chunk, ctx, &stage.params, budget))
                .catch_unwind()
                .map(|result| {
                    result.unwrap_or_else(|payload| Err(ActionError::Panicked(panic_message(&*payload))))
                })
        })
        .await
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

struct Partition {
    accepted: Vec<MatchedEntity>,
    remaining: Vec<Entity>,
    rejected: usize,
    side_effects: JsonMap,
}

/// Splits an action's output into accepted matches and the entities that
/// flow on to the next stage.
///
/// Only the best match per offered entity counts. Matches for entities that
/// were not offered are ignored. Offered entities the action neither
/// matched nor returned stay unresolved.
fn partition_output(stage: &WaterfallStage, offered: &[Entity], output: ActionOutput) -> Partition {
    let offered_ids: HashSet<&str> = offered.iter().map(|e| e.id.as_str()).collect();

    let mut best: HashMap<String, EntityMatch> = HashMap::new();
    let mut foreign = 0usize;
    for candidate in output.matched {
        if !offered_ids.contains(candidate.entity_id.as_str()) {
            foreign += 1;
            continue;
        }
        let replace = best.get(&candidate.entity_id).map_or(true, |current| {
            !candidate.confidence.is_nan()
                && (current.confidence.is_nan() || candidate.confidence > current.confidence)
        });
        if replace {
            best.insert(candidate.entity_id.clone(), candidate);
        }
    }
    if foreign > 0 {
        debug!(stage = %stage.id, foreign, "Ignored matches for entities not offered to the stage");
    }

    let mut returned: HashMap<String, Entity> = output
        .unresolved
        .into_iter()
        .filter(|e| offered_ids.contains(e.id.as_str()))
        .map(|e| (e.id.clone(), e))
        .collect();

    let mut accepted = Vec::new();
    let mut remaining = Vec::new();
    let mut rejected = 0;
    for entity in offered {
        match best.remove(&entity.id) {
            Some(m) if stage.accepts(m.confidence) => accepted.push(MatchedEntity {
                entity: entity.clone(),
                target: m.target,
                confidence: m.confidence,
                stage_id: stage.id.clone(),
                method: stage.method.clone(),
                metadata: m.metadata,
            }),
            found => {
                if found.is_some() {
                    rejected += 1;
                }
                remaining.push(returned.remove(&entity.id).unwrap_or_else(|| entity.clone()));
            }
        }
    }

    Partition {
        accepted,
        remaining,
        rejected,
        side_effects: output.side_effects,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{ActionParams, FnAction};
    use crate::config::ExecutionConfig;
    use crate::events::CollectingEventSink;
    use crate::testing::{entities, test_context, FailingAction, ScriptedAction};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn ids(entities: &[Entity]) -> Vec<&str> {
        entities.iter().map(|e| e.id.as_str()).collect()
    }

    #[test]
    fn test_dedup_keeps_first_occurrence() {
        let input = vec![
            Entity::new("A").with_attribute("n", json!(1)),
            Entity::new("B"),
            Entity::new("A").with_attribute("n", json!(2)),
        ];
        let (unique, duplicates) = dedup_input(input);
        assert_eq!(ids(&unique), vec!["A", "B"]);
        assert_eq!(unique[0].attributes["n"], 1);
        assert_eq!(duplicates, vec!["A"]);
    }

    #[test]
    fn test_partition_uses_best_match_and_ignores_foreign() {
        let stage = WaterfallStage::new("s", Arc::new(ScriptedAction::new("s"))).with_threshold(0.5);
        let offered = entities(&["A", "B"]);
        let output = ActionOutput::new()
            .with_match(EntityMatch::new("A", "low", 0.2))
            .with_match(EntityMatch::new("A", "high", 0.9))
            .with_match(EntityMatch::new("B", "nan", f64::NAN))
            .with_match(EntityMatch::new("Z", "foreign", 1.0));

        let partition = partition_output(&stage, &offered, output);
        assert_eq!(partition.accepted.len(), 1);
        assert_eq!(partition.accepted[0].target, "high");
        assert_eq!(ids(&partition.remaining), vec!["B"]);
        assert_eq!(partition.rejected, 1);
    }

    #[test]
    fn test_partition_prefers_returned_entity_version() {
        let stage = WaterfallStage::new("s", Arc::new(ScriptedAction::new("s")));
        let offered = entities(&["A"]);
        let output = ActionOutput::new()
            .with_unresolved(Entity::new("A").with_attribute("normalized", json!("a")));

        let partition = partition_output(&stage, &offered, output);
        assert_eq!(partition.remaining[0].attributes["normalized"], "a");
    }

    #[tokio::test]
    async fn test_two_stage_scenario() {
        let stage1 = ScriptedAction::new("exact").with_match("A", "P1", 0.95);
        let stage2 = ScriptedAction::new("fuzzy")
            .with_match("B", "P2", 0.4)
            .with_match("C", "P3", 0.85);
        let pipeline = WaterfallPipeline::new("proteins")
            .with_stage(WaterfallStage::new("stage1", Arc::new(stage1)).with_threshold(0.9))
            .with_stage(WaterfallStage::new("stage2", Arc::new(stage2)).with_threshold(0.8));

        let mut ctx = test_context();
        let outcome = pipeline.run(entities(&["A", "B", "C"]), &mut ctx).await.unwrap();

        let matched: Vec<_> = outcome
            .matched
            .iter()
            .map(|m| (m.entity.id.as_str(), m.stage_id.as_str()))
            .collect();
        assert_eq!(matched, vec![("A", "stage1"), ("C", "stage2")]);
        assert_eq!(ids(&outcome.unmapped), vec!["B"]);
        assert_eq!(outcome.stages[1].rejected_below_threshold, 1);
        assert_eq!(outcome.stages[1].cumulative_unique_matches, 2);

        assert_eq!(ctx.dataset("matched").unwrap().len(), 2);
        assert_eq!(ctx.dataset("unmapped").unwrap().len(), 1);
        assert_eq!(ctx.dataset("stage1.matched").unwrap().len(), 1);
        assert_eq!(ctx.provenance().len(), 2);
        assert!(ctx.is_successful());
    }

    #[tokio::test]
    async fn test_matched_entities_are_never_reoffered() {
        let first = Arc::new(ScriptedAction::new("first").with_match("A", "X", 1.0));
        let second = Arc::new(ScriptedAction::new("second").with_match("A", "Y", 1.0));
        let pipeline = WaterfallPipeline::new("p")
            .with_stage(WaterfallStage::new("first", first))
            .with_stage(WaterfallStage::new("second", second.clone()));

        let outcome = pipeline.run(entities(&["A", "B"]), &mut test_context()).await.unwrap();

        assert_eq!(second.seen_ids(), vec!["B"]);
        assert_eq!(outcome.matched.len(), 1);
        assert_eq!(outcome.matched[0].target, "X");
    }

    #[tokio::test]
    async fn test_stages_skipped_once_everything_matched() {
        let first = ScriptedAction::new("first").with_match("A", "X", 1.0);
        let second = Arc::new(ScriptedAction::new("second"));
        let sink = Arc::new(CollectingEventSink::new());
        let pipeline = WaterfallPipeline::new("p")
            .with_stage(WaterfallStage::new("first", Arc::new(first)))
            .with_stage(WaterfallStage::new("second", second.clone()))
            .with_event_sink(sink.clone());

        let outcome = pipeline.run(entities(&["A"]), &mut test_context()).await.unwrap();

        assert_eq!(second.call_count(), 0);
        assert!(outcome.stages[1].skipped);
        assert_eq!(sink.events_of_type("stage.skipped").len(), 1);
        assert_eq!(sink.events_of_type("waterfall.completed").len(), 1);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_is_partial_success() {
        let action = ScriptedAction::new("api")
            .with_match("A", "X", 1.0)
            .with_match("B", "Y", 1.0)
            .with_match("C", "Z", 1.0);
        let pipeline = WaterfallPipeline::new("p")
            .with_stage(
                WaterfallStage::new("api", Arc::new(action))
                    .with_budget(2)
                    .with_cost_per_call(0.5),
            );

        let outcome = pipeline.run(entities(&["A", "B", "C"]), &mut test_context()).await.unwrap();

        let metrics = &outcome.stages[0];
        assert!(metrics.budget_exhausted);
        assert_eq!(metrics.api_calls_made, 2);
        assert!((metrics.cost_estimate - 1.0).abs() < f64::EPSILON);
        assert_eq!(outcome.matched.len(), 2);
        assert_eq!(ids(&outcome.unmapped), vec!["C"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stage_failure_retains_earlier_matches() {
        let pipeline = WaterfallPipeline::new("p")
            .with_stage(WaterfallStage::new(
                "exact",
                Arc::new(ScriptedAction::new("exact").with_match("A", "X", 1.0)),
            ))
            .with_stage(WaterfallStage::new("broken", Arc::new(FailingAction::new("broken"))))
            .with_retry_policy(RetryPolicy::none().with_max_retries(1).with_base_delay_ms(1));

        let mut ctx = test_context();
        let err = pipeline.run(entities(&["A", "B"]), &mut ctx).await.unwrap_err();

        match err {
            BiomapperError::StageExecution(e) => {
                assert_eq!(e.stage_id, "broken");
                assert_eq!(e.attempts, 2);
                assert_eq!(e.retained.len(), 1);
                assert_eq!(e.retained[0].entity.id, "A");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!ctx.is_successful());
    }

    #[tokio::test]
    async fn test_panicking_action_becomes_stage_error() {
        let action = FnAction::new("boom", |_: &[Entity], _: &ActionParams, _: &CallBudget| -> std::result::Result<ActionOutput, ActionError> {
            panic!("bad index")
        });
        let pipeline = WaterfallPipeline::new("p").with_stage(WaterfallStage::new("boom", Arc::new(action)));

        let err = pipeline.run(entities(&["A"]), &mut test_context()).await.unwrap_err();
        assert!(err.to_string().contains("bad index"));
    }

    #[tokio::test]
    async fn test_cancellation_is_checked_between_stages() {
        let token = Arc::new(CancellationToken::new());
        let first = ScriptedAction::new("first").with_cancel_on_call(token.clone());
        let second = Arc::new(ScriptedAction::new("second"));
        let pipeline = WaterfallPipeline::new("p")
            .with_stage(WaterfallStage::new("first", Arc::new(first)))
            .with_stage(WaterfallStage::new("second", second.clone()));

        let hooks = RunHooks::default().with_cancel(token);
        let err = pipeline
            .run_with(entities(&["A"]), &mut test_context(), &hooks)
            .await
            .unwrap_err();

        assert!(matches!(err, BiomapperError::Cancelled(_)));
        assert_eq!(second.call_count(), 0);
    }

    #[tokio::test]
    async fn test_batches_share_one_budget() {
        let config = ExecutionConfig::default().with_batch(2, true);
        let mut ctx = ExecutionContext::new("run", crate::context::OntologyType::Protein, config).unwrap();
        let action = Arc::new(ScriptedAction::new("api").matching_all(1.0));
        let pipeline = WaterfallPipeline::new("p")
            .with_stage(WaterfallStage::new("api", action.clone()).with_budget(3));

        let outcome = pipeline.run(entities(&["A", "B", "C", "D", "E"]), &mut ctx).await.unwrap();

        assert_eq!(action.call_count(), 3);
        assert_eq!(outcome.matched.len(), 3);
        assert_eq!(outcome.unmapped.len(), 2);
        assert_eq!(outcome.stages[0].api_calls_made, 3);
    }

    #[tokio::test]
    async fn test_progress_callback_sees_every_stage() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let hooks = RunHooks::default().with_progress(Arc::new(move |done: usize, total: usize, id: &str| {
            seen_clone.lock().push((done, total, id.to_string()));
        }));
        let pipeline = WaterfallPipeline::new("p")
            .with_stage(WaterfallStage::new("a", Arc::new(ScriptedAction::new("a"))))
            .with_stage(WaterfallStage::new("b", Arc::new(ScriptedAction::new("b"))));

        pipeline.run_with(entities(&["A"]), &mut test_context(), &hooks).await.unwrap();

        assert_eq!(
            *seen.lock(),
            vec![(1, 2, "a".to_string()), (2, 2, "b".to_string())]
        );
    }

    #[tokio::test]
    async fn test_duplicate_stage_ids_are_rejected() {
        let action = Arc::new(ScriptedAction::new("a"));
        let pipeline = WaterfallPipeline::new("p")
            .with_stage(WaterfallStage::new("a", action.clone()))
            .with_stage(WaterfallStage::new("a", action));

        let err = pipeline.run(entities(&["A"]), &mut test_context()).await.unwrap_err();
        assert!(matches!(err, BiomapperError::Validation(_)));
    }
}
