//! Scripted actions and probes for tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::actions::{Action, ActionError, ActionOutput, ActionParams, CallBudget, Entity, EntityMatch};
use crate::cancellation::CancellationToken;
use crate::context::ExecutionContext;
use crate::resources::{ProbeError, ProbeReport, ResourceProbe};

/// An action that answers from a fixed table of matches.
///
/// Every offered entity costs one budget unit. Once a reservation is
/// refused, the rest of the batch is returned unresolved.
#[derive(Debug)]
pub struct ScriptedAction {
    action_type: String,
    matches: HashMap<String, (String, f64)>,
    match_all: Option<f64>,
    cancel_on_call: Option<Arc<CancellationToken>>,
    calls: AtomicUsize,
    seen: Mutex<Vec<String>>,
}

impl ScriptedAction {
    /// Creates an action that matches nothing.
    #[must_use]
    pub fn new(action_type: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            matches: HashMap::new(),
            match_all: None,
            cancel_on_call: None,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Matches `entity_id` to `target` with `confidence`.
    #[must_use]
    pub fn with_match(mut self, entity_id: impl Into<String>, target: impl Into<String>, confidence: f64) -> Self {
        self.matches.insert(entity_id.into(), (target.into(), confidence));
        self
    }

    /// Matches every entity without a scripted match to `<type>:<id>`.
    #[must_use]
    pub fn matching_all(mut self, confidence: f64) -> Self {
        self.match_all = Some(confidence);
        self
    }

    /// Cancels `token` whenever the action runs.
    #[must_use]
    pub fn with_cancel_on_call(mut self, token: Arc<CancellationToken>) -> Self {
        self.cancel_on_call = Some(token);
        self
    }

    /// Number of invocations.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Ids offered to the action, in order, across all invocations.
    #[must_use]
    pub fn seen_ids(&self) -> Vec<String> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl Action for ScriptedAction {
    fn action_type(&self) -> &str {
        &self.action_type
    }

    async fn execute(
        &self,
        unresolved: &[Entity],
        _ctx: &ExecutionContext,
        _params: &ActionParams,
        budget: &CallBudget,
    ) -> Result<ActionOutput, ActionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(token) = &self.cancel_on_call {
            token.cancel(format!("cancelled by {}", self.action_type));
        }
        self.seen.lock().extend(unresolved.iter().map(|e| e.id.clone()));

        let mut output = ActionOutput::new();
        let mut refused = false;
        for entity in unresolved {
            refused = refused || !budget.try_spend(1);
            if refused {
                output = output.with_unresolved(entity.clone());
                continue;
            }
            let scripted = self
                .matches
                .get(&entity.id)
                .cloned()
                .or_else(|| self.match_all.map(|c| (format!("{}:{}", self.action_type, entity.id), c)));
            output = match scripted {
                Some((target, confidence)) => output.with_match(EntityMatch::new(&entity.id, target, confidence)),
                None => output.with_unresolved(entity.clone()),
            };
        }
        Ok(output)
    }
}

/// An action that always fails with a retryable error.
#[derive(Debug)]
pub struct FailingAction {
    action_type: String,
    calls: AtomicUsize,
}

impl FailingAction {
    /// Creates a failing action.
    #[must_use]
    pub fn new(action_type: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of invocations.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Action for FailingAction {
    fn action_type(&self) -> &str {
        &self.action_type
    }

    async fn execute(
        &self,
        _unresolved: &[Entity],
        _ctx: &ExecutionContext,
        _params: &ActionParams,
        _budget: &CallBudget,
    ) -> Result<ActionOutput, ActionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ActionError::Failed(format!("{} is down", self.action_type)))
    }
}

/// An action that never returns.
#[derive(Debug)]
pub struct HangingAction {
    action_type: String,
    started: AtomicBool,
}

impl HangingAction {
    /// Creates a hanging action.
    #[must_use]
    pub fn new(action_type: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            started: AtomicBool::new(false),
        }
    }

    /// Whether the action has been entered.
    #[must_use]
    pub fn was_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Action for HangingAction {
    fn action_type(&self) -> &str {
        &self.action_type
    }

    async fn execute(
        &self,
        _unresolved: &[Entity],
        _ctx: &ExecutionContext,
        _params: &ActionParams,
        _budget: &CallBudget,
    ) -> Result<ActionOutput, ActionError> {
        self.started.store(true, Ordering::SeqCst);
        std::future::pending::<()>().await;
        Ok(ActionOutput::new())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeMode {
    AlwaysHealthy,
    AlwaysUnavailable,
    HealthyAfterStart,
}

/// A probe with a fixed behaviour that counts its calls.
#[derive(Debug)]
pub struct CountingProbe {
    mode: ProbeMode,
    started: AtomicBool,
    checks: AtomicUsize,
    starts: AtomicUsize,
}

impl CountingProbe {
    fn with_mode(mode: ProbeMode) -> Self {
        Self {
            mode,
            started: AtomicBool::new(false),
            checks: AtomicUsize::new(0),
            starts: AtomicUsize::new(0),
        }
    }

    /// Every check reports `Healthy`.
    #[must_use]
    pub fn always_healthy() -> Self {
        Self::with_mode(ProbeMode::AlwaysHealthy)
    }

    /// Every check reports `Unavailable`, even after a successful start.
    #[must_use]
    pub fn always_unavailable() -> Self {
        Self::with_mode(ProbeMode::AlwaysUnavailable)
    }

    /// `Unavailable` until `start` is called, `Healthy` afterwards.
    #[must_use]
    pub fn healthy_after_start() -> Self {
        Self::with_mode(ProbeMode::HealthyAfterStart)
    }

    /// Number of `check` calls.
    #[must_use]
    pub fn check_calls(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }

    /// Number of `start` calls.
    #[must_use]
    pub fn start_calls(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResourceProbe for CountingProbe {
    async fn check(&self, _config: &serde_json::Value) -> Result<ProbeReport, ProbeError> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        let report = match self.mode {
            ProbeMode::AlwaysHealthy => ProbeReport::healthy(),
            ProbeMode::AlwaysUnavailable => ProbeReport::unavailable("probe always fails"),
            ProbeMode::HealthyAfterStart if self.started.load(Ordering::SeqCst) => ProbeReport::healthy(),
            ProbeMode::HealthyAfterStart => ProbeReport::unavailable("not started"),
        };
        Ok(report)
    }

    async fn start(&self, _config: &serde_json::Value) -> Result<bool, ProbeError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.started.store(true, Ordering::SeqCst);
        Ok(true)
    }
}
