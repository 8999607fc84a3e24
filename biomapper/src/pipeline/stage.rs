//! Waterfall stage definition.

use crate::actions::{Action, ActionParams};
use crate::errors::ValidationError;
use std::sync::Arc;

/// One matching stage: an action plus the rules applied to its output.
#[derive(Debug, Clone)]
pub struct WaterfallStage {
    /// Unique stage id within the pipeline.
    pub id: String,
    /// Human-readable method label (defaults to the action type).
    pub method: String,
    /// The matching action.
    pub action: Arc<dyn Action>,
    /// Minimum confidence for a match to be accepted.
    pub confidence_threshold: f64,
    /// Maximum external calls, if limited.
    pub cost_budget: Option<u64>,
    /// Estimated cost of one external call.
    pub cost_per_call: f64,
    /// Parameters handed to the action.
    pub params: ActionParams,
}

impl WaterfallStage {
    /// Creates a stage accepting every match, without a budget.
    #[must_use]
    pub fn new(id: impl Into<String>, action: Arc<dyn Action>) -> Self {
        Self {
            id: id.into(),
            method: action.action_type().to_string(),
            action,
            confidence_threshold: 0.0,
            cost_budget: None,
            cost_per_call: 0.0,
            params: ActionParams::new(),
        }
    }

    /// Sets the method label.
    #[must_use]
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    /// Sets the confidence threshold.
    #[must_use]
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    /// Limits the stage to `budget` external calls.
    #[must_use]
    pub fn with_budget(mut self, budget: u64) -> Self {
        self.cost_budget = Some(budget);
        self
    }

    /// Sets the per-call cost used for estimates.
    #[must_use]
    pub fn with_cost_per_call(mut self, cost: f64) -> Self {
        self.cost_per_call = cost;
        self
    }

    /// Sets the action parameters.
    #[must_use]
    pub fn with_params(mut self, params: ActionParams) -> Self {
        self.params = params;
        self
    }

    /// Returns whether a confidence passes this stage's threshold.
    ///
    /// NaN never passes.
    #[must_use]
    pub fn accepts(&self, confidence: f64) -> bool {
        !confidence.is_nan() && confidence >= self.confidence_threshold
    }

    /// Checks the stage settings.
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` for an empty id or method, a threshold
    /// outside `[0, 1]`, or a negative cost.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::empty("stage.id"));
        }
        if self.method.trim().is_empty() {
            return Err(ValidationError::empty(format!("stages.{}.method", self.id)));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(ValidationError::new(
                format!("stages.{}.confidence_threshold", self.id),
                "must be between 0 and 1",
            ));
        }
        if !self.cost_per_call.is_finite() || self.cost_per_call < 0.0 {
            return Err(ValidationError::new(
                format!("stages.{}.cost_per_call", self.id),
                "must not be negative",
            ));
        }
        Ok(())
    }
}
