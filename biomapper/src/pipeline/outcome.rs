//! Results of a waterfall run.

use crate::actions::Entity;
use crate::context::JsonMap;
use serde::{Deserialize, Serialize};

/// An entity accepted by a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedEntity {
    /// The input entity.
    pub entity: Entity,
    /// The resolved target identifier.
    pub target: String,
    /// Confidence reported by the action.
    pub confidence: f64,
    /// The stage that accepted the match.
    pub stage_id: String,
    /// The stage's method label.
    pub method: String,
    /// Match metadata from the action.
    #[serde(default, skip_serializing_if = "JsonMap::is_empty")]
    pub metadata: JsonMap,
}

impl MatchedEntity {
    /// Flattens the match into a dataset row.
    #[must_use]
    pub fn to_record(&self) -> JsonMap {
        let mut row = self.entity.to_record();
        row.insert("target".to_string(), serde_json::json!(self.target));
        row.insert("confidence".to_string(), serde_json::json!(self.confidence));
        row.insert("stage_id".to_string(), serde_json::json!(self.stage_id));
        row.insert("method".to_string(), serde_json::json!(self.method));
        row
    }
}

/// Per-stage accounting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageMetrics {
    /// Stage id.
    pub stage_id: String,
    /// Method label.
    pub method: String,
    /// Entities handed to the stage.
    pub entities_offered: usize,
    /// Entities accepted by this stage.
    pub new_unique_matches: usize,
    /// Entities matched below the threshold.
    pub rejected_below_threshold: usize,
    /// Entities accepted by this and every earlier stage.
    pub cumulative_unique_matches: usize,
    /// `cumulative_unique_matches / total input`.
    pub cumulative_coverage: f64,
    /// `api_calls_made * cost_per_call`.
    pub cost_estimate: f64,
    /// Calls spent from the stage budget.
    pub api_calls_made: u64,
    /// Whether the action was refused budget.
    pub budget_exhausted: bool,
    /// Action attempts, retries included (highest across batches).
    pub attempts: u32,
    /// Wall-clock time spent in the stage.
    pub duration_ms: u64,
    /// True when the stage was not invoked because nothing was left.
    pub skipped: bool,
}

/// Final state of a waterfall run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WaterfallOutcome {
    /// Accepted matches, in stage order.
    pub matched: Vec<MatchedEntity>,
    /// Entities no stage resolved.
    pub unmapped: Vec<Entity>,
    /// One entry per stage, in declaration order.
    pub stages: Vec<StageMetrics>,
    /// Distinct input entities.
    pub total_input: usize,
    /// Ids dropped from the input because they were repeated.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub duplicate_ids: Vec<String>,
}

impl WaterfallOutcome {
    /// Fraction of the input that was matched.
    #[must_use]
    pub fn coverage(&self) -> f64 {
        coverage(self.matched.len(), self.total_input)
    }

    /// Matches accepted by one stage.
    pub fn matched_by_stage<'a>(&'a self, stage_id: &'a str) -> impl Iterator<Item = &'a MatchedEntity> {
        self.matched.iter().filter(move |m| m.stage_id == stage_id)
    }

    /// Looks up the match for an entity id.
    #[must_use]
    pub fn match_for(&self, entity_id: &str) -> Option<&MatchedEntity> {
        self.matched.iter().find(|m| m.entity.id == entity_id)
    }

    /// Total estimated cost across stages.
    #[must_use]
    pub fn total_cost(&self) -> f64 {
        self.stages.iter().map(|s| s.cost_estimate).sum()
    }

    /// Serializes the outcome.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[allow(clippy::cast_precision_loss)]
pub(crate) fn coverage(matched: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        matched as f64 / total as f64
    }
}
