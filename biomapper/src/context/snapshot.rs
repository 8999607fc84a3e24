//! Read-only view of a finished run.

use super::records::{ExecutionSummary, JsonMap, ProvenanceRecord, StepResult};
use super::OntologyType;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Frozen state of an execution context.
///
/// Jobs keep one of these after reaching a terminal status. There are no
/// mutators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSnapshot {
    /// Unique id of the run.
    pub run_id: Uuid,
    /// The identifier the run started from.
    pub initial_identifier: String,
    /// The identifier at the end of the run.
    pub current_identifier: String,
    /// Every distinct identifier value, in order.
    pub identifier_history: Vec<String>,
    /// The resolved ontology.
    pub ontology_type: OntologyType,
    /// Named datasets in insertion order.
    pub datasets: IndexMap<String, Vec<JsonMap>>,
    /// Step results in insertion order.
    pub step_results: IndexMap<String, StepResult>,
    /// The audit trail.
    pub provenance: Vec<ProvenanceRecord>,
    /// Custom data written by actions.
    pub custom_data: HashMap<String, serde_json::Value>,
    /// Step counts at the time of the snapshot.
    pub summary: ExecutionSummary,
}

impl ContextSnapshot {
    /// Returns a dataset by name.
    #[must_use]
    pub fn dataset(&self, name: &str) -> Option<&[JsonMap]> {
        self.datasets.get(name).map(Vec::as_slice)
    }

    /// Serializes the snapshot.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::ExecutionConfig;
    use crate::context::{ExecutionContext, OntologyType, ProvenanceRecord};

    #[test]
    fn test_snapshot_copies_state() {
        let mut ctx =
            ExecutionContext::new("HMDB0000122", OntologyType::Metabolite, ExecutionConfig::default())
                .unwrap();
        ctx.set_current_identifier("CHEBI:4167");
        ctx.add_provenance(ProvenanceRecord::new("hmdb", "resolve")).unwrap();

        let snapshot = ctx.into_snapshot();
        assert_eq!(snapshot.identifier_history.len(), 2);
        assert_eq!(snapshot.provenance.len(), 1);
        assert_eq!(snapshot.summary.total_steps, 0);

        let json = snapshot.to_json();
        assert_eq!(json["ontology_type"], "metabolite");
        assert_eq!(json["current_identifier"], "CHEBI:4167");
    }
}
