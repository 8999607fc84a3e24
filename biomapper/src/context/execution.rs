//! The execution context threaded through one strategy run.

use super::records::{ExecutionSummary, JsonMap, ProvenanceRecord, StepResult};
use super::snapshot::ContextSnapshot;
use super::OntologyType;
use crate::cache::ActionCache;
use crate::config::ExecutionConfig;
use crate::errors::ValidationError;
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Mutable state of one strategy run.
///
/// A context is owned by exactly one job task. It never performs I/O and
/// needs no internal locking.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    run_id: Uuid,
    initial_identifier: String,
    current_identifier: String,
    identifier_history: Vec<String>,
    ontology_type: OntologyType,
    datasets: IndexMap<String, Vec<JsonMap>>,
    step_results: IndexMap<String, StepResult>,
    provenance: Vec<ProvenanceRecord>,
    custom_data: HashMap<String, serde_json::Value>,
    config: ExecutionConfig,
    cache: Option<Arc<ActionCache>>,
}

impl ExecutionContext {
    /// Creates a context whose current identifier is the initial one.
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` if the identifier is empty or the
    /// configuration is invalid.
    pub fn new(
        initial_identifier: impl Into<String>,
        ontology_type: OntologyType,
        config: ExecutionConfig,
    ) -> Result<Self, ValidationError> {
        let initial_identifier = initial_identifier.into();
        if initial_identifier.trim().is_empty() {
            return Err(ValidationError::empty("initial_identifier"));
        }
        config.validate()?;

        Ok(Self {
            run_id: Uuid::new_v4(),
            current_identifier: initial_identifier.clone(),
            identifier_history: vec![initial_identifier.clone()],
            initial_identifier,
            ontology_type,
            datasets: IndexMap::new(),
            step_results: IndexMap::new(),
            provenance: Vec::new(),
            custom_data: HashMap::new(),
            config,
            cache: None,
        })
    }

    /// Attaches the shared action cache.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<ActionCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Unique id of this run.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// The identifier the run started from.
    #[must_use]
    pub fn initial_identifier(&self) -> &str {
        &self.initial_identifier
    }

    /// The identifier as rewritten by the latest step.
    #[must_use]
    pub fn current_identifier(&self) -> &str {
        &self.current_identifier
    }

    /// Every distinct identifier value, in order.
    #[must_use]
    pub fn identifier_history(&self) -> &[String] {
        &self.identifier_history
    }

    /// The ontology this run resolves.
    #[must_use]
    pub fn ontology_type(&self) -> OntologyType {
        self.ontology_type
    }

    /// The run configuration.
    #[must_use]
    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// The shared action cache, if one was attached and is enabled.
    #[must_use]
    pub fn cache(&self) -> Option<&Arc<ActionCache>> {
        self.cache.as_ref().filter(|c| c.is_enabled())
    }

    /// Rewrites the current identifier.
    ///
    /// The history only grows when the value differs from its last entry.
    pub fn set_current_identifier(&mut self, identifier: impl Into<String>) {
        let identifier = identifier.into();
        if self.identifier_history.last() != Some(&identifier) {
            self.identifier_history.push(identifier.clone());
        }
        self.current_identifier = identifier;
    }

    /// Records the result of a named step, replacing any earlier result
    /// under the same name.
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` if `name` is empty.
    pub fn add_step_result(
        &mut self,
        name: impl Into<String>,
        result: StepResult,
    ) -> Result<(), ValidationError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ValidationError::empty("step_name"));
        }
        // Re-inserting moves the entry to the end so insertion order tracks recency.
        self.step_results.shift_remove(&name);
        self.step_results.insert(name, result);
        Ok(())
    }

    /// Returns a recorded step result.
    #[must_use]
    pub fn step_result(&self, name: &str) -> Option<&StepResult> {
        self.step_results.get(name)
    }

    /// Iterates recorded step results in insertion order.
    pub fn step_results(&self) -> impl Iterator<Item = (&str, &StepResult)> {
        self.step_results.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Appends a provenance record.
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` if `source` or `action` is empty.
    pub fn add_provenance(&mut self, record: ProvenanceRecord) -> Result<(), ValidationError> {
        record.validate()?;
        self.provenance.push(record);
        Ok(())
    }

    /// The audit trail, oldest first.
    #[must_use]
    pub fn provenance(&self) -> &[ProvenanceRecord] {
        &self.provenance
    }

    /// Stores a value in the custom data store.
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` if the key is empty or the value cannot be
    /// represented as JSON.
    pub fn set_action_data<T: Serialize>(
        &mut self,
        key: impl Into<String>,
        value: T,
    ) -> Result<(), ValidationError> {
        let key = key.into();
        if key.is_empty() {
            return Err(ValidationError::empty("key"));
        }
        let value = serde_json::to_value(value)
            .map_err(|e| ValidationError::new(key.clone(), e.to_string()))?;
        self.custom_data.insert(key, value);
        Ok(())
    }

    /// Reads a typed value from the custom data store.
    ///
    /// Returns `default` when the key is absent or holds a value of another
    /// shape.
    pub fn get_action_data<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.custom_data
            .get(key)
            .and_then(|v| T::deserialize(v).ok())
            .unwrap_or(default)
    }

    /// Returns whether the custom data store holds `key`.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.custom_data.contains_key(key)
    }

    /// Raw access to the custom data store.
    #[must_use]
    pub fn custom_data(&self) -> &HashMap<String, serde_json::Value> {
        &self.custom_data
    }

    pub(crate) fn merge_custom_data(&mut self, data: JsonMap) {
        self.custom_data.extend(data);
    }

    /// Stores a named dataset.
    ///
    /// Replacing an existing dataset keeps its original position.
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` if `name` is empty.
    pub fn set_dataset(
        &mut self,
        name: impl Into<String>,
        rows: Vec<JsonMap>,
    ) -> Result<(), ValidationError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ValidationError::empty("dataset"));
        }
        self.datasets.insert(name, rows);
        Ok(())
    }

    /// Returns a dataset by name.
    #[must_use]
    pub fn dataset(&self, name: &str) -> Option<&[JsonMap]> {
        self.datasets.get(name).map(Vec::as_slice)
    }

    /// Dataset names in insertion order.
    #[must_use]
    pub fn dataset_names(&self) -> Vec<&str> {
        self.datasets.keys().map(String::as_str).collect()
    }

    /// Returns whether a dataset exists.
    #[must_use]
    pub fn has_dataset(&self, name: &str) -> bool {
        self.datasets.contains_key(name)
    }

    /// True iff every recorded step succeeded. Vacuously true with no steps.
    #[must_use]
    pub fn is_successful(&self) -> bool {
        self.step_results.values().all(StepResult::success)
    }

    /// The most recent step result by timestamp.
    ///
    /// On equal timestamps the later-recorded result wins.
    #[must_use]
    pub fn last_step_result(&self) -> Option<(&str, &StepResult)> {
        self.step_results
            .iter()
            .max_by_key(|(_, r)| r.timestamp())
            .map(|(k, v)| (k.as_str(), v))
    }

    /// Counts of recorded steps.
    #[must_use]
    pub fn execution_summary(&self) -> ExecutionSummary {
        let total_steps = self.step_results.len();
        let successful_steps = self.step_results.values().filter(|r| r.success()).count();
        #[allow(clippy::cast_precision_loss)]
        let success_rate = if total_steps == 0 {
            0.0
        } else {
            successful_steps as f64 / total_steps as f64
        };
        ExecutionSummary {
            total_steps,
            successful_steps,
            failed_steps: total_steps - successful_steps,
            success_rate,
        }
    }

    /// Captures a read-only copy of the current state.
    #[must_use]
    pub fn snapshot(&self) -> ContextSnapshot {
        self.clone().into_snapshot()
    }

    /// Freezes the context into a read-only snapshot.
    #[must_use]
    pub fn into_snapshot(self) -> ContextSnapshot {
        let summary = self.execution_summary();
        ContextSnapshot {
            run_id: self.run_id,
            initial_identifier: self.initial_identifier,
            current_identifier: self.current_identifier,
            identifier_history: self.identifier_history,
            ontology_type: self.ontology_type,
            datasets: self.datasets,
            step_results: self.step_results,
            provenance: self.provenance,
            custom_data: self.custom_data,
            summary,
        }
    }
}
