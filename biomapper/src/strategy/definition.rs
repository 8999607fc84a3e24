//! Strategy definitions.
//!
//! A strategy is plain data produced by an external parser: an ordered
//! list of steps plus `parameters` and `metadata` blocks.

use crate::context::{JsonMap, OntologyType};
use crate::errors::ValidationError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One step of a strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDescriptor {
    /// Step name. Becomes the stage id.
    pub name: String,
    /// Registered action type.
    pub action_type: String,
    /// Step parameters. May reference `${parameters.<key>}`.
    #[serde(default)]
    pub params: JsonMap,
}

impl StepDescriptor {
    /// Creates a step without parameters.
    #[must_use]
    pub fn new(name: impl Into<String>, action_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            action_type: action_type.into(),
            params: JsonMap::new(),
        }
    }

    /// Adds a parameter.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }
}

/// A declarative strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyDefinition {
    /// Unique strategy name.
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Steps in execution order.
    #[serde(default)]
    pub steps: Vec<StepDescriptor>,
    /// Default parameters, overridable at submission.
    #[serde(default)]
    pub parameters: JsonMap,
    /// Free-form metadata. `ontology_type` is read from here.
    #[serde(default)]
    pub metadata: JsonMap,
}

impl StrategyDefinition {
    /// Creates a strategy without steps.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            steps: Vec::new(),
            parameters: JsonMap::new(),
            metadata: JsonMap::new(),
        }
    }

    /// Appends a step.
    #[must_use]
    pub fn with_step(mut self, step: StepDescriptor) -> Self {
        self.steps.push(step);
        self
    }

    /// Sets a default parameter.
    #[must_use]
    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    /// Sets a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Parses a strategy from a JSON value.
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` if the value has the wrong shape or the
    /// strategy is invalid.
    pub fn from_json(value: serde_json::Value) -> Result<Self, ValidationError> {
        let definition: Self =
            serde_json::from_value(value).map_err(|e| ValidationError::new("strategy", e.to_string()))?;
        definition.validate()?;
        Ok(definition)
    }

    /// Action types of every step, in order.
    pub fn action_types(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|s| s.action_type.as_str())
    }

    /// The ontology declared in `metadata.ontology_type`.
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` if the value is not a known ontology.
    pub fn ontology_type(&self) -> Result<Option<OntologyType>, ValidationError> {
        self.metadata
            .get("ontology_type")
            .and_then(serde_json::Value::as_str)
            .map(str::parse)
            .transpose()
    }

    /// Checks names and step uniqueness.
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` naming the first problem.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::empty("strategy.name"));
        }
        let mut names = HashSet::new();
        for (index, step) in self.steps.iter().enumerate() {
            if step.name.trim().is_empty() {
                return Err(ValidationError::empty(format!("steps[{index}].name")));
            }
            if step.action_type.trim().is_empty() {
                return Err(ValidationError::empty(format!("steps[{index}].action_type")));
            }
            if !names.insert(step.name.as_str()) {
                return Err(ValidationError::new(
                    format!("steps[{index}].name"),
                    format!("duplicate step name '{}'", step.name),
                ));
            }
        }
        self.ontology_type()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json() {
        let strategy = StrategyDefinition::from_json(json!({
            "name": "protein_harmonization",
            "steps": [
                {"name": "exact", "action_type": "exact_match", "params": {"confidence_threshold": 0.95}},
                {"name": "vector", "action_type": "vector_search"}
            ],
            "parameters": {"threshold": 0.8},
            "metadata": {"ontology_type": "protein"}
        }))
        .unwrap();

        assert_eq!(strategy.steps.len(), 2);
        assert_eq!(
            strategy.action_types().collect::<Vec<_>>(),
            vec!["exact_match", "vector_search"]
        );
        assert_eq!(strategy.ontology_type().unwrap(), Some(OntologyType::Protein));
    }

    #[test]
    fn test_duplicate_step_names_rejected() {
        let strategy = StrategyDefinition::new("s")
            .with_step(StepDescriptor::new("a", "exact_match"))
            .with_step(StepDescriptor::new("a", "fuzzy_match"));
        assert_eq!(strategy.validate().unwrap_err().field, "steps[1].name");
    }

    #[test]
    fn test_unknown_ontology_rejected() {
        let strategy = StrategyDefinition::new("s").with_metadata("ontology_type", json!("organism"));
        assert!(strategy.validate().is_err());
    }

    #[test]
    fn test_zero_steps_is_valid() {
        assert!(StrategyDefinition::new("empty").validate().is_ok());
    }
}
