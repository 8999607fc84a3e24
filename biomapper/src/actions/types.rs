//! Data exchanged between the pipeline and its actions.

use crate::context::JsonMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An entity awaiting resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Source identifier. Unique within one run.
    pub id: String,
    /// Semi-structured row data (names, synonyms, source columns).
    #[serde(default, skip_serializing_if = "JsonMap::is_empty")]
    pub attributes: JsonMap,
}

impl Entity {
    /// Creates an entity without attributes.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attributes: JsonMap::new(),
        }
    }

    /// Adds an attribute.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Returns a string attribute.
    #[must_use]
    pub fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(serde_json::Value::as_str)
    }

    /// Flattens the entity into a dataset row.
    #[must_use]
    pub fn to_record(&self) -> JsonMap {
        let mut row = self.attributes.clone();
        row.insert("id".to_string(), serde_json::Value::String(self.id.clone()));
        row
    }
}

/// A proposed match returned by an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMatch {
    /// The id of the matched input entity.
    pub entity_id: String,
    /// The resolved target identifier.
    pub target: String,
    /// Match confidence, usually in `[0, 1]`.
    pub confidence: f64,
    /// Extra data about the match.
    #[serde(default, skip_serializing_if = "JsonMap::is_empty")]
    pub metadata: JsonMap,
}

impl EntityMatch {
    /// Creates a match.
    #[must_use]
    pub fn new(entity_id: impl Into<String>, target: impl Into<String>, confidence: f64) -> Self {
        Self {
            entity_id: entity_id.into(),
            target: target.into(),
            confidence,
            metadata: JsonMap::new(),
        }
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// What an action hands back to the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionOutput {
    /// Proposed matches. The pipeline applies the confidence threshold.
    #[serde(default)]
    pub matched: Vec<EntityMatch>,
    /// Entities the action could not resolve.
    #[serde(default)]
    pub unresolved: Vec<Entity>,
    /// Values merged into the context's custom data after the stage.
    #[serde(default)]
    pub side_effects: JsonMap,
}

impl ActionOutput {
    /// Creates an empty output.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a match.
    #[must_use]
    pub fn with_match(mut self, m: EntityMatch) -> Self {
        self.matched.push(m);
        self
    }

    /// Adds an unresolved entity.
    #[must_use]
    pub fn with_unresolved(mut self, entity: Entity) -> Self {
        self.unresolved.push(entity);
        self
    }

    /// Adds a side effect.
    #[must_use]
    pub fn with_side_effect(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.side_effects.insert(key.into(), value);
        self
    }

    /// Appends another batch's output to this one.
    pub fn merge(&mut self, other: Self) {
        self.matched.extend(other.matched);
        self.unresolved.extend(other.unresolved);
        self.side_effects.extend(other.side_effects);
    }
}

/// Parameters for one action invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionParams(JsonMap);

impl ActionParams {
    /// Creates empty parameters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an existing map.
    #[must_use]
    pub fn from_map(map: JsonMap) -> Self {
        Self(map)
    }

    /// Adds a parameter.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.0.insert(key.into(), value);
        self
    }

    /// Returns a raw parameter.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    /// Returns a string parameter.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(serde_json::Value::as_str)
    }

    /// Returns a numeric parameter.
    #[must_use]
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(serde_json::Value::as_f64)
    }

    /// Returns an unsigned integer parameter.
    #[must_use]
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(serde_json::Value::as_u64)
    }

    /// Returns a boolean parameter.
    #[must_use]
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(serde_json::Value::as_bool)
    }

    /// Returns the underlying map.
    #[must_use]
    pub fn as_map(&self) -> &JsonMap {
        &self.0
    }
}

impl From<JsonMap> for ActionParams {
    fn from(map: JsonMap) -> Self {
        Self(map)
    }
}

/// Errors an action can report.
#[derive(Debug, Clone, Error)]
pub enum ActionError {
    /// Generic failure.
    #[error("{0}")]
    Failed(String),

    /// The action's own call deadline passed.
    #[error("action timed out after {seconds}s")]
    Timeout {
        /// The deadline in seconds.
        seconds: f64,
    },

    /// Parameters were missing or malformed.
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// An upstream service returned an error.
    #[error("{service}: {message}")]
    Upstream {
        /// The service name.
        service: String,
        /// The upstream message.
        message: String,
    },

    /// The action panicked.
    #[error("action panicked: {0}")]
    Panicked(String),
}

impl ActionError {
    /// Returns whether another attempt may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Timeout { .. } | Self::Upstream { .. })
    }
}
