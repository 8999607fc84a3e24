//! Step results, provenance records and execution summaries.

use crate::errors::ValidationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// JSON object used for free-form payloads.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// Outcome of one named step.
///
/// A successful result never carries an error; this is checked when the
/// value is built or deserialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StepResultRepr")]
pub struct StepResult {
    action: String,
    timestamp: DateTime<Utc>,
    success: bool,
    data: JsonMap,
    error: Option<String>,
}

#[derive(Deserialize)]
struct StepResultRepr {
    action: String,
    timestamp: DateTime<Utc>,
    success: bool,
    #[serde(default)]
    data: JsonMap,
    #[serde(default)]
    error: Option<String>,
}

impl TryFrom<StepResultRepr> for StepResult {
    type Error = ValidationError;

    fn try_from(repr: StepResultRepr) -> Result<Self, Self::Error> {
        let mut result = Self::new(repr.action, repr.success, repr.data, repr.error)?;
        result.timestamp = repr.timestamp;
        Ok(result)
    }
}

impl StepResult {
    /// Builds a step result stamped with the current time.
    ///
    /// An empty error string counts as no error.
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` if `action` is empty or if `success` is
    /// true while `error` is non-empty.
    pub fn new(
        action: impl Into<String>,
        success: bool,
        data: JsonMap,
        error: Option<String>,
    ) -> Result<Self, ValidationError> {
        let action = action.into();
        if action.trim().is_empty() {
            return Err(ValidationError::empty("action"));
        }
        let error = error.filter(|e| !e.is_empty());
        if success && error.is_some() {
            return Err(ValidationError::new(
                "error",
                "a successful step result cannot carry an error",
            ));
        }
        Ok(Self {
            action,
            timestamp: Utc::now(),
            success,
            data,
            error,
        })
    }

    /// Builds a successful result.
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` if `action` is empty.
    pub fn succeeded(action: impl Into<String>, data: JsonMap) -> Result<Self, ValidationError> {
        Self::new(action, true, data, None)
    }

    /// Builds a failed result.
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` if `action` is empty.
    pub fn failed(action: impl Into<String>, error: impl Into<String>) -> Result<Self, ValidationError> {
        Self::new(action, false, JsonMap::new(), Some(error.into()))
    }

    /// The action that produced this result.
    #[must_use]
    pub fn action(&self) -> &str {
        &self.action
    }

    /// When the result was recorded.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Whether the step succeeded.
    #[must_use]
    pub fn success(&self) -> bool {
        self.success
    }

    /// The step payload.
    #[must_use]
    pub fn data(&self) -> &JsonMap {
        &self.data
    }

    /// The error message of a failed step.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

/// One entry of the append-only audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    /// Where the information came from (stage id, service name, file).
    pub source: String,
    /// When the record was created.
    pub timestamp: DateTime<Utc>,
    /// What was done.
    pub action: String,
    /// Free-form details.
    #[serde(default)]
    pub details: JsonMap,
}

impl ProvenanceRecord {
    /// Creates a record stamped with the current time.
    #[must_use]
    pub fn new(source: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            timestamp: Utc::now(),
            action: action.into(),
            details: JsonMap::new(),
        }
    }

    /// Adds a detail entry.
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ValidationError> {
        if self.source.trim().is_empty() {
            return Err(ValidationError::empty("provenance.source"));
        }
        if self.action.trim().is_empty() {
            return Err(ValidationError::empty("provenance.action"));
        }
        Ok(())
    }
}

/// Aggregate counts over the recorded step results.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    /// Number of recorded steps.
    pub total_steps: usize,
    /// Steps that succeeded.
    pub successful_steps: usize,
    /// Steps that failed.
    pub failed_steps: usize,
    /// `successful_steps / total_steps`, or 0 when nothing was recorded.
    pub success_rate: f64,
}
