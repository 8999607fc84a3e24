//! Error types for the biomapper engine.
//!
//! Every failure that crosses the job API boundary carries a human-readable
//! message and a machine-checkable [`ErrorKind`].

use crate::pipeline::MatchedEntity;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Convenience result alias used throughout the crate.
pub type Result<T, E = BiomapperError> = std::result::Result<T, E>;

/// Machine-checkable classification of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A required resource failed its health check or could not be started.
    ResourcePrerequisite,
    /// A stage action raised an error.
    StageExecution,
    /// A stage exhausted its cost budget.
    BudgetExceeded,
    /// A wall-clock limit was exceeded.
    Timeout,
    /// Malformed input or an inconsistent context mutation.
    Validation,
    /// Execution was cancelled cooperatively.
    Cancelled,
    /// A job, strategy, action or resource was not found.
    NotFound,
    /// A job result was requested before the job completed.
    JobNotReady,
    /// Invalid engine configuration.
    Configuration,
    /// Unexpected internal failure.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ResourcePrerequisite => "resource_prerequisite",
            Self::StageExecution => "stage_execution",
            Self::BudgetExceeded => "budget_exceeded",
            Self::Timeout => "timeout",
            Self::Validation => "validation",
            Self::Cancelled => "cancelled",
            Self::NotFound => "not_found",
            Self::JobNotReady => "job_not_ready",
            Self::Configuration => "configuration",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// The main error type for engine operations.
#[derive(Debug, Clone, Error)]
pub enum BiomapperError {
    /// Required resources were not available before execution.
    #[error("{0}")]
    ResourcePrerequisite(#[from] ResourcePrerequisiteError),

    /// A stage action failed.
    #[error("{0}")]
    StageExecution(#[from] StageExecutionError),

    /// A stage hit its cost budget.
    #[error("Budget exhausted for stage '{stage_id}': {calls_made} of {budget} calls used")]
    BudgetExceeded {
        /// The stage that ran out of budget.
        stage_id: String,
        /// The configured budget.
        budget: u64,
        /// Calls made before the budget ran out.
        calls_made: u64,
    },

    /// A wall-clock timeout was exceeded.
    #[error("Timed out after {seconds}s")]
    Timeout {
        /// The limit that was exceeded, in seconds.
        seconds: f64,
    },

    /// Validation failed.
    #[error("{0}")]
    Validation(#[from] ValidationError),

    /// Execution was cancelled.
    #[error("Execution cancelled: {0}")]
    Cancelled(String),

    /// Something was not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A job result was requested before completion.
    #[error("Job {job_id} has no result (status: {status})")]
    JobNotReady {
        /// The job identifier.
        job_id: String,
        /// The job status at the time of the request.
        status: String,
    },

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BiomapperError {
    /// Returns the machine-checkable kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ResourcePrerequisite(_) => ErrorKind::ResourcePrerequisite,
            Self::StageExecution(_) => ErrorKind::StageExecution,
            Self::BudgetExceeded { .. } => ErrorKind::BudgetExceeded,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::JobNotReady { .. } => ErrorKind::JobNotReady,
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns true if the error should stop a run.
    ///
    /// Budget exhaustion is the only non-fatal kind.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::BudgetExceeded { .. })
    }

    /// Converts to a dictionary representation suitable for API payloads.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("kind".to_string(), serde_json::json!(self.kind()));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));

        match self {
            Self::ResourcePrerequisite(err) => {
                map.insert("resources".to_string(), serde_json::json!(err.resources));
            }
            Self::StageExecution(err) => {
                map.insert("stage_id".to_string(), serde_json::json!(err.stage_id));
                map.insert("attempts".to_string(), serde_json::json!(err.attempts));
                map.insert(
                    "retained_matches".to_string(),
                    serde_json::json!(err.retained.len()),
                );
            }
            Self::Validation(err) => {
                map.insert("field".to_string(), serde_json::json!(err.field));
            }
            _ => {}
        }

        map
    }
}

/// Error raised when required resources are unavailable before execution.
#[derive(Debug, Clone, Error)]
#[error("Required resources unavailable: {}", resources.join(", "))]
pub struct ResourcePrerequisiteError {
    /// Names of the resources that failed.
    pub resources: Vec<String>,
}

impl ResourcePrerequisiteError {
    /// Creates a new prerequisite error.
    #[must_use]
    pub fn new(resources: Vec<String>) -> Self {
        Self { resources }
    }
}

/// Error raised when a stage action fails.
///
/// Matches accepted by earlier stages are retained on the error so a caller
/// can still inspect the partial result.
#[derive(Debug, Clone, Error)]
#[error("Stage '{stage_id}' failed after {attempts} attempt(s): {message}")]
pub struct StageExecutionError {
    /// The failing stage.
    pub stage_id: String,
    /// The underlying error message.
    pub message: String,
    /// How many times the action was invoked.
    pub attempts: u32,
    /// Matches accepted before the failure.
    pub retained: Vec<MatchedEntity>,
}

impl StageExecutionError {
    /// Creates a new stage execution error.
    #[must_use]
    pub fn new(stage_id: impl Into<String>, message: impl Into<String>, attempts: u32) -> Self {
        Self {
            stage_id: stage_id.into(),
            message: message.into(),
            attempts,
            retained: Vec::new(),
        }
    }

    /// Attaches the matches accepted before the failure.
    #[must_use]
    pub fn with_retained(mut self, retained: Vec<MatchedEntity>) -> Self {
        self.retained = retained;
        self
    }
}

/// Error raised when a mutation or input is malformed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Validation failed for '{field}': {message}")]
pub struct ValidationError {
    /// The offending field.
    pub field: String,
    /// What was wrong with it.
    pub message: String,
}

impl ValidationError {
    /// Creates a new validation error.
    #[must_use]
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates an error for a required field that was empty.
    #[must_use]
    pub fn empty(field: impl Into<String>) -> Self {
        Self::new(field, "must not be empty")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let err: BiomapperError = ResourcePrerequisiteError::new(vec!["vector_store".into()]).into();
        assert_eq!(err.kind(), ErrorKind::ResourcePrerequisite);
        assert!(err.to_string().contains("vector_store"));

        let err = BiomapperError::Timeout { seconds: 1.0 };
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.is_fatal());
    }

    #[test]
    fn test_budget_exceeded_is_not_fatal() {
        let err = BiomapperError::BudgetExceeded {
            stage_id: "api".into(),
            budget: 10,
            calls_made: 10,
        };
        assert!(!err.is_fatal());
        assert_eq!(err.kind(), ErrorKind::BudgetExceeded);
    }

    #[test]
    fn test_stage_execution_error_to_dict() {
        let err: BiomapperError = StageExecutionError::new("fuzzy", "connection reset", 3).into();
        let dict = err.to_dict();

        assert_eq!(dict.get("kind").unwrap(), "stage_execution");
        assert_eq!(dict.get("stage_id").unwrap(), "fuzzy");
        assert_eq!(dict.get("attempts").unwrap(), 3);
    }

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::empty("step_name");
        assert_eq!(err.to_string(), "Validation failed for 'step_name': must not be empty");
    }

    #[test]
    fn test_error_kind_serialization() {
        let json = serde_json::to_string(&ErrorKind::JobNotReady).unwrap();
        assert_eq!(json, r#""job_not_ready""#);
        assert_eq!(ErrorKind::JobNotReady.to_string(), "job_not_ready");
    }
}
