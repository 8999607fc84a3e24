//! Job records and the views handed to callers.

use super::JobStatus;
use crate::context::{ContextSnapshot, JsonMap};
use crate::errors::{BiomapperError, ErrorKind};
use crate::pipeline::WaterfallOutcome;
use crate::strategy::StrategyDefinition;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What to run: a registered strategy or an inline definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategySource {
    /// A strategy registered under this name.
    Named(String),
    /// A strategy passed with the submission.
    Inline(StrategyDefinition),
}

impl StrategySource {
    /// Shorthand for [`StrategySource::Named`].
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self::Named(name.into())
    }
}

impl From<StrategyDefinition> for StrategySource {
    fn from(definition: StrategyDefinition) -> Self {
        Self::Inline(definition)
    }
}

/// A submitted job.
///
/// Status changes go through the transition methods, which refuse to move
/// backwards or out of a terminal state.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    id: Uuid,
    strategy_name: String,
    status: JobStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    progress_percentage: f64,
    current_step: Option<String>,
    error_message: Option<String>,
    error_kind: Option<ErrorKind>,
    result_handle: Option<String>,
}

impl Job {
    pub(crate) fn new(strategy_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            strategy_name: strategy_name.into(),
            status: JobStatus::Pending,
            created_at: now,
            updated_at: now,
            progress_percentage: 0.0,
            current_step: None,
            error_message: None,
            error_kind: None,
            result_handle: None,
        }
    }

    /// Job id.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Name of the strategy being run.
    #[must_use]
    pub fn strategy_name(&self) -> &str {
        &self.strategy_name
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> JobStatus {
        self.status
    }

    /// Submission time.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Time of the last change.
    #[must_use]
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Progress from 0 to 100.
    #[must_use]
    pub fn progress_percentage(&self) -> f64 {
        self.progress_percentage
    }

    /// The last stage reported.
    #[must_use]
    pub fn current_step(&self) -> Option<&str> {
        self.current_step.as_deref()
    }

    /// Failure message, once failed or cancelled.
    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// Failure kind, once failed or cancelled.
    #[must_use]
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error_kind
    }

    /// Run id of the stored result, once completed.
    #[must_use]
    pub fn result_handle(&self) -> Option<&str> {
        self.result_handle.as_deref()
    }

    pub(crate) fn transition(&mut self, next: JobStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.updated_at = Utc::now();
        true
    }

    /// Records stage progress. Ignored unless running; never decreases.
    pub(crate) fn record_progress(&mut self, percentage: f64, step: &str) -> bool {
        if self.status != JobStatus::Running {
            return false;
        }
        self.progress_percentage = percentage.clamp(self.progress_percentage, 100.0);
        self.current_step = Some(step.to_string());
        self.updated_at = Utc::now();
        true
    }

    pub(crate) fn complete(&mut self, result_handle: String) -> bool {
        if !self.transition(JobStatus::Completed) {
            return false;
        }
        self.progress_percentage = 100.0;
        self.result_handle = Some(result_handle);
        true
    }

    pub(crate) fn fail(&mut self, error: &BiomapperError) -> bool {
        let next = if error.kind() == ErrorKind::Cancelled {
            JobStatus::Cancelled
        } else {
            JobStatus::Failed
        };
        if !self.transition(next) {
            return false;
        }
        self.error_message = Some(error.to_string());
        self.error_kind = Some(error.kind());
        true
    }

    /// Status view for polling clients.
    #[must_use]
    pub fn report(&self) -> JobStatusReport {
        JobStatusReport {
            job_id: self.id.to_string(),
            status: self.status,
            progress: self.progress_percentage,
            message: self.error_message.clone(),
            current_step: self.current_step.clone(),
            error_kind: self.error_kind,
            updated_at: self.updated_at,
        }
    }
}

/// Returned by a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    /// Id to poll with.
    pub job_id: String,
    /// Status at submission.
    pub status: JobStatus,
}

/// Point-in-time status of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusReport {
    /// Job id.
    pub job_id: String,
    /// Current status.
    pub status: JobStatus,
    /// Progress from 0 to 100.
    pub progress: f64,
    /// Error message for failed and cancelled jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// The last stage reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    /// Error kind for failed and cancelled jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// Time of the last change.
    pub updated_at: DateTime<Utc>,
}

impl JobStatusReport {
    /// Returns true once the job can no longer change.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// The result of a completed job.
#[derive(Debug, Clone, Serialize)]
pub struct JobResult {
    /// Job id.
    pub job_id: String,
    /// Strategy that produced the result.
    pub strategy_name: String,
    /// Parameters the job ran with.
    pub parameters: JsonMap,
    /// Matches, unmapped entities and stage metrics.
    pub outcome: WaterfallOutcome,
    /// Final state of the execution context.
    pub context: ContextSnapshot,
}

impl JobResult {
    /// The opaque payload served to clients.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ResourcePrerequisiteError;

    #[test]
    fn test_progress_only_while_running() {
        let mut job = Job::new("s");
        assert!(!job.record_progress(50.0, "exact"));

        assert!(job.transition(JobStatus::Running));
        assert!(job.record_progress(50.0, "exact"));
        assert!(job.record_progress(10.0, "fuzzy"));
        assert!((job.progress_percentage() - 50.0).abs() < f64::EPSILON);
        assert_eq!(job.current_step(), Some("fuzzy"));
    }

    #[test]
    fn test_complete_sets_full_progress() {
        let mut job = Job::new("s");
        job.transition(JobStatus::Running);
        assert!(job.complete("run-1".into()));
        assert!((job.progress_percentage() - 100.0).abs() < f64::EPSILON);
        assert_eq!(job.result_handle(), Some("run-1"));

        assert!(!job.fail(&BiomapperError::Internal("late".into())));
        assert_eq!(job.status(), JobStatus::Completed);
    }

    #[test]
    fn test_fail_from_pending_keeps_kind() {
        let mut job = Job::new("s");
        let err: BiomapperError = ResourcePrerequisiteError::new(vec!["vector_store".into()]).into();
        assert!(job.fail(&err));

        let report = job.report();
        assert_eq!(report.status, JobStatus::Failed);
        assert_eq!(report.error_kind, Some(ErrorKind::ResourcePrerequisite));
        assert!(report.message.unwrap().contains("vector_store"));
    }

    #[test]
    fn test_cancelled_error_maps_to_cancelled_status() {
        let mut job = Job::new("s");
        job.transition(JobStatus::Running);
        assert!(job.fail(&BiomapperError::Cancelled("user".into())));
        assert_eq!(job.status(), JobStatus::Cancelled);
    }
}
