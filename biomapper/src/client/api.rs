//! The job submission API consumed by clients.

use crate::context::JsonMap;
use crate::errors::Result;
use crate::jobs::{JobHandle, JobManager, JobStatusReport, StrategySource};
use async_trait::async_trait;

/// Submit, poll and fetch operations on jobs.
///
/// [`JobManager`] implements this in-process; remote transports implement
/// it over their own protocol.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobApi: Send + Sync {
    /// Submits a strategy run.
    async fn submit(&self, strategy: StrategySource, parameters: JsonMap) -> Result<JobHandle>;

    /// Current status of a job.
    async fn status(&self, job_id: &str) -> Result<JobStatusReport>;

    /// Result payload of a completed job.
    async fn result(&self, job_id: &str) -> Result<serde_json::Value>;

    /// Requests cancellation. Returns false if the job already finished.
    async fn cancel(&self, job_id: &str) -> Result<bool>;
}

#[async_trait]
impl JobApi for JobManager {
    async fn submit(&self, strategy: StrategySource, parameters: JsonMap) -> Result<JobHandle> {
        JobManager::submit(self, strategy, parameters)
    }

    async fn status(&self, job_id: &str) -> Result<JobStatusReport> {
        JobManager::status(self, job_id)
    }

    async fn result(&self, job_id: &str) -> Result<serde_json::Value> {
        JobManager::result(self, job_id).map(|result| result.to_json())
    }

    async fn cancel(&self, job_id: &str) -> Result<bool> {
        JobManager::cancel(self, job_id, "cancelled by client")
    }
}
