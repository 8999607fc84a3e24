//! Polling a job until it finishes.

use super::{ClientError, ClientResult, JobApi};
use crate::config::EngineConfig;
use crate::context::JsonMap;
use crate::errors::{BiomapperError, ErrorKind};
use crate::jobs::{JobStatus, JobStatusReport, StrategySource};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Result of one status check.
///
/// "Still running" is an ordinary outcome, not an error.
#[derive(Debug, Clone)]
pub enum PollOutcome {
    /// The job reached a terminal state.
    Finished(JobStatusReport),
    /// The job is pending or running.
    Pending(JobStatusReport),
    /// The status call failed.
    Errored(BiomapperError),
}

/// Checks a job's status once.
pub async fn poll_once<A>(api: &A, job_id: &str) -> PollOutcome
where
    A: JobApi + ?Sized,
{
    match api.status(job_id).await {
        Ok(report) if report.is_terminal() => PollOutcome::Finished(report),
        Ok(report) => PollOutcome::Pending(report),
        Err(err) => PollOutcome::Errored(err),
    }
}

/// How [`wait_for_job`] polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    /// Delay between status checks.
    pub poll_interval: Duration,
    /// Give up after this long.
    pub timeout: Duration,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(300),
        }
    }
}

impl WaitOptions {
    /// Options with the given interval and timeout.
    #[must_use]
    pub fn new(poll_interval: Duration, timeout: Duration) -> Self {
        Self { poll_interval, timeout }
    }

    /// Polls at the configured default interval and waits as long as the
    /// job timeout.
    #[must_use]
    pub fn from_engine_config(config: &EngineConfig) -> Self {
        Self::new(config.poll_interval(), config.execution.timeout())
    }

    /// Sets the poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Polls until the job finishes and returns its result payload.
///
/// # Errors
///
/// - `JobFailed` with the stored message and kind if the job failed
/// - `JobCancelled` if the job was cancelled
/// - `Timeout` if the job did not finish within `options.timeout`
/// - `Api` if a status or result call failed
pub async fn wait_for_job<A>(api: &A, job_id: &str, options: &WaitOptions) -> ClientResult<serde_json::Value>
where
    A: JobApi + ?Sized,
{
    let started = Instant::now();
    loop {
        match poll_once(api, job_id).await {
            PollOutcome::Finished(report) => return finish(api, report).await,
            PollOutcome::Errored(err) => return Err(err.into()),
            PollOutcome::Pending(report) => {
                let waited = started.elapsed();
                if waited >= options.timeout {
                    return Err(ClientError::Timeout {
                        job_id: job_id.to_string(),
                        waited,
                    });
                }
                debug!(job_id = %job_id, status = %report.status, progress = report.progress, "Waiting for job");
                let pause = options
                    .poll_interval
                    .max(MIN_POLL_INTERVAL)
                    .min(options.timeout - waited);
                tokio::time::sleep(pause).await;
            }
        }
    }
}

async fn finish<A>(api: &A, report: JobStatusReport) -> ClientResult<serde_json::Value>
where
    A: JobApi + ?Sized,
{
    match report.status {
        JobStatus::Completed => Ok(api.result(&report.job_id).await?),
        JobStatus::Failed => Err(ClientError::JobFailed {
            kind: report.error_kind.unwrap_or(ErrorKind::Internal),
            message: report.message.unwrap_or_default(),
            job_id: report.job_id,
        }),
        JobStatus::Cancelled => Err(ClientError::JobCancelled {
            message: report.message.unwrap_or_default(),
            job_id: report.job_id,
        }),
        JobStatus::Pending | JobStatus::Running => Err(BiomapperError::Internal(format!(
            "job {} reported as finished while {}",
            report.job_id, report.status
        ))
        .into()),
    }
}

/// Submits a strategy and waits for its result.
///
/// # Errors
///
/// See [`wait_for_job`]; submission errors are returned as `Api`.
pub async fn submit_and_wait<A>(
    api: &A,
    strategy: StrategySource,
    parameters: JsonMap,
    options: &WaitOptions,
) -> ClientResult<serde_json::Value>
where
    A: JobApi + ?Sized,
{
    let handle = api.submit(strategy, parameters).await?;
    wait_for_job(api, &handle.job_id, options).await
}
