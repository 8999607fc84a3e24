//! Client errors.

use crate::errors::{BiomapperError, ErrorKind};
use std::time::Duration;
use thiserror::Error;

/// Result alias for client operations.
pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Why a client operation did not produce a result.
///
/// A failed job and a client that gave up waiting are different variants,
/// so callers can tell them apart.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// The server reports the job as failed.
    #[error("Job {job_id} failed ({kind}): {message}")]
    JobFailed {
        /// Job id.
        job_id: String,
        /// Error kind stored on the job.
        kind: ErrorKind,
        /// Error message stored on the job.
        message: String,
    },

    /// The job was cancelled.
    #[error("Job {job_id} was cancelled: {message}")]
    JobCancelled {
        /// Job id.
        job_id: String,
        /// Cancellation reason.
        message: String,
    },

    /// The job did not finish within the client's timeout.
    #[error("Gave up waiting for job {job_id} after {waited:?}")]
    Timeout {
        /// Job id.
        job_id: String,
        /// How long the client waited.
        waited: Duration,
    },

    /// The API call itself failed.
    #[error("Job API error: {0}")]
    Api(#[from] BiomapperError),
}

impl ClientError {
    /// Returns true if the client gave up waiting.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns true if the server reported the job as failed.
    #[must_use]
    pub fn is_job_failure(&self) -> bool {
        matches!(self, Self::JobFailed { .. })
    }
}
