//! Client protocol for long-running jobs.
//!
//! This module provides:
//! - [`JobApi`]: the submit/status/result/cancel surface
//! - [`poll_once`] and [`wait_for_job`]: tri-state polling with a
//!   client-side timeout
//! - [`stream_progress`]: a finite stream of progress events

mod api;
mod error;
mod stream;
mod wait;

#[cfg(test)]
pub use api::MockJobApi;
pub use api::JobApi;
pub use error::{ClientError, ClientResult};
pub use stream::stream_progress;
pub use wait::{poll_once, submit_and_wait, wait_for_job, PollOutcome, WaitOptions};
