//! Job lifecycle.
//!
//! This module provides:
//! - [`JobManager`]: submits strategy runs onto their own tasks and tracks
//!   them to a terminal state
//! - [`Job`], [`JobStatus`] and the [`JobStatusReport`] polling view
//! - [`ProgressEvent`] channels closed after the terminal event

mod job;
mod manager;
mod progress;
mod status;

pub use job::{Job, JobHandle, JobResult, JobStatusReport, StrategySource};
pub use manager::JobManager;
pub use progress::{ProgressEvent, ProgressHub};
pub use status::JobStatus;
