//! Waterfall pipeline.
//!
//! This module provides:
//! - [`WaterfallStage`]: an action plus its threshold and budget
//! - [`WaterfallPipeline`]: ordered stage execution with deduplication,
//!   batching and retries
//! - [`WaterfallOutcome`] and per-stage [`StageMetrics`]

mod outcome;
mod retry;
mod stage;
mod waterfall;

pub use outcome::{MatchedEntity, StageMetrics, WaterfallOutcome};
pub use retry::{BackoffStrategy, JitterStrategy, RetryPolicy};
pub use stage::WaterfallStage;
pub use waterfall::{ProgressCallback, RunHooks, WaterfallPipeline};
