//! # Biomapper
//!
//! A waterfall orchestration engine for resolving biological entity
//! identifiers.
//!
//! Biomapper runs mapping strategies as long-lived jobs with support for:
//!
//! - **Waterfall matching**: ordered stages where each stage only sees the
//!   entities earlier stages left unresolved
//! - **Execution context**: identifier history, step results and a
//!   provenance trail per run
//! - **Resource management**: preflight checks, auto-start with backoff and
//!   background health monitoring
//! - **Job lifecycle**: submit, poll, stream progress, cancel and time out
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use biomapper::prelude::*;
//!
//! let actions = ActionRegistry::new().with_action(Arc::new(ExactMatch::new()));
//! let resources = Arc::new(ResourceManager::new(Arc::new(ProbeRegistry::new())));
//! let manager = JobManager::new(Arc::new(actions), resources);
//!
//! let strategy = StrategyDefinition::new("protein_lookup")
//!     .with_step(StepDescriptor::new("exact", "exact_match"));
//! let result = submit_and_wait(&manager, strategy.into(), params, &WaitOptions::default()).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod actions;
pub mod cache;
pub mod cancellation;
pub mod client;
pub mod config;
pub mod context;
pub mod errors;
pub mod events;
pub mod jobs;
pub mod observability;
pub mod pipeline;
pub mod resources;
pub mod strategy;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::actions::{
        Action, ActionError, ActionOutput, ActionParams, ActionRegistry, CallBudget, Entity, EntityMatch,
    };
    pub use crate::cache::ActionCache;
    pub use crate::cancellation::CancellationToken;
    pub use crate::client::{
        poll_once, stream_progress, submit_and_wait, wait_for_job, ClientError, JobApi, PollOutcome,
        WaitOptions,
    };
    pub use crate::config::{EngineConfig, ExecutionConfig};
    pub use crate::context::{ContextSnapshot, ExecutionContext, JsonMap, OntologyType};
    pub use crate::errors::{BiomapperError, ErrorKind, ValidationError};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::jobs::{JobHandle, JobManager, JobStatus, JobStatusReport, ProgressEvent, StrategySource};
    pub use crate::pipeline::{WaterfallOutcome, WaterfallPipeline, WaterfallStage};
    pub use crate::resources::{
        ProbeRegistry, ResourceConfig, ResourceManager, ResourceProbe, ResourceStatus, ResourceType,
    };
    pub use crate::strategy::{StepDescriptor, StrategyDefinition, StrategyRegistry};
}
