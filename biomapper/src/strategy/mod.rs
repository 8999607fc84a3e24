//! Strategy definitions and compilation.
//!
//! This module provides:
//! - [`StrategyDefinition`] and [`StepDescriptor`]: strategies as data
//! - [`StrategyRegistry`]: named strategies available to the job manager
//! - [`compile`]: resolves step actions and parameters into a
//!   [`WaterfallPipeline`](crate::pipeline::WaterfallPipeline)

mod compile;
mod definition;
mod registry;

pub use compile::{compile, merge_parameters};
pub use definition::{StepDescriptor, StrategyDefinition};
pub use registry::StrategyRegistry;
