//! Testing utilities.
//!
//! This module provides:
//! - Scripted, failing and hanging actions
//! - A call-counting resource probe
//! - Entity and context fixtures

mod fixtures;
mod mocks;

pub use fixtures::{entities, fast_config, test_context};
pub use mocks::{CountingProbe, FailingAction, HangingAction, ScriptedAction};
