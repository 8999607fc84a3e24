//! Action interface.
//!
//! Actions are the pluggable matching steps a waterfall stage wraps. They
//! receive the entities still unresolved, a read-only view of the context,
//! their parameters and the stage's call budget.

mod budget;
mod registry;
mod types;

pub use budget::CallBudget;
pub use registry::ActionRegistry;
pub use types::{ActionError, ActionOutput, ActionParams, Entity, EntityMatch};

use crate::context::ExecutionContext;
use async_trait::async_trait;
use std::fmt::Debug;

/// Trait for matching actions.
///
/// Implementations must be safe to call again with the same input: the
/// pipeline retries failed invocations. Retrying is never the action's job.
#[async_trait]
pub trait Action: Send + Sync + Debug {
    /// Returns the action type this implementation is registered under.
    fn action_type(&self) -> &str;

    /// Attempts to resolve `unresolved`.
    ///
    /// Actions making external calls must reserve them through `budget`
    /// and return what they have once a reservation is refused.
    async fn execute(
        &self,
        unresolved: &[Entity],
        ctx: &ExecutionContext,
        params: &ActionParams,
        budget: &CallBudget,
    ) -> Result<ActionOutput, ActionError>;
}

/// A synchronous function-based action.
pub struct FnAction<F>
where
    F: Fn(&[Entity], &ActionParams, &CallBudget) -> Result<ActionOutput, ActionError> + Send + Sync,
{
    action_type: String,
    func: F,
}

impl<F> FnAction<F>
where
    F: Fn(&[Entity], &ActionParams, &CallBudget) -> Result<ActionOutput, ActionError> + Send + Sync,
{
    /// Creates a new function-based action.
    pub fn new(action_type: impl Into<String>, func: F) -> Self {
        Self {
            action_type: action_type.into(),
            func,
        }
    }
}

impl<F> Debug for FnAction<F>
where
    F: Fn(&[Entity], &ActionParams, &CallBudget) -> Result<ActionOutput, ActionError> + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnAction")
            .field("action_type", &self.action_type)
            .finish()
    }
}

#[async_trait]
impl<F> Action for FnAction<F>
where
    F: Fn(&[Entity], &ActionParams, &CallBudget) -> Result<ActionOutput, ActionError> + Send + Sync,
{
    fn action_type(&self) -> &str {
        &self.action_type
    }

    async fn execute(
        &self,
        unresolved: &[Entity],
        _ctx: &ExecutionContext,
        params: &ActionParams,
        budget: &CallBudget,
    ) -> Result<ActionOutput, ActionError> {
        (self.func)(unresolved, params, budget)
    }
}
