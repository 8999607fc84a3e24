//! Lookup of actions by type.

use super::Action;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Maps action types to implementations.
#[derive(Default)]
pub struct ActionRegistry {
    actions: RwLock<HashMap<String, Arc<dyn Action>>>,
}

impl ActionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an action under its own type, replacing any previous one.
    pub fn register(&self, action: Arc<dyn Action>) {
        let action_type = action.action_type().to_string();
        self.register_as(action_type, action);
    }

    /// Registers an action under an explicit type name.
    pub fn register_as(&self, action_type: impl Into<String>, action: Arc<dyn Action>) {
        self.actions.write().insert(action_type.into(), action);
    }

    /// Registers an action, returning the registry.
    #[must_use]
    pub fn with_action(self, action: Arc<dyn Action>) -> Self {
        self.register(action);
        self
    }

    /// Looks up an action.
    #[must_use]
    pub fn get(&self, action_type: &str) -> Option<Arc<dyn Action>> {
        self.actions.read().get(action_type).cloned()
    }

    /// Returns whether an action type is registered.
    #[must_use]
    pub fn contains(&self, action_type: &str) -> bool {
        self.actions.read().contains_key(action_type)
    }

    /// Registered action types, sorted.
    #[must_use]
    pub fn action_types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.actions.read().keys().cloned().collect();
        types.sort();
        types
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("action_types", &self.action_types())
            .finish()
    }
}
