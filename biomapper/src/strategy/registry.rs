//! Named strategy lookup.

use super::StrategyDefinition;
use crate::errors::ValidationError;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Strategies available for submission by name.
#[derive(Debug, Default)]
pub struct StrategyRegistry {
    strategies: RwLock<HashMap<String, Arc<StrategyDefinition>>>,
}

impl StrategyRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and registers a strategy, replacing one with the same name.
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` if the strategy is invalid.
    pub fn register(&self, strategy: StrategyDefinition) -> Result<(), ValidationError> {
        strategy.validate()?;
        self.strategies
            .write()
            .insert(strategy.name.clone(), Arc::new(strategy));
        Ok(())
    }

    /// Looks up a strategy.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<StrategyDefinition>> {
        self.strategies.read().get(name).cloned()
    }

    /// Removes a strategy.
    pub fn remove(&self, name: &str) -> Option<Arc<StrategyDefinition>> {
        self.strategies.write().remove(name)
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.strategies.read().keys().cloned().collect();
        names.sort();
        names
    }
}
