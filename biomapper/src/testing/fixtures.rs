//! Fixtures for tests.

use crate::actions::Entity;
use crate::config::ExecutionConfig;
use crate::context::{ExecutionContext, OntologyType};

/// Entities with the given ids and no attributes.
#[must_use]
pub fn entities(ids: &[&str]) -> Vec<Entity> {
    ids.iter().map(|id| Entity::new(*id)).collect()
}

/// A configuration with millisecond retry delays and no cache.
#[must_use]
pub fn fast_config() -> ExecutionConfig {
    ExecutionConfig::default()
        .with_retry_attempts(1)
        .with_retry_base_delay_ms(1)
        .with_cache(false, 60)
}

/// A protein context built from [`fast_config`].
///
/// # Panics
///
/// Never: the fixed identifier and config are valid.
#[must_use]
pub fn test_context() -> ExecutionContext {
    ExecutionContext::new("P12345", OntologyType::Protein, fast_config())
        .unwrap_or_else(|e| panic!("test context is invalid: {e}"))
}
