//! Action type to resource mapping.

use std::collections::{BTreeSet, HashMap};

/// Resource every execution needs.
pub const METADATA_STORE: &str = "metadata_store";
/// Vector database used by similarity actions.
pub const VECTOR_STORE: &str = "vector_store";
/// Remote identifier-mapping services.
pub const EXTERNAL_API: &str = "external_api";

const VECTOR_ACTIONS: &[&str] = &[
    "vector_search",
    "vector_similarity",
    "semantic_search",
    "embedding_match",
];

const API_ACTIONS: &[&str] = &[
    "api_resolve",
    "uniprot_lookup",
    "unichem_lookup",
    "hmdb_lookup",
    "pubchem_lookup",
    "llm_validate",
];

/// Static table deriving the resources a strategy needs from its action
/// types.
#[derive(Debug, Clone)]
pub struct RequirementTable {
    always: BTreeSet<String>,
    by_action: HashMap<String, BTreeSet<String>>,
}

impl Default for RequirementTable {
    fn default() -> Self {
        let mut table = Self::empty().with_always(METADATA_STORE);
        for action in VECTOR_ACTIONS {
            table = table.with(*action, [VECTOR_STORE]);
        }
        for action in API_ACTIONS {
            table = table.with(*action, [EXTERNAL_API]);
        }
        table
    }
}

impl RequirementTable {
    /// A table with no entries at all.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            always: BTreeSet::new(),
            by_action: HashMap::new(),
        }
    }

    /// Adds a resource needed by every execution.
    #[must_use]
    pub fn with_always(mut self, resource: impl Into<String>) -> Self {
        self.always.insert(resource.into());
        self
    }

    /// Maps an action type to the resources it needs.
    #[must_use]
    pub fn with<I, S>(mut self, action_type: impl Into<String>, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.by_action
            .entry(action_type.into())
            .or_default()
            .extend(resources.into_iter().map(Into::into));
        self
    }

    /// Resources needed by a set of action types, sorted and deduplicated.
    pub fn requirements_for<'a, I>(&self, action_types: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut needed = self.always.clone();
        for action_type in action_types {
            if let Some(resources) = self.by_action.get(action_type) {
                needed.extend(resources.iter().cloned());
            }
        }
        needed.into_iter().collect()
    }
}
