//! Execution context for strategy runs.
//!
//! This module provides:
//! - The mutable [`ExecutionContext`] owned by one job
//! - Step results and the provenance trail
//! - Read-only [`ContextSnapshot`]s kept after a job finishes

mod execution;
mod ontology;
mod records;
mod snapshot;

pub use execution::ExecutionContext;
pub use ontology::OntologyType;
pub use records::{ExecutionSummary, JsonMap, ProvenanceRecord, StepResult};
pub use snapshot::ContextSnapshot;
