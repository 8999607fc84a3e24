//! Ontology types an execution context can resolve.

use crate::errors::ValidationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The kind of biological entity a run resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OntologyType {
    /// Gene identifiers (HGNC, Entrez, Ensembl).
    Gene,
    /// Protein identifiers (UniProt).
    Protein,
    /// Metabolite identifiers (HMDB, ChEBI, InChIKey).
    Metabolite,
    /// Sequence variants.
    Variant,
    /// Chemical compounds (PubChem).
    Compound,
    /// Pathways.
    Pathway,
    /// Diseases.
    Disease,
}

impl OntologyType {
    /// All variants in declaration order.
    pub const ALL: [Self; 7] = [
        Self::Gene,
        Self::Protein,
        Self::Metabolite,
        Self::Variant,
        Self::Compound,
        Self::Pathway,
        Self::Disease,
    ];

    /// Returns the lowercase name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gene => "gene",
            Self::Protein => "protein",
            Self::Metabolite => "metabolite",
            Self::Variant => "variant",
            Self::Compound => "compound",
            Self::Pathway => "pathway",
            Self::Disease => "disease",
        }
    }
}

impl fmt::Display for OntologyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OntologyType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| ValidationError::new("ontology_type", format!("unknown ontology type '{s}'")))
    }
}
