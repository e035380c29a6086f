//! Facet catalog and contract compilation.
//!
//! A facet is a named, typed, schema-backed semantic slot (`objectiveBrief`,
//! `copyVariants`, ...). Plan I/O is expressed in facets first; the compiler
//! turns facet lists into JSON-Schema contracts with per-facet provenance.
//!
//! # Module Structure
//!
//! - `catalog`: the catalog of known facets plus the built-in defaults
//! - `compiler`: facet lists -> JSON-Schema contracts

mod catalog;
mod compiler;

pub use catalog::{FacetCatalog, FacetDef, FacetDirection};
pub use compiler::{CompiledContract, CompiledContracts};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Side of a contract a facet is requested for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContractDirection {
    Input,
    Output,
}

impl std::fmt::Display for ContractDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContractDirection::Input => write!(f, "input"),
            ContractDirection::Output => write!(f, "output"),
        }
    }
}

/// One provenance record per facet in a compiled contract.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FacetProvenanceEntry {
    /// Human title from the catalog.
    pub title: String,
    /// Which side of the contract the facet was compiled into.
    pub direction: ContractDirection,
    /// Facet name.
    pub facet: String,
    /// Canonical JSON pointer into the composed final output.
    pub pointer: String,
}

/// Compilation failures for facet contracts.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FacetContractError {
    /// A requested facet is not in the catalog.
    #[error("unknown facet '{facet}'")]
    UnknownFacet { facet: String },
    /// A facet was requested in a direction its catalog entry does not allow.
    #[error("facet '{facet}' is not {requested}-producible")]
    Directionality {
        facet: String,
        requested: ContractDirection,
    },
}

impl FacetContractError {
    /// Stable machine-readable code for API surfaces.
    pub fn code(&self) -> &'static str {
        match self {
            FacetContractError::UnknownFacet { .. } => "unknown_facet",
            FacetContractError::Directionality { .. } => "facet_directionality",
        }
    }
}
