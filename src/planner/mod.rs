//! The hybrid LLM-assisted planner.
//!
//! # Module Structure
//!
//! - `service`: the external planner-service seam and draft types
//! - `validate`: deterministic draft validation against the registry
//! - `planner`: normalization, CRCS gating, contract resolution

mod planner;
mod service;
mod validate;

pub use planner::{FlexPlanner, PlannerError};
pub use service::{
    DraftNode, PlanDraft, PlannerHooks, PlannerService, PlannerServiceError, PlannerServiceRequest,
    ScriptedPlanner,
};
pub use validate::{DraftValidator, PlannerDiagnostic};
