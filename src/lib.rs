//! flexrun: a flexible AI-agent workflow orchestrator.
//!
//! A caller submits a task envelope (objective, typed facet inputs,
//! policies, an output contract and optional goal conditions); the
//! orchestrator plans a DAG of capability invocations over the registered
//! capability set, executes it with contract validation at every boundary,
//! streams progress events, pauses for human input where required and
//! returns a contract-conforming final output.

pub mod conditions;
pub mod config;
pub mod context;
pub mod engine;
pub mod facets;
pub mod hitl;
pub mod models;
pub mod persistence;
pub mod planner;
pub mod registration;
pub mod registry;

// Re-export the surface most embedders touch.
pub use config::FlexConfig;
pub use context::{FacetEntry, ProvenanceRecord, RunContext, RunContextSnapshot};
pub use engine::{
    CapabilityRuntime, EngineError, FlexExecutionEngine, FlexRunError, FlexRunService,
    HumanTaskSubmission, RunOutcome, ScriptedRuntime,
};
pub use facets::{FacetCatalog, FacetDef, FacetDirection};
pub use hitl::{HitlResponse, HitlService, MemoryHitlService};
pub use models::{
    CapabilityRecord, CapabilityRegistration, CollectingSink, EventSink, FlexEvent, FlexEventKind,
    Plan, RunStatus, TaskEnvelope,
};
pub use persistence::{FlexRunPersistence, MemoryPersistence};
pub use planner::{FlexPlanner, PlannerService, ScriptedPlanner};
pub use registry::{CapabilityRegistry, MemoryCapabilityStore};
