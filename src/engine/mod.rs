//! Plan scheduling and the flex execution engine.
//!
//! # Module Structure
//!
//! - `scheduler`: ready-queue over the plan DAG with conditional locks
//! - `validation`: contract validation at every boundary
//! - `runtime`: the capability runtime seam (LLM-backed in production)
//! - `prompt`: capability prompt composition
//! - `feedback`: feedback normalization and resolution diffing
//! - `engine`: node lifecycle, policy and post-condition dispatch, pauses
//! - `coordinator`: the run service (replan loop, resume entry points)

mod coordinator;
#[allow(clippy::module_inception)]
mod engine;
mod feedback;
mod prompt;
mod runtime;
mod scheduler;
mod validation;

pub use coordinator::{
    DeclineAck, FlexRunError, FlexRunService, HumanTaskSubmission, RunOutcome, plan_from_snapshot,
};
pub use engine::{EngineError, ExecutionOutcome, FlexExecutionEngine, InterruptState};
pub use feedback::{
    FEEDBACK_FACET, FeedbackEntry, FeedbackResolutionChange, diff_resolutions, normalize_feedback,
    relevant_feedback,
};
pub use prompt::{PromptArgs, compose_prompt};
pub use runtime::{
    CapabilityInvocation, CapabilityRuntime, CapabilityRuntimeError, ScriptedRuntime,
};
pub use scheduler::{Scheduler, SchedulerError};
pub use validation::{SchemaViolation, ValidationScope, validate_against_schema};
