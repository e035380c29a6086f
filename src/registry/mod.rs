//! Capability registry and reachability computation.
//!
//! # Module Structure
//!
//! - `store`: repository contract (`flex_capabilities`) + memory impl
//! - `service`: registration pipeline, heartbeat sweep, cached snapshot
//! - `crcs`: forward/backward facet reachability and capability pinning

mod crcs;
mod service;
mod store;

pub use crcs::{
    CrcsOptions, CrcsRow, CrcsSnapshot, REASON_GOAL_CONDITION, REASON_PATH,
    REASON_POLICY_REFERENCE, compute_crcs,
};
pub use service::{CapabilityRegistry, RegistrationError};
pub use store::{CapabilityStore, MemoryCapabilityStore};
