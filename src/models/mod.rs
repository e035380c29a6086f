pub mod capability;
pub mod envelope;
pub mod event;
pub mod plan;
pub mod run;

pub use capability::{
    AgentType, AssignmentDefaults, CapabilityContract, CapabilityRecord, CapabilityRegistration,
    CapabilityStatus, HeartbeatSpec, OnDecline, PostConditionSpec,
};
pub use envelope::{
    EnvelopeConstraints, PlannerPolicies, PolicyAction, PolicyBundle, PolicySelector,
    PolicyTrigger, RuntimePolicy, SelectionPolicy, TaskEnvelope, TriggerKind,
};
pub use event::{ChannelSink, CollectingSink, EventSink, FlexEvent, FlexEventKind, NullSink};
pub use plan::{
    NodeBundle, NodeContracts, NodeFacets, NodeProvenance, Plan, PlanEdge, PlanNode, PlanNodeKind,
    RouteSpec, RoutingSpec,
};
pub use run::{
    GraphContext, NodeStatus, PauseMode, PendingPolicyAction, PendingState, PlanNodeSnapshot,
    RunRecord, RunStatus,
};
