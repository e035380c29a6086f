//! Run records, node snapshots and resumable pending state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::conditions::GoalConditionResult;

use super::envelope::{PolicyAction, TaskEnvelope};

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    AwaitingHitl,
    AwaitingHuman,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

/// Lifecycle of a single plan node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Error,
    AwaitingHitl,
    AwaitingHuman,
}

/// Persisted view of one plan node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanNodeSnapshot {
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_id: Option<String>,
    #[serde(default)]
    pub label: String,
    pub status: NodeStatus,
    /// The full plan node as planned (context for resume and audits).
    #[serde(default)]
    pub context: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_condition_results: Vec<GoalConditionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Why a snapshot was written mid-run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PauseMode {
    Pause,
    Hitl,
}

/// A HITL decision the engine still owes a resolution for.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingPolicyAction {
    pub policy_id: String,
    pub node_id: String,
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approve_action: Option<PolicyAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reject_action: Option<PolicyAction>,
}

/// Everything needed to resume execution cold.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingState {
    #[serde(default)]
    pub completed_node_ids: Vec<String>,
    #[serde(default)]
    pub node_outputs: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub policy_actions: Vec<PendingPolicyAction>,
    /// Attempts consumed per policy id (for `goto` bounds).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub policy_attempts: BTreeMap<String, u32>,
    /// Attempts consumed per node id (for post-condition retries).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub post_condition_attempts: BTreeMap<String, u32>,
    /// Conditional-routing selections already made, for resume.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub routing_selections: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<PauseMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal_condition_failures: Option<Vec<GoalConditionResult>>,
}

/// What a replanning planner sees of the interrupted run: completed work
/// and the facets it already produced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphContext {
    #[serde(default)]
    pub completed_node_ids: Vec<String>,
    #[serde(default)]
    pub node_outputs: BTreeMap<String, Value>,
    /// Output facets per completed node.
    #[serde(default)]
    pub node_output_facets: BTreeMap<String, Vec<String>>,
    /// Facet names already present in the run context.
    #[serde(default)]
    pub facets: Vec<String>,
}

/// Canonical run row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub envelope: TaskEnvelope,
    pub status: RunStatus,
    pub plan_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Serialized run context (`{ facets, hitlClarifications }`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_snapshot: Option<Value>,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::AwaitingHitl.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }

    #[test]
    fn test_status_wire_form() {
        assert_eq!(
            serde_json::to_value(RunStatus::AwaitingHuman).unwrap(),
            serde_json::json!("awaiting_human")
        );
        assert_eq!(
            serde_json::to_value(NodeStatus::AwaitingHitl).unwrap(),
            serde_json::json!("awaiting_hitl")
        );
    }

    #[test]
    fn test_pending_state_roundtrip() {
        let mut state = PendingState::default();
        state.completed_node_ids.push("n1".to_string());
        state
            .node_outputs
            .insert("n1".to_string(), serde_json::json!({ "ok": true }));
        state.policy_attempts.insert("p1".to_string(), 2);
        state.mode = Some(PauseMode::Hitl);

        let json = serde_json::to_value(&state).unwrap();
        let restored: PendingState = serde_json::from_value(json).unwrap();
        assert_eq!(restored.completed_node_ids, vec!["n1".to_string()]);
        assert_eq!(restored.policy_attempts.get("p1"), Some(&2));
        assert_eq!(restored.mode, Some(PauseMode::Hitl));
    }
}
