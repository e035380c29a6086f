//! Persistence contract the engine requires, plus the in-memory
//! implementation used by tests and the CLI.
//!
//! Row shapes mirror the `flex_runs` / `flex_plan_nodes` /
//! `flex_plan_snapshots` / `flex_run_outputs` tables. The memory store keeps
//! everything under one lock, which gives the same atomicity the SQL
//! implementation gets from transactions.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::conditions::GoalConditionResult;
use crate::models::{
    NodeStatus, PendingState, PlanEdge, PlanNodeSnapshot, RunRecord, RunStatus,
};

/// Stable fingerprint of a JSON schema, used to tag snapshots and outputs.
pub fn schema_hash(schema: &Value) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    schema.to_string().hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// One `flex_plan_snapshots` row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanSnapshotRow {
    pub run_id: String,
    pub plan_version: u32,
    /// Nodes, edges, plan metadata and the pending state.
    pub snapshot: Value,
    /// Run-context snapshot at save time.
    pub facet_snapshot: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_hash: Option<String>,
    #[serde(default)]
    pub pending_node_ids: Vec<String>,
}

/// One `flex_run_outputs` row; a run has at most one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutputRow {
    pub run_id: String,
    pub plan_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_hash: Option<String>,
    pub status: RunStatus,
    pub output: Value,
    pub facet_snapshot: Value,
    pub provenance: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub goal_condition_results: Vec<GoalConditionResult>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub post_condition_results: Value,
}

/// Context accompanying a plan-snapshot save.
#[derive(Debug, Clone, Default)]
pub struct PlanSnapshotContext {
    pub facets: Value,
    pub schema_hash: Option<String>,
    pub edges: Vec<PlanEdge>,
    pub plan_metadata: Value,
    pub pending_state: PendingState,
}

/// Context accompanying a final-result write.
#[derive(Debug, Clone)]
pub struct RunResultContext {
    pub status: RunStatus,
    pub plan_version: u32,
    pub schema_hash: Option<String>,
    pub facets: Value,
    pub provenance: Value,
    pub goal_condition_results: Vec<GoalConditionResult>,
    pub post_condition_results: Value,
    /// Snapshot saved in the same transaction as the result.
    pub snapshot_nodes: Vec<PlanNodeSnapshot>,
    pub snapshot_context: PlanSnapshotContext,
}

/// Partial update for one plan-node row.
#[derive(Debug, Clone, Default)]
pub struct NodeUpdates {
    pub status: Option<NodeStatus>,
    pub capability_id: Option<String>,
    pub label: Option<String>,
    pub context: Option<Value>,
    pub output: Option<Value>,
    pub error: Option<Value>,
    pub post_condition_results: Option<Vec<GoalConditionResult>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Filter for the pending-human-task listing.
#[derive(Debug, Clone, Default)]
pub struct HumanTaskFilter {
    pub assigned_to: Option<String>,
    pub role: Option<String>,
    pub status: Option<NodeStatus>,
}

/// A node waiting on a person, joined with its run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingHumanTask {
    pub run_id: String,
    pub node_id: String,
    pub status: NodeStatus,
    /// Assignment payload attached when the node parked.
    pub assignment: Value,
}

/// A resume audit entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeAudit {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// What the execution engine requires of its store.
#[async_trait]
pub trait FlexRunPersistence: Send + Sync {
    async fn create_or_update_run(&self, record: RunRecord);

    async fn update_status(&self, run_id: &str, status: RunStatus);

    /// Save a plan snapshot atomically with the run-row update. Plan-node
    /// rows not referenced by the snapshot are deleted; referenced rows are
    /// upserted keyed by `(run_id, node_id)`; the snapshot row is upserted
    /// keyed by `(run_id, plan_version)`.
    async fn save_plan_snapshot(
        &self,
        run_id: &str,
        plan_version: u32,
        nodes: &[PlanNodeSnapshot],
        context: PlanSnapshotContext,
    );

    /// Upsert one plan-node row.
    async fn mark_node(&self, run_id: &str, node_id: &str, updates: NodeUpdates);

    /// In one transaction: update the run row, upsert the single
    /// `flex_run_outputs` row, save the plan snapshot.
    async fn record_result(&self, run_id: &str, output: &Value, context: RunResultContext);

    async fn load_flex_run(&self, run_id: &str) -> Option<RunRecord>;

    /// Most recently updated run on a thread.
    async fn find_flex_run_by_thread_id(&self, thread_id: &str) -> Option<RunRecord>;

    /// Latest snapshot, or the one for a specific plan version.
    async fn load_plan_snapshot(
        &self,
        run_id: &str,
        plan_version: Option<u32>,
    ) -> Option<PlanSnapshotRow>;

    async fn load_node_snapshots(&self, run_id: &str) -> Vec<PlanNodeSnapshot>;

    async fn load_run_output(&self, run_id: &str) -> Option<RunOutputRow>;

    async fn list_pending_human_tasks(&self, filter: HumanTaskFilter) -> Vec<PendingHumanTask>;

    async fn record_resume_audit(&self, run_id: &str, operator: Option<&str>, note: Option<&str>);
}

#[derive(Default)]
struct MemoryState {
    runs: BTreeMap<String, RunRecord>,
    nodes: BTreeMap<String, BTreeMap<String, PlanNodeSnapshot>>,
    snapshots: BTreeMap<String, BTreeMap<u32, PlanSnapshotRow>>,
    outputs: BTreeMap<String, RunOutputRow>,
    audits: Vec<ResumeAudit>,
}

/// `FlexRunPersistence` over mutex-guarded maps.
#[derive(Default)]
pub struct MemoryPersistence {
    state: Mutex<MemoryState>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::new())
    }

    pub async fn resume_audits(&self, run_id: &str) -> Vec<ResumeAudit> {
        self.state
            .lock()
            .await
            .audits
            .iter()
            .filter(|a| a.run_id == run_id)
            .cloned()
            .collect()
    }
}

fn apply_snapshot(
    state: &mut MemoryState,
    run_id: &str,
    plan_version: u32,
    nodes: &[PlanNodeSnapshot],
    context: &PlanSnapshotContext,
) {
    let node_map = state.nodes.entry(run_id.to_string()).or_default();
    node_map.retain(|id, _| nodes.iter().any(|n| &n.node_id == id));
    for node in nodes {
        node_map.insert(node.node_id.clone(), node.clone());
    }

    let pending_node_ids: Vec<String> = nodes
        .iter()
        .filter(|n| {
            matches!(
                n.status,
                NodeStatus::Pending | NodeStatus::AwaitingHitl | NodeStatus::AwaitingHuman
            )
        })
        .map(|n| n.node_id.clone())
        .collect();

    let snapshot = serde_json::json!({
        "nodes": nodes,
        "edges": context.edges,
        "planMetadata": context.plan_metadata,
        "pendingState": context.pending_state,
    });
    state.snapshots.entry(run_id.to_string()).or_default().insert(
        plan_version,
        PlanSnapshotRow {
            run_id: run_id.to_string(),
            plan_version,
            snapshot,
            facet_snapshot: context.facets.clone(),
            schema_hash: context.schema_hash.clone(),
            pending_node_ids,
        },
    );

    if let Some(run) = state.runs.get_mut(run_id) {
        run.plan_version = plan_version;
        run.context_snapshot = Some(context.facets.clone());
        run.updated_at = Utc::now();
    }
}

#[async_trait]
impl FlexRunPersistence for MemoryPersistence {
    async fn create_or_update_run(&self, record: RunRecord) {
        let mut state = self.state.lock().await;
        state.runs.insert(record.run_id.clone(), record);
    }

    async fn update_status(&self, run_id: &str, status: RunStatus) {
        let mut state = self.state.lock().await;
        if let Some(run) = state.runs.get_mut(run_id) {
            run.status = status;
            run.updated_at = Utc::now();
        }
    }

    async fn save_plan_snapshot(
        &self,
        run_id: &str,
        plan_version: u32,
        nodes: &[PlanNodeSnapshot],
        context: PlanSnapshotContext,
    ) {
        let mut state = self.state.lock().await;
        apply_snapshot(&mut state, run_id, plan_version, nodes, &context);
    }

    async fn mark_node(&self, run_id: &str, node_id: &str, updates: NodeUpdates) {
        let mut state = self.state.lock().await;
        let node_map = state.nodes.entry(run_id.to_string()).or_default();
        let entry = node_map
            .entry(node_id.to_string())
            .or_insert_with(|| PlanNodeSnapshot {
                node_id: node_id.to_string(),
                capability_id: None,
                label: String::new(),
                status: NodeStatus::Pending,
                context: Value::Null,
                output: None,
                error: None,
                post_condition_results: vec![],
                started_at: None,
                completed_at: None,
            });

        if let Some(status) = updates.status {
            entry.status = status;
        }
        if let Some(capability_id) = updates.capability_id {
            entry.capability_id = Some(capability_id);
        }
        if let Some(label) = updates.label {
            entry.label = label;
        }
        if let Some(context) = updates.context {
            entry.context = context;
        }
        if let Some(output) = updates.output {
            entry.output = Some(output);
        }
        if let Some(error) = updates.error {
            entry.error = Some(error);
        }
        if let Some(results) = updates.post_condition_results {
            entry.post_condition_results = results;
        }
        if let Some(started_at) = updates.started_at {
            entry.started_at = Some(started_at);
        }
        if let Some(completed_at) = updates.completed_at {
            entry.completed_at = Some(completed_at);
        }
    }

    async fn record_result(&self, run_id: &str, output: &Value, context: RunResultContext) {
        let mut state = self.state.lock().await;

        if let Some(run) = state.runs.get_mut(run_id) {
            run.status = context.status;
            run.plan_version = context.plan_version;
            run.result = Some(output.clone());
            run.updated_at = Utc::now();
        }
        state.outputs.insert(
            run_id.to_string(),
            RunOutputRow {
                run_id: run_id.to_string(),
                plan_version: context.plan_version,
                schema_hash: context.schema_hash.clone(),
                status: context.status,
                output: output.clone(),
                facet_snapshot: context.facets.clone(),
                provenance: context.provenance.clone(),
                goal_condition_results: context.goal_condition_results.clone(),
                post_condition_results: context.post_condition_results.clone(),
            },
        );
        apply_snapshot(
            &mut state,
            run_id,
            context.plan_version,
            &context.snapshot_nodes,
            &context.snapshot_context,
        );
    }

    async fn load_flex_run(&self, run_id: &str) -> Option<RunRecord> {
        self.state.lock().await.runs.get(run_id).cloned()
    }

    async fn find_flex_run_by_thread_id(&self, thread_id: &str) -> Option<RunRecord> {
        self.state
            .lock()
            .await
            .runs
            .values()
            .filter(|r| r.thread_id.as_deref() == Some(thread_id))
            .max_by_key(|r| r.updated_at)
            .cloned()
    }

    async fn load_plan_snapshot(
        &self,
        run_id: &str,
        plan_version: Option<u32>,
    ) -> Option<PlanSnapshotRow> {
        let state = self.state.lock().await;
        let versions = state.snapshots.get(run_id)?;
        match plan_version {
            Some(version) => versions.get(&version).cloned(),
            None => versions.values().next_back().cloned(),
        }
    }

    async fn load_node_snapshots(&self, run_id: &str) -> Vec<PlanNodeSnapshot> {
        self.state
            .lock()
            .await
            .nodes
            .get(run_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    async fn load_run_output(&self, run_id: &str) -> Option<RunOutputRow> {
        self.state.lock().await.outputs.get(run_id).cloned()
    }

    async fn list_pending_human_tasks(&self, filter: HumanTaskFilter) -> Vec<PendingHumanTask> {
        let state = self.state.lock().await;
        let wanted_status = filter.status.unwrap_or(NodeStatus::AwaitingHuman);
        let mut tasks = Vec::new();

        for (run_id, nodes) in &state.nodes {
            for node in nodes.values() {
                if node.status != wanted_status {
                    continue;
                }
                let assignment = node
                    .context
                    .get("bundle")
                    .and_then(|b| b.get("assignment"))
                    .cloned()
                    .unwrap_or(Value::Null);
                if assignment.is_null() {
                    continue;
                }
                if let Some(assigned_to) = &filter.assigned_to {
                    let matches = assignment
                        .get("assignedTo")
                        .and_then(Value::as_str)
                        .map(|a| a == assigned_to)
                        .unwrap_or(false);
                    if !matches {
                        continue;
                    }
                }
                if let Some(role) = &filter.role {
                    let matches = assignment
                        .get("role")
                        .and_then(Value::as_str)
                        .map(|r| r == role)
                        .unwrap_or(false);
                    if !matches {
                        continue;
                    }
                }
                tasks.push(PendingHumanTask {
                    run_id: run_id.clone(),
                    node_id: node.node_id.clone(),
                    status: node.status,
                    assignment,
                });
            }
        }
        tasks
    }

    async fn record_resume_audit(&self, run_id: &str, operator: Option<&str>, note: Option<&str>) {
        self.state.lock().await.audits.push(ResumeAudit {
            run_id: run_id.to_string(),
            operator: operator.map(|s| s.to_string()),
            note: note.map(|s| s.to_string()),
            timestamp: Utc::now(),
        });
    }
}
