//! The external planner service seam.
//!
//! The planner service is typically an LLM with schema-guided structured
//! output; the orchestrator only depends on this trait. Test and CLI
//! substitutes return scripted drafts.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::models::{GraphContext, PlanEdge, PlanNodeKind, PolicyBundle, RoutingSpec, TaskEnvelope};
use crate::registry::CrcsRow;

/// Everything the planner service sees for one proposal.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannerServiceRequest {
    pub run_id: String,
    pub envelope: TaskEnvelope,
    /// The CRCS rows; the only capabilities the service may reference.
    pub capabilities: Vec<CrcsRow>,
    pub policies: PolicyBundle,
    /// Completed work from the interrupted run, for mid-run replans.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<GraphContext>,
    /// 1-based planner attempt for this run.
    pub attempt: u32,
}

/// A proposed node before validation and contract resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftNode {
    pub id: String,
    #[serde(default = "default_kind")]
    pub kind: PlanNodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_facets: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_facets: Vec<String>,
    /// Literal inputs the planner pins for this node.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing: Option<RoutingSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rationale: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived_capability: Option<Value>,
}

fn default_kind() -> PlanNodeKind {
    PlanNodeKind::Execution
}

/// The service's proposed plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanDraft {
    #[serde(default)]
    pub nodes: Vec<DraftNode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edges: Vec<PlanEdge>,
    #[serde(default)]
    pub metadata: Value,
}

/// Failures crossing the planner-service boundary.
#[derive(Debug, Clone, Error)]
pub enum PlannerServiceError {
    /// The service judged that no capability arrangement can satisfy the
    /// objective.
    #[error("objective unsupported: {reason}")]
    Unsupported { reason: String },
    #[error("planner service failed: {0}")]
    Failed(String),
}

/// External plan proposer (LLM-backed in production).
#[async_trait]
pub trait PlannerService: Send + Sync {
    async fn propose_plan(
        &self,
        request: &PlannerServiceRequest,
    ) -> Result<PlanDraft, PlannerServiceError>;
}

/// Observability hooks threaded through a planner invocation.
#[derive(Default)]
pub struct PlannerHooks {
    /// Called with the request just before the service is invoked.
    pub on_request: Option<Box<dyn Fn(&PlannerServiceRequest) + Send + Sync>>,
}

/// Returns pre-scripted drafts in order; the last one repeats. Serves the
/// CLI's file-driven mode and every planner test.
pub struct ScriptedPlanner {
    drafts: std::sync::Mutex<Vec<PlanDraft>>,
}

impl ScriptedPlanner {
    pub fn new(drafts: Vec<PlanDraft>) -> Self {
        Self {
            drafts: std::sync::Mutex::new(drafts),
        }
    }

    pub fn single(draft: PlanDraft) -> Self {
        Self::new(vec![draft])
    }
}

#[async_trait]
impl PlannerService for ScriptedPlanner {
    async fn propose_plan(
        &self,
        _request: &PlannerServiceRequest,
    ) -> Result<PlanDraft, PlannerServiceError> {
        let mut drafts = self.drafts.lock().expect("draft lock poisoned");
        if drafts.is_empty() {
            return Err(PlannerServiceError::Failed(
                "scripted planner exhausted".to_string(),
            ));
        }
        if drafts.len() == 1 {
            return Ok(drafts[0].clone());
        }
        Ok(drafts.remove(0))
    }
}
