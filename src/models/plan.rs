//! Validated plan graphs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::conditions::ConditionSpec;
use crate::facets::FacetProvenanceEntry;

use super::capability::PostConditionSpec;

/// What a plan node does when dispatched.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PlanNodeKind {
    /// Invokes a capability (AI or human).
    Execution,
    /// Gating step; validated like execution but without input checks.
    Validation,
    /// Conditional branch over outgoing edges.
    Routing,
    /// Bookkeeping only; no dispatch.
    Virtual,
}

/// Everything the executor needs to dispatch one node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeBundle {
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub objective: String,
    /// Planner-authored instructions for this node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    /// Literal inputs pinned by the planner; merged with run-context values.
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policies: Option<Value>,
    /// The effective output contract the node must satisfy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract: Option<Value>,
    /// Human-task assignment payload, set while a node awaits a person.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignment: Option<Value>,
}

/// Input/output JSON-Schema contracts resolved for a node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeContracts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

/// Facet names a node consumes and produces.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeFacets {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output: Vec<String>,
}

/// Facet provenance entries for a node, both directions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeProvenance {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input: Vec<FacetProvenanceEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output: Vec<FacetProvenanceEntry>,
}

/// One conditional branch out of a routing node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteSpec {
    /// Target node id when the condition matches.
    pub to: String,
    pub condition: ConditionSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Conditional-branch table of a routing node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingSpec {
    pub routes: Vec<RouteSpec>,
    /// Fallback target when no route matches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub else_to: Option<String>,
}

/// A node of the validated plan graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanNode {
    pub id: String,
    pub kind: PlanNodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_id: Option<String>,
    #[serde(default)]
    pub capability_label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_version: Option<String>,
    /// Planner-synthesized capability description for derived nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived_capability: Option<Value>,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub bundle: NodeBundle,
    #[serde(default)]
    pub contracts: NodeContracts,
    #[serde(default)]
    pub facets: NodeFacets,
    #[serde(default)]
    pub provenance: NodeProvenance,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rationale: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing: Option<RoutingSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_condition_guards: Vec<PostConditionSpec>,
    #[serde(default)]
    pub metadata: Value,
}

impl PlanNode {
    /// Whether `facet` is one of this node's declared output facets.
    pub fn produces_facet(&self, facet: &str) -> bool {
        self.facets.output.iter().any(|f| f == facet)
    }

    pub fn is_dispatchable(&self) -> bool {
        !matches!(self.kind, PlanNodeKind::Virtual)
    }
}

/// A directed edge; when a plan carries no edges they default to sequential.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlanEdge {
    pub from: String,
    pub to: String,
}

/// A validated, executable plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub run_id: String,
    pub version: u32,
    pub created_at: String,
    pub nodes: Vec<PlanNode>,
    #[serde(default)]
    pub edges: Vec<PlanEdge>,
    #[serde(default)]
    pub metadata: Value,
}

impl Plan {
    pub fn node(&self, node_id: &str) -> Option<&PlanNode> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    pub fn node_index(&self, node_id: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.id == node_id)
    }

    pub fn node_ids(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.id.clone()).collect()
    }

    /// Effective edges: declared ones, or the sequential default.
    pub fn effective_edges(&self) -> Vec<PlanEdge> {
        if !self.edges.is_empty() {
            return self.edges.clone();
        }
        self.nodes
            .windows(2)
            .map(|pair| PlanEdge {
                from: pair[0].id.clone(),
                to: pair[1].id.clone(),
            })
            .collect()
    }

    /// The last execution node in plan order, if any.
    pub fn last_execution_node(&self) -> Option<&PlanNode> {
        self.nodes
            .iter()
            .rev()
            .find(|n| n.kind == PlanNodeKind::Execution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn bare_node(id: &str, kind: PlanNodeKind) -> PlanNode {
        PlanNode {
            id: id.to_string(),
            kind,
            capability_id: None,
            capability_label: String::new(),
            capability_version: None,
            derived_capability: None,
            label: id.to_string(),
            bundle: NodeBundle::default(),
            contracts: NodeContracts::default(),
            facets: NodeFacets::default(),
            provenance: NodeProvenance::default(),
            rationale: vec![],
            routing: None,
            post_condition_guards: vec![],
            metadata: json!({}),
        }
    }

    #[test]
    fn test_effective_edges_default_sequential() {
        let plan = Plan {
            run_id: "r".to_string(),
            version: 1,
            created_at: chrono::Utc::now().to_rfc3339(),
            nodes: vec![
                bare_node("a", PlanNodeKind::Execution),
                bare_node("b", PlanNodeKind::Execution),
                bare_node("c", PlanNodeKind::Virtual),
            ],
            edges: vec![],
            metadata: json!({}),
        };

        let edges = plan.effective_edges();
        assert_eq!(edges.len(), 2);
        assert_eq!(edges[0].from, "a");
        assert_eq!(edges[1].to, "c");
    }

    #[test]
    fn test_declared_edges_win() {
        let plan = Plan {
            run_id: "r".to_string(),
            version: 1,
            created_at: chrono::Utc::now().to_rfc3339(),
            nodes: vec![
                bare_node("a", PlanNodeKind::Execution),
                bare_node("b", PlanNodeKind::Execution),
            ],
            edges: vec![PlanEdge {
                from: "b".to_string(),
                to: "a".to_string(),
            }],
            metadata: json!({}),
        };
        assert_eq!(plan.effective_edges()[0].from, "b");
    }

    #[test]
    fn test_last_execution_node_skips_virtual() {
        let plan = Plan {
            run_id: "r".to_string(),
            version: 1,
            created_at: chrono::Utc::now().to_rfc3339(),
            nodes: vec![
                bare_node("a", PlanNodeKind::Execution),
                bare_node("tail", PlanNodeKind::Virtual),
            ],
            edges: vec![],
            metadata: json!({}),
        };
        assert_eq!(plan.last_execution_node().unwrap().id, "a");
    }
}
