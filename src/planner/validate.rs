//! Deterministic validation of planner drafts.
//!
//! These checks run on every draft before contract resolution; a single
//! diagnostic rejects the draft. Each check family has its own method and
//! `check_all` aggregates them.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::models::{CapabilityRecord, PlanNodeKind};

use super::service::{DraftNode, PlanDraft};

pub const CAPABILITY_NOT_REGISTERED: &str = "CAPABILITY_NOT_REGISTERED";
pub const NODE_MISSING_CAPABILITY: &str = "NODE_MISSING_CAPABILITY";
pub const FACET_NOT_DECLARED: &str = "FACET_NOT_DECLARED";
pub const ROUTING_MISSING: &str = "ROUTING_MISSING";
pub const ROUTING_CONDITION_INVALID: &str = "ROUTING_CONDITION_INVALID";
pub const ROUTING_TARGET_UNKNOWN: &str = "ROUTING_TARGET_UNKNOWN";
pub const DUPLICATE_NODE_ID: &str = "DUPLICATE_NODE_ID";
pub const EDGE_ENDPOINT_UNKNOWN: &str = "EDGE_ENDPOINT_UNKNOWN";
pub const PLAN_HAS_CYCLE: &str = "PLAN_HAS_CYCLE";
pub const EMPTY_PLAN: &str = "EMPTY_PLAN";

/// One reason a draft cannot be executed as proposed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlannerDiagnostic {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub message: String,
}

impl PlannerDiagnostic {
    fn new(code: &str, node_id: Option<&str>, message: String) -> Self {
        Self {
            code: code.to_string(),
            node_id: node_id.map(|s| s.to_string()),
            message,
        }
    }
}

/// Validates drafts against the registered capability set.
pub struct DraftValidator<'a> {
    capabilities: BTreeMap<&'a str, &'a CapabilityRecord>,
}

impl<'a> DraftValidator<'a> {
    pub fn new(active_capabilities: &'a [CapabilityRecord]) -> Self {
        Self {
            capabilities: active_capabilities
                .iter()
                .map(|c| (c.capability_id.as_str(), c))
                .collect(),
        }
    }

    /// Run every check on the draft.
    pub fn check_all(&self, draft: &PlanDraft) -> Vec<PlannerDiagnostic> {
        let mut diagnostics = Vec::new();

        if draft.nodes.is_empty() {
            diagnostics.push(PlannerDiagnostic::new(
                EMPTY_PLAN,
                None,
                "draft contains no nodes".to_string(),
            ));
            return diagnostics;
        }

        diagnostics.extend(self.check_duplicate_ids(draft));
        diagnostics.extend(self.check_capabilities(draft));
        diagnostics.extend(self.check_facet_declarations(draft));
        diagnostics.extend(self.check_routing(draft));
        diagnostics.extend(self.check_edges(draft));
        diagnostics.extend(self.check_cycles(draft));

        diagnostics
    }

    fn check_duplicate_ids(&self, draft: &PlanDraft) -> Vec<PlannerDiagnostic> {
        let mut seen = BTreeSet::new();
        let mut diagnostics = Vec::new();
        for node in &draft.nodes {
            if !seen.insert(node.id.as_str()) {
                diagnostics.push(PlannerDiagnostic::new(
                    DUPLICATE_NODE_ID,
                    Some(&node.id),
                    format!("node id '{}' appears more than once", node.id),
                ));
            }
        }
        diagnostics
    }

    fn check_capabilities(&self, draft: &PlanDraft) -> Vec<PlannerDiagnostic> {
        let mut diagnostics = Vec::new();
        for node in &draft.nodes {
            match (&node.capability_id, node.kind) {
                (Some(capability_id), _) => {
                    if !self.capabilities.contains_key(capability_id.as_str()) {
                        diagnostics.push(PlannerDiagnostic::new(
                            CAPABILITY_NOT_REGISTERED,
                            Some(&node.id),
                            format!(
                                "capability '{}' is not registered or not active",
                                capability_id
                            ),
                        ));
                    }
                }
                (None, PlanNodeKind::Execution) if node.derived_capability.is_none() => {
                    diagnostics.push(PlannerDiagnostic::new(
                        NODE_MISSING_CAPABILITY,
                        Some(&node.id),
                        "execution node names no capability".to_string(),
                    ));
                }
                _ => {}
            }
        }
        diagnostics
    }

    fn check_facet_declarations(&self, draft: &PlanDraft) -> Vec<PlannerDiagnostic> {
        let mut diagnostics = Vec::new();
        for node in &draft.nodes {
            let Some(capability) = node
                .capability_id
                .as_deref()
                .and_then(|id| self.capabilities.get(id))
            else {
                continue;
            };

            for (declared, allowed, side) in [
                (&node.input_facets, &capability.input_facets, "input"),
                (&node.output_facets, &capability.output_facets, "output"),
            ] {
                for facet in declared.iter() {
                    if !allowed.contains(facet) {
                        diagnostics.push(PlannerDiagnostic::new(
                            FACET_NOT_DECLARED,
                            Some(&node.id),
                            format!(
                                "{} facet '{}' is not declared by capability '{}'",
                                side, facet, capability.capability_id
                            ),
                        ));
                    }
                }
            }
        }
        diagnostics
    }

    fn check_routing(&self, draft: &PlanDraft) -> Vec<PlannerDiagnostic> {
        let node_ids: BTreeSet<&str> = draft.nodes.iter().map(|n| n.id.as_str()).collect();
        let mut diagnostics = Vec::new();

        for node in &draft.nodes {
            if node.kind != PlanNodeKind::Routing {
                continue;
            }
            let Some(routing) = &node.routing else {
                diagnostics.push(PlannerDiagnostic::new(
                    ROUTING_MISSING,
                    Some(&node.id),
                    "routing node carries no routes".to_string(),
                ));
                continue;
            };

            for route in &routing.routes {
                if let Err(err) = route.condition.ensure_compiled() {
                    diagnostics.push(PlannerDiagnostic::new(
                        ROUTING_CONDITION_INVALID,
                        Some(&node.id),
                        format!("route to '{}': {}", route.to, err),
                    ));
                }
                if !node_ids.contains(route.to.as_str()) {
                    diagnostics.push(PlannerDiagnostic::new(
                        ROUTING_TARGET_UNKNOWN,
                        Some(&node.id),
                        format!("route target '{}' is not a plan node", route.to),
                    ));
                }
            }
            if let Some(else_to) = &routing.else_to
                && !node_ids.contains(else_to.as_str())
            {
                diagnostics.push(PlannerDiagnostic::new(
                    ROUTING_TARGET_UNKNOWN,
                    Some(&node.id),
                    format!("else target '{}' is not a plan node", else_to),
                ));
            }
        }
        diagnostics
    }

    fn check_edges(&self, draft: &PlanDraft) -> Vec<PlannerDiagnostic> {
        let node_ids: BTreeSet<&str> = draft.nodes.iter().map(|n| n.id.as_str()).collect();
        let mut diagnostics = Vec::new();
        for edge in &draft.edges {
            for endpoint in [&edge.from, &edge.to] {
                if !node_ids.contains(endpoint.as_str()) {
                    diagnostics.push(PlannerDiagnostic::new(
                        EDGE_ENDPOINT_UNKNOWN,
                        None,
                        format!("edge endpoint '{}' is not a plan node", endpoint),
                    ));
                }
            }
        }
        diagnostics
    }

    fn check_cycles(&self, draft: &PlanDraft) -> Vec<PlannerDiagnostic> {
        if draft.edges.is_empty() {
            // Sequential default cannot cycle.
            return Vec::new();
        }
        let node_ids: Vec<&str> = draft.nodes.iter().map(|n| n.id.as_str()).collect();
        let id_set: BTreeSet<&str> = node_ids.iter().copied().collect();

        let mut degree: BTreeMap<&str, usize> = node_ids.iter().map(|id| (*id, 0)).collect();
        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for edge in &draft.edges {
            let (from, to) = (edge.from.as_str(), edge.to.as_str());
            if !id_set.contains(from) || !id_set.contains(to) {
                continue;
            }
            *degree.entry(to).or_default() += 1;
            dependents.entry(from).or_default().push(to);
        }

        let mut queue: VecDeque<&str> = node_ids
            .iter()
            .filter(|id| degree.get(**id) == Some(&0))
            .copied()
            .collect();
        let mut processed = 0usize;
        while let Some(current) = queue.pop_front() {
            processed += 1;
            for child in dependents.get(current).into_iter().flatten() {
                let entry = degree.get_mut(child).expect("child indexed");
                *entry -= 1;
                if *entry == 0 {
                    queue.push_back(child);
                }
            }
        }

        if processed != node_ids.len() {
            return vec![PlannerDiagnostic::new(
                PLAN_HAS_CYCLE,
                None,
                "draft edges form a cycle".to_string(),
            )];
        }
        Vec::new()
    }
}
