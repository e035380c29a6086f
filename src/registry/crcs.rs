//! Capability reachability computation (CRCS).
//!
//! Given an envelope and the active capability set, determine which
//! capabilities can participate in a valid plan. Forward reachability is
//! AND-over-inputs: a capability activates only once every required input
//! facet is producible. Backward reachability from the target facets needs
//! only one producer per facet. The intersection is the MRCS; pinned
//! capabilities (policy references, goal-condition producers) are annotated
//! on top of it.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::models::{
    AgentType, CapabilityRecord, GraphContext, PostConditionSpec, TaskEnvelope,
};

/// Reason a capability appears in the CRCS.
pub const REASON_PATH: &str = "path";
pub const REASON_POLICY_REFERENCE: &str = "policy_reference";
pub const REASON_GOAL_CONDITION: &str = "goal_condition";

/// One capability the planner may consider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrcsRow {
    pub capability_id: String,
    pub display_name: String,
    pub kind: AgentType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_facets: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_facets: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_conditions: Vec<PostConditionSpec>,
    pub reason_codes: Vec<String>,
    pub source: String,
}

/// Full reachability snapshot handed to the planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrcsSnapshot {
    pub rows: Vec<CrcsRow>,
    /// Row count before truncation.
    pub total_rows: usize,
    pub mrcs_size: usize,
    pub reason_counts: BTreeMap<String, usize>,
    pub row_cap: usize,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pinned_capability_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mrcs_capability_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_pinned_capability_ids: Vec<String>,
}

/// Inputs to the computation beyond the envelope itself.
#[derive(Debug, Clone, Default)]
pub struct CrcsOptions<'a> {
    /// Completed work from an interrupted run (mid-run replans).
    pub graph_context: Option<&'a GraphContext>,
    /// Extra facets the caller asserts are available.
    pub available_facet_hints: &'a [String],
    /// Row cap; defaults from config when `None`.
    pub max_rows: Option<usize>,
    /// Facets observed failing their goal conditions (replan after gate).
    pub goal_condition_failure_facets: &'a [String],
}

/// Compute the CRCS over the active capability set.
pub fn compute_crcs(
    envelope: &TaskEnvelope,
    capabilities: &[CapabilityRecord],
    options: &CrcsOptions<'_>,
    default_row_cap: usize,
) -> CrcsSnapshot {
    let row_cap = options.max_rows.unwrap_or(default_row_cap).max(1);

    // Facet indices across the active set.
    let mut facet_to_consumers: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    let mut facet_to_producers: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (index, capability) in capabilities.iter().enumerate() {
        for facet in &capability.input_facets {
            facet_to_consumers.entry(facet.as_str()).or_default().push(index);
        }
        for facet in &capability.output_facets {
            facet_to_producers.entry(facet.as_str()).or_default().push(index);
        }
    }

    // Start facets: envelope inputs, hints, and anything a completed node
    // already produced.
    let mut start_facets: BTreeSet<String> = envelope.inputs.keys().cloned().collect();
    start_facets.extend(options.available_facet_hints.iter().cloned());
    if let Some(graph) = options.graph_context {
        start_facets.extend(graph.facets.iter().cloned());
        for facets in graph.node_output_facets.values() {
            start_facets.extend(facets.iter().cloned());
        }
    }

    // Target facets: output contract plus goal-condition reads.
    let mut target_facets: BTreeSet<String> = output_contract_facets(envelope);
    for goal in &envelope.goal_condition {
        target_facets.insert(goal.facet.clone());
    }

    let forward = forward_reachable(capabilities, &facet_to_consumers, &start_facets);
    let backward = backward_reachable(capabilities, &facet_to_producers, &target_facets);
    let path_caps: BTreeSet<usize> = forward.intersection(&backward).copied().collect();

    // Pinned sources: planner `require`, runtime policy selectors, and
    // goal-condition facet producers. `avoid`/`forbid` never pin.
    let index_by_id: BTreeMap<&str, usize> = capabilities
        .iter()
        .enumerate()
        .map(|(i, c)| (c.capability_id.as_str(), i))
        .collect();

    let mut pinned_reasons: BTreeMap<usize, BTreeSet<&'static str>> = BTreeMap::new();
    let mut missing_pinned: Vec<String> = Vec::new();

    let pin_by_id = |id: &str,
                         reason: &'static str,
                         pinned: &mut BTreeMap<usize, BTreeSet<&'static str>>,
                         missing: &mut Vec<String>| {
        match index_by_id.get(id) {
            Some(index) => {
                pinned.entry(*index).or_default().insert(reason);
            }
            None => {
                if !missing.contains(&id.to_string()) {
                    missing.push(id.to_string());
                }
            }
        }
    };

    if let Some(selection) = envelope
        .policies
        .planner
        .as_ref()
        .and_then(|p| p.selection.as_ref())
    {
        for id in &selection.require {
            pin_by_id(id, REASON_POLICY_REFERENCE, &mut pinned_reasons, &mut missing_pinned);
        }
    }
    for policy in &envelope.policies.runtime {
        if let Some(capability_id) = policy
            .trigger
            .selector
            .as_ref()
            .and_then(|s| s.capability_id.as_deref())
        {
            pin_by_id(
                capability_id,
                REASON_POLICY_REFERENCE,
                &mut pinned_reasons,
                &mut missing_pinned,
            );
        }
    }

    let mut goal_facets: BTreeSet<String> = envelope
        .goal_condition
        .iter()
        .map(|g| g.facet.clone())
        .collect();
    goal_facets.extend(options.goal_condition_failure_facets.iter().cloned());
    for facet in &goal_facets {
        match facet_to_producers.get(facet.as_str()) {
            Some(producers) if !producers.is_empty() => {
                for index in producers {
                    pinned_reasons
                        .entry(*index)
                        .or_default()
                        .insert(REASON_GOAL_CONDITION);
                }
            }
            _ => {
                let marker = format!("facet:{}", facet);
                if !missing_pinned.contains(&marker) {
                    missing_pinned.push(marker);
                }
            }
        }
    }

    // Rows in original capability-list order: MRCS members plus pinned.
    let mut rows = Vec::new();
    for (index, capability) in capabilities.iter().enumerate() {
        let in_path = path_caps.contains(&index);
        let pinned = pinned_reasons.get(&index);
        if !in_path && pinned.is_none() {
            continue;
        }

        let mut reason_codes: Vec<String> = Vec::new();
        if in_path {
            reason_codes.push(REASON_PATH.to_string());
        }
        if let Some(reasons) = pinned {
            reason_codes.extend(reasons.iter().map(|r| r.to_string()));
        }

        rows.push(CrcsRow {
            capability_id: capability.capability_id.clone(),
            display_name: capability.display_name.clone(),
            kind: capability.agent_type,
            input_facets: capability.input_facets.clone(),
            output_facets: capability.output_facets.clone(),
            post_conditions: capability.post_conditions.clone(),
            reason_codes,
            source: "mrcs".to_string(),
        });
    }

    let total_rows = rows.len();
    let mut reason_counts: BTreeMap<String, usize> = BTreeMap::new();
    for row in &rows {
        for reason in &row.reason_codes {
            *reason_counts.entry(reason.clone()).or_default() += 1;
        }
    }

    let truncated = rows.len() > row_cap;
    if truncated {
        rows.truncate(row_cap);
    }

    let mrcs_capability_ids: Vec<String> = capabilities
        .iter()
        .enumerate()
        .filter(|(i, _)| path_caps.contains(i))
        .map(|(_, c)| c.capability_id.clone())
        .collect();
    let pinned_capability_ids: Vec<String> = capabilities
        .iter()
        .enumerate()
        .filter(|(i, _)| pinned_reasons.contains_key(i))
        .map(|(_, c)| c.capability_id.clone())
        .collect();

    CrcsSnapshot {
        rows,
        total_rows,
        mrcs_size: path_caps.len(),
        reason_counts,
        row_cap,
        truncated,
        pinned_capability_ids,
        mrcs_capability_ids,
        missing_pinned_capability_ids: missing_pinned,
    }
}

fn output_contract_facets(envelope: &TaskEnvelope) -> BTreeSet<String> {
    use crate::models::CapabilityContract;
    match &envelope.output_contract {
        CapabilityContract::Facets { facets } => facets.iter().cloned().collect(),
        CapabilityContract::JsonSchema { schema, .. } => schema
            .get("properties")
            .and_then(serde_json::Value::as_object)
            .map(|props| props.keys().cloned().collect())
            .unwrap_or_default(),
    }
}

/// AND-over-inputs forward pass with a remaining-inputs counter per
/// capability. Zero-input capabilities activate immediately.
fn forward_reachable(
    capabilities: &[CapabilityRecord],
    facet_to_consumers: &BTreeMap<&str, Vec<usize>>,
    start_facets: &BTreeSet<String>,
) -> BTreeSet<usize> {
    let mut reachable: BTreeSet<usize> = BTreeSet::new();
    let mut satisfied: Vec<BTreeSet<&str>> = vec![BTreeSet::new(); capabilities.len()];
    let mut available: BTreeSet<String> = BTreeSet::new();
    let mut queue: VecDeque<String> = VecDeque::new();

    let activate = |index: usize,
                        reachable: &mut BTreeSet<usize>,
                        available: &mut BTreeSet<String>,
                        queue: &mut VecDeque<String>| {
        if !reachable.insert(index) {
            return;
        }
        for produced in &capabilities[index].output_facets {
            if available.insert(produced.clone()) {
                queue.push_back(produced.clone());
            }
        }
    };

    for (index, capability) in capabilities.iter().enumerate() {
        if capability.input_facets.is_empty() {
            activate(index, &mut reachable, &mut available, &mut queue);
        }
    }
    for facet in start_facets {
        if available.insert(facet.clone()) {
            queue.push_back(facet.clone());
        }
    }

    while let Some(facet) = queue.pop_front() {
        let Some(consumers) = facet_to_consumers.get(facet.as_str()) else {
            continue;
        };
        for &index in consumers {
            if reachable.contains(&index) {
                continue;
            }
            let capability = &capabilities[index];
            let required: BTreeSet<&str> =
                capability.input_facets.iter().map(String::as_str).collect();
            if !required.contains(facet.as_str()) {
                continue;
            }
            satisfied[index].insert(
                capability
                    .input_facets
                    .iter()
                    .find(|f| f.as_str() == facet.as_str())
                    .expect("facet is required")
                    .as_str(),
            );
            if satisfied[index].len() == required.len() {
                activate(index, &mut reachable, &mut available, &mut queue);
            }
        }
    }

    reachable
}

/// Backward pass from the target facets; any producer keeps a facet
/// reachable, no AND requirement.
fn backward_reachable(
    capabilities: &[CapabilityRecord],
    facet_to_producers: &BTreeMap<&str, Vec<usize>>,
    target_facets: &BTreeSet<String>,
) -> BTreeSet<usize> {
    let mut reachable: BTreeSet<usize> = BTreeSet::new();
    let mut visited_facets: BTreeSet<String> = BTreeSet::new();
    let mut queue: VecDeque<String> = target_facets.iter().cloned().collect();
    visited_facets.extend(target_facets.iter().cloned());

    while let Some(facet) = queue.pop_front() {
        let Some(producers) = facet_to_producers.get(facet.as_str()) else {
            continue;
        };
        for &index in producers {
            if !reachable.insert(index) {
                continue;
            }
            for needed in &capabilities[index].input_facets {
                if visited_facets.insert(needed.clone()) {
                    queue.push_back(needed.clone());
                }
            }
        }
    }

    reachable
}
