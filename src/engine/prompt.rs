//! Prompt composition for AI capability invocations.
//!
//! The prompt is assembled from the same sections the dispatch contract
//! names: capability and planner instructions, objective, merged inputs,
//! policies, completed-sibling outputs, the facet snapshot, relevant
//! feedback, HITL clarifications, planner rationale, the node's contracts
//! and the envelope's special instructions.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::context::RunContext;
use crate::models::{CapabilityRecord, PlanNode, TaskEnvelope};

use super::feedback::{FEEDBACK_FACET, normalize_feedback, relevant_feedback};

/// How many feedback entries a prompt carries at most.
const FEEDBACK_LIMIT: usize = 8;

/// Inputs to prompt composition for one node dispatch.
pub struct PromptArgs<'a> {
    pub envelope: &'a TaskEnvelope,
    pub node: &'a PlanNode,
    pub capability: &'a CapabilityRecord,
    pub merged_inputs: &'a BTreeMap<String, Value>,
    pub context: &'a RunContext,
    /// Completed sibling outputs in completion order, already cap-limited.
    pub sibling_outputs: &'a [(String, Value)],
    /// Summaries of prior post-condition failures for this node, if any.
    pub retry_context: &'a [String],
}

/// Compose the full dispatch prompt.
pub fn compose_prompt(args: &PromptArgs<'_>) -> String {
    let mut sections: Vec<String> = Vec::new();

    if let Some(instructions) = capability_instructions(args.capability) {
        sections.push(format!("## Capability Instructions\n{}", instructions));
    }
    if let Some(instructions) = &args.node.bundle.instructions {
        sections.push(format!("## Planner Instructions\n{}", instructions));
    }

    sections.push(format!("## Objective\n{}", args.envelope.objective));

    if !args.merged_inputs.is_empty() {
        sections.push(format!(
            "## Inputs\n```json\n{}\n```",
            pretty(&serde_json::to_value(args.merged_inputs).unwrap_or(Value::Null))
        ));
    }

    if !args.envelope.policies.runtime.is_empty() {
        sections.push(format!(
            "## Runtime Policies\n```json\n{}\n```",
            pretty(&serde_json::to_value(&args.envelope.policies.runtime).unwrap_or(Value::Null))
        ));
    }

    if !args.sibling_outputs.is_empty() {
        let rendered: Vec<String> = args
            .sibling_outputs
            .iter()
            .map(|(node_id, output)| format!("### {}\n```json\n{}\n```", node_id, pretty(output)))
            .collect();
        sections.push(format!("## Completed Steps\n{}", rendered.join("\n")));
    }

    let snapshot = args.context.snapshot_value();
    if let Some(facets) = snapshot.get("facets")
        && facets.as_object().map(|m| !m.is_empty()).unwrap_or(false)
    {
        sections.push(format!(
            "## Current Facts\n```json\n{}\n```",
            pretty(facets)
        ));
    }

    if let Some(feedback_value) = args.context.facet_value(FEEDBACK_FACET) {
        let entries = normalize_feedback(feedback_value);
        let relevant = relevant_feedback(&entries, &args.node.facets.output, FEEDBACK_LIMIT);
        if !relevant.is_empty() {
            sections.push(format!(
                "## Feedback To Address\n```json\n{}\n```",
                pretty(&serde_json::to_value(&relevant).unwrap_or(Value::Null))
            ));
        }
    }

    let clarifications = args.context.clarifications_for_node(&args.node.id);
    if !clarifications.is_empty() {
        let rendered: Vec<String> = clarifications
            .iter()
            .map(|c| {
                format!(
                    "- Q: {}\n  A: {}",
                    c.question,
                    c.answer.as_deref().unwrap_or("(unanswered)")
                )
            })
            .collect();
        sections.push(format!("## Clarifications\n{}", rendered.join("\n")));
    }

    if !args.node.rationale.is_empty() {
        sections.push(format!(
            "## Planner Rationale\n{}",
            args.node
                .rationale
                .iter()
                .map(|r| format!("- {}", r))
                .collect::<Vec<_>>()
                .join("\n")
        ));
    }

    if let Some(input_contract) = &args.node.contracts.input {
        sections.push(format!(
            "## Input Contract\n```json\n{}\n```",
            pretty(input_contract)
        ));
    }
    if let Some(output_contract) = &args.node.contracts.output {
        sections.push(format!(
            "## Output Contract\nReturn ONLY JSON matching this schema.\n```json\n{}\n```",
            pretty(output_contract)
        ));
    }

    if let Some(special) = &args.envelope.special_instructions {
        sections.push(format!("## Special Instructions\n{}", special));
    }

    if !args.retry_context.is_empty() {
        sections.push(format!(
            "## Previous Attempt Failed\nThe prior output violated these conditions; produce a corrected output.\n{}",
            args.retry_context
                .iter()
                .map(|line| format!("- {}", line))
                .collect::<Vec<_>>()
                .join("\n")
        ));
    }

    sections.join("\n\n")
}

fn capability_instructions(capability: &CapabilityRecord) -> Option<String> {
    capability
        .instruction_templates
        .as_ref()
        .and_then(|templates| {
            templates
                .get("app")
                .or_else(|| templates.get("default"))
                .and_then(Value::as_str)
                .map(String::from)
        })
        .or_else(|| {
            (!capability.summary.is_empty()).then(|| capability.summary.clone())
        })
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "null".to_string())
}
