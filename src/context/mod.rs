//! The run context: authoritative facet store for a run.
//!
//! Every facet holds its current value plus an append-only provenance chain;
//! values are replaced, history never is. The context also records HITL
//! clarification exchanges so capability prompts can carry them.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::facets::FacetCatalog;
use crate::models::{CapabilityContract, PlanNode};

/// Output keys the planner attaches for bookkeeping; never facet values.
const PLANNER_METADATA_KEYS: &[&str] = &["plannerKind", "plannerVariantCount", "derivedCapability"];

/// One append-only history record for a facet update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProvenanceRecord {
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    pub timestamp: String,
}

impl ProvenanceRecord {
    pub fn now(node_id: &str, capability_id: Option<&str>, rationale: Option<&str>) -> Self {
        Self {
            node_id: node_id.to_string(),
            capability_id: capability_id.map(|s| s.to_string()),
            rationale: rationale.map(|s| s.to_string()),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// Live state of one facet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FacetEntry {
    pub value: Value,
    /// Appended on every update; never mutated in place.
    pub provenance: Vec<ProvenanceRecord>,
    pub updated_at: String,
}

/// A clarification question raised to a human, with its eventual answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HitlClarification {
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_id: Option<String>,
    pub question_id: String,
    pub question: String,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answered_at: Option<String>,
}

/// Serialized form of the context (`snapshot()` / `from_snapshot()`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunContextSnapshot {
    #[serde(default)]
    pub facets: BTreeMap<String, FacetEntry>,
    #[serde(default)]
    pub hitl_clarifications: Vec<HitlClarification>,
}

/// Authoritative facet store for one run.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    facets: BTreeMap<String, FacetEntry>,
    hitl_clarifications: Vec<HitlClarification>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the context from envelope inputs. Each seeded facet gets an
    /// `envelope` provenance record so the invariant holds from the start.
    pub fn from_envelope_inputs(inputs: &BTreeMap<String, Value>) -> Self {
        let mut context = Self::new();
        for (facet, value) in inputs {
            context.update_facet(
                facet,
                value.clone(),
                ProvenanceRecord::now("envelope", None, Some("caller-provided input")),
            );
        }
        context
    }

    pub fn facet_value(&self, facet: &str) -> Option<&Value> {
        self.facets.get(facet).map(|entry| &entry.value)
    }

    pub fn facet_entry(&self, facet: &str) -> Option<&FacetEntry> {
        self.facets.get(facet)
    }

    pub fn facet_names(&self) -> Vec<String> {
        self.facets.keys().cloned().collect()
    }

    /// Direct write with explicit provenance.
    pub fn update_facet(&mut self, facet: &str, value: Value, prov: ProvenanceRecord) {
        let timestamp = prov.timestamp.clone();
        match self.facets.get_mut(facet) {
            Some(entry) => {
                entry.value = value;
                entry.provenance.push(prov);
                entry.updated_at = timestamp;
            }
            None => {
                self.facets.insert(
                    facet.to_string(),
                    FacetEntry {
                        value,
                        provenance: vec![prov],
                        updated_at: timestamp,
                    },
                );
            }
        }
    }

    /// Apply a node's output: every key naming one of the node's declared
    /// output facets is assigned; planner bookkeeping keys are stripped.
    pub fn update_from_node(&mut self, node: &PlanNode, output: &Value) {
        let Some(object) = output.as_object() else {
            return;
        };
        for (key, value) in object {
            if PLANNER_METADATA_KEYS.contains(&key.as_str()) {
                continue;
            }
            if !node.produces_facet(key) {
                continue;
            }
            self.update_facet(
                key,
                value.clone(),
                ProvenanceRecord::now(
                    &node.id,
                    node.capability_id.as_deref(),
                    node.rationale.first().map(String::as_str),
                ),
            );
        }
    }

    pub fn record_clarification_question(
        &mut self,
        node_id: &str,
        capability_id: Option<&str>,
        question_id: &str,
        question: &str,
    ) {
        self.hitl_clarifications.push(HitlClarification {
            node_id: node_id.to_string(),
            capability_id: capability_id.map(|s| s.to_string()),
            question_id: question_id.to_string(),
            question: question.to_string(),
            created_at: Utc::now().to_rfc3339(),
            answer: None,
            answered_at: None,
        });
    }

    pub fn record_clarification_answer(&mut self, question_id: &str, answer: &str) {
        if let Some(entry) = self
            .hitl_clarifications
            .iter_mut()
            .find(|c| c.question_id == question_id)
        {
            entry.answer = Some(answer.to_string());
            entry.answered_at = Some(Utc::now().to_rfc3339());
        }
    }

    /// Clarification history for one node, question/answer pairs in order.
    pub fn clarifications_for_node(&self, node_id: &str) -> Vec<&HitlClarification> {
        self.hitl_clarifications
            .iter()
            .filter(|c| c.node_id == node_id)
            .collect()
    }

    /// Materialize the final output by walking the facets the output
    /// contract references and writing each current value at its canonical
    /// pointer. Returns `{}` when no target facet is known to the context.
    pub fn compose_final_output(
        &self,
        output_contract: &CapabilityContract,
        catalog: &FacetCatalog,
    ) -> Value {
        let target_facets: Vec<String> = match output_contract {
            CapabilityContract::Facets { facets } => facets.clone(),
            CapabilityContract::JsonSchema { schema, .. } => schema
                .get("properties")
                .and_then(Value::as_object)
                .map(|props| props.keys().cloned().collect())
                .unwrap_or_default(),
        };

        let mut composed = Value::Object(Map::new());
        for facet in &target_facets {
            let Some(entry) = self.facets.get(facet) else {
                continue;
            };
            let pointer = catalog
                .get(facet)
                .map(|def| def.pointer.clone())
                .unwrap_or_else(|| format!("/{}", facet));
            write_json_pointer(&mut composed, &pointer, entry.value.clone());
        }
        composed
    }

    /// Deep-immutable serialized view (`{ facets, hitlClarifications }`).
    pub fn snapshot(&self) -> RunContextSnapshot {
        RunContextSnapshot {
            facets: self.facets.clone(),
            hitl_clarifications: self.hitl_clarifications.clone(),
        }
    }

    /// Snapshot as a JSON value, the shape condition evaluation reads.
    pub fn snapshot_value(&self) -> Value {
        serde_json::to_value(self.snapshot()).unwrap_or(Value::Null)
    }

    /// Restore a context for resume.
    pub fn from_snapshot(snapshot: RunContextSnapshot) -> Self {
        Self {
            facets: snapshot.facets,
            hitl_clarifications: snapshot.hitl_clarifications,
        }
    }

    /// A copy of this context with `output` applied as if `node` completed.
    /// Post-conditions are evaluated against this projection.
    pub fn project_with_output(&self, node: &PlanNode, output: &Value) -> RunContext {
        let mut projected = self.clone();
        projected.update_from_node(node, output);
        projected
    }
}

/// Write `value` into `target` at a JSON pointer, creating intermediate
/// objects. Array segments are not synthesized; a non-object hop aborts the
/// write rather than clobbering sibling data.
pub fn write_json_pointer(target: &mut Value, pointer: &str, value: Value) {
    let segments: Vec<&str> = pointer.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        *target = value;
        return;
    }

    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    let mut current = target;
    for segment in &segments[..segments.len() - 1] {
        let object = current.as_object_mut().expect("object ensured above");
        let next = object
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !next.is_object() {
            return;
        }
        current = next;
    }
    if let Some(object) = current.as_object_mut() {
        object.insert(segments[segments.len() - 1].to_string(), value);
    }
}
