//! Task envelopes and runtime policies.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::conditions::{ConditionError, ConditionSpec, GoalCondition};

use super::capability::CapabilityContract;

/// Caller-submitted description of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEnvelope {
    /// What the run should achieve.
    pub objective: String,
    /// Initial facet values, keyed by facet name.
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,
    #[serde(default)]
    pub policies: PolicyBundle,
    /// Declarative contract for the final output.
    pub output_contract: CapabilityContract,
    /// Whole-run assertions checked after the plan finishes.
    #[serde(default, rename = "goal_condition", skip_serializing_if = "Vec::is_empty")]
    pub goal_condition: Vec<GoalCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub special_instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<EnvelopeConstraints>,
}

impl TaskEnvelope {
    /// Facet names declared by the output contract (facet mode only).
    pub fn output_facets(&self) -> Vec<String> {
        self.output_contract.facet_names()
    }

    pub fn resume_run_id(&self) -> Option<&str> {
        self.constraints
            .as_ref()
            .and_then(|c| c.resume_run_id.as_deref())
    }

    /// Thread id from constraints, falling back to `metadata.threadId`.
    pub fn thread_id(&self) -> Option<String> {
        if let Some(thread) = self
            .constraints
            .as_ref()
            .and_then(|c| c.thread_id.as_deref())
        {
            return Some(thread.to_string());
        }
        self.metadata
            .as_ref()
            .and_then(|m| m.get("threadId"))
            .and_then(Value::as_str)
            .map(|s| s.to_string())
    }

    /// Compile every DSL condition the envelope carries, in place.
    ///
    /// Runs at ingress so an invalid DSL is rejected before the run starts.
    pub fn normalize_conditions(&mut self) -> Result<(), ConditionError> {
        for policy in &mut self.policies.runtime {
            if let Some(condition) = &mut policy.trigger.condition {
                *condition = condition.ensure_compiled()?.into();
            }
        }
        for goal in &mut self.goal_condition {
            if let Some(condition) = &mut goal.condition {
                *condition = condition.ensure_compiled()?.into();
            }
        }
        Ok(())
    }
}

/// Opaque run constraints understood by the coordinator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeConstraints {
    /// Resume an existing paused run instead of starting a new one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_run_id: Option<String>,
    /// Conversation thread this run belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

/// Planner plus runtime policy sets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyBundle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planner: Option<PlannerPolicies>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub runtime: Vec<RuntimePolicy>,
}

/// Planner-facing directives and capability selection constraints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannerPolicies {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<SelectionPolicy>,
    /// Free-form planner directives (for example `requiresHitlApproval`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directives: Option<Value>,
}

impl PlannerPolicies {
    pub fn directive_flag(&self, name: &str) -> bool {
        self.directives
            .as_ref()
            .and_then(|d| d.get(name))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Capability pinning and exclusion lists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionPolicy {
    /// Capabilities the plan must include (pinned).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub require: Vec<String>,
    /// Soft exclusions; never pinned.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub avoid: Vec<String>,
    /// Hard exclusions; never pinned.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub forbid: Vec<String>,
}

/// A declarative `trigger -> action` rule evaluated during execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimePolicy {
    pub id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub trigger: PolicyTrigger,
    pub action: PolicyAction,
}

fn default_enabled() -> bool {
    true
}

/// When a runtime policy fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyTrigger {
    pub kind: TriggerKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<PolicySelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<ConditionSpec>,
    /// Retry bound for `onPostConditionFailed` triggers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TriggerKind {
    OnStart,
    OnNodeComplete,
    OnPostConditionFailed,
    Manual,
}

/// Narrows a trigger to specific nodes or capabilities.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicySelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_id: Option<String>,
}

impl PolicySelector {
    /// Whether this selector matches a node/capability pair. An empty
    /// selector matches everything.
    pub fn matches(&self, node_id: &str, capability_id: Option<&str>) -> bool {
        if let Some(wanted) = &self.node_id
            && wanted != node_id
        {
            return false;
        }
        if let Some(wanted) = &self.capability_id
            && Some(wanted.as_str()) != capability_id
        {
            return false;
        }
        true
    }
}

/// What a fired policy does.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PolicyAction {
    /// Discard the remaining plan and re-enter the planner.
    Replan,
    /// Jump execution back to a node, bounded by `max_attempts`.
    Goto {
        next: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_attempts: Option<u32>,
    },
    /// Raise a HITL request; the resolution picks one of the nested actions.
    Hitl {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        approve_action: Option<Box<PolicyAction>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reject_action: Option<Box<PolicyAction>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rationale: Option<String>,
    },
    /// Park the run until an operator resumes it.
    Pause {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Emit an event frame; control flow is unchanged.
    Emit {
        event: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    /// Fail the run.
    Fail {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal_envelope() -> TaskEnvelope {
        serde_json::from_value(json!({
            "objective": "Create LinkedIn post variants",
            "inputs": { "objectiveBrief": "Announce the launch" },
            "outputContract": { "mode": "facets", "facets": ["copyVariants"] }
        }))
        .expect("envelope parses")
    }

    #[test]
    fn test_envelope_parses_with_defaults() {
        let envelope = minimal_envelope();
        assert_eq!(envelope.objective, "Create LinkedIn post variants");
        assert_eq!(envelope.output_facets(), vec!["copyVariants".to_string()]);
        assert!(envelope.policies.runtime.is_empty());
        assert!(envelope.goal_condition.is_empty());
    }

    #[test]
    fn test_thread_id_from_metadata_fallback() {
        let mut envelope = minimal_envelope();
        assert_eq!(envelope.thread_id(), None);

        envelope.metadata = Some(json!({ "threadId": "t1" }));
        assert_eq!(envelope.thread_id(), Some("t1".to_string()));

        envelope.constraints = Some(EnvelopeConstraints {
            resume_run_id: None,
            thread_id: Some("t2".to_string()),
        });
        assert_eq!(envelope.thread_id(), Some("t2".to_string()));
    }

    #[test]
    fn test_policy_action_wire_form() {
        let action: PolicyAction = serde_json::from_value(json!({
            "kind": "goto",
            "next": "node-2",
            "maxAttempts": 2
        }))
        .unwrap();
        assert_eq!(
            action,
            PolicyAction::Goto {
                next: "node-2".to_string(),
                max_attempts: Some(2)
            }
        );

        let hitl: PolicyAction = serde_json::from_value(json!({
            "kind": "hitl",
            "approveAction": { "kind": "replan" },
            "rejectAction": { "kind": "fail", "message": "rejected" }
        }))
        .unwrap();
        assert!(matches!(hitl, PolicyAction::Hitl { .. }));
    }

    #[test]
    fn test_trigger_kind_wire_form() {
        assert_eq!(
            serde_json::to_value(TriggerKind::OnPostConditionFailed).unwrap(),
            json!("onPostConditionFailed")
        );
    }

    #[test]
    fn test_normalize_conditions_compiles_dsl() {
        let mut envelope = minimal_envelope();
        envelope.policies.runtime.push(RuntimePolicy {
            id: "p1".to_string(),
            enabled: true,
            trigger: PolicyTrigger {
                kind: TriggerKind::OnNodeComplete,
                selector: None,
                condition: Some(ConditionSpec::new("facets.qaFindings.score < 0.5")),
                max_retries: None,
            },
            action: PolicyAction::Replan,
        });

        envelope.normalize_conditions().unwrap();
        let compiled = envelope.policies.runtime[0]
            .trigger
            .condition
            .as_ref()
            .unwrap();
        assert!(compiled.json_logic.is_some());
    }

    #[test]
    fn test_normalize_conditions_rejects_bad_dsl() {
        let mut envelope = minimal_envelope();
        envelope.policies.runtime.push(RuntimePolicy {
            id: "p1".to_string(),
            enabled: true,
            trigger: PolicyTrigger {
                kind: TriggerKind::OnNodeComplete,
                selector: None,
                condition: Some(ConditionSpec::new("facets.planKnobs.hookIntensity <")),
                max_retries: None,
            },
            action: PolicyAction::Replan,
        });

        assert!(envelope.normalize_conditions().is_err());
    }

    #[test]
    fn test_selector_matching() {
        let selector = PolicySelector {
            node_id: None,
            capability_id: Some("contentGenerator".to_string()),
        };
        assert!(selector.matches("n1", Some("contentGenerator")));
        assert!(!selector.matches("n1", Some("other")));
        assert!(!selector.matches("n1", None));
        assert!(PolicySelector::default().matches("n1", None));
    }
}
