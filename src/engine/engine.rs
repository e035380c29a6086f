//! The flex execution engine: drives a validated plan to a
//! contract-conforming output.
//!
//! Each external boundary (capability runtime, persistence, HITL) is an
//! awaited suspension point; at every pause the engine persists enough state
//! for cold-start resumption and returns without holding anything.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::conditions::{GoalCondition, GoalConditionResult, evaluate, evaluate_goal_conditions};
use crate::config::FlexConfig;
use crate::context::{RunContext, RunContextSnapshot};
use crate::hitl::{HitlRequestPayload, HitlService, RaiseOptions, RaiseOutcome};
use crate::models::{
    AgentType, CapabilityContract, CapabilityRecord, EventSink, FlexEvent, FlexEventKind,
    NodeStatus, PauseMode, PendingPolicyAction, PendingState, Plan, PlanNode, PlanNodeKind,
    PolicyAction, RunStatus, TaskEnvelope, TriggerKind,
};
use crate::persistence::{
    FlexRunPersistence, NodeUpdates, PlanSnapshotContext, schema_hash,
};
use crate::registry::CapabilityRegistry;

use super::feedback::{FEEDBACK_FACET, diff_resolutions, normalize_feedback};
use super::prompt::{PromptArgs, compose_prompt};
use super::runtime::{CapabilityInvocation, CapabilityRuntime};
use super::scheduler::Scheduler;
use super::validation::{SchemaViolation, ValidationScope, validate_against_schema};

/// Planner directive that gates run completion on operator approval.
pub const REQUIRES_HITL_APPROVAL_DIRECTIVE: &str = "requiresHitlApproval";
/// Synthetic policy id used for the approval gate's pending action.
pub const HITL_APPROVAL_POLICY_ID: &str = "hitl_approval";

/// State captured when execution is interrupted (replan, goal failure).
#[derive(Debug, Clone)]
pub struct InterruptState {
    pub pending: PendingState,
    pub context_snapshot: RunContextSnapshot,
}

/// Engine failures and control-flow interrupts.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{scope} validation failed with {} errors", errors.len())]
    Validation {
        scope: ValidationScope,
        node_id: Option<String>,
        errors: Vec<SchemaViolation>,
    },
    #[error("replan requested by {trigger}")]
    ReplanRequested {
        trigger: String,
        state: Box<InterruptState>,
    },
    #[error("goal conditions failed")]
    GoalConditionsFailed {
        failures: Vec<GoalConditionResult>,
        composed_output: Value,
        state: Box<InterruptState>,
    },
    #[error("run paused for HITL request {request_id}")]
    HitlPause { request_id: String },
    #[error("run paused{}", reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    RunPaused { reason: Option<String> },
    #[error("node {node_id} awaits human input")]
    AwaitingHumanInput { node_id: String },
    #[error("HITL request denied: {reason}")]
    HitlDenied { policy_id: String, reason: String },
    #[error("runtime policy '{policy_id}' failed the run: {message}")]
    PolicyFailure { policy_id: String, message: String },
    #[error("capability '{capability_id}' is not active")]
    CapabilityUnavailable { capability_id: String },
    #[error("capability runtime error on node {node_id}: {message}")]
    Runtime { node_id: String, message: String },
    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    /// Pause-type interrupts park the run instead of failing it.
    pub fn is_pause(&self) -> bool {
        matches!(
            self,
            EngineError::HitlPause { .. }
                | EngineError::RunPaused { .. }
                | EngineError::AwaitingHumanInput { .. }
        )
    }
}

/// Successful plan execution.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub output: Value,
    pub goal_condition_results: Vec<GoalConditionResult>,
}

/// Per-execution mutable state threaded through the node loop.
struct ExecState<'a> {
    envelope: &'a TaskEnvelope,
    plan: &'a Plan,
    context: &'a mut RunContext,
    pending: &'a mut PendingState,
    statuses: BTreeMap<String, NodeStatus>,
    post_results: BTreeMap<String, Vec<GoalConditionResult>>,
    assignments: BTreeMap<String, Value>,
    sink: &'a dyn EventSink,
}

impl ExecState<'_> {
    fn run_id(&self) -> &str {
        &self.plan.run_id
    }

    fn emit(&self, event: FlexEvent) {
        self.sink.emit(event.with_plan_version(self.plan.version));
    }

    /// The JSON-Logic data document conditions evaluate against.
    fn condition_data(&self, node: Option<&PlanNode>, output: Option<&Value>) -> Value {
        let mut data = json!({
            "run": { "id": self.plan.run_id, "version": self.plan.version },
            "metadata": { "runContextSnapshot": self.context.snapshot_value() }
        });
        if let Some(node) = node
            && let Some(object) = data.as_object_mut()
        {
            object.insert(
                "node".to_string(),
                json!({ "id": node.id, "capabilityId": node.capability_id }),
            );
        }
        if let Some(output) = output
            && let Some(object) = data.as_object_mut()
        {
            object.insert("output".to_string(), output.clone());
        }
        data
    }

    fn interrupt_state(&self) -> Box<InterruptState> {
        Box::new(InterruptState {
            pending: self.pending.clone(),
            context_snapshot: self.context.snapshot(),
        })
    }

    /// Snapshot every plan node with its current status and output.
    fn snapshot_nodes(&self) -> Vec<crate::models::PlanNodeSnapshot> {
        self.plan
            .nodes
            .iter()
            .map(|node| {
                let mut context_value = serde_json::to_value(node).unwrap_or(Value::Null);
                if let Some(assignment) = self.assignments.get(&node.id)
                    && let Some(bundle) = context_value
                        .get_mut("bundle")
                        .and_then(Value::as_object_mut)
                {
                    bundle.insert("assignment".to_string(), assignment.clone());
                }
                crate::models::PlanNodeSnapshot {
                    node_id: node.id.clone(),
                    capability_id: node.capability_id.clone(),
                    label: node.label.clone(),
                    status: self
                        .statuses
                        .get(&node.id)
                        .copied()
                        .unwrap_or(NodeStatus::Pending),
                    context: context_value,
                    output: self.pending.node_outputs.get(&node.id).cloned(),
                    error: None,
                    post_condition_results: self
                        .post_results
                        .get(&node.id)
                        .cloned()
                        .unwrap_or_default(),
                    started_at: None,
                    completed_at: None,
                }
            })
            .collect()
    }
}

/// The core runtime: executes plan graphs with contract validation, policy
/// dispatch, post-condition retries and HITL/human pausing.
pub struct FlexExecutionEngine {
    registry: Arc<CapabilityRegistry>,
    persistence: Arc<dyn FlexRunPersistence>,
    hitl: Arc<dyn HitlService>,
    runtime: Arc<dyn CapabilityRuntime>,
    config: FlexConfig,
}

impl FlexExecutionEngine {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        persistence: Arc<dyn FlexRunPersistence>,
        hitl: Arc<dyn HitlService>,
        runtime: Arc<dyn CapabilityRuntime>,
        config: FlexConfig,
    ) -> Self {
        Self {
            registry,
            persistence,
            hitl,
            runtime,
            config,
        }
    }

    /// Execute the plan from its current pending state to completion or the
    /// next interrupt.
    pub async fn execute(
        &self,
        envelope: &TaskEnvelope,
        plan: &Plan,
        context: &mut RunContext,
        pending: &mut PendingState,
        sink: &dyn EventSink,
    ) -> Result<ExecutionOutcome, EngineError> {
        let mut scheduler = Scheduler::new(
            plan,
            &pending.completed_node_ids,
            &pending.routing_selections,
        )
        .map_err(|err| EngineError::Internal(err.to_string()))?;

        let fresh_start = pending.completed_node_ids.is_empty();
        let mut state = ExecState {
            envelope,
            plan,
            context,
            pending,
            statuses: BTreeMap::new(),
            post_results: BTreeMap::new(),
            assignments: BTreeMap::new(),
            sink,
        };
        for completed in &state.pending.completed_node_ids.clone() {
            state.statuses.insert(completed.clone(), NodeStatus::Completed);
        }

        if fresh_start {
            self.fire_start_policies(&mut state, &mut scheduler).await?;
        }

        while let Some(node_id) = scheduler.next() {
            let node = plan
                .node(&node_id)
                .ok_or_else(|| EngineError::Internal(format!("node '{}' vanished", node_id)))?;
            self.run_node(&mut state, &mut scheduler, node).await?;
        }

        self.finalize(&mut state).await
    }

    // ========================================================================
    // Node dispatch
    // ========================================================================

    async fn run_node(
        &self,
        state: &mut ExecState<'_>,
        scheduler: &mut Scheduler,
        node: &PlanNode,
    ) -> Result<(), EngineError> {
        debug!(run_id = state.run_id(), node_id = %node.id, kind = ?node.kind, "dispatching node");
        state.statuses.insert(node.id.clone(), NodeStatus::Running);
        self.persistence
            .mark_node(
                state.run_id(),
                &node.id,
                NodeUpdates {
                    status: Some(NodeStatus::Running),
                    capability_id: node.capability_id.clone(),
                    label: Some(node.label.clone()),
                    context: serde_json::to_value(node).ok(),
                    started_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await;
        state.emit(
            FlexEvent::new(FlexEventKind::NodeStart, state.run_id())
                .with_node(&node.id)
                .with_provenance(node.provenance.output.clone())
                .with_payload(json!({ "kind": node.kind, "label": node.label })),
        );

        let dispatched = match node.kind {
            PlanNodeKind::Virtual => Ok(None),
            PlanNodeKind::Routing => self.run_routing(state, scheduler, node).map(Some),
            PlanNodeKind::Execution | PlanNodeKind::Validation => {
                self.run_capability_node(state, node).await
            }
        };

        match dispatched {
            Ok(output) => {
                let output = match output {
                    Some(value)
                        if node.kind == PlanNodeKind::Execution
                            && !node.post_condition_guards.is_empty() =>
                    {
                        Some(self.enforce_post_conditions(state, node, value).await?)
                    }
                    other => other,
                };

                if let Some(value) = &output {
                    self.emit_feedback_resolutions(state, node, value);
                    state.context.update_from_node(node, value);
                    state
                        .pending
                        .node_outputs
                        .insert(node.id.clone(), value.clone());
                }

                state.statuses.insert(node.id.clone(), NodeStatus::Completed);
                state.pending.completed_node_ids.push(node.id.clone());
                scheduler.mark_completed(&node.id);
                self.persistence
                    .mark_node(
                        state.run_id(),
                        &node.id,
                        NodeUpdates {
                            status: Some(NodeStatus::Completed),
                            output: output.clone(),
                            completed_at: Some(Utc::now()),
                            ..Default::default()
                        },
                    )
                    .await;
                state.emit(
                    FlexEvent::new(FlexEventKind::NodeComplete, state.run_id())
                        .with_node(&node.id)
                        .with_provenance(node.provenance.output.clone())
                        .with_payload(json!({ "hasOutput": output.is_some() })),
                );

                self.fire_node_complete_policies(state, scheduler, node, output.as_ref())
                    .await
            }
            Err(err) if err.is_pause() => Err(err),
            Err(err) => {
                state.statuses.insert(node.id.clone(), NodeStatus::Error);
                self.persistence
                    .mark_node(
                        state.run_id(),
                        &node.id,
                        NodeUpdates {
                            status: Some(NodeStatus::Error),
                            error: Some(json!({ "message": err.to_string() })),
                            completed_at: Some(Utc::now()),
                            ..Default::default()
                        },
                    )
                    .await;
                state.emit(
                    FlexEvent::new(FlexEventKind::NodeError, state.run_id())
                        .with_node(&node.id)
                        .with_payload(json!({ "message": err.to_string() })),
                );
                Err(err)
            }
        }
    }

    /// Routing nodes evaluate their routes in order; the first match wins,
    /// `elseTo` catches the rest, and no match at all forces a replan.
    fn run_routing(
        &self,
        state: &mut ExecState<'_>,
        scheduler: &mut Scheduler,
        node: &PlanNode,
    ) -> Result<Value, EngineError> {
        let routing = node.routing.as_ref().ok_or_else(|| {
            EngineError::Internal(format!("routing node '{}' has no routes", node.id))
        })?;
        let data = state.condition_data(Some(node), None);

        let mut traces = Vec::new();
        let mut selected: Option<(String, &'static str)> = None;
        for route in &routing.routes {
            let compiled = match route.condition.ensure_compiled() {
                Ok(compiled) => compiled,
                Err(err) => {
                    traces.push(json!({
                        "to": route.to,
                        "error": err.to_string(),
                        "satisfied": false
                    }));
                    continue;
                }
            };
            let outcome = evaluate(&compiled.json_logic, &data);
            traces.push(json!({
                "to": route.to,
                "dsl": compiled.canonical_dsl,
                "satisfied": outcome.satisfied(),
                "error": outcome.error,
            }));
            if outcome.satisfied() {
                selected = Some((route.to.clone(), "match"));
                break;
            }
        }
        if selected.is_none()
            && let Some(else_to) = &routing.else_to
        {
            selected = Some((else_to.clone(), "else"));
        }

        let Some((target, resolution)) = selected else {
            state.emit(
                FlexEvent::new(FlexEventKind::Log, state.run_id())
                    .with_node(&node.id)
                    .with_payload(json!({ "message": "routing_no_match", "traces": traces })),
            );
            return Err(EngineError::ReplanRequested {
                trigger: "routing_no_match".to_string(),
                state: state.interrupt_state(),
            });
        };

        scheduler.mark_conditional_release(&node.id, std::slice::from_ref(&target));
        state
            .pending
            .routing_selections
            .insert(node.id.clone(), vec![target.clone()]);
        state.emit(
            FlexEvent::new(FlexEventKind::Log, state.run_id())
                .with_node(&node.id)
                .with_payload(json!({ "message": format!("routing_selected:{}", target) })),
        );

        Ok(json!({
            "routingResult": {
                "selectedTarget": target,
                "resolution": resolution,
                "traces": traces,
            }
        }))
    }

    async fn run_capability_node(
        &self,
        state: &mut ExecState<'_>,
        node: &PlanNode,
    ) -> Result<Option<Value>, EngineError> {
        let Some(capability_id) = node.capability_id.as_deref() else {
            // Planner-derived capabilities dispatch to the runtime with a
            // synthetic record; a bare validation node gates on contracts
            // only.
            if node.kind == PlanNodeKind::Execution && node.derived_capability.is_some() {
                let capability = derived_capability_record(node);
                return self
                    .invoke_ai_capability(state, node, &capability, &[])
                    .await
                    .map(Some);
            }
            return Ok(None);
        };
        let capability = self
            .registry
            .get_capability_by_id(capability_id)
            .await
            .filter(|c| c.is_active())
            .ok_or_else(|| EngineError::CapabilityUnavailable {
                capability_id: capability_id.to_string(),
            })?;

        match capability.agent_type {
            AgentType::Ai => self
                .invoke_ai_capability(state, node, &capability, &[])
                .await
                .map(Some),
            AgentType::Human => self.park_human_node(state, node, &capability).await,
        }
    }

    /// Merge pinned literals with run-context values for the declared input
    /// facets; literals win.
    fn merge_inputs(state: &ExecState<'_>, node: &PlanNode) -> BTreeMap<String, Value> {
        let mut merged: BTreeMap<String, Value> = BTreeMap::new();
        for facet in &node.facets.input {
            if let Some(value) = state.context.facet_value(facet) {
                merged.insert(facet.clone(), value.clone());
            }
        }
        for (key, value) in &node.bundle.inputs {
            merged.insert(key.clone(), value.clone());
        }
        merged
    }

    async fn invoke_ai_capability(
        &self,
        state: &mut ExecState<'_>,
        node: &PlanNode,
        capability: &CapabilityRecord,
        retry_context: &[String],
    ) -> Result<Value, EngineError> {
        let merged_inputs = Self::merge_inputs(state, node);

        if node.kind == PlanNodeKind::Execution
            && let Some(input_contract) = &node.contracts.input
        {
            let inputs_value = serde_json::to_value(&merged_inputs).unwrap_or(Value::Null);
            if let Err(errors) = validate_against_schema(input_contract, &inputs_value) {
                return Err(self.validation_failure(
                    state,
                    ValidationScope::CapabilityInput,
                    Some(&node.id),
                    errors,
                ));
            }
        }

        let sibling_outputs: Vec<(String, Value)> = state
            .pending
            .completed_node_ids
            .iter()
            .filter_map(|id| {
                state
                    .pending
                    .node_outputs
                    .get(id)
                    .map(|output| (id.clone(), output.clone()))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .take(self.config.prompt_sibling_cap)
            .rev()
            .collect();

        let prompt = compose_prompt(&PromptArgs {
            envelope: state.envelope,
            node,
            capability,
            merged_inputs: &merged_inputs,
            context: &*state.context,
            sibling_outputs: &sibling_outputs,
            retry_context,
        });

        let invocation = CapabilityInvocation {
            run_id: state.run_id().to_string(),
            node_id: node.id.clone(),
            capability: capability.clone(),
            prompt,
            inputs: merged_inputs,
            output_schema: node.contracts.output.clone(),
        };
        let output = self
            .runtime
            .invoke(&invocation)
            .await
            .map_err(|err| EngineError::Runtime {
                node_id: node.id.clone(),
                message: err.message,
            })?;

        if let Some(output_contract) = &node.contracts.output
            && let Err(errors) = validate_against_schema(output_contract, &output)
        {
            return Err(self.validation_failure(
                state,
                ValidationScope::CapabilityOutput,
                Some(&node.id),
                errors,
            ));
        }

        Ok(output)
    }

    /// Park an execution node on a human: attach the assignment payload,
    /// persist a pause snapshot and surface `awaiting_human`.
    async fn park_human_node(
        &self,
        state: &mut ExecState<'_>,
        node: &PlanNode,
        capability: &CapabilityRecord,
    ) -> Result<Option<Value>, EngineError> {
        let defaults = capability.assignment_defaults.clone().unwrap_or_default();
        let merged_inputs = Self::merge_inputs(state, node);
        let instructions = capability
            .instruction_templates
            .as_ref()
            .and_then(|t| t.get("app"))
            .and_then(Value::as_str)
            .map(String::from)
            .or_else(|| node.bundle.instructions.clone());
        let due_at = defaults
            .timeout_seconds
            .map(|secs| (Utc::now() + chrono::Duration::seconds(secs as i64)).to_rfc3339());

        let assignment = json!({
            "assignmentId": uuid::Uuid::new_v4().to_string(),
            "role": defaults.role,
            "assignedTo": Value::Null,
            "dueAt": due_at,
            "priority": "normal",
            "notifyChannels": defaults.notify_channels,
            "timeoutSeconds": defaults.timeout_seconds,
            "maxNotifications": defaults.max_notifications,
            "instructions": instructions,
            "metadata": {
                "currentInputs": merged_inputs,
                "runContextSnapshot": state.context.snapshot_value(),
            },
            "facets": node.facets,
            "contracts": node.contracts,
            "facetProvenance": node.provenance,
        });

        state.assignments.insert(node.id.clone(), assignment.clone());
        state
            .statuses
            .insert(node.id.clone(), NodeStatus::AwaitingHuman);

        let mut node_context = serde_json::to_value(node).unwrap_or(Value::Null);
        if let Some(bundle) = node_context.get_mut("bundle").and_then(Value::as_object_mut) {
            bundle.insert("assignment".to_string(), assignment.clone());
        }
        self.persistence
            .mark_node(
                state.run_id(),
                &node.id,
                NodeUpdates {
                    status: Some(NodeStatus::AwaitingHuman),
                    context: Some(node_context),
                    ..Default::default()
                },
            )
            .await;

        self.persist_pause_snapshot(state, PauseMode::Pause).await;
        self.persistence
            .update_status(state.run_id(), RunStatus::AwaitingHuman)
            .await;
        state.emit(
            FlexEvent::new(FlexEventKind::Log, state.run_id())
                .with_node(&node.id)
                .with_payload(json!({
                    "message": "human_task_assigned",
                    "assignmentId": assignment["assignmentId"],
                    "role": assignment["role"],
                })),
        );
        info!(run_id = state.run_id(), node_id = %node.id, "run awaits human input");

        Err(EngineError::AwaitingHumanInput {
            node_id: node.id.clone(),
        })
    }

    // ========================================================================
    // Post-conditions
    // ========================================================================

    /// Evaluate the capability's post-conditions against the projected run
    /// context; retry the capability with a failure summary until the retry
    /// bound, then dispatch the applicable policy action.
    async fn enforce_post_conditions(
        &self,
        state: &mut ExecState<'_>,
        node: &PlanNode,
        mut output: Value,
    ) -> Result<Value, EngineError> {
        loop {
            let goals: Vec<GoalCondition> = node
                .post_condition_guards
                .iter()
                .map(|guard| GoalCondition {
                    facet: guard.facet.clone(),
                    path: guard.path.clone(),
                    condition: Some(guard.condition.clone()),
                })
                .collect();
            let projected = state.context.project_with_output(node, &output);
            let results = evaluate_goal_conditions(
                &goals,
                &projected.snapshot_value(),
                state.run_id(),
                state.plan.version,
            );
            let failures: Vec<GoalConditionResult> = results
                .iter()
                .filter(|r| !r.satisfied || r.error.is_some())
                .cloned()
                .collect();

            state.post_results.insert(node.id.clone(), results.clone());
            self.persistence
                .mark_node(
                    state.run_id(),
                    &node.id,
                    NodeUpdates {
                        post_condition_results: Some(results),
                        ..Default::default()
                    },
                )
                .await;

            if failures.is_empty() {
                return Ok(output);
            }

            let policy = state.envelope.policies.runtime.iter().find(|p| {
                p.enabled
                    && p.trigger.kind == TriggerKind::OnPostConditionFailed
                    && p.trigger
                        .selector
                        .as_ref()
                        .map(|s| s.matches(&node.id, node.capability_id.as_deref()))
                        .unwrap_or(true)
            });
            let max_retries = policy
                .and_then(|p| p.trigger.max_retries)
                .unwrap_or(self.config.post_condition_max_retries);

            let attempts = state
                .pending
                .post_condition_attempts
                .entry(node.id.clone())
                .or_insert(0);
            if *attempts < max_retries {
                *attempts += 1;
                let attempt = *attempts;
                warn!(
                    run_id = state.run_id(),
                    node_id = %node.id,
                    attempt,
                    "post-conditions failed, retrying capability"
                );
                state.emit(
                    FlexEvent::new(FlexEventKind::Log, state.run_id())
                        .with_node(&node.id)
                        .with_payload(json!({
                            "message": "post_condition_retry",
                            "attempt": attempt,
                            "failures": &failures,
                        })),
                );

                let retry_context: Vec<String> = failures
                    .iter()
                    .map(|f| match &f.error {
                        Some(error) => format!("{}.{}: {}", f.facet, f.path, error),
                        None => format!(
                            "{}.{} is not satisfied (observed {})",
                            f.facet,
                            f.path,
                            f.observed_value
                                .as_ref()
                                .map(|v| v.to_string())
                                .unwrap_or_else(|| "null".to_string())
                        ),
                    })
                    .collect();

                let capability = self
                    .registry
                    .get_capability_by_id(node.capability_id.as_deref().unwrap_or_default())
                    .await
                    .filter(|c| c.is_active())
                    .ok_or_else(|| EngineError::CapabilityUnavailable {
                        capability_id: node.capability_id.clone().unwrap_or_default(),
                    })?;
                output = self
                    .invoke_ai_capability(state, node, &capability, &retry_context)
                    .await?;
                continue;
            }

            // Retries exhausted: dispatch the policy action, defaulting to
            // failing the run.
            let policy_id = policy
                .map(|p| p.id.clone())
                .unwrap_or_else(|| "post_condition".to_string());
            let action = policy.map(|p| p.action.clone()).unwrap_or(PolicyAction::Fail {
                message: Some(format!(
                    "post-conditions failed after {} retries",
                    max_retries
                )),
            });
            if policy.is_some() {
                state.emit(
                    FlexEvent::new(FlexEventKind::PolicyTriggered, state.run_id())
                        .with_node(&node.id)
                        .with_payload(json!({
                            "policyId": &policy_id,
                            "trigger": "onPostConditionFailed",
                            "failures": &failures,
                        })),
                );
            }
            // `goto` and `emit` cannot absolve a failed post-condition, so
            // anything non-interrupting falls through to a policy failure.
            return match self
                .apply_policy_action(state, None, &policy_id, &action, Some(&node.id))
                .await
            {
                Ok(()) => Err(EngineError::PolicyFailure {
                    policy_id,
                    message: "post-conditions failed".to_string(),
                }),
                Err(err) => Err(err),
            };
        }
    }

    // ========================================================================
    // Runtime policies
    // ========================================================================

    async fn fire_start_policies(
        &self,
        state: &mut ExecState<'_>,
        scheduler: &mut Scheduler,
    ) -> Result<(), EngineError> {
        let policies: Vec<_> = state
            .envelope
            .policies
            .runtime
            .iter()
            .filter(|p| p.enabled && p.trigger.kind == TriggerKind::OnStart)
            .cloned()
            .collect();
        for policy in policies {
            // A start policy that already fired before a pause (tracked via
            // its attempt counter) must not refire on resume.
            if matches!(policy.action, PolicyAction::Hitl { .. })
                && state.pending.policy_attempts.contains_key(&policy.id)
            {
                continue;
            }
            state.emit(
                FlexEvent::new(FlexEventKind::PolicyTriggered, state.run_id())
                    .with_payload(json!({ "policyId": &policy.id, "trigger": "onStart" })),
            );
            self.apply_policy_action(state, Some(&mut *scheduler), &policy.id, &policy.action, None)
                .await?;
        }
        Ok(())
    }

    async fn fire_node_complete_policies(
        &self,
        state: &mut ExecState<'_>,
        scheduler: &mut Scheduler,
        node: &PlanNode,
        output: Option<&Value>,
    ) -> Result<(), EngineError> {
        let policies: Vec<_> = state
            .envelope
            .policies
            .runtime
            .iter()
            .filter(|p| {
                p.enabled
                    && p.trigger.kind == TriggerKind::OnNodeComplete
                    && p.trigger
                        .selector
                        .as_ref()
                        .map(|s| s.matches(&node.id, node.capability_id.as_deref()))
                        .unwrap_or(true)
            })
            .cloned()
            .collect();

        for policy in policies {
            if let Some(condition) = &policy.trigger.condition {
                let compiled = condition.ensure_compiled().map_err(|err| {
                    EngineError::Internal(format!("policy '{}' condition: {}", policy.id, err))
                })?;
                let data = state.condition_data(Some(node), output);
                if !evaluate(&compiled.json_logic, &data).satisfied() {
                    continue;
                }
            }
            state.emit(
                FlexEvent::new(FlexEventKind::PolicyTriggered, state.run_id())
                    .with_node(&node.id)
                    .with_payload(json!({ "policyId": &policy.id, "trigger": "onNodeComplete" })),
            );
            self.apply_policy_action(
                state,
                Some(&mut *scheduler),
                &policy.id,
                &policy.action,
                Some(&node.id),
            )
            .await?;
        }
        Ok(())
    }

    /// Dispatch one policy action. `Ok(())` means execution continues.
    async fn apply_policy_action(
        &self,
        state: &mut ExecState<'_>,
        scheduler: Option<&mut Scheduler>,
        policy_id: &str,
        action: &PolicyAction,
        node_id: Option<&str>,
    ) -> Result<(), EngineError> {
        match action {
            PolicyAction::Replan => Err(EngineError::ReplanRequested {
                trigger: policy_id.to_string(),
                state: state.interrupt_state(),
            }),
            PolicyAction::Goto { next, max_attempts } => {
                if state.plan.node(next).is_none() {
                    state.emit(
                        FlexEvent::new(FlexEventKind::Log, state.run_id()).with_payload(json!({
                            "message": "runtime_policy_goto_missing_node",
                            "policyId": policy_id,
                            "next": next,
                        })),
                    );
                    return Ok(());
                }
                let bound = max_attempts.unwrap_or(1);
                let attempts = state
                    .pending
                    .policy_attempts
                    .entry(policy_id.to_string())
                    .or_insert(0);
                if *attempts >= bound {
                    return Err(EngineError::PolicyFailure {
                        policy_id: policy_id.to_string(),
                        message: format!("goto attempts exhausted ({} of {})", attempts, bound),
                    });
                }
                *attempts += 1;

                let Some(scheduler) = scheduler else {
                    return Err(EngineError::Internal(
                        "goto action outside the scheduling loop".to_string(),
                    ));
                };
                let reset = scheduler.reset_from_node(next);
                state
                    .pending
                    .completed_node_ids
                    .retain(|id| !reset.contains(id));
                for id in &reset {
                    state.pending.node_outputs.remove(id);
                    state.pending.routing_selections.remove(id);
                    state.statuses.insert(id.clone(), NodeStatus::Pending);
                }
                state.emit(
                    FlexEvent::new(FlexEventKind::PolicyUpdate, state.run_id()).with_payload(
                        json!({
                            "policyId": policy_id,
                            "action": "goto",
                            "next": next,
                            "resetNodeIds": reset,
                        }),
                    ),
                );
                Ok(())
            }
            PolicyAction::Pause { reason } => {
                self.persist_pause_snapshot(state, PauseMode::Pause).await;
                self.persistence
                    .update_status(state.run_id(), RunStatus::AwaitingHitl)
                    .await;
                state.emit(
                    FlexEvent::new(FlexEventKind::PolicyUpdate, state.run_id()).with_payload(
                        json!({
                            "policyId": policy_id,
                            "action": "pause",
                            "reason": reason,
                        }),
                    ),
                );
                Err(EngineError::RunPaused {
                    reason: reason.clone(),
                })
            }
            PolicyAction::Hitl {
                approve_action,
                reject_action,
                rationale,
            } => {
                self.raise_hitl_pause(
                    state,
                    policy_id,
                    approve_action.as_deref(),
                    reject_action.as_deref(),
                    rationale.as_deref(),
                    node_id,
                )
                .await
            }
            PolicyAction::Emit { event, payload } => {
                state.emit(
                    FlexEvent::new(FlexEventKind::PolicyUpdate, state.run_id()).with_payload(
                        json!({
                            "policyId": policy_id,
                            "action": "emit",
                            "event": event,
                            "payload": payload,
                        }),
                    ),
                );
                state.emit(
                    FlexEvent::new(FlexEventKind::Log, state.run_id()).with_payload(json!({
                        "message": event,
                        "payload": payload,
                    })),
                );
                Ok(())
            }
            PolicyAction::Fail { message } => Err(EngineError::PolicyFailure {
                policy_id: policy_id.to_string(),
                message: message
                    .clone()
                    .unwrap_or_else(|| "policy failed the run".to_string()),
            }),
        }
    }

    async fn raise_hitl_pause(
        &self,
        state: &mut ExecState<'_>,
        policy_id: &str,
        approve_action: Option<&PolicyAction>,
        reject_action: Option<&PolicyAction>,
        rationale: Option<&str>,
        node_id: Option<&str>,
    ) -> Result<(), EngineError> {
        // The pausing node: the current node if the policy fired on one,
        // else the plan's terminal node.
        let pause_node = node_id
            .map(|s| s.to_string())
            .or_else(|| state.plan.nodes.last().map(|n| n.id.clone()));

        let outcome = self
            .hitl
            .raise_request(
                HitlRequestPayload {
                    run_id: state.run_id().to_string(),
                    policy_id: Some(policy_id.to_string()),
                    question: rationale
                        .map(|r| r.to_string())
                        .unwrap_or_else(|| "Approve continuing this run?".to_string()),
                    rationale: rationale.map(|r| r.to_string()),
                },
                RaiseOptions {
                    pending_node_id: pause_node.clone(),
                    operator_prompt: None,
                    contract_summary: None,
                    on_request: None,
                    on_denied: None,
                },
            )
            .await;

        match outcome {
            RaiseOutcome::Denied { reason } => Err(EngineError::HitlDenied {
                policy_id: policy_id.to_string(),
                reason,
            }),
            RaiseOutcome::Pending(request) => {
                *state
                    .pending
                    .policy_attempts
                    .entry(policy_id.to_string())
                    .or_insert(0) += 1;
                state.pending.policy_actions.push(PendingPolicyAction {
                    policy_id: policy_id.to_string(),
                    node_id: pause_node.clone().unwrap_or_default(),
                    request_id: request.request_id.clone(),
                    approve_action: approve_action.cloned(),
                    reject_action: reject_action.cloned(),
                });
                if let Some(pause_node) = &pause_node {
                    state
                        .statuses
                        .insert(pause_node.clone(), NodeStatus::AwaitingHitl);
                    self.persistence
                        .mark_node(
                            state.run_id(),
                            pause_node,
                            NodeUpdates {
                                status: Some(NodeStatus::AwaitingHitl),
                                ..Default::default()
                            },
                        )
                        .await;
                }
                self.persist_pause_snapshot(state, PauseMode::Hitl).await;
                self.persistence
                    .update_status(state.run_id(), RunStatus::AwaitingHitl)
                    .await;
                state.emit(
                    FlexEvent::new(FlexEventKind::HitlRequest, state.run_id())
                        .with_payload(json!({
                            "requestId": &request.request_id,
                            "policyId": policy_id,
                            "question": &request.question,
                            "nodeId": &pause_node,
                        })),
                );
                info!(
                    run_id = state.run_id(),
                    request_id = %request.request_id,
                    "run paused for HITL"
                );
                Err(EngineError::HitlPause {
                    request_id: request.request_id,
                })
            }
        }
    }

    // ========================================================================
    // Feedback, finalize, snapshots
    // ========================================================================

    fn emit_feedback_resolutions(
        &self,
        state: &mut ExecState<'_>,
        node: &PlanNode,
        output: &Value,
    ) {
        if !node.produces_facet(FEEDBACK_FACET) {
            return;
        }
        let Some(new_value) = output.get(FEEDBACK_FACET) else {
            return;
        };
        let previous = state
            .context
            .facet_value(FEEDBACK_FACET)
            .map(|v| normalize_feedback(v))
            .unwrap_or_default();
        let current = normalize_feedback(new_value);

        for change in diff_resolutions(&previous, &current) {
            state.emit(
                FlexEvent::new(FlexEventKind::FeedbackResolution, state.run_id())
                    .with_node(&node.id)
                    .with_payload(serde_json::to_value(&change).unwrap_or(Value::Null)),
            );
        }
    }

    async fn finalize(
        &self,
        state: &mut ExecState<'_>,
    ) -> Result<ExecutionOutcome, EngineError> {
        let composed = state
            .context
            .compose_final_output(&state.envelope.output_contract, self.registry.catalog());
        let composed = if composed.as_object().map(|m| m.is_empty()).unwrap_or(false) {
            // Fall back to the last execution node's output.
            state
                .plan
                .last_execution_node()
                .and_then(|node| state.pending.node_outputs.get(&node.id))
                .cloned()
                .unwrap_or(composed)
        } else {
            composed
        };

        if let Some(schema) = self.output_contract_schema(state.envelope)
            && let Err(errors) = validate_against_schema(&schema, &composed)
        {
            return Err(self.validation_failure(
                state,
                ValidationScope::FinalOutput,
                None,
                errors,
            ));
        }

        let results = evaluate_goal_conditions(
            &state.envelope.goal_condition,
            &state.context.snapshot_value(),
            state.run_id(),
            state.plan.version,
        );
        let failures: Vec<GoalConditionResult> = results
            .iter()
            .filter(|r| !r.satisfied)
            .cloned()
            .collect();
        if !failures.is_empty() {
            state.pending.goal_condition_failures = Some(failures.clone());
            state.emit(
                FlexEvent::new(FlexEventKind::Log, state.run_id()).with_payload(json!({
                    "message": "goal_conditions_failed",
                    "failures": &failures,
                })),
            );
            return Err(EngineError::GoalConditionsFailed {
                failures,
                composed_output: composed,
                state: state.interrupt_state(),
            });
        }

        // The `requiresHitlApproval` planner directive gates completion on
        // one operator approval. The attempt marker keeps the gate from
        // re-raising after the approved resume.
        let requires_approval = state
            .envelope
            .policies
            .planner
            .as_ref()
            .map(|p| p.directive_flag(REQUIRES_HITL_APPROVAL_DIRECTIVE))
            .unwrap_or(false);
        if requires_approval
            && !state
                .pending
                .policy_attempts
                .contains_key(HITL_APPROVAL_POLICY_ID)
        {
            self.raise_hitl_pause(
                state,
                HITL_APPROVAL_POLICY_ID,
                None,
                None,
                Some("Approve the final output before completion"),
                None,
            )
            .await?;
        }

        Ok(ExecutionOutcome {
            output: composed,
            goal_condition_results: results,
        })
    }

    /// The envelope output contract as a JSON Schema, compiling facet mode
    /// through the catalog.
    fn output_contract_schema(&self, envelope: &TaskEnvelope) -> Option<Value> {
        match &envelope.output_contract {
            CapabilityContract::JsonSchema { schema, .. } => Some(schema.clone()),
            CapabilityContract::Facets { facets } => self
                .registry
                .catalog()
                .compile_contracts(&[], facets)
                .ok()
                .and_then(|c| c.output)
                .map(|c| c.schema),
        }
    }

    fn validation_failure(
        &self,
        state: &ExecState<'_>,
        scope: ValidationScope,
        node_id: Option<&str>,
        errors: Vec<SchemaViolation>,
    ) -> EngineError {
        let mut event = FlexEvent::new(FlexEventKind::ValidationError, state.run_id())
            .with_payload(json!({ "scope": scope, "errors": &errors }));
        if let Some(node_id) = node_id {
            event = event.with_node(node_id);
        }
        state.emit(event);
        EngineError::Validation {
            scope,
            node_id: node_id.map(|s| s.to_string()),
            errors,
        }
    }

    /// Persist a full resumable snapshot (nodes, edges, pending state).
    async fn persist_pause_snapshot(&self, state: &mut ExecState<'_>, mode: PauseMode) {
        state.pending.mode = Some(mode);
        let nodes = state.snapshot_nodes();
        let hash = self
            .output_contract_schema(state.envelope)
            .map(|schema| schema_hash(&schema));
        self.persistence
            .save_plan_snapshot(
                state.run_id(),
                state.plan.version,
                &nodes,
                PlanSnapshotContext {
                    facets: state.context.snapshot_value(),
                    schema_hash: hash,
                    edges: state.plan.effective_edges(),
                    plan_metadata: state.plan.metadata.clone(),
                    pending_state: state.pending.clone(),
                },
            )
            .await;
    }

    /// Snapshot nodes for the coordinator's completion/failure writes.
    pub(crate) fn snapshot_for(
        plan: &Plan,
        pending: &PendingState,
        context: &RunContext,
    ) -> (Vec<crate::models::PlanNodeSnapshot>, PlanSnapshotContext) {
        let statuses: BTreeMap<String, NodeStatus> = pending
            .completed_node_ids
            .iter()
            .map(|id| (id.clone(), NodeStatus::Completed))
            .collect();
        let nodes = plan
            .nodes
            .iter()
            .map(|node| crate::models::PlanNodeSnapshot {
                node_id: node.id.clone(),
                capability_id: node.capability_id.clone(),
                label: node.label.clone(),
                status: statuses
                    .get(&node.id)
                    .copied()
                    .unwrap_or(NodeStatus::Pending),
                context: serde_json::to_value(node).unwrap_or(Value::Null),
                output: pending.node_outputs.get(&node.id).cloned(),
                error: None,
                post_condition_results: vec![],
                started_at: None,
                completed_at: None,
            })
            .collect();
        let snapshot_context = PlanSnapshotContext {
            facets: context.snapshot_value(),
            schema_hash: None,
            edges: plan.effective_edges(),
            plan_metadata: plan.metadata.clone(),
            pending_state: pending.clone(),
        };
        (nodes, snapshot_context)
    }
}

/// Synthetic record for a planner-derived capability; the node's resolved
/// contracts stand in for a registration.
fn derived_capability_record(node: &PlanNode) -> CapabilityRecord {
    let derived = node.derived_capability.as_ref();
    let field = |name: &str| {
        derived
            .and_then(|d| d.get(name))
            .and_then(Value::as_str)
            .map(String::from)
    };
    let now = Utc::now();
    CapabilityRecord {
        capability_id: format!("derived:{}", node.id),
        version: "derived".to_string(),
        display_name: field("displayName").unwrap_or_else(|| node.label.clone()),
        summary: field("summary").unwrap_or_default(),
        agent_type: AgentType::Ai,
        input_contract: node.contracts.input.clone().map(|schema| {
            CapabilityContract::JsonSchema {
                schema,
                hints: None,
            }
        }),
        output_contract: CapabilityContract::JsonSchema {
            schema: node
                .contracts
                .output
                .clone()
                .unwrap_or_else(|| json!({ "type": "object" })),
            hints: None,
        },
        input_facets: node.facets.input.clone(),
        output_facets: node.facets.output.clone(),
        heartbeat: Default::default(),
        assignment_defaults: None,
        instruction_templates: derived
            .and_then(|d| d.get("instructions"))
            .map(|i| json!({ "app": i })),
        post_conditions: node.post_condition_guards.clone(),
        metadata: json!({ "derived": true }),
        preferred_models: vec![],
        cost: None,
        status: crate::models::CapabilityStatus::Active,
        last_seen_at: now,
        registered_at: now,
        created_at: now,
        updated_at: now,
    }
}
