//! The run coordinator: owns the replan loop and every resume entry point.
//!
//! `FlexRunService` is the public surface a transport calls. It normalizes
//! envelopes at ingress, routes resume requests (explicit `resumeRunId` or
//! thread reuse), drives the planner/engine loop bounded by the planner
//! attempt budget, and converts engine pauses into `RunOutcome::Paused`.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::conditions::{ConditionError, GoalConditionResult};
use crate::config::FlexConfig;
use crate::context::RunContext;
use crate::hitl::{HitlResponse, HitlService, resolve_hitl_decision};
use crate::models::{
    EventSink, FlexEvent, FlexEventKind, GraphContext, NodeStatus, PendingState, Plan,
    PlanNode, PolicyAction, RunRecord, RunStatus, TaskEnvelope,
};
use crate::persistence::{
    FlexRunPersistence, NodeUpdates, PlanSnapshotRow, RunResultContext, schema_hash,
};
use crate::planner::{FlexPlanner, PlannerError, PlannerHooks};
use crate::registry::CapabilityRegistry;

use super::engine::{EngineError, FlexExecutionEngine, InterruptState};
use super::validation::{ValidationScope, validate_against_schema};

/// Terminal failures surfaced to the caller; pauses are not errors.
#[derive(Debug, Error)]
pub enum FlexRunError {
    #[error(transparent)]
    InvalidConditionDsl(#[from] ConditionError),
    #[error(transparent)]
    Planner(#[from] PlannerError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("run '{run_id}' not found")]
    RunNotFound { run_id: String },
    #[error("run '{run_id}' is in state {status:?}, which this operation does not accept")]
    InvalidRunState { run_id: String, status: RunStatus },
    #[error("no node of run '{run_id}' awaits human input")]
    TaskNotFound { run_id: String },
    #[error("replan budget exhausted after {attempts} planner attempts")]
    ReplanBudgetExhausted { attempts: u32 },
}

impl FlexRunError {
    /// Stable code for API surfaces.
    pub fn code(&self) -> &'static str {
        match self {
            FlexRunError::InvalidConditionDsl(_) => "invalid_condition_dsl",
            FlexRunError::Planner(_) => "planner_rejected",
            FlexRunError::Engine(_) => "engine_failure",
            FlexRunError::RunNotFound { .. } => "run_not_found",
            FlexRunError::InvalidRunState { .. } => "invalid_run_state",
            FlexRunError::TaskNotFound { .. } => "task_not_found",
            FlexRunError::ReplanBudgetExhausted { .. } => "replan_budget_exhausted",
        }
    }
}

/// How a `run` call ended.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed {
        run_id: String,
        output: Value,
        goal_condition_results: Vec<GoalConditionResult>,
    },
    Paused {
        run_id: String,
        status: RunStatus,
        pending_request_id: Option<String>,
        awaiting_node_id: Option<String>,
    },
}

impl RunOutcome {
    pub fn run_id(&self) -> &str {
        match self {
            RunOutcome::Completed { run_id, .. } | RunOutcome::Paused { run_id, .. } => run_id,
        }
    }
}

/// A human task submission (the response becomes the node's output).
#[derive(Debug, Clone)]
pub struct HumanTaskSubmission {
    pub payload: Value,
    pub operator: Option<String>,
    pub note: Option<String>,
}

/// Acknowledgement of a human-task decline.
#[derive(Debug, Clone)]
pub struct DeclineAck {
    pub run_id: String,
    pub node_id: String,
    pub status: RunStatus,
}

/// Process-wide run service; construct once and share.
pub struct FlexRunService {
    registry: Arc<CapabilityRegistry>,
    planner: FlexPlanner,
    engine: FlexExecutionEngine,
    persistence: Arc<dyn FlexRunPersistence>,
    hitl: Arc<dyn HitlService>,
    config: FlexConfig,
}

impl FlexRunService {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        planner: FlexPlanner,
        engine: FlexExecutionEngine,
        persistence: Arc<dyn FlexRunPersistence>,
        hitl: Arc<dyn HitlService>,
        config: FlexConfig,
    ) -> Self {
        Self {
            registry,
            planner,
            engine,
            persistence,
            hitl,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn persistence(&self) -> &Arc<dyn FlexRunPersistence> {
        &self.persistence
    }

    // ========================================================================
    // Entry points
    // ========================================================================

    /// Run a task envelope, or resume the run it points at.
    pub async fn run(
        &self,
        mut envelope: TaskEnvelope,
        sink: &dyn EventSink,
    ) -> Result<RunOutcome, FlexRunError> {
        // Compile every condition before any run state exists.
        envelope.normalize_conditions()?;

        if let Some(resume_id) = envelope.resume_run_id().map(|s| s.to_string()) {
            return self.resume(&resume_id, sink).await;
        }
        if let Some(thread_id) = envelope.thread_id()
            && let Some(existing) = self.persistence.find_flex_run_by_thread_id(&thread_id).await
            && !existing.status.is_terminal()
        {
            info!(run_id = %existing.run_id, thread_id, "resuming run on thread");
            return self.resume(&existing.run_id, sink).await;
        }

        self.start_new_run(envelope, sink).await
    }

    /// Record operator responses for a paused run and resume it.
    pub async fn resolve_hitl(
        &self,
        run_id: &str,
        responses: Vec<HitlResponse>,
        operator: Option<&str>,
        note: Option<&str>,
        sink: &dyn EventSink,
    ) -> Result<RunOutcome, FlexRunError> {
        self.hitl.submit_responses(run_id, responses).await;
        self.persistence
            .record_resume_audit(run_id, operator, note)
            .await;
        self.resume(run_id, sink).await
    }

    /// Complete an awaiting human task; the submission becomes the node's
    /// output and execution continues.
    pub async fn submit_human_task(
        &self,
        run_id: &str,
        submission: HumanTaskSubmission,
        sink: &dyn EventSink,
    ) -> Result<RunOutcome, FlexRunError> {
        let record = self.load_run(run_id).await?;
        if record.status != RunStatus::AwaitingHuman {
            return Err(FlexRunError::InvalidRunState {
                run_id: run_id.to_string(),
                status: record.status,
            });
        }

        let (plan, mut pending, mut context) = self.restore_run_state(&record).await?;
        let node = self
            .awaiting_human_node(&plan, run_id)
            .await
            .ok_or_else(|| FlexRunError::TaskNotFound {
                run_id: run_id.to_string(),
            })?;

        if let Some(output_contract) = &node.contracts.output
            && let Err(errors) = validate_against_schema(output_contract, &submission.payload)
        {
            // Reject the submission; the run stays parked.
            sink.emit(
                FlexEvent::new(FlexEventKind::ValidationError, run_id)
                    .with_node(&node.id)
                    .with_plan_version(plan.version)
                    .with_payload(json!({
                        "scope": ValidationScope::CapabilityOutput,
                        "errors": &errors,
                    })),
            );
            return Err(FlexRunError::Engine(EngineError::Validation {
                scope: ValidationScope::CapabilityOutput,
                node_id: Some(node.id.clone()),
                errors,
            }));
        }

        context.update_from_node(&node, &submission.payload);
        pending.completed_node_ids.push(node.id.clone());
        pending
            .node_outputs
            .insert(node.id.clone(), submission.payload.clone());
        pending.mode = None;
        self.persistence
            .mark_node(
                run_id,
                &node.id,
                NodeUpdates {
                    status: Some(NodeStatus::Completed),
                    output: Some(submission.payload.clone()),
                    completed_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await;
        self.persistence
            .record_resume_audit(run_id, submission.operator.as_deref(), submission.note.as_deref())
            .await;
        sink.emit(
            FlexEvent::new(FlexEventKind::NodeComplete, run_id)
                .with_node(&node.id)
                .with_plan_version(plan.version)
                .with_provenance(node.provenance.output.clone())
                .with_payload(json!({ "hasOutput": true, "source": "human" })),
        );

        self.persistence.update_status(run_id, RunStatus::Running).await;
        self.drive(
            run_id,
            &record.envelope,
            context,
            pending,
            plan.version,
            None,
            Vec::new(),
            Some(plan),
            sink,
        )
        .await
    }

    /// Decline an awaiting human task; the run fails per `onDecline`.
    pub async fn decline_human_task(
        &self,
        run_id: &str,
        reason: &str,
        note: Option<&str>,
        sink: &dyn EventSink,
    ) -> Result<DeclineAck, FlexRunError> {
        let record = self.load_run(run_id).await?;
        if record.status != RunStatus::AwaitingHuman {
            return Err(FlexRunError::InvalidRunState {
                run_id: run_id.to_string(),
                status: record.status,
            });
        }
        let (plan, _, _) = self.restore_run_state(&record).await?;
        let node = self
            .awaiting_human_node(&plan, run_id)
            .await
            .ok_or_else(|| FlexRunError::TaskNotFound {
                run_id: run_id.to_string(),
            })?;

        let message = format!("human task declined: {}", reason);
        self.persistence
            .mark_node(
                run_id,
                &node.id,
                NodeUpdates {
                    status: Some(NodeStatus::Error),
                    error: Some(json!({ "message": &message, "note": note })),
                    completed_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await;
        self.fail_run(run_id, &message).await;
        sink.emit(
            FlexEvent::new(FlexEventKind::NodeError, run_id)
                .with_node(&node.id)
                .with_plan_version(plan.version)
                .with_payload(json!({ "message": &message })),
        );
        warn!(run_id, node_id = %node.id, reason, "human task declined");

        Ok(DeclineAck {
            run_id: run_id.to_string(),
            node_id: node.id.clone(),
            status: RunStatus::Failed,
        })
    }

    // ========================================================================
    // New runs
    // ========================================================================

    async fn start_new_run(
        &self,
        envelope: TaskEnvelope,
        sink: &dyn EventSink,
    ) -> Result<RunOutcome, FlexRunError> {
        let run_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let record = RunRecord {
            run_id: run_id.clone(),
            thread_id: envelope.thread_id(),
            envelope: envelope.clone(),
            status: RunStatus::Running,
            plan_version: 0,
            result: None,
            context_snapshot: None,
            metadata: envelope.metadata.clone().unwrap_or_else(|| json!({})),
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        self.persistence.create_or_update_run(record).await;
        info!(run_id, objective = %envelope.objective, "run started");

        // Envelope-scope validation of caller inputs against the catalog.
        if let Err((facet, errors)) = self.validate_envelope_inputs(&envelope) {
            sink.emit(
                FlexEvent::new(FlexEventKind::ValidationError, &run_id).with_payload(json!({
                    "scope": ValidationScope::Envelope,
                    "facet": facet,
                    "errors": &errors,
                })),
            );
            let err = EngineError::Validation {
                scope: ValidationScope::Envelope,
                node_id: None,
                errors,
            };
            self.fail_run(&run_id, &err.to_string()).await;
            return Err(err.into());
        }

        let context = RunContext::from_envelope_inputs(&envelope.inputs);
        self.drive(
            &run_id,
            &envelope,
            context,
            PendingState::default(),
            0,
            None,
            Vec::new(),
            None,
            sink,
        )
        .await
    }

    fn validate_envelope_inputs(
        &self,
        envelope: &TaskEnvelope,
    ) -> Result<(), (String, Vec<super::validation::SchemaViolation>)> {
        for (facet, value) in &envelope.inputs {
            if let Some(def) = self.registry.catalog().get(facet)
                && let Err(errors) = validate_against_schema(&def.schema, value)
            {
                return Err((facet.clone(), errors));
            }
        }
        Ok(())
    }

    // ========================================================================
    // The plan/execute/replan loop
    // ========================================================================

    /// Drive a run forward. `initial_plan` short-circuits the first planner
    /// call when resuming an existing plan; `last_version` is the highest
    /// plan version seen so far.
    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &self,
        run_id: &str,
        envelope: &TaskEnvelope,
        mut context: RunContext,
        mut pending: PendingState,
        last_version: u32,
        mut graph_context: Option<GraphContext>,
        mut goal_failure_facets: Vec<String>,
        mut initial_plan: Option<Plan>,
        sink: &dyn EventSink,
    ) -> Result<RunOutcome, FlexRunError> {
        let mut attempt = last_version.max(if initial_plan.is_some() { 1 } else { 0 });

        loop {
            let plan = match initial_plan.take() {
                Some(plan) => plan,
                None => {
                    attempt += 1;
                    if attempt > self.config.planner_max_attempts {
                        let err = FlexRunError::ReplanBudgetExhausted { attempts: attempt - 1 };
                        self.fail_run(run_id, &err.to_string()).await;
                        return Err(err);
                    }
                    let plan = match self
                        .planner
                        .plan(
                            run_id,
                            envelope,
                            graph_context.as_ref(),
                            &goal_failure_facets,
                            attempt,
                            &PlannerHooks::default(),
                        )
                        .await
                    {
                        Ok(plan) => plan,
                        Err(err) => {
                            sink.emit(
                                FlexEvent::new(FlexEventKind::NodeError, run_id)
                                    .with_payload(json!({ "message": err.to_string() })),
                            );
                            self.fail_run(run_id, &err.to_string()).await;
                            return Err(err.into());
                        }
                    };
                    sink.emit(
                        FlexEvent::new(FlexEventKind::PlanGenerated, run_id)
                            .with_plan_version(plan.version)
                            .with_payload(json!({
                                "nodes": plan.nodes.iter().map(|n| json!({
                                    "id": n.id,
                                    "kind": n.kind,
                                    "capabilityId": n.capability_id,
                                })).collect::<Vec<_>>(),
                                "metadata": &plan.metadata,
                            })),
                    );
                    let (nodes, snapshot_context) =
                        FlexExecutionEngine::snapshot_for(&plan, &pending, &context);
                    self.persistence
                        .save_plan_snapshot(run_id, plan.version, &nodes, snapshot_context)
                        .await;
                    plan
                }
            };

            match self
                .engine
                .execute(envelope, &plan, &mut context, &mut pending, sink)
                .await
            {
                Ok(outcome) => {
                    return self
                        .complete_run(run_id, envelope, &plan, &pending, &context, outcome, sink)
                        .await;
                }
                Err(EngineError::ReplanRequested { trigger, state }) => {
                    sink.emit(
                        FlexEvent::new(FlexEventKind::Log, run_id)
                            .with_plan_version(plan.version)
                            .with_payload(json!({ "message": "replan_requested", "trigger": trigger })),
                    );
                    let interrupted = *state;
                    graph_context = Some(build_graph_context(&plan, &interrupted));
                    context = RunContext::from_snapshot(interrupted.context_snapshot);
                    pending = carry_over_attempts(&interrupted.pending);
                    goal_failure_facets.clear();
                    attempt = attempt.max(plan.version);
                }
                Err(EngineError::GoalConditionsFailed {
                    failures, state, ..
                }) => {
                    let interrupted = *state;
                    graph_context = Some(build_graph_context(&plan, &interrupted));
                    context = RunContext::from_snapshot(interrupted.context_snapshot);
                    pending = carry_over_attempts(&interrupted.pending);
                    goal_failure_facets = failures.iter().map(|f| f.facet.clone()).collect();
                    attempt = attempt.max(plan.version);
                }
                Err(err) if err.is_pause() => {
                    let awaiting_node_id = match &err {
                        EngineError::AwaitingHumanInput { node_id } => Some(node_id.clone()),
                        _ => None,
                    };
                    let status = self
                        .persistence
                        .load_flex_run(run_id)
                        .await
                        .map(|r| r.status)
                        .unwrap_or(RunStatus::AwaitingHitl);
                    let pending_request_id = self
                        .hitl
                        .load_run_state(run_id)
                        .await
                        .pending_request_id;
                    return Ok(RunOutcome::Paused {
                        run_id: run_id.to_string(),
                        status,
                        pending_request_id,
                        awaiting_node_id,
                    });
                }
                Err(err) => {
                    self.fail_run(run_id, &err.to_string()).await;
                    return Err(err.into());
                }
            }
        }
    }

    async fn complete_run(
        &self,
        run_id: &str,
        envelope: &TaskEnvelope,
        plan: &Plan,
        pending: &PendingState,
        context: &RunContext,
        outcome: super::engine::ExecutionOutcome,
        sink: &dyn EventSink,
    ) -> Result<RunOutcome, FlexRunError> {
        let (nodes, mut snapshot_context) =
            FlexExecutionEngine::snapshot_for(plan, pending, context);
        let hash = match &envelope.output_contract {
            crate::models::CapabilityContract::JsonSchema { schema, .. } => {
                Some(schema_hash(schema))
            }
            crate::models::CapabilityContract::Facets { facets } => self
                .registry
                .catalog()
                .compile_contracts(&[], facets)
                .ok()
                .and_then(|c| c.output)
                .map(|c| schema_hash(&c.schema)),
        };
        snapshot_context.schema_hash = hash.clone();

        let snapshot = context.snapshot();
        let provenance: BTreeMap<String, Value> = snapshot
            .facets
            .iter()
            .map(|(facet, entry)| {
                (
                    facet.clone(),
                    serde_json::to_value(&entry.provenance).unwrap_or(Value::Null),
                )
            })
            .collect();

        self.persistence
            .record_result(
                run_id,
                &outcome.output,
                RunResultContext {
                    status: RunStatus::Completed,
                    plan_version: plan.version,
                    schema_hash: hash,
                    facets: context.snapshot_value(),
                    provenance: serde_json::to_value(provenance).unwrap_or(Value::Null),
                    goal_condition_results: outcome.goal_condition_results.clone(),
                    post_condition_results: Value::Null,
                    snapshot_nodes: nodes,
                    snapshot_context,
                },
            )
            .await;

        sink.emit(
            FlexEvent::new(FlexEventKind::Complete, run_id)
                .with_plan_version(plan.version)
                .with_payload(json!({
                    "output": &outcome.output,
                    "goal_condition_results": &outcome.goal_condition_results,
                })),
        );
        info!(run_id, plan_version = plan.version, "run completed");

        Ok(RunOutcome::Completed {
            run_id: run_id.to_string(),
            output: outcome.output,
            goal_condition_results: outcome.goal_condition_results,
        })
    }

    // ========================================================================
    // Resume
    // ========================================================================

    async fn resume(&self, run_id: &str, sink: &dyn EventSink) -> Result<RunOutcome, FlexRunError> {
        let record = self.load_run(run_id).await?;
        match record.status {
            RunStatus::Completed => self.replay_completed(&record, sink).await,
            RunStatus::AwaitingHitl => self.resume_from_hitl(&record, sink).await,
            RunStatus::AwaitingHuman => {
                // Without a submitted response there is nothing to do yet.
                Ok(RunOutcome::Paused {
                    run_id: run_id.to_string(),
                    status: RunStatus::AwaitingHuman,
                    pending_request_id: None,
                    awaiting_node_id: self
                        .awaiting_human_node_id(run_id)
                        .await,
                })
            }
            status => Err(FlexRunError::InvalidRunState {
                run_id: run_id.to_string(),
                status,
            }),
        }
    }

    /// Resume a run paused on HITL: resolve every pending policy action
    /// against the latest responses, then continue (or replan, or fail).
    async fn resume_from_hitl(
        &self,
        record: &RunRecord,
        sink: &dyn EventSink,
    ) -> Result<RunOutcome, FlexRunError> {
        let run_id = record.run_id.as_str();
        let (plan, mut pending, context) = self.restore_run_state(record).await?;
        let hitl_state = self.hitl.load_run_state(run_id).await;

        let mut resolved_actions: Vec<(String, PolicyAction)> = Vec::new();
        for pending_action in &pending.policy_actions {
            let Some(decision) = resolve_hitl_decision(&hitl_state, &pending_action.request_id)
            else {
                // Still unanswered; stay paused.
                return Ok(RunOutcome::Paused {
                    run_id: run_id.to_string(),
                    status: RunStatus::AwaitingHitl,
                    pending_request_id: Some(pending_action.request_id.clone()),
                    awaiting_node_id: Some(pending_action.node_id.clone()),
                });
            };
            let action = match decision.kind {
                crate::hitl::HitlDecisionKind::Approve => pending_action.approve_action.clone(),
                crate::hitl::HitlDecisionKind::Reject => Some(
                    pending_action
                        .reject_action
                        .clone()
                        // A bare rejection fails the run.
                        .unwrap_or(PolicyAction::Fail {
                            message: Some("HITL request rejected".to_string()),
                        }),
                ),
            };
            if let Some(action) = action {
                resolved_actions.push((pending_action.policy_id.clone(), action));
            }
        }
        pending.policy_actions.clear();
        pending.mode = None;

        let mut graph_context = None;
        let mut replan = false;
        for (policy_id, action) in resolved_actions {
            match action {
                PolicyAction::Fail { message } => {
                    let message = message.unwrap_or_else(|| "HITL rejected".to_string());
                    self.fail_run(run_id, &message).await;
                    return Err(EngineError::PolicyFailure { policy_id, message }.into());
                }
                PolicyAction::Replan => {
                    replan = true;
                    graph_context = Some(build_graph_context(
                        &plan,
                        &InterruptState {
                            pending: pending.clone(),
                            context_snapshot: context.snapshot(),
                        },
                    ));
                }
                PolicyAction::Goto { next, .. } => {
                    // Drop the target and its descendants from completion.
                    if let Ok(mut scheduler) = super::scheduler::Scheduler::new(
                        &plan,
                        &pending.completed_node_ids,
                        &pending.routing_selections,
                    ) {
                        let reset = scheduler.reset_from_node(&next);
                        pending.completed_node_ids.retain(|id| !reset.contains(id));
                        for id in &reset {
                            pending.node_outputs.remove(id);
                            pending.routing_selections.remove(id);
                        }
                    }
                }
                PolicyAction::Pause { .. } => {
                    return Ok(RunOutcome::Paused {
                        run_id: run_id.to_string(),
                        status: RunStatus::AwaitingHitl,
                        pending_request_id: None,
                        awaiting_node_id: None,
                    });
                }
                PolicyAction::Emit { event, payload } => {
                    sink.emit(
                        FlexEvent::new(FlexEventKind::Log, run_id)
                            .with_payload(json!({ "message": event, "payload": payload })),
                    );
                }
                PolicyAction::Hitl { .. } => {
                    // Nested HITL actions are not re-raised on resume.
                    warn!(run_id, policy_id, "ignoring nested hitl action on resume");
                }
            }
        }

        self.persistence.update_status(run_id, RunStatus::Running).await;
        let initial_plan = if replan { None } else { Some(plan.clone()) };
        self.drive(
            run_id,
            &record.envelope,
            context,
            if replan {
                carry_over_attempts(&pending)
            } else {
                pending
            },
            plan.version,
            graph_context,
            Vec::new(),
            initial_plan,
            sink,
        )
        .await
    }

    /// Replay a completed run's stored output: terminal node events, final
    /// validation, goal conditions, `complete`.
    async fn replay_completed(
        &self,
        record: &RunRecord,
        sink: &dyn EventSink,
    ) -> Result<RunOutcome, FlexRunError> {
        let run_id = record.run_id.as_str();
        let output_row = self
            .persistence
            .load_run_output(run_id)
            .await
            .ok_or_else(|| FlexRunError::RunNotFound {
                run_id: run_id.to_string(),
            })?;

        let (plan, _, _) = self.restore_run_state(record).await?;
        if let Some(terminal) = plan.last_execution_node() {
            sink.emit(
                FlexEvent::new(FlexEventKind::NodeStart, run_id)
                    .with_node(&terminal.id)
                    .with_plan_version(plan.version)
                    .with_payload(json!({ "replay": true })),
            );
            sink.emit(
                FlexEvent::new(FlexEventKind::NodeComplete, run_id)
                    .with_node(&terminal.id)
                    .with_plan_version(plan.version)
                    .with_provenance(terminal.provenance.output.clone())
                    .with_payload(json!({ "replay": true })),
            );
        }

        if let Some(schema) = match &record.envelope.output_contract {
            crate::models::CapabilityContract::JsonSchema { schema, .. } => Some(schema.clone()),
            crate::models::CapabilityContract::Facets { facets } => self
                .registry
                .catalog()
                .compile_contracts(&[], facets)
                .ok()
                .and_then(|c| c.output)
                .map(|c| c.schema),
        } && let Err(errors) = validate_against_schema(&schema, &output_row.output)
        {
            return Err(EngineError::Validation {
                scope: ValidationScope::FinalOutput,
                node_id: None,
                errors,
            }
            .into());
        }

        sink.emit(
            FlexEvent::new(FlexEventKind::Complete, run_id)
                .with_plan_version(plan.version)
                .with_payload(json!({
                    "output": &output_row.output,
                    "goal_condition_results": &output_row.goal_condition_results,
                    "replay": true,
                })),
        );
        Ok(RunOutcome::Completed {
            run_id: run_id.to_string(),
            output: output_row.output.clone(),
            goal_condition_results: output_row.goal_condition_results.clone(),
        })
    }

    // ========================================================================
    // Shared helpers
    // ========================================================================

    async fn load_run(&self, run_id: &str) -> Result<RunRecord, FlexRunError> {
        self.persistence
            .load_flex_run(run_id)
            .await
            .ok_or_else(|| FlexRunError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }

    /// Rebuild (plan, pending state, run context) from the latest snapshot.
    async fn restore_run_state(
        &self,
        record: &RunRecord,
    ) -> Result<(Plan, PendingState, RunContext), FlexRunError> {
        let row = self
            .persistence
            .load_plan_snapshot(&record.run_id, None)
            .await
            .ok_or_else(|| FlexRunError::RunNotFound {
                run_id: record.run_id.clone(),
            })?;
        let (plan, pending) = plan_from_snapshot(&row).ok_or_else(|| {
            FlexRunError::InvalidRunState {
                run_id: record.run_id.clone(),
                status: record.status,
            }
        })?;

        let context = record
            .context_snapshot
            .clone()
            .or_else(|| Some(row.facet_snapshot.clone()))
            .and_then(|snapshot| serde_json::from_value(snapshot).ok())
            .map(RunContext::from_snapshot)
            .unwrap_or_default();
        Ok((plan, pending, context))
    }

    async fn awaiting_human_node(&self, plan: &Plan, run_id: &str) -> Option<PlanNode> {
        let node_id = self.awaiting_human_node_id(run_id).await?;
        plan.node(&node_id).cloned()
    }

    async fn awaiting_human_node_id(&self, run_id: &str) -> Option<String> {
        self.persistence
            .load_node_snapshots(run_id)
            .await
            .into_iter()
            .find(|n| n.status == NodeStatus::AwaitingHuman)
            .map(|n| n.node_id)
    }

    async fn fail_run(&self, run_id: &str, message: &str) {
        if let Some(mut record) = self.persistence.load_flex_run(run_id).await {
            record.status = RunStatus::Failed;
            record.last_error = Some(message.to_string());
            record.updated_at = Utc::now();
            self.persistence.create_or_update_run(record).await;
        }
        warn!(run_id, message, "run failed");
    }
}

/// Carry attempt counters across a replan; the new plan has new node ids so
/// completion state does not transfer.
fn carry_over_attempts(pending: &PendingState) -> PendingState {
    PendingState {
        policy_attempts: pending.policy_attempts.clone(),
        post_condition_attempts: BTreeMap::new(),
        ..Default::default()
    }
}

/// What the next planner attempt sees of the interrupted run.
fn build_graph_context(plan: &Plan, state: &InterruptState) -> GraphContext {
    let node_output_facets: BTreeMap<String, Vec<String>> = state
        .pending
        .completed_node_ids
        .iter()
        .filter_map(|id| plan.node(id).map(|n| (id.clone(), n.facets.output.clone())))
        .collect();
    GraphContext {
        completed_node_ids: state.pending.completed_node_ids.clone(),
        node_outputs: state.pending.node_outputs.clone(),
        node_output_facets,
        facets: state.context_snapshot.facets.keys().cloned().collect(),
    }
}

/// Rebuild an executable plan from a persisted snapshot row.
pub fn plan_from_snapshot(row: &PlanSnapshotRow) -> Option<(Plan, PendingState)> {
    let nodes_value = row.snapshot.get("nodes")?.as_array()?;
    let mut nodes = Vec::with_capacity(nodes_value.len());
    for node_snapshot in nodes_value {
        let node: PlanNode =
            serde_json::from_value(node_snapshot.get("context")?.clone()).ok()?;
        nodes.push(node);
    }
    let edges = row
        .snapshot
        .get("edges")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default();
    let metadata = row
        .snapshot
        .get("planMetadata")
        .cloned()
        .unwrap_or(Value::Null);
    let pending: PendingState = row
        .snapshot
        .get("pendingState")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default();

    Some((
        Plan {
            run_id: row.run_id.clone(),
            version: row.plan_version,
            created_at: Utc::now().to_rfc3339(),
            nodes,
            edges,
            metadata,
        },
        pending,
    ))
}
