//! End-to-end runs through `FlexRunService` against in-memory substitutes
//! for persistence, HITL, the planner service and the capability runtime.

use std::sync::Arc;

use serde_json::{Value, json};

use flexrun::engine::{FlexExecutionEngine, ScriptedRuntime};
use flexrun::hitl::{HitlResponse, HitlService, MemoryHitlService};
use flexrun::models::{
    CapabilityRegistration, CollectingSink, FlexEventKind, RunStatus, TaskEnvelope,
};
use flexrun::persistence::{FlexRunPersistence, HumanTaskFilter, MemoryPersistence};
use flexrun::planner::{PlanDraft, ScriptedPlanner};
use flexrun::registry::{CapabilityRegistry, MemoryCapabilityStore};
use flexrun::{
    FacetCatalog, FlexConfig, FlexPlanner, FlexRunError, FlexRunService, HumanTaskSubmission,
    RunOutcome,
};

struct Harness {
    service: FlexRunService,
    runtime: Arc<ScriptedRuntime>,
    hitl: Arc<MemoryHitlService>,
    persistence: Arc<MemoryPersistence>,
    registry: Arc<CapabilityRegistry>,
}

impl Harness {
    async fn new(drafts: Vec<PlanDraft>) -> Self {
        let config = FlexConfig::default();
        let registry = Arc::new(CapabilityRegistry::new(
            MemoryCapabilityStore::shared(),
            Arc::new(FacetCatalog::with_defaults()),
            &config,
        ));
        let runtime = Arc::new(ScriptedRuntime::new());
        let persistence = MemoryPersistence::shared();
        let hitl = MemoryHitlService::shared(config.hitl_max_requests);
        let planner_service = Arc::new(ScriptedPlanner::new(drafts));

        let service = FlexRunService::new(
            registry.clone(),
            FlexPlanner::new(registry.clone(), planner_service),
            FlexExecutionEngine::new(
                registry.clone(),
                persistence.clone(),
                hitl.clone(),
                runtime.clone(),
                config.clone(),
            ),
            persistence.clone(),
            hitl.clone(),
            config,
        );
        Self {
            service,
            runtime,
            hitl,
            persistence,
            registry,
        }
    }

    async fn register(&self, payload: Value) {
        let registration: CapabilityRegistration =
            serde_json::from_value(payload).expect("registration parses");
        self.registry
            .register(registration)
            .await
            .expect("registration accepted");
    }
}

fn content_generator() -> Value {
    json!({
        "capabilityId": "contentGenerator",
        "version": "1.0.0",
        "displayName": "Content generator",
        "summary": "Generates post copy variants",
        "agentType": "ai",
        "inputContract": {
            "mode": "facets",
            "facets": ["objectiveBrief", "writerBrief", "toneOfVoice", "audienceProfile"]
        },
        "outputContract": { "mode": "facets", "facets": ["copyVariants"] }
    })
}

fn generator_draft() -> PlanDraft {
    serde_json::from_value(json!({
        "nodes": [{
            "id": "generate",
            "capabilityId": "contentGenerator",
            "inputFacets": ["objectiveBrief"],
            "outputFacets": ["copyVariants"],
            "rationale": ["single generation step"]
        }]
    }))
    .expect("draft parses")
}

fn variants_envelope() -> TaskEnvelope {
    serde_json::from_value(json!({
        "objective": "Create LinkedIn post variants",
        "inputs": { "objectiveBrief": "Announce the new editor launch" },
        "outputContract": { "mode": "facets", "facets": ["copyVariants"] }
    }))
    .expect("envelope parses")
}

// ============================================================================
// Scenario: happy path
// ============================================================================

#[tokio::test]
async fn test_happy_path_linkedin_variants() {
    let harness = Harness::new(vec![generator_draft()]).await;
    harness.register(content_generator()).await;
    harness.runtime.enqueue(
        "contentGenerator",
        vec![json!({ "copyVariants": [{ "post": "We shipped it." }] })],
    );

    let sink = CollectingSink::new();
    let outcome = harness
        .service
        .run(variants_envelope(), &sink)
        .await
        .expect("run completes");

    let RunOutcome::Completed { output, .. } = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(output, json!({ "copyVariants": [{ "post": "We shipped it." }] }));

    let kinds = sink.kinds();
    for expected in [
        FlexEventKind::PlanGenerated,
        FlexEventKind::NodeStart,
        FlexEventKind::NodeComplete,
        FlexEventKind::Complete,
    ] {
        assert!(kinds.contains(&expected), "missing {expected:?} in {kinds:?}");
    }

    // Persisted state agrees with the stream.
    let run_id = sink.events()[0].run_id.clone();
    let record = harness.persistence.load_flex_run(&run_id).await.unwrap();
    assert_eq!(record.status, RunStatus::Completed);
    let output_row = harness.persistence.load_run_output(&run_id).await.unwrap();
    assert_eq!(output_row.output, output);
}

// ============================================================================
// Scenario: strict schema validation
// ============================================================================

#[tokio::test]
async fn test_strict_output_schema_fails_run() {
    let harness = Harness::new(vec![generator_draft()]).await;
    harness.register(content_generator()).await;
    // Runtime returns one variant where the caller demands two.
    harness.runtime.enqueue(
        "contentGenerator",
        vec![json!({ "variants": [{ "post": "only one" }] })],
    );

    let mut envelope = variants_envelope();
    envelope.output_contract = serde_json::from_value(json!({
        "mode": "json_schema",
        "schema": {
            "type": "object",
            "properties": {
                "variants": { "type": "array", "minItems": 2 }
            },
            "required": ["variants"]
        }
    }))
    .unwrap();

    let sink = CollectingSink::new();
    let err = harness
        .service
        .run(envelope, &sink)
        .await
        .expect_err("run fails validation");
    assert_eq!(err.code(), "engine_failure");

    let validation_events: Vec<_> = sink
        .events()
        .into_iter()
        .filter(|e| e.kind == FlexEventKind::ValidationError)
        .collect();
    assert_eq!(validation_events.len(), 1);
    assert_eq!(validation_events[0].payload["scope"], "capability_output");

    let run_id = sink.events()[0].run_id.clone();
    let record = harness.persistence.load_flex_run(&run_id).await.unwrap();
    assert_eq!(record.status, RunStatus::Failed);
    assert!(record.last_error.is_some());
}

// ============================================================================
// Scenario: HITL approval gate
// ============================================================================

#[tokio::test]
async fn test_hitl_approval_pause_and_resume() {
    let harness = Harness::new(vec![generator_draft()]).await;
    harness.register(content_generator()).await;
    harness.runtime.enqueue(
        "contentGenerator",
        vec![json!({ "copyVariants": [{ "post": "Needs sign-off." }] })],
    );

    let mut envelope = variants_envelope();
    envelope.policies.planner = Some(
        serde_json::from_value(json!({
            "directives": { "requiresHitlApproval": true }
        }))
        .unwrap(),
    );

    let sink = CollectingSink::new();
    let outcome = harness
        .service
        .run(envelope.clone(), &sink)
        .await
        .expect("first call pauses");
    let RunOutcome::Paused {
        run_id,
        status,
        pending_request_id,
        ..
    } = outcome
    else {
        panic!("expected pause, got {outcome:?}");
    };
    assert_eq!(status, RunStatus::AwaitingHitl);
    let request_id = pending_request_id.expect("request raised");
    assert!(sink.kinds().contains(&FlexEventKind::HitlRequest));

    // The pause snapshot is persisted and resumable.
    let snapshot = harness
        .persistence
        .load_plan_snapshot(&run_id, None)
        .await
        .expect("snapshot saved");
    assert!(!snapshot.pending_node_ids.is_empty() || snapshot.snapshot["pendingState"]["policyActions"].is_array());

    // Approve, then resume via constraints.resumeRunId.
    harness
        .hitl
        .submit_responses(&run_id, vec![HitlResponse::approval(&request_id, Some("ops"))])
        .await;
    let mut resume_envelope = envelope;
    resume_envelope.constraints = Some(
        serde_json::from_value(json!({ "resumeRunId": run_id })).unwrap(),
    );

    let resume_sink = CollectingSink::new();
    let outcome = harness
        .service
        .run(resume_envelope, &resume_sink)
        .await
        .expect("resume completes");
    let RunOutcome::Completed { output, .. } = outcome else {
        panic!("expected completion after approval");
    };
    assert_eq!(output, json!({ "copyVariants": [{ "post": "Needs sign-off." }] }));
    assert!(resume_sink.kinds().contains(&FlexEventKind::Complete));
}

#[tokio::test]
async fn test_hitl_rejection_fails_run() {
    let harness = Harness::new(vec![generator_draft()]).await;
    harness.register(content_generator()).await;
    harness.runtime.enqueue(
        "contentGenerator",
        vec![json!({ "copyVariants": [{ "post": "Doomed." }] })],
    );

    let mut envelope = variants_envelope();
    envelope.policies.planner = Some(
        serde_json::from_value(json!({
            "directives": { "requiresHitlApproval": true }
        }))
        .unwrap(),
    );

    let sink = CollectingSink::new();
    let RunOutcome::Paused {
        run_id,
        pending_request_id,
        ..
    } = harness.service.run(envelope, &sink).await.unwrap()
    else {
        panic!("expected pause");
    };
    let request_id = pending_request_id.unwrap();

    let resume_sink = CollectingSink::new();
    let err = harness
        .service
        .resolve_hitl(
            &run_id,
            vec![HitlResponse::rejection(&request_id, Some("ops"), Some("not on brand"))],
            Some("ops"),
            None,
            &resume_sink,
        )
        .await
        .expect_err("rejection fails the run");
    assert_eq!(err.code(), "engine_failure");

    let record = harness.persistence.load_flex_run(&run_id).await.unwrap();
    assert_eq!(record.status, RunStatus::Failed);
}

// ============================================================================
// Scenario: thread re-use after completion
// ============================================================================

#[tokio::test]
async fn test_thread_reuse_after_completion_starts_new_run() {
    let harness = Harness::new(vec![generator_draft()]).await;
    harness.register(content_generator()).await;
    harness.runtime.enqueue(
        "contentGenerator",
        vec![
            json!({ "copyVariants": [{ "post": "first" }] }),
            json!({ "copyVariants": [{ "post": "second" }] }),
        ],
    );

    let mut first = variants_envelope();
    first.metadata = Some(json!({ "threadId": "t1" }));
    let sink1 = CollectingSink::new();
    let outcome1 = harness.service.run(first, &sink1).await.unwrap();

    let mut second = variants_envelope();
    second.objective = "Create a follow-up post".to_string();
    second.metadata = Some(json!({ "threadId": "t1" }));
    let sink2 = CollectingSink::new();
    let outcome2 = harness.service.run(second, &sink2).await.unwrap();

    let (RunOutcome::Completed { run_id: id1, .. }, RunOutcome::Completed { run_id: id2, output, .. }) =
        (outcome1, outcome2)
    else {
        panic!("both runs should complete");
    };
    assert_ne!(id1, id2, "completed threads start fresh runs");
    assert_eq!(output, json!({ "copyVariants": [{ "post": "second" }] }));
}

// ============================================================================
// Scenario: invalid DSL at ingress
// ============================================================================

#[tokio::test]
async fn test_invalid_condition_dsl_rejected_before_run() {
    let harness = Harness::new(vec![generator_draft()]).await;
    harness.register(content_generator()).await;

    let mut envelope = variants_envelope();
    envelope.policies.runtime.push(
        serde_json::from_value(json!({
            "id": "broken",
            "trigger": {
                "kind": "onNodeComplete",
                "condition": { "dsl": "facets.planKnobs.hookIntensity <" }
            },
            "action": { "kind": "replan" }
        }))
        .unwrap(),
    );

    let sink = CollectingSink::new();
    let err = harness.service.run(envelope, &sink).await.unwrap_err();
    assert_eq!(err.code(), "invalid_condition_dsl");

    // No run was started: nothing persisted, nothing streamed.
    assert!(sink.events().is_empty());
    assert!(
        harness
            .persistence
            .list_pending_human_tasks(HumanTaskFilter::default())
            .await
            .is_empty()
    );
}

// ============================================================================
// Scenario: post-condition retry then fail
// ============================================================================

#[tokio::test]
async fn test_post_condition_retry_then_fail() {
    let harness = Harness::new(vec![serde_json::from_value::<PlanDraft>(json!({
        "nodes": [{
            "id": "finalize",
            "capabilityId": "finalizer",
            "inputFacets": ["objectiveBrief"],
            "outputFacets": ["post_copy"]
        }]
    }))
    .unwrap()])
    .await;

    harness
        .register(json!({
            "capabilityId": "finalizer",
            "version": "1.0.0",
            "displayName": "Finalizer",
            "agentType": "ai",
            "inputContract": { "mode": "facets", "facets": ["objectiveBrief"] },
            "outputContract": { "mode": "facets", "facets": ["post_copy"] },
            "postConditions": [{
                "facet": "post_copy",
                "path": "status",
                "condition": { "dsl": "facets.post_copy.status == \"ready\"" }
            }]
        }))
        .await;
    // Both the first attempt and the retry come back as drafts.
    harness.runtime.enqueue(
        "finalizer",
        vec![json!({ "post_copy": { "status": "draft" } })],
    );

    let envelope: TaskEnvelope = serde_json::from_value(json!({
        "objective": "Finalize the post",
        "inputs": { "objectiveBrief": "Ship announcement" },
        "outputContract": { "mode": "facets", "facets": ["post_copy"] }
    }))
    .unwrap();

    let sink = CollectingSink::new();
    let err = harness.service.run(envelope, &sink).await.unwrap_err();
    let FlexRunError::Engine(engine_err) = &err else {
        panic!("expected engine failure, got {err:?}");
    };
    assert!(engine_err.to_string().contains("policy"), "{engine_err}");

    // Default retry bound of one means exactly two invocations, the second
    // carrying the retry context.
    let prompts = harness.runtime.prompts_for("finalizer");
    assert_eq!(prompts.len(), 2);
    assert!(!prompts[0].contains("Previous Attempt Failed"));
    assert!(prompts[1].contains("Previous Attempt Failed"));

    let run_id = sink.events()[0].run_id.clone();
    let record = harness.persistence.load_flex_run(&run_id).await.unwrap();
    assert_eq!(record.status, RunStatus::Failed);
}

// ============================================================================
// Routing
// ============================================================================

#[tokio::test]
async fn test_routing_selects_matching_branch() {
    let draft: PlanDraft = serde_json::from_value(json!({
        "nodes": [
            {
                "id": "route",
                "kind": "routing",
                "routing": {
                    "routes": [{
                        "to": "spicy",
                        "condition": { "dsl": "facets.planKnobs.hookIntensity >= 0.7" }
                    }],
                    "elseTo": "mild"
                }
            },
            {
                "id": "spicy",
                "capabilityId": "contentGenerator",
                "inputFacets": ["objectiveBrief"],
                "outputFacets": ["copyVariants"]
            },
            {
                "id": "mild",
                "capabilityId": "contentGenerator",
                "inputFacets": ["objectiveBrief"],
                "outputFacets": ["copyVariants"]
            }
        ],
        "edges": [
            { "from": "route", "to": "spicy" },
            { "from": "route", "to": "mild" }
        ]
    }))
    .unwrap();

    let harness = Harness::new(vec![draft]).await;
    harness.register(content_generator()).await;
    harness.runtime.enqueue(
        "contentGenerator",
        vec![json!({ "copyVariants": [{ "post": "routed" }] })],
    );

    let envelope: TaskEnvelope = serde_json::from_value(json!({
        "objective": "Create LinkedIn post variants",
        "inputs": {
            "objectiveBrief": "Announce",
            "planKnobs": { "hookIntensity": 0.9 }
        },
        "outputContract": { "mode": "facets", "facets": ["copyVariants"] }
    }))
    .unwrap();

    let sink = CollectingSink::new();
    let outcome = harness.service.run(envelope, &sink).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Completed { .. }));

    // The routing selection is visible in the stream, and only the selected
    // branch ran.
    let logs: Vec<String> = sink
        .events()
        .into_iter()
        .filter(|e| e.kind == FlexEventKind::Log)
        .filter_map(|e| e.payload["message"].as_str().map(String::from))
        .collect();
    assert!(logs.iter().any(|m| m == "routing_selected:spicy"), "{logs:?}");

    let started: Vec<Option<String>> = sink
        .events()
        .into_iter()
        .filter(|e| e.kind == FlexEventKind::NodeStart)
        .map(|e| e.node_id)
        .collect();
    assert!(started.contains(&Some("spicy".to_string())));
    assert!(!started.contains(&Some("mild".to_string())));
}

// ============================================================================
// Human tasks
// ============================================================================

fn approver() -> Value {
    json!({
        "capabilityId": "copyApprover",
        "version": "1.0.0",
        "displayName": "Copy approver",
        "agentType": "human",
        "outputContract": { "mode": "facets", "facets": ["feedback"] },
        "assignmentDefaults": {
            "role": "editor",
            "timeoutSeconds": 3600,
            "onDecline": "fail_run"
        },
        "instructionTemplates": { "app": "Review the copy and leave feedback." }
    })
}

fn human_review_draft() -> PlanDraft {
    serde_json::from_value(json!({
        "nodes": [
            {
                "id": "generate",
                "capabilityId": "contentGenerator",
                "inputFacets": ["objectiveBrief"],
                "outputFacets": ["copyVariants"]
            },
            {
                "id": "review",
                "capabilityId": "copyApprover",
                "outputFacets": ["feedback"]
            }
        ]
    }))
    .unwrap()
}

fn human_review_envelope() -> TaskEnvelope {
    serde_json::from_value(json!({
        "objective": "Create reviewed post variants",
        "inputs": { "objectiveBrief": "Announce" },
        "outputContract": { "mode": "facets", "facets": ["copyVariants", "feedback"] }
    }))
    .unwrap()
}

#[tokio::test]
async fn test_human_task_pause_submit_resume() {
    let harness = Harness::new(vec![human_review_draft()]).await;
    harness.register(content_generator()).await;
    harness.register(approver()).await;
    harness.runtime.enqueue(
        "contentGenerator",
        vec![json!({ "copyVariants": [{ "post": "please review" }] })],
    );

    let sink = CollectingSink::new();
    let outcome = harness
        .service
        .run(human_review_envelope(), &sink)
        .await
        .unwrap();
    let RunOutcome::Paused {
        run_id,
        status,
        awaiting_node_id,
        ..
    } = outcome
    else {
        panic!("expected human pause");
    };
    assert_eq!(status, RunStatus::AwaitingHuman);
    assert_eq!(awaiting_node_id.as_deref(), Some("review"));

    // The task shows up on the pending listing with its assignment payload.
    let tasks = harness
        .persistence
        .list_pending_human_tasks(HumanTaskFilter {
            role: Some("editor".to_string()),
            ..Default::default()
        })
        .await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].node_id, "review");
    assert!(tasks[0].assignment["assignmentId"].is_string());

    // Submit the human's response; it becomes the node output.
    let resume_sink = CollectingSink::new();
    let outcome = harness
        .service
        .submit_human_task(
            &run_id,
            HumanTaskSubmission {
                payload: json!({
                    "feedback": [
                        { "id": "fb-1", "facet": "copyVariants", "message": "ship it", "resolution": "resolved" }
                    ]
                }),
                operator: Some("sam".to_string()),
                note: None,
            },
            &resume_sink,
        )
        .await
        .unwrap();

    let RunOutcome::Completed { output, .. } = outcome else {
        panic!("expected completion after submission");
    };
    assert_eq!(output["copyVariants"][0]["post"], "please review");
    assert_eq!(output["feedback"][0]["id"], "fb-1");

    let audits = harness.persistence.resume_audits(&run_id).await;
    assert_eq!(audits.len(), 1);
    assert_eq!(audits[0].operator.as_deref(), Some("sam"));
}

#[tokio::test]
async fn test_human_task_decline_fails_run() {
    let harness = Harness::new(vec![human_review_draft()]).await;
    harness.register(content_generator()).await;
    harness.register(approver()).await;
    harness.runtime.enqueue(
        "contentGenerator",
        vec![json!({ "copyVariants": [{ "post": "nobody wants this" }] })],
    );

    let sink = CollectingSink::new();
    let RunOutcome::Paused { run_id, .. } = harness
        .service
        .run(human_review_envelope(), &sink)
        .await
        .unwrap()
    else {
        panic!("expected human pause");
    };

    let decline_sink = CollectingSink::new();
    let ack = harness
        .service
        .decline_human_task(&run_id, "out of office", None, &decline_sink)
        .await
        .unwrap();
    assert_eq!(ack.status, RunStatus::Failed);
    assert_eq!(ack.node_id, "review");

    let record = harness.persistence.load_flex_run(&run_id).await.unwrap();
    assert_eq!(record.status, RunStatus::Failed);
    assert!(record.last_error.as_deref().unwrap().contains("declined"));

    // Declining again is an invalid-state error, not a second failure.
    let err = harness
        .service
        .decline_human_task(&run_id, "again", None, &decline_sink)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid_run_state");
}

// ============================================================================
// Replan via runtime policy
// ============================================================================

#[tokio::test]
async fn test_replan_policy_reenters_planner_with_graph_context() {
    // First draft runs the generator; the policy then requests a replan and
    // the second draft runs QA against the already-produced variants.
    let second_draft: PlanDraft = serde_json::from_value(json!({
        "nodes": [{
            "id": "qa",
            "capabilityId": "qaReviewer",
            "inputFacets": ["copyVariants"],
            "outputFacets": ["qaFindings"]
        }]
    }))
    .unwrap();

    let harness = Harness::new(vec![generator_draft(), second_draft]).await;
    harness.register(content_generator()).await;
    harness
        .register(json!({
            "capabilityId": "qaReviewer",
            "version": "1.0.0",
            "displayName": "QA reviewer",
            "agentType": "ai",
            "inputContract": { "mode": "facets", "facets": ["copyVariants"] },
            "outputContract": { "mode": "facets", "facets": ["qaFindings"] }
        }))
        .await;
    harness.runtime.enqueue(
        "contentGenerator",
        vec![json!({ "copyVariants": [{ "post": "v1" }] })],
    );
    harness.runtime.enqueue(
        "qaReviewer",
        vec![json!({ "qaFindings": [{ "finding": "looks fine" }] })],
    );

    let mut envelope: TaskEnvelope = serde_json::from_value(json!({
        "objective": "Create QA'd post variants",
        "inputs": { "objectiveBrief": "Announce" },
        "outputContract": { "mode": "facets", "facets": ["qaFindings"] }
    }))
    .unwrap();
    envelope.policies.runtime.push(
        serde_json::from_value(json!({
            "id": "needs-qa",
            "trigger": {
                "kind": "onNodeComplete",
                "selector": { "capabilityId": "contentGenerator" },
                "condition": { "dsl": "facets.qaFindings == null" }
            },
            "action": { "kind": "replan" }
        }))
        .unwrap(),
    );

    let sink = CollectingSink::new();
    let outcome = harness.service.run(envelope, &sink).await.unwrap();
    let RunOutcome::Completed { output, .. } = outcome else {
        panic!("expected completion after replan");
    };
    assert_eq!(output["qaFindings"][0]["finding"], "looks fine");

    // Two plans were generated; the replan is visible in the stream.
    let plan_events = sink
        .kinds()
        .into_iter()
        .filter(|k| *k == FlexEventKind::PlanGenerated)
        .count();
    assert_eq!(plan_events, 2);
    assert!(sink.kinds().contains(&FlexEventKind::PolicyTriggered));
}

// ============================================================================
// Goto policy
// ============================================================================

#[tokio::test]
async fn test_goto_policy_reruns_target_until_bound() {
    let harness = Harness::new(vec![generator_draft()]).await;
    harness.register(content_generator()).await;
    harness.runtime.enqueue(
        "contentGenerator",
        vec![
            json!({ "copyVariants": [] }),
            json!({ "copyVariants": [{ "post": "second try" }] }),
        ],
    );

    let mut envelope = variants_envelope();
    envelope.policies.runtime.push(
        serde_json::from_value(json!({
            "id": "retry-empty",
            "trigger": {
                "kind": "onNodeComplete",
                "selector": { "capabilityId": "contentGenerator" },
                "condition": { "dsl": "facets.copyVariants == []" }
            },
            "action": { "kind": "goto", "next": "generate", "maxAttempts": 1 }
        }))
        .unwrap(),
    );

    let sink = CollectingSink::new();
    let outcome = harness.service.run(envelope, &sink).await.unwrap();
    let RunOutcome::Completed { output, .. } = outcome else {
        panic!("expected completion after goto retry");
    };
    assert_eq!(output["copyVariants"][0]["post"], "second try");
    assert_eq!(harness.runtime.prompts_for("contentGenerator").len(), 2);

    let goto_updates: Vec<_> = sink
        .events()
        .into_iter()
        .filter(|e| e.kind == FlexEventKind::PolicyUpdate)
        .filter(|e| e.payload["action"] == "goto")
        .collect();
    assert_eq!(goto_updates.len(), 1);
}

#[tokio::test]
async fn test_goto_unknown_node_is_noop() {
    let harness = Harness::new(vec![generator_draft()]).await;
    harness.register(content_generator()).await;
    harness.runtime.enqueue(
        "contentGenerator",
        vec![json!({ "copyVariants": [{ "post": "fine" }] })],
    );

    let mut envelope = variants_envelope();
    envelope.policies.runtime.push(
        serde_json::from_value(json!({
            "id": "bad-goto",
            "trigger": { "kind": "onNodeComplete" },
            "action": { "kind": "goto", "next": "ghost-node" }
        }))
        .unwrap(),
    );

    let sink = CollectingSink::new();
    let outcome = harness.service.run(envelope, &sink).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Completed { .. }));

    let logs: Vec<String> = sink
        .events()
        .into_iter()
        .filter(|e| e.kind == FlexEventKind::Log)
        .filter_map(|e| e.payload["message"].as_str().map(String::from))
        .collect();
    assert!(
        logs.iter().any(|m| m == "runtime_policy_goto_missing_node"),
        "{logs:?}"
    );
}

// ============================================================================
// Goal conditions
// ============================================================================

#[tokio::test]
async fn test_goal_condition_failure_replans_then_succeeds() {
    // Attempt one produces a draft; the goal condition on post_copy.status
    // fails and the coordinator replans. Attempt two produces ready copy.
    let finalize_draft: PlanDraft = serde_json::from_value(json!({
        "nodes": [{
            "id": "finalize",
            "capabilityId": "finalizer",
            "inputFacets": ["objectiveBrief"],
            "outputFacets": ["post_copy"]
        }]
    }))
    .unwrap();

    let harness = Harness::new(vec![finalize_draft.clone(), finalize_draft]).await;
    harness
        .register(json!({
            "capabilityId": "finalizer",
            "version": "1.0.0",
            "displayName": "Finalizer",
            "agentType": "ai",
            "inputContract": { "mode": "facets", "facets": ["objectiveBrief"] },
            "outputContract": { "mode": "facets", "facets": ["post_copy"] }
        }))
        .await;
    harness.runtime.enqueue(
        "finalizer",
        vec![
            json!({ "post_copy": { "status": "draft" } }),
            json!({ "post_copy": { "status": "ready" } }),
        ],
    );

    let envelope: TaskEnvelope = serde_json::from_value(json!({
        "objective": "Finalize the post",
        "inputs": { "objectiveBrief": "Announce" },
        "outputContract": { "mode": "facets", "facets": ["post_copy"] },
        "goal_condition": [{
            "facet": "post_copy",
            "path": "status",
            "condition": { "dsl": "facets.post_copy.status == \"ready\"" }
        }]
    }))
    .unwrap();

    let sink = CollectingSink::new();
    let outcome = harness.service.run(envelope, &sink).await.unwrap();
    let RunOutcome::Completed {
        output,
        goal_condition_results,
        ..
    } = outcome
    else {
        panic!("expected completion after goal-driven replan");
    };
    assert_eq!(output["post_copy"]["status"], "ready");
    assert!(goal_condition_results.iter().all(|r| r.satisfied));
}
