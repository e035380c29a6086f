//! Envelope -> validated plan.
//!
//! The planner normalizes policies, scopes the capability set through CRCS,
//! asks the external service for a draft, validates it deterministically and
//! resolves per-node contracts and facet provenance.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info};

use crate::conditions::ConditionError;
use crate::facets::FacetContractError;
use crate::models::{
    CapabilityContract, CapabilityRecord, GraphContext, NodeBundle, NodeContracts, NodeFacets,
    NodeProvenance, Plan, PlanEdge, PlanNode, PlanNodeKind, RouteSpec, RoutingSpec, TaskEnvelope,
};
use crate::registry::CapabilityRegistry;

use super::service::{
    DraftNode, PlanDraft, PlannerHooks, PlannerService, PlannerServiceError, PlannerServiceRequest,
};
use super::validate::{DraftValidator, PlannerDiagnostic};

/// Planning failures.
#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("no capability arrangement satisfies the objective: {reason}")]
    UnsupportedObjective { reason: String },
    #[error("missing pinned capabilities: {ids:?}")]
    MissingPinnedCapabilities { ids: Vec<String> },
    #[error("planner draft rejected ({} diagnostics)", diagnostics.len())]
    DraftRejected { diagnostics: Vec<PlannerDiagnostic> },
    #[error(transparent)]
    InvalidConditionDsl(#[from] ConditionError),
    #[error(transparent)]
    FacetContract(#[from] FacetContractError),
    #[error("planner service failure: {0}")]
    Service(String),
}

/// LLM-assisted planner over the capability registry.
pub struct FlexPlanner {
    registry: Arc<CapabilityRegistry>,
    service: Arc<dyn PlannerService>,
}

impl FlexPlanner {
    pub fn new(registry: Arc<CapabilityRegistry>, service: Arc<dyn PlannerService>) -> Self {
        Self { registry, service }
    }

    /// Produce a validated plan for the envelope.
    ///
    /// `attempt` is 1-based and becomes the plan version; replans pass the
    /// interrupted run's `graph_context` and any observed goal-condition
    /// failure facets.
    pub async fn plan(
        &self,
        run_id: &str,
        envelope: &TaskEnvelope,
        graph_context: Option<&GraphContext>,
        goal_failure_facets: &[String],
        attempt: u32,
        hooks: &PlannerHooks,
    ) -> Result<Plan, PlannerError> {
        let active = self.registry.list_active().await;

        let mut envelope = envelope.clone();
        envelope.normalize_conditions()?;

        let crcs = self
            .registry
            .compute_crcs_snapshot(&envelope, graph_context, goal_failure_facets)
            .await;
        if !crcs.missing_pinned_capability_ids.is_empty() {
            return Err(PlannerError::MissingPinnedCapabilities {
                ids: crcs.missing_pinned_capability_ids.clone(),
            });
        }

        let request = PlannerServiceRequest {
            run_id: run_id.to_string(),
            envelope: envelope.clone(),
            capabilities: crcs.rows.clone(),
            policies: envelope.policies.clone(),
            context: graph_context.cloned(),
            attempt,
        };
        if let Some(on_request) = &hooks.on_request {
            on_request(&request);
        }

        let draft = self
            .service
            .propose_plan(&request)
            .await
            .map_err(|err| match err {
                PlannerServiceError::Unsupported { reason } => {
                    PlannerError::UnsupportedObjective { reason }
                }
                PlannerServiceError::Failed(message) => PlannerError::Service(message),
            })?;

        let diagnostics = DraftValidator::new(&active).check_all(&draft);
        if !diagnostics.is_empty() {
            debug!(count = diagnostics.len(), "planner draft rejected");
            return Err(PlannerError::DraftRejected { diagnostics });
        }

        let capability_index: BTreeMap<&str, &CapabilityRecord> = active
            .iter()
            .map(|c| (c.capability_id.as_str(), c))
            .collect();

        let mut nodes = Vec::with_capacity(draft.nodes.len());
        for draft_node in &draft.nodes {
            nodes.push(self.resolve_node(run_id, &envelope, draft_node, &capability_index)?);
        }
        // When the caller supplied a raw-schema output contract, the
        // terminal execution node must satisfy it directly.
        if let CapabilityContract::JsonSchema { schema, .. } = &envelope.output_contract
            && let Some(terminal) = nodes
                .iter_mut()
                .rev()
                .find(|n| n.kind == PlanNodeKind::Execution)
        {
            terminal.contracts.output = Some(schema.clone());
            terminal.bundle.contract = Some(schema.clone());
        }
        let edges = derive_edges(&draft, &nodes);

        let mut metadata = match draft.metadata.clone() {
            Value::Object(map) => Value::Object(map),
            Value::Null => json!({}),
            other => json!({ "draft": other }),
        };
        if let Some(object) = metadata.as_object_mut() {
            object.insert("plannerAttempts".to_string(), json!(attempt));
            object.insert(
                "plannerContext".to_string(),
                json!({
                    "mrcsSize": crcs.mrcs_size,
                    "totalRows": crcs.total_rows,
                    "rowCap": crcs.row_cap,
                    "truncated": crcs.truncated,
                    "pinnedCapabilityIds": crcs.pinned_capability_ids,
                }),
            );
        }

        info!(
            run_id,
            attempt,
            nodes = nodes.len(),
            edges = edges.len(),
            "plan generated"
        );
        Ok(Plan {
            run_id: run_id.to_string(),
            version: attempt,
            created_at: Utc::now().to_rfc3339(),
            nodes,
            edges,
            metadata,
        })
    }

    /// Resolve one draft node into an executable plan node: effective facet
    /// lists, compiled contracts and facet provenance.
    fn resolve_node(
        &self,
        run_id: &str,
        envelope: &TaskEnvelope,
        draft: &DraftNode,
        capabilities: &BTreeMap<&str, &CapabilityRecord>,
    ) -> Result<PlanNode, PlannerError> {
        let capability = draft
            .capability_id
            .as_deref()
            .and_then(|id| capabilities.get(id))
            .copied();

        let input_facets = if !draft.input_facets.is_empty() {
            draft.input_facets.clone()
        } else {
            capability.map(|c| c.input_facets.clone()).unwrap_or_default()
        };
        let output_facets = if !draft.output_facets.is_empty() {
            draft.output_facets.clone()
        } else {
            capability.map(|c| c.output_facets.clone()).unwrap_or_default()
        };

        let compiled = self
            .registry
            .catalog()
            .compile_contracts(&input_facets, &output_facets)?;

        // Facet contracts win; a capability registered with a raw schema
        // contract contributes that schema unchanged.
        let input_contract = compiled
            .input
            .as_ref()
            .map(|c| c.schema.clone())
            .or_else(|| capability.and_then(|c| c.input_schema().cloned()));
        let output_contract = compiled
            .output
            .as_ref()
            .map(|c| c.schema.clone())
            .or_else(|| capability.and_then(|c| c.output_schema().cloned()));

        let routing = match &draft.routing {
            Some(spec) => Some(compile_routing(spec)?),
            None => None,
        };

        let label = draft
            .label
            .clone()
            .or_else(|| capability.map(|c| c.display_name.clone()))
            .unwrap_or_else(|| draft.id.clone());

        Ok(PlanNode {
            id: draft.id.clone(),
            kind: draft.kind,
            capability_id: draft.capability_id.clone(),
            capability_label: capability
                .map(|c| c.display_name.clone())
                .unwrap_or_else(|| label.clone()),
            capability_version: capability.map(|c| c.version.clone()),
            derived_capability: draft.derived_capability.clone(),
            label,
            bundle: NodeBundle {
                run_id: run_id.to_string(),
                node_id: draft.id.clone(),
                objective: envelope.objective.clone(),
                instructions: draft.instructions.clone(),
                inputs: draft.inputs.clone(),
                policies: None,
                contract: output_contract.clone(),
                assignment: None,
            },
            contracts: NodeContracts {
                input: input_contract,
                output: output_contract,
            },
            facets: NodeFacets {
                input: input_facets,
                output: output_facets,
            },
            provenance: NodeProvenance {
                input: compiled
                    .input
                    .map(|c| c.provenance)
                    .unwrap_or_default(),
                output: compiled
                    .output
                    .map(|c| c.provenance)
                    .unwrap_or_default(),
            },
            rationale: draft.rationale.clone(),
            routing,
            post_condition_guards: capability
                .map(|c| c.post_conditions.clone())
                .unwrap_or_default(),
            metadata: json!({}),
        })
    }
}

fn compile_routing(spec: &RoutingSpec) -> Result<RoutingSpec, PlannerError> {
    let mut routes = Vec::with_capacity(spec.routes.len());
    for route in &spec.routes {
        routes.push(RouteSpec {
            to: route.to.clone(),
            condition: route.condition.ensure_compiled()?.into(),
            label: route.label.clone(),
        });
    }
    Ok(RoutingSpec {
        routes,
        else_to: spec.else_to.clone(),
    })
}

/// Keep planner-supplied edges verbatim; nodes the edge set never mentions
/// fall back to their sequential predecessor so a draft cannot silently
/// orphan them. An empty edge set stays empty (sequential default).
fn derive_edges(draft: &PlanDraft, nodes: &[PlanNode]) -> Vec<PlanEdge> {
    if draft.edges.is_empty() {
        return Vec::new();
    }
    let mut edges = draft.edges.clone();
    let mentioned: std::collections::BTreeSet<&str> = draft
        .edges
        .iter()
        .flat_map(|e| [e.from.as_str(), e.to.as_str()])
        .collect();
    for (index, node) in nodes.iter().enumerate().skip(1) {
        if !mentioned.contains(node.id.as_str()) {
            edges.push(PlanEdge {
                from: nodes[index - 1].id.clone(),
                to: node.id.clone(),
            });
        }
    }
    edges
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FlexConfig;
    use crate::facets::FacetCatalog;
    use crate::models::{CapabilityRegistration, PlannerPolicies, SelectionPolicy};
    use crate::planner::service::ScriptedPlanner;
    use crate::registry::MemoryCapabilityStore;

    async fn registry_with_generator() -> Arc<CapabilityRegistry> {
        let registry = Arc::new(CapabilityRegistry::new(
            MemoryCapabilityStore::shared(),
            Arc::new(FacetCatalog::with_defaults()),
            &FlexConfig::default(),
        ));
        let payload: CapabilityRegistration = serde_json::from_value(json!({
            "capabilityId": "contentGenerator",
            "version": "1.0.0",
            "displayName": "Content generator",
            "agentType": "ai",
            "inputContract": { "mode": "facets", "facets": ["objectiveBrief"] },
            "outputContract": { "mode": "facets", "facets": ["copyVariants"] }
        }))
        .unwrap();
        registry.register(payload).await.unwrap();
        registry
    }

    fn envelope() -> TaskEnvelope {
        serde_json::from_value(json!({
            "objective": "Create LinkedIn post variants",
            "inputs": { "objectiveBrief": "Announce the launch" },
            "outputContract": { "mode": "facets", "facets": ["copyVariants"] }
        }))
        .unwrap()
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
        .unwrap()
    }

    #[tokio::test]
    async fn test_plan_resolves_contracts_and_provenance() {
        let registry = registry_with_generator().await;
        let planner = FlexPlanner::new(
            registry,
            Arc::new(ScriptedPlanner::single(generator_draft())),
        );

        let plan = planner
            .plan("run-1", &envelope(), None, &[], 1, &PlannerHooks::default())
            .await
            .unwrap();

        assert_eq!(plan.version, 1);
        assert_eq!(plan.nodes.len(), 1);
        let node = &plan.nodes[0];
        assert_eq!(node.capability_id.as_deref(), Some("contentGenerator"));
        assert!(node.contracts.input.is_some());
        assert!(node.contracts.output.is_some());
        assert_eq!(node.provenance.output[0].facet, "copyVariants");
        assert_eq!(node.provenance.output[0].pointer, "/copyVariants");
        assert_eq!(node.bundle.objective, "Create LinkedIn post variants");
        assert_eq!(plan.metadata["plannerAttempts"], 1);
        assert_eq!(plan.metadata["plannerContext"]["mrcsSize"], 1);
    }

    #[tokio::test]
    async fn test_plan_rejects_unregistered_capability() {
        let registry = registry_with_generator().await;
        let draft: PlanDraft = serde_json::from_value(json!({
            "nodes": [{ "id": "n1", "capabilityId": "ghost" }]
        }))
        .unwrap();
        let planner = FlexPlanner::new(registry, Arc::new(ScriptedPlanner::single(draft)));

        let err = planner
            .plan("run-1", &envelope(), None, &[], 1, &PlannerHooks::default())
            .await
            .unwrap_err();
        let PlannerError::DraftRejected { diagnostics } = err else {
            panic!("expected DraftRejected, got {err:?}");
        };
        assert_eq!(diagnostics[0].code, "CAPABILITY_NOT_REGISTERED");
    }

    #[tokio::test]
    async fn test_plan_fails_fast_on_missing_pinned() {
        let registry = registry_with_generator().await;
        let planner = FlexPlanner::new(
            registry,
            Arc::new(ScriptedPlanner::single(generator_draft())),
        );
        let mut env = envelope();
        env.policies.planner = Some(PlannerPolicies {
            selection: Some(SelectionPolicy {
                require: vec!["notRegistered".to_string()],
                avoid: vec![],
                forbid: vec![],
            }),
            directives: None,
        });

        let err = planner
            .plan("run-1", &env, None, &[], 1, &PlannerHooks::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PlannerError::MissingPinnedCapabilities { ref ids } if ids == &vec!["notRegistered".to_string()]));
    }

    #[tokio::test]
    async fn test_plan_rejects_invalid_policy_dsl() {
        let registry = registry_with_generator().await;
        let planner = FlexPlanner::new(
            registry,
            Arc::new(ScriptedPlanner::single(generator_draft())),
        );
        let mut env = envelope();
        env.policies.runtime.push(serde_json::from_value(json!({
            "id": "bad",
            "trigger": {
                "kind": "onNodeComplete",
                "condition": { "dsl": "facets.planKnobs.hookIntensity <" }
            },
            "action": { "kind": "replan" }
        }))
        .unwrap());

        let err = planner
            .plan("run-1", &env, None, &[], 1, &PlannerHooks::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PlannerError::InvalidConditionDsl(_)));
    }

    #[tokio::test]
    async fn test_unsupported_objective_propagates() {
        struct Refusing;
        #[async_trait::async_trait]
        impl PlannerService for Refusing {
            async fn propose_plan(
                &self,
                _request: &PlannerServiceRequest,
            ) -> Result<PlanDraft, PlannerServiceError> {
                Err(PlannerServiceError::Unsupported {
                    reason: "no capability covers translation".to_string(),
                })
            }
        }

        let registry = registry_with_generator().await;
        let planner = FlexPlanner::new(registry, Arc::new(Refusing));
        let err = planner
            .plan("run-1", &envelope(), None, &[], 1, &PlannerHooks::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PlannerError::UnsupportedObjective { .. }));
    }

    #[tokio::test]
    async fn test_hooks_observe_request() {
        let registry = registry_with_generator().await;
        let planner = FlexPlanner::new(
            registry,
            Arc::new(ScriptedPlanner::single(generator_draft())),
        );
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let hooks = PlannerHooks {
            on_request: Some(Box::new(move |request: &PlannerServiceRequest| {
                seen_clone
                    .lock()
                    .unwrap()
                    .push(request.capabilities.len());
            })),
        };

        planner
            .plan("run-1", &envelope(), None, &[], 1, &hooks)
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_partial_edges_filled_sequentially() {
        let registry = registry_with_generator().await;
        let draft: PlanDraft = serde_json::from_value(json!({
            "nodes": [
                { "id": "a", "capabilityId": "contentGenerator", "outputFacets": ["copyVariants"] },
                { "id": "b", "capabilityId": "contentGenerator", "outputFacets": ["copyVariants"] },
                { "id": "c", "capabilityId": "contentGenerator", "outputFacets": ["copyVariants"] }
            ],
            "edges": [{ "from": "a", "to": "b" }]
        }))
        .unwrap();
        let planner = FlexPlanner::new(registry, Arc::new(ScriptedPlanner::single(draft)));

        let plan = planner
            .plan("run-1", &envelope(), None, &[], 1, &PlannerHooks::default())
            .await
            .unwrap();
        assert!(plan.edges.contains(&PlanEdge {
            from: "b".to_string(),
            to: "c".to_string()
        }));
    }
}
