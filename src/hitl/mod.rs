//! Human-in-the-loop service contract.
//!
//! The engine raises requests through this seam and later resolves the
//! operator's decision into a policy action. The in-memory implementation
//! enforces the per-run request cap and powers tests and the CLI.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Lifecycle of a HITL request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HitlRequestStatus {
    Pending,
    Resolved,
    Cancelled,
}

/// A question raised to an operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HitlRequest {
    pub request_id: String,
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<String>,
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_summary: Option<Value>,
    pub status: HitlRequestStatus,
    pub created_at: String,
}

/// How an operator answered.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HitlResponseType {
    Approval,
    Rejection,
    Answer,
}

/// One operator response to a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HitlResponse {
    pub request_id: String,
    pub response_type: HitlResponseType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    pub created_at: String,
}

impl HitlResponse {
    pub fn approval(request_id: &str, operator: Option<&str>) -> Self {
        Self {
            request_id: request_id.to_string(),
            response_type: HitlResponseType::Approval,
            approved: Some(true),
            operator: operator.map(|s| s.to_string()),
            note: None,
            payload: None,
            created_at: Utc::now().to_rfc3339(),
        }
    }

    pub fn rejection(request_id: &str, operator: Option<&str>, note: Option<&str>) -> Self {
        Self {
            request_id: request_id.to_string(),
            response_type: HitlResponseType::Rejection,
            approved: Some(false),
            operator: operator.map(|s| s.to_string()),
            note: note.map(|s| s.to_string()),
            payload: None,
            created_at: Utc::now().to_rfc3339(),
        }
    }
}

/// Full HITL state of one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HitlRunState {
    #[serde(default)]
    pub requests: Vec<HitlRequest>,
    #[serde(default)]
    pub responses: Vec<HitlResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_request_id: Option<String>,
    #[serde(default)]
    pub denied_count: u32,
}

/// Payload for raising a request.
#[derive(Debug, Clone)]
pub struct HitlRequestPayload {
    pub run_id: String,
    pub policy_id: Option<String>,
    pub question: String,
    pub rationale: Option<String>,
}

/// Raise-time context: which node pauses, plus callbacks the engine uses to
/// mirror the raise (or its denial) into its own persisted state.
#[derive(Default)]
pub struct RaiseOptions {
    pub pending_node_id: Option<String>,
    pub operator_prompt: Option<String>,
    pub contract_summary: Option<Value>,
    pub on_request: Option<Box<dyn Fn(&HitlRequest) + Send + Sync>>,
    pub on_denied: Option<Box<dyn Fn(&str) + Send + Sync>>,
}

/// Outcome of a raise attempt.
#[derive(Debug, Clone)]
pub enum RaiseOutcome {
    Pending(HitlRequest),
    Denied { reason: String },
}

/// The operator decision derived from a resolved request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitlDecisionKind {
    Approve,
    Reject,
}

#[derive(Debug, Clone)]
pub struct HitlDecision {
    pub kind: HitlDecisionKind,
    pub request: HitlRequest,
    pub response: HitlResponse,
}

/// Map one response to the decision it expresses, if any.
pub fn parse_hitl_decision_action(response: &HitlResponse) -> Option<HitlDecisionKind> {
    if response.response_type == HitlResponseType::Rejection || response.approved == Some(false) {
        return Some(HitlDecisionKind::Reject);
    }
    if response.approved == Some(true) {
        return Some(HitlDecisionKind::Approve);
    }
    None
}

/// Resolve the latest decision for a request, newest response first.
pub fn resolve_hitl_decision(state: &HitlRunState, request_id: &str) -> Option<HitlDecision> {
    let request = state
        .requests
        .iter()
        .find(|r| r.request_id == request_id)?
        .clone();
    let response = state
        .responses
        .iter()
        .rev()
        .find(|r| r.request_id == request_id)?;
    let kind = parse_hitl_decision_action(response)?;
    Some(HitlDecision {
        kind,
        request,
        response: response.clone(),
    })
}

/// HITL surface the engine drives.
#[async_trait]
pub trait HitlService: Send + Sync {
    async fn load_run_state(&self, run_id: &str) -> HitlRunState;

    /// Raise a request, enforcing the per-run cap. A denial increments the
    /// run's denied count and fires `on_denied` instead of `on_request`.
    async fn raise_request(&self, payload: HitlRequestPayload, options: RaiseOptions)
    -> RaiseOutcome;

    /// Record operator responses and resolve their requests.
    async fn submit_responses(&self, run_id: &str, responses: Vec<HitlResponse>);

    /// Cancel a pending request; false when it was not pending.
    async fn remove_request(&self, run_id: &str, request_id: &str) -> bool;
}

/// In-memory `HitlService` with a per-run request cap.
pub struct MemoryHitlService {
    max_requests_per_run: u32,
    state: Mutex<BTreeMap<String, HitlRunState>>,
}

impl MemoryHitlService {
    pub fn new(max_requests_per_run: u32) -> Self {
        Self {
            max_requests_per_run,
            state: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn shared(max_requests_per_run: u32) -> Arc<Self> {
        Arc::new(Self::new(max_requests_per_run))
    }
}

#[async_trait]
impl HitlService for MemoryHitlService {
    async fn load_run_state(&self, run_id: &str) -> HitlRunState {
        self.state
            .lock()
            .await
            .get(run_id)
            .cloned()
            .unwrap_or_default()
    }

    async fn raise_request(
        &self,
        payload: HitlRequestPayload,
        options: RaiseOptions,
    ) -> RaiseOutcome {
        let mut state = self.state.lock().await;
        let run_state = state.entry(payload.run_id.clone()).or_default();

        let raised = run_state.requests.len() as u32;
        if raised >= self.max_requests_per_run {
            run_state.denied_count += 1;
            let reason = format!(
                "HITL request limit reached ({} per run)",
                self.max_requests_per_run
            );
            if let Some(on_denied) = &options.on_denied {
                on_denied(&reason);
            }
            return RaiseOutcome::Denied { reason };
        }

        let request = HitlRequest {
            request_id: Uuid::new_v4().to_string(),
            run_id: payload.run_id.clone(),
            node_id: options.pending_node_id.clone(),
            policy_id: payload.policy_id.clone(),
            question: options
                .operator_prompt
                .clone()
                .unwrap_or_else(|| payload.question.clone()),
            rationale: payload.rationale.clone(),
            contract_summary: options.contract_summary.clone(),
            status: HitlRequestStatus::Pending,
            created_at: Utc::now().to_rfc3339(),
        };
        run_state.requests.push(request.clone());
        run_state.pending_request_id = Some(request.request_id.clone());

        if let Some(on_request) = &options.on_request {
            on_request(&request);
        }
        RaiseOutcome::Pending(request)
    }

    async fn submit_responses(&self, run_id: &str, responses: Vec<HitlResponse>) {
        let mut state = self.state.lock().await;
        let run_state = state.entry(run_id.to_string()).or_default();
        for response in responses {
            if let Some(request) = run_state
                .requests
                .iter_mut()
                .find(|r| r.request_id == response.request_id)
            {
                request.status = HitlRequestStatus::Resolved;
                if run_state.pending_request_id.as_deref() == Some(&response.request_id) {
                    run_state.pending_request_id = None;
                }
            }
            run_state.responses.push(response);
        }
    }

    async fn remove_request(&self, run_id: &str, request_id: &str) -> bool {
        let mut state = self.state.lock().await;
        let Some(run_state) = state.get_mut(run_id) else {
            return false;
        };
        let Some(request) = run_state
            .requests
            .iter_mut()
            .find(|r| r.request_id == request_id && r.status == HitlRequestStatus::Pending)
        else {
            return false;
        };
        request.status = HitlRequestStatus::Cancelled;
        if run_state.pending_request_id.as_deref() == Some(request_id) {
            run_state.pending_request_id = None;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(run_id: &str) -> HitlRequestPayload {
        HitlRequestPayload {
            run_id: run_id.to_string(),
            policy_id: Some("p1".to_string()),
            question: "Approve the generated copy?".to_string(),
            rationale: None,
        }
    }

    #[tokio::test]
    async fn test_raise_and_resolve_approval() {
        let service = MemoryHitlService::new(3);
        let RaiseOutcome::Pending(request) = service
            .raise_request(payload("r1"), RaiseOptions::default())
            .await
        else {
            panic!("expected pending");
        };

        let state = service.load_run_state("r1").await;
        assert_eq!(state.pending_request_id.as_deref(), Some(request.request_id.as_str()));

        service
            .submit_responses(
                "r1",
                vec![HitlResponse::approval(&request.request_id, Some("ops"))],
            )
            .await;
        let state = service.load_run_state("r1").await;
        assert!(state.pending_request_id.is_none());
        assert_eq!(state.requests[0].status, HitlRequestStatus::Resolved);

        let decision = resolve_hitl_decision(&state, &request.request_id).unwrap();
        assert_eq!(decision.kind, HitlDecisionKind::Approve);
    }

    #[tokio::test]
    async fn test_rejection_decision() {
        let service = MemoryHitlService::new(3);
        let RaiseOutcome::Pending(request) = service
            .raise_request(payload("r1"), RaiseOptions::default())
            .await
        else {
            panic!("expected pending");
        };
        service
            .submit_responses(
                "r1",
                vec![HitlResponse::rejection(
                    &request.request_id,
                    Some("ops"),
                    Some("tone is off"),
                )],
            )
            .await;

        let state = service.load_run_state("r1").await;
        let decision = resolve_hitl_decision(&state, &request.request_id).unwrap();
        assert_eq!(decision.kind, HitlDecisionKind::Reject);
        assert_eq!(decision.response.note.as_deref(), Some("tone is off"));
    }

    #[tokio::test]
    async fn test_request_cap_denies_and_counts() {
        let service = MemoryHitlService::new(1);
        let denied_reason = Arc::new(std::sync::Mutex::new(None::<String>));
        let denied_clone = denied_reason.clone();

        let first = service
            .raise_request(payload("r1"), RaiseOptions::default())
            .await;
        assert!(matches!(first, RaiseOutcome::Pending(_)));

        let second = service
            .raise_request(
                payload("r1"),
                RaiseOptions {
                    on_denied: Some(Box::new(move |reason| {
                        *denied_clone.lock().unwrap() = Some(reason.to_string());
                    })),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(second, RaiseOutcome::Denied { .. }));
        assert!(denied_reason.lock().unwrap().as_deref().unwrap().contains("limit"));
        assert_eq!(service.load_run_state("r1").await.denied_count, 1);
    }

    #[tokio::test]
    async fn test_remove_request_cancels_pending_only() {
        let service = MemoryHitlService::new(3);
        let RaiseOutcome::Pending(request) = service
            .raise_request(payload("r1"), RaiseOptions::default())
            .await
        else {
            panic!("expected pending");
        };

        assert!(service.remove_request("r1", &request.request_id).await);
        assert!(!service.remove_request("r1", &request.request_id).await);
        let state = service.load_run_state("r1").await;
        assert_eq!(state.requests[0].status, HitlRequestStatus::Cancelled);
    }

    #[test]
    fn test_parse_decision_variants() {
        let approval = HitlResponse::approval("q", None);
        assert_eq!(
            parse_hitl_decision_action(&approval),
            Some(HitlDecisionKind::Approve)
        );

        let rejection = HitlResponse::rejection("q", None, None);
        assert_eq!(
            parse_hitl_decision_action(&rejection),
            Some(HitlDecisionKind::Reject)
        );

        // A bare rejection type without the approved flag still rejects.
        let bare = HitlResponse {
            approved: None,
            ..HitlResponse::rejection("q", None, None)
        };
        assert_eq!(
            parse_hitl_decision_action(&bare),
            Some(HitlDecisionKind::Reject)
        );

        let answer = HitlResponse {
            response_type: HitlResponseType::Answer,
            approved: None,
            ..HitlResponse::approval("q", None)
        };
        assert_eq!(parse_hitl_decision_action(&answer), None);
    }
}
