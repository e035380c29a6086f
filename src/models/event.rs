//! The run event stream.
//!
//! Every engine emission is mirrored into the persisted run state, so a
//! streaming client and a later reader observe the same history. Events are
//! delivered to the sink in emission order; transports must preserve it.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::facets::FacetProvenanceEntry;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FlexEventKind {
    PlanGenerated,
    NodeStart,
    NodeComplete,
    NodeError,
    ValidationError,
    PolicyTriggered,
    PolicyUpdate,
    Log,
    HitlRequest,
    FeedbackResolution,
    Complete,
}

/// One frame of the run event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlexEvent {
    #[serde(rename = "type")]
    pub kind: FlexEventKind,
    pub timestamp: String,
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facet_provenance: Option<Vec<FacetProvenanceEntry>>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl FlexEvent {
    pub fn new(kind: FlexEventKind, run_id: &str) -> Self {
        Self {
            kind,
            timestamp: chrono::Utc::now().to_rfc3339(),
            run_id: run_id.to_string(),
            node_id: None,
            plan_version: None,
            facet_provenance: None,
            payload: Value::Null,
        }
    }

    pub fn with_node(mut self, node_id: &str) -> Self {
        self.node_id = Some(node_id.to_string());
        self
    }

    pub fn with_plan_version(mut self, version: u32) -> Self {
        self.plan_version = Some(version);
        self
    }

    pub fn with_provenance(mut self, provenance: Vec<FacetProvenanceEntry>) -> Self {
        if !provenance.is_empty() {
            self.facet_provenance = Some(provenance);
        }
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Where the engine delivers events. Implementations must be cheap; the
/// engine calls this inline on the run's execution path.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: FlexEvent);
}

/// Sink that drops everything.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: FlexEvent) {}
}

/// Buffers events in memory; the test and CLI default.
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<FlexEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<FlexEvent> {
        self.events.lock().expect("sink lock poisoned").clone()
    }

    pub fn kinds(&self) -> Vec<FlexEventKind> {
        self.events().iter().map(|e| e.kind).collect()
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: FlexEvent) {
        self.events.lock().expect("sink lock poisoned").push(event);
    }
}

/// Forwards events into an unbounded channel for streaming transports.
pub struct ChannelSink {
    sender: tokio::sync::mpsc::UnboundedSender<FlexEvent>,
}

impl ChannelSink {
    pub fn new(sender: tokio::sync::mpsc::UnboundedSender<FlexEvent>) -> Self {
        Self { sender }
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: FlexEvent) {
        // A closed receiver just means the client went away mid-stream.
        let _ = self.sender.send(event);
    }
}
