//! Capability registration payloads and canonical records.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::conditions::ConditionSpec;

/// Fallback heartbeat interval when a registration declares none.
const DEFAULT_HEARTBEAT_INTERVAL_SECONDS: i64 = 60;

/// Who executes a capability.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    Ai,
    Human,
}

/// Registry liveness of a capability.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityStatus {
    Active,
    Inactive,
}

/// A capability I/O contract: facet list or raw JSON Schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CapabilityContract {
    Facets {
        facets: Vec<String>,
    },
    JsonSchema {
        schema: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hints: Option<Value>,
    },
}

impl CapabilityContract {
    /// Facet names if this is (or was compiled from) a facet contract.
    pub fn facet_names(&self) -> Vec<String> {
        match self {
            CapabilityContract::Facets { facets } => facets.clone(),
            CapabilityContract::JsonSchema { .. } => Vec::new(),
        }
    }

    /// The JSON Schema, if materialized.
    pub fn schema(&self) -> Option<&Value> {
        match self {
            CapabilityContract::Facets { .. } => None,
            CapabilityContract::JsonSchema { schema, .. } => Some(schema),
        }
    }

    pub fn is_facet_mode(&self) -> bool {
        matches!(self, CapabilityContract::Facets { .. })
    }
}

/// Declared heartbeat cadence.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

impl HeartbeatSpec {
    /// Effective expiry window: explicit timeout, else three missed intervals.
    pub fn effective_timeout(&self) -> Duration {
        match (self.timeout_seconds, self.interval_seconds) {
            (Some(timeout), _) => Duration::seconds(timeout as i64),
            (None, Some(interval)) => Duration::seconds(interval as i64 * 3),
            (None, None) => Duration::seconds(DEFAULT_HEARTBEAT_INTERVAL_SECONDS * 3),
        }
    }
}

/// What happens when a human assignee declines a task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OnDecline {
    FailRun,
    Continue,
    Replan,
}

/// Defaults applied to human-task assignments.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentDefaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_notifications: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_decline: Option<OnDecline>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notify_channels: Vec<String>,
}

/// An assertion evaluated after the capability produces output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostConditionSpec {
    pub facet: String,
    #[serde(default)]
    pub path: String,
    pub condition: ConditionSpec,
}

/// Registration payload accepted from capability clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityRegistration {
    pub capability_id: String,
    pub version: String,
    pub display_name: String,
    #[serde(default)]
    pub summary: String,
    pub agent_type: AgentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_contract: Option<CapabilityContract>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_contract: Option<CapabilityContract>,
    #[serde(default)]
    pub heartbeat: HeartbeatSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignment_defaults: Option<AssignmentDefaults>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction_templates: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_conditions: Vec<PostConditionSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preferred_models: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<Value>,
}

/// Canonical registered form of a capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityRecord {
    pub capability_id: String,
    pub version: String,
    pub display_name: String,
    #[serde(default)]
    pub summary: String,
    pub agent_type: AgentType,
    /// Input contract; always json_schema mode when facets were declared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_contract: Option<CapabilityContract>,
    /// Output contract; registration guarantees presence.
    pub output_contract: CapabilityContract,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_facets: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_facets: Vec<String>,
    #[serde(default)]
    pub heartbeat: HeartbeatSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignment_defaults: Option<AssignmentDefaults>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction_templates: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_conditions: Vec<PostConditionSpec>,
    /// Free-form metadata, enriched at registration with facet provenance.
    #[serde(default)]
    pub metadata: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preferred_models: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<Value>,
    pub status: CapabilityStatus,
    pub last_seen_at: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CapabilityRecord {
    /// Whether the heartbeat window has elapsed. Exactly at the bound is
    /// still live; one tick past is expired.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.last_seen_at > self.heartbeat.effective_timeout()
    }

    pub fn is_active(&self) -> bool {
        self.status == CapabilityStatus::Active
    }

    pub fn input_schema(&self) -> Option<&Value> {
        self.input_contract.as_ref().and_then(|c| c.schema())
    }

    pub fn output_schema(&self) -> Option<&Value> {
        self.output_contract.schema()
    }
}
