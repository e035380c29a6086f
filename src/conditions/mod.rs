//! Condition DSL compilation and JSON-Logic evaluation.
//!
//! Conditions enter the system as a restricted DSL
//! (`facets.post_copy.status == "ready" && facets.qaFindings.score >= 0.8`)
//! and are compiled to JSON-Logic at ingress. The runtime only ever
//! evaluates JSON-Logic against a run-context snapshot; a DSL string that
//! fails to compile is rejected before a run starts.
//!
//! # Module Structure
//!
//! - `dsl`: lexer + recursive-descent parser + JSON-Logic compilation
//! - `logic`: JSON-Logic evaluator (missing variables resolve to `null`)
//! - `goal`: goal-condition evaluation over run-context snapshots

mod dsl;
mod goal;
mod logic;

pub use dsl::compile_dsl;
pub use goal::{GoalCondition, GoalConditionResult, evaluate_goal_conditions, observed_facet_value};
pub use logic::{evaluate, truthy};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A condition with all three representations materialized.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompiledCondition {
    /// The DSL exactly as the caller wrote it.
    pub dsl: String,
    /// Normalized rendering of the parsed expression.
    pub canonical_dsl: String,
    /// JSON-Logic the runtime evaluates.
    pub json_logic: Value,
}

/// Wire form of a condition; compiled fields are filled at ingress.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConditionSpec {
    pub dsl: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_dsl: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_logic: Option<Value>,
}

impl ConditionSpec {
    pub fn new(dsl: &str) -> Self {
        Self {
            dsl: dsl.to_string(),
            canonical_dsl: None,
            json_logic: None,
        }
    }

    /// Compile the DSL unless a compiled form is already attached.
    pub fn ensure_compiled(&self) -> Result<CompiledCondition, ConditionError> {
        if let (Some(canonical), Some(logic)) = (&self.canonical_dsl, &self.json_logic) {
            return Ok(CompiledCondition {
                dsl: self.dsl.clone(),
                canonical_dsl: canonical.clone(),
                json_logic: logic.clone(),
            });
        }
        compile_dsl(&self.dsl)
    }
}

impl From<CompiledCondition> for ConditionSpec {
    fn from(compiled: CompiledCondition) -> Self {
        Self {
            dsl: compiled.dsl,
            canonical_dsl: Some(compiled.canonical_dsl),
            json_logic: Some(compiled.json_logic),
        }
    }
}

/// Condition compilation failures.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConditionError {
    /// The DSL does not parse.
    #[error("invalid condition dsl: {message} (in {dsl:?})")]
    InvalidDsl { dsl: String, message: String },
}

/// Result of evaluating one compiled condition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationOutcome {
    /// False when evaluation itself failed (unknown operator, bad shape).
    pub ok: bool,
    /// The JSON-Logic result; conditions normally yield a boolean.
    pub result: Value,
    /// Variable paths touched during evaluation, with resolved values.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resolved_variables: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EvaluationOutcome {
    /// Whether the condition evaluated cleanly to a truthy value.
    pub fn satisfied(&self) -> bool {
        self.ok && truthy(&self.result)
    }
}
