//! The capability runtime seam.
//!
//! AI execution nodes dispatch through this trait; production wires an LLM
//! runtime that honors the node's output schema. Tests and the CLI use the
//! scripted variant.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::models::CapabilityRecord;

/// Everything a runtime gets for one capability invocation.
#[derive(Debug, Clone)]
pub struct CapabilityInvocation {
    pub run_id: String,
    pub node_id: String,
    pub capability: CapabilityRecord,
    /// Composed prompt (instructions, inputs, facet snapshot, feedback, ...).
    pub prompt: String,
    /// Merged literal and run-context inputs, keyed by facet.
    pub inputs: BTreeMap<String, Value>,
    /// Schema the structured completion must satisfy.
    pub output_schema: Option<Value>,
}

#[derive(Debug, Clone, Error)]
#[error("capability runtime failed: {message}")]
pub struct CapabilityRuntimeError {
    pub message: String,
}

impl CapabilityRuntimeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// External executor for AI capabilities.
#[async_trait]
pub trait CapabilityRuntime: Send + Sync {
    async fn invoke(
        &self,
        invocation: &CapabilityInvocation,
    ) -> Result<Value, CapabilityRuntimeError>;
}

/// Scripted runtime: per-capability output queues, last output repeats.
/// Records every invocation so tests can assert on composed prompts.
#[derive(Default)]
pub struct ScriptedRuntime {
    outputs: Mutex<BTreeMap<String, VecDeque<Value>>>,
    invocations: Mutex<Vec<CapabilityInvocation>>,
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue outputs for a capability; they are consumed in order and the
    /// final one repeats for subsequent calls.
    pub fn enqueue(&self, capability_id: &str, outputs: Vec<Value>) {
        self.outputs
            .lock()
            .expect("outputs lock poisoned")
            .entry(capability_id.to_string())
            .or_default()
            .extend(outputs);
    }

    pub fn with_output(capability_id: &str, output: Value) -> Self {
        let runtime = Self::new();
        runtime.enqueue(capability_id, vec![output]);
        runtime
    }

    pub fn invocations(&self) -> Vec<CapabilityInvocation> {
        self.invocations
            .lock()
            .expect("invocations lock poisoned")
            .clone()
    }

    pub fn prompts_for(&self, capability_id: &str) -> Vec<String> {
        self.invocations()
            .into_iter()
            .filter(|i| i.capability.capability_id == capability_id)
            .map(|i| i.prompt)
            .collect()
    }
}

#[async_trait]
impl CapabilityRuntime for ScriptedRuntime {
    async fn invoke(
        &self,
        invocation: &CapabilityInvocation,
    ) -> Result<Value, CapabilityRuntimeError> {
        self.invocations
            .lock()
            .expect("invocations lock poisoned")
            .push(invocation.clone());

        let mut outputs = self.outputs.lock().expect("outputs lock poisoned");
        let queue = outputs
            .get_mut(&invocation.capability.capability_id)
            .ok_or_else(|| {
                CapabilityRuntimeError::new(format!(
                    "no scripted output for capability '{}'",
                    invocation.capability.capability_id
                ))
            })?;
        match queue.len() {
            0 => Err(CapabilityRuntimeError::new(format!(
                "scripted outputs exhausted for '{}'",
                invocation.capability.capability_id
            ))),
            1 => Ok(queue.front().cloned().expect("len checked")),
            _ => Ok(queue.pop_front().expect("len checked")),
        }
    }
}
