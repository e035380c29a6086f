//! The capability registry: registration pipeline, heartbeat-based
//! liveness and the cached capability snapshot.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::FlexConfig;
use crate::facets::{FacetCatalog, FacetContractError};
use crate::models::{
    CapabilityContract, CapabilityRecord, CapabilityRegistration, CapabilityStatus, GraphContext,
    TaskEnvelope,
};

use super::crcs::{CrcsOptions, CrcsSnapshot, compute_crcs};
use super::store::CapabilityStore;

/// Registration rejections, surfaced to callers as 400s.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RegistrationError {
    #[error("facet contract rejected: {0}")]
    FacetContract(#[from] FacetContractError),
    /// No output contract remained after facet compilation.
    #[error("capability declares no output contract")]
    MissingOutputContract,
}

impl RegistrationError {
    pub fn code(&self) -> &'static str {
        match self {
            RegistrationError::FacetContract(inner) => inner.code(),
            RegistrationError::MissingOutputContract => "missing_output_contract",
        }
    }
}

struct SnapshotCache {
    records: Arc<Vec<CapabilityRecord>>,
    loaded_at: Instant,
}

/// Typed catalog of executable capabilities.
///
/// The snapshot load is single-flighted: the cache sits behind one async
/// mutex, so concurrent readers either observe a fresh cache or queue on the
/// same refresh.
pub struct CapabilityRegistry {
    store: Arc<dyn CapabilityStore>,
    catalog: Arc<FacetCatalog>,
    cache_ttl: Duration,
    default_row_cap: usize,
    cache: Mutex<Option<SnapshotCache>>,
}

impl CapabilityRegistry {
    pub fn new(store: Arc<dyn CapabilityStore>, catalog: Arc<FacetCatalog>, config: &FlexConfig) -> Self {
        Self {
            store,
            catalog,
            cache_ttl: Duration::from_millis(config.capability_cache_ttl_ms),
            default_row_cap: config.crcs_row_cap(),
            cache: Mutex::new(None),
        }
    }

    pub fn catalog(&self) -> &FacetCatalog {
        &self.catalog
    }

    /// Register or re-register a capability.
    ///
    /// Facet contracts are compiled to JSON-Schema contracts; the canonical
    /// record always exposes the schema form plus the original facet lists.
    pub async fn register(
        &self,
        payload: CapabilityRegistration,
    ) -> Result<CapabilityRecord, RegistrationError> {
        let input_facets = payload
            .input_contract
            .as_ref()
            .map(|c| c.facet_names())
            .unwrap_or_default();
        let output_facets = payload
            .output_contract
            .as_ref()
            .map(|c| c.facet_names())
            .unwrap_or_default();

        let compiled = self
            .catalog
            .compile_contracts(&input_facets, &output_facets)?;
        let input_provenance = compiled
            .input
            .as_ref()
            .map(|c| c.provenance.clone())
            .unwrap_or_default();
        let output_provenance = compiled
            .output
            .as_ref()
            .map(|c| c.provenance.clone())
            .unwrap_or_default();

        let input_contract = match (&payload.input_contract, compiled.input) {
            (Some(contract), Some(compiled)) if contract.is_facet_mode() => {
                Some(CapabilityContract::JsonSchema {
                    schema: compiled.schema,
                    hints: None,
                })
            }
            (other, _) => other.clone(),
        };
        let output_contract = match (&payload.output_contract, compiled.output) {
            (Some(contract), Some(compiled)) if contract.is_facet_mode() => {
                Some(CapabilityContract::JsonSchema {
                    schema: compiled.schema,
                    hints: None,
                })
            }
            (other, _) => other.clone(),
        };
        let Some(output_contract) = output_contract else {
            return Err(RegistrationError::MissingOutputContract);
        };

        // Enrich metadata with the facet lists and their provenance.
        let mut metadata = match payload.metadata.clone() {
            Some(Value::Object(map)) => Value::Object(map),
            Some(other) => json!({ "value": other }),
            None => json!({}),
        };
        if let Some(object) = metadata.as_object_mut() {
            object.insert(
                "facets".to_string(),
                json!({ "input": input_facets, "output": output_facets }),
            );
            object.insert(
                "facetProvenance".to_string(),
                json!({ "input": input_provenance, "output": output_provenance }),
            );
        }

        let now = Utc::now();
        let record = CapabilityRecord {
            capability_id: payload.capability_id.clone(),
            version: payload.version,
            display_name: payload.display_name,
            summary: payload.summary,
            agent_type: payload.agent_type,
            input_contract,
            output_contract,
            input_facets,
            output_facets,
            heartbeat: payload.heartbeat,
            assignment_defaults: payload.assignment_defaults,
            instruction_templates: payload.instruction_templates,
            post_conditions: payload.post_conditions,
            metadata,
            preferred_models: payload.preferred_models,
            cost: payload.cost,
            status: CapabilityStatus::Active,
            last_seen_at: now,
            registered_at: now,
            created_at: now,
            updated_at: now,
        };

        self.store.upsert(record).await;
        self.invalidate_cache().await;

        // Re-fetch so the caller sees the canonical row (preserved
        // registered_at on upsert, etc).
        let canonical = self
            .store
            .fetch(&payload.capability_id)
            .await
            .expect("record was just upserted");
        info!(
            capability_id = %canonical.capability_id,
            version = %canonical.version,
            "capability registered"
        );
        Ok(canonical)
    }

    /// Heartbeat: refresh `last_seen_at` for a registered capability.
    pub async fn heartbeat(&self, capability_id: &str) -> bool {
        let touched = self.store.touch(capability_id, Utc::now()).await;
        if touched {
            self.invalidate_cache().await;
        } else {
            warn!(capability_id, "heartbeat for unknown capability");
        }
        touched
    }

    /// Cached snapshot of every registered capability, expiry applied.
    pub async fn get_snapshot(&self) -> Arc<Vec<CapabilityRecord>> {
        let mut cache = self.cache.lock().await;
        if let Some(existing) = cache.as_ref()
            && existing.loaded_at.elapsed() < self.cache_ttl
        {
            return existing.records.clone();
        }

        let records = self.load_with_sweep().await;
        let records = Arc::new(records);
        *cache = Some(SnapshotCache {
            records: records.clone(),
            loaded_at: Instant::now(),
        });
        records
    }

    /// Active capabilities from the cached snapshot.
    pub async fn list_active(&self) -> Vec<CapabilityRecord> {
        self.get_snapshot()
            .await
            .iter()
            .filter(|r| r.is_active())
            .cloned()
            .collect()
    }

    /// Fetch one capability, projecting heartbeat expiry.
    pub async fn get_capability_by_id(&self, capability_id: &str) -> Option<CapabilityRecord> {
        let mut record = self.store.fetch(capability_id).await?;
        let now = Utc::now();
        if record.is_active() && record.is_expired(now) {
            self.store
                .mark_inactive(&[record.capability_id.clone()], now)
                .await;
            record.status = CapabilityStatus::Inactive;
        }
        Some(record)
    }

    /// Compute the CRCS snapshot over the current active set.
    pub async fn compute_crcs_snapshot(
        &self,
        envelope: &TaskEnvelope,
        graph_context: Option<&GraphContext>,
        goal_condition_failure_facets: &[String],
    ) -> CrcsSnapshot {
        let active = self.list_active().await;
        let options = CrcsOptions {
            graph_context,
            available_facet_hints: &[],
            max_rows: None,
            goal_condition_failure_facets,
        };
        let snapshot = compute_crcs(envelope, &active, &options, self.default_row_cap);
        debug!(
            total = snapshot.total_rows,
            mrcs = snapshot.mrcs_size,
            truncated = snapshot.truncated,
            "computed CRCS snapshot"
        );
        snapshot
    }

    pub async fn invalidate_cache(&self) {
        *self.cache.lock().await = None;
    }

    /// Fetch everything; demote expired records with one batched write.
    async fn load_with_sweep(&self) -> Vec<CapabilityRecord> {
        let mut records = self.store.fetch_all().await;
        let now = Utc::now();
        let expired: Vec<String> = records
            .iter()
            .filter(|r| r.is_active() && r.is_expired(now))
            .map(|r| r.capability_id.clone())
            .collect();

        if !expired.is_empty() {
            debug!(count = expired.len(), "sweeping expired capabilities");
            self.store.mark_inactive(&expired, now).await;
            for record in &mut records {
                if expired.contains(&record.capability_id) {
                    record.status = CapabilityStatus::Inactive;
                }
            }
        }
        records
    }
}
