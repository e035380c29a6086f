//! Capability repository contract and the in-memory implementation.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::models::{CapabilityRecord, CapabilityStatus};

/// Repository the registry persists capabilities through.
///
/// Implementations back `flex_capabilities`; the in-memory variant serves
/// tests and the CLI.
#[async_trait]
pub trait CapabilityStore: Send + Sync {
    /// Insert or replace by `capability_id`. On replace, `registered_at`
    /// and `created_at` of the existing row are preserved.
    async fn upsert(&self, record: CapabilityRecord) -> CapabilityRecord;

    async fn fetch_all(&self) -> Vec<CapabilityRecord>;

    async fn fetch(&self, capability_id: &str) -> Option<CapabilityRecord>;

    /// Batched demotion of expired records.
    async fn mark_inactive(&self, capability_ids: &[String], now: DateTime<Utc>);

    /// Heartbeat refresh; returns false when the capability is unknown.
    async fn touch(&self, capability_id: &str, now: DateTime<Utc>) -> bool;
}

/// `CapabilityStore` over a mutex-guarded map.
#[derive(Default)]
pub struct MemoryCapabilityStore {
    records: Mutex<BTreeMap<String, CapabilityRecord>>,
}

impl MemoryCapabilityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl CapabilityStore for MemoryCapabilityStore {
    async fn upsert(&self, mut record: CapabilityRecord) -> CapabilityRecord {
        let mut records = self.records.lock().await;
        if let Some(existing) = records.get(&record.capability_id) {
            record.registered_at = existing.registered_at;
            record.created_at = existing.created_at;
        }
        records.insert(record.capability_id.clone(), record.clone());
        record
    }

    async fn fetch_all(&self) -> Vec<CapabilityRecord> {
        self.records.lock().await.values().cloned().collect()
    }

    async fn fetch(&self, capability_id: &str) -> Option<CapabilityRecord> {
        self.records.lock().await.get(capability_id).cloned()
    }

    async fn mark_inactive(&self, capability_ids: &[String], now: DateTime<Utc>) {
        let mut records = self.records.lock().await;
        for id in capability_ids {
            if let Some(record) = records.get_mut(id) {
                record.status = CapabilityStatus::Inactive;
                record.updated_at = now;
            }
        }
    }

    async fn touch(&self, capability_id: &str, now: DateTime<Utc>) -> bool {
        let mut records = self.records.lock().await;
        match records.get_mut(capability_id) {
            Some(record) => {
                record.last_seen_at = now;
                record.status = CapabilityStatus::Active;
                record.updated_at = now;
                true
            }
            None => false,
        }
    }
}
