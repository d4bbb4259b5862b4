//! Storage seam for reconciled records and run summaries.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{SyncError, SyncResult};
use crate::lock::ResourceClass;
use crate::orchestrator::SyncRunSummary;
use crate::reconcile::ReconciledEntity;

#[async_trait]
pub trait Repository: Send + Sync {
    /// Idempotent insert-or-replace keyed by (class, entity id).
    async fn upsert(&self, class: ResourceClass, record: &ReconciledEntity) -> SyncResult<()>;

    /// Replace the full signup list of one event. Records are keyed
    /// `event:rider`; riders missing from `records` are dropped.
    async fn replace_signups(&self, event_id: &str, records: &[ReconciledEntity]) -> SyncResult<()>;

    /// Persist a finished run. Default: not persisted.
    async fn record_run(&self, _summary: &SyncRunSummary) -> SyncResult<()> {
        Ok(())
    }
}

/// Process-local repository, used by tests and by the binary when no
/// database is configured.
#[derive(Default)]
pub struct MemoryRepository {
    records: Mutex<BTreeMap<(ResourceClass, String), ReconciledEntity>>,
    signups: Mutex<BTreeMap<String, Vec<ReconciledEntity>>>,
    runs: Mutex<Vec<SyncRunSummary>>,
    failing: Mutex<HashSet<String>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write of `entity_id` fail with a storage error.
    pub fn fail_writes_for(&self, entity_id: &str) {
        self.failing
            .lock()
            .expect("repository mutex poisoned")
            .insert(entity_id.to_string());
    }

    pub fn get(&self, class: ResourceClass, entity_id: &str) -> Option<ReconciledEntity> {
        self.records
            .lock()
            .expect("repository mutex poisoned")
            .get(&(class, entity_id.to_string()))
            .cloned()
    }

    pub fn count(&self, class: ResourceClass) -> usize {
        self.records
            .lock()
            .expect("repository mutex poisoned")
            .keys()
            .filter(|(c, _)| *c == class)
            .count()
    }

    pub fn signups(&self, event_id: &str) -> Vec<ReconciledEntity> {
        self.signups
            .lock()
            .expect("repository mutex poisoned")
            .get(event_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn runs(&self) -> Vec<SyncRunSummary> {
        self.runs.lock().expect("repository mutex poisoned").clone()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn upsert(&self, class: ResourceClass, record: &ReconciledEntity) -> SyncResult<()> {
        if self
            .failing
            .lock()
            .expect("repository mutex poisoned")
            .contains(&record.entity_id)
        {
            return Err(SyncError::Storage(format!(
                "write of {class}/{} rejected",
                record.entity_id
            )));
        }
        self.records
            .lock()
            .expect("repository mutex poisoned")
            .insert((class, record.entity_id.clone()), record.clone());
        Ok(())
    }

    async fn replace_signups(&self, event_id: &str, records: &[ReconciledEntity]) -> SyncResult<()> {
        if self
            .failing
            .lock()
            .expect("repository mutex poisoned")
            .contains(event_id)
        {
            return Err(SyncError::Storage(format!("signups of {event_id} rejected")));
        }
        let mut rows = records.to_vec();
        rows.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        self.signups
            .lock()
            .expect("repository mutex poisoned")
            .insert(event_id.to_string(), rows);
        Ok(())
    }

    async fn record_run(&self, summary: &SyncRunSummary) -> SyncResult<()> {
        self.runs
            .lock()
            .expect("repository mutex poisoned")
            .push(summary.clone());
        Ok(())
    }
}
