//! In-process registry with change notifications
//!
//! Mirrors the API server's semantics closely enough for local runs and
//! tests: every mutation bumps the record version, and subscribers are told
//! which key changed.

use super::{WorkloadRegistry, WriteOutcome};
use crate::error::Result;
use crate::models::{WorkloadKey, WorkloadRecord};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::broadcast;
use tracing::debug;

const EVENT_BUFFER: usize = 256;

pub struct InMemoryRegistry {
    records: DashMap<WorkloadKey, WorkloadRecord>,
    next_version: AtomicU64,
    health_writes: AtomicUsize,
    events: broadcast::Sender<WorkloadKey>,
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            records: DashMap::new(),
            next_version: AtomicU64::new(1),
            health_writes: AtomicUsize::new(0),
            events,
        }
    }

    fn bump_version(&self) -> String {
        self.next_version.fetch_add(1, Ordering::SeqCst).to_string()
    }

    fn notify(&self, key: &WorkloadKey) {
        // No subscribers is fine
        let _ = self.events.send(key.clone());
    }

    /// Create or replace a record, as an operator would
    pub fn upsert(&self, key: WorkloadKey, job_identifier: &str, health: bool) -> WorkloadRecord {
        let record = WorkloadRecord {
            key: key.clone(),
            job_identifier: job_identifier.to_string(),
            health,
            version: self.bump_version(),
        };
        self.records.insert(key.clone(), record.clone());
        self.notify(&key);
        record
    }

    pub fn remove(&self, key: &WorkloadKey) -> Option<WorkloadRecord> {
        let removed = self.records.remove(key).map(|(_, v)| v);
        if removed.is_some() {
            self.notify(key);
        }
        removed
    }

    /// Receive the key of every record that changes
    pub fn subscribe(&self) -> broadcast::Receiver<WorkloadKey> {
        self.events.subscribe()
    }

    /// Number of successful compare-and-set health writes
    pub fn health_writes(&self) -> usize {
        self.health_writes.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self, key: &WorkloadKey) -> Option<WorkloadRecord> {
        self.records.get(key).map(|r| r.clone())
    }
}

#[async_trait]
impl WorkloadRegistry for InMemoryRegistry {
    async fn list(&self) -> Result<Vec<WorkloadRecord>> {
        let mut records: Vec<_> = self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(records)
    }

    async fn get(&self, key: &WorkloadKey) -> Result<Option<WorkloadRecord>> {
        Ok(self.snapshot(key))
    }

    async fn compare_and_set_health(
        &self,
        key: &WorkloadKey,
        expected_version: &str,
        health: bool,
    ) -> Result<WriteOutcome> {
        let outcome = {
            let Some(mut entry) = self.records.get_mut(key) else {
                return Ok(WriteOutcome::NotFound);
            };
            if entry.version != expected_version {
                debug!(
                    workload = %key,
                    expected = %expected_version,
                    actual = %entry.version,
                    "Stale version"
                );
                return Ok(WriteOutcome::Conflict);
            }
            entry.health = health;
            entry.version = self.bump_version();
            WriteOutcome::Written {
                new_version: entry.version.clone(),
            }
        };

        self.health_writes.fetch_add(1, Ordering::SeqCst);
        self.notify(key);
        Ok(outcome)
    }
}
