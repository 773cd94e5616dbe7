//! Durable store of tracked workloads
//!
//! Records are created and deleted by operators. The guard only reads them
//! and, from the sampler, updates `health` with compare-and-set writes.

mod kubernetes;
mod memory;

pub use kubernetes::KubeRegistry;
pub use memory::InMemoryRegistry;

use crate::error::Result;
use crate::models::{WorkloadKey, WorkloadRecord};
use async_trait::async_trait;

/// Result of a compare-and-set health write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Written { new_version: String },
    /// The record changed since it was read; nothing was written
    Conflict,
    /// The record was deleted since it was read
    NotFound,
}

#[async_trait]
pub trait WorkloadRegistry: Send + Sync {
    async fn list(&self) -> Result<Vec<WorkloadRecord>>;

    /// Fetch one record; `Ok(None)` when it does not exist
    async fn get(&self, key: &WorkloadKey) -> Result<Option<WorkloadRecord>>;

    /// Write `health` only if the record is still at `expected_version`
    async fn compare_and_set_health(
        &self,
        key: &WorkloadKey,
        expected_version: &str,
        health: bool,
    ) -> Result<WriteOutcome>;
}
