//! Cluster workload inspection
//!
//! The inspector lists pods and their latest resource usage for a namespace.
//! Samples built from those listings feed the health verdict.

mod cluster;
mod samples;

pub use cluster::KubeInspector;
pub use samples::{build_sample, evaluate, SampleSet};

use crate::error::Result;
use crate::models::{PodMetricRecord, PodRecord};
use async_trait::async_trait;

/// Read access to pods and pod metrics
#[async_trait]
pub trait WorkloadInspector: Send + Sync {
    /// List all pods in a namespace
    async fn list_pods(&self, namespace: &str) -> Result<Vec<PodRecord>>;

    /// List the latest usage snapshot for pods in a namespace
    async fn list_pod_metrics(&self, namespace: &str) -> Result<Vec<PodMetricRecord>>;
}
