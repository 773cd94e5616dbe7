//! Core data models for the health guard

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Waiting reason reported by the kubelet for a container stuck restarting
pub const CRASH_LOOP_BACK_OFF: &str = "CrashLoopBackOff";

/// Identity of a tracked workload record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkloadKey {
    pub namespace: String,
    pub name: String,
}

impl WorkloadKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for WorkloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A tracked workload as read from the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadRecord {
    pub key: WorkloadKey,
    /// Value of the job selector label on the workload's pods
    pub job_identifier: String,
    /// Last verdict written by the sampler
    pub health: bool,
    /// Opaque version token used for compare-and-set writes
    pub version: String,
}

/// Pod lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    /// Parse the phase string reported by the API server.
    /// Anything unrecognised (including a missing phase) is `Unknown`.
    pub fn parse(phase: Option<&str>) -> Self {
        match phase {
            Some("Pending") => PodPhase::Pending,
            Some("Running") => PodPhase::Running,
            Some("Succeeded") => PodPhase::Succeeded,
            Some("Failed") => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PodPhase::Pending => write!(f, "Pending"),
            PodPhase::Running => write!(f, "Running"),
            PodPhase::Succeeded => write!(f, "Succeeded"),
            PodPhase::Failed => write!(f, "Failed"),
            PodPhase::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Container status as seen by the inspector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub name: String,
    pub restart_count: u32,
    /// Reason of the waiting state, when the container is waiting
    pub waiting_reason: Option<String>,
}

/// Pod as returned by the inspector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodRecord {
    pub name: String,
    pub namespace: String,
    pub phase: PodPhase,
    pub labels: BTreeMap<String, String>,
    pub created_at: Option<DateTime<Utc>>,
    pub containers: Vec<ContainerRecord>,
}

/// Point-in-time container usage from the metrics API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerUsage {
    pub name: String,
    /// CPU quantity, e.g. "50m"
    pub cpu: String,
    /// Memory quantity, e.g. "128Mi"
    pub memory: String,
}

/// Pod usage as returned by the metrics API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodMetricRecord {
    pub pod_name: String,
    pub namespace: String,
    pub containers: Vec<ContainerUsage>,
}

/// Per-tick snapshot of one pod
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodSample {
    pub pod_name: String,
    pub namespace: String,
    pub phase: PodPhase,
    /// Sum of restarts across all containers
    pub restart_count: u32,
    /// Any container waiting with reason CrashLoopBackOff
    pub crash_loop: bool,
    /// Time since creation, only populated while Pending
    pub pending_duration: Option<Duration>,
    pub cpu_usage: Option<String>,
    pub memory_usage: Option<String>,
}

/// Outcome of evaluating one workload's pods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Healthy,
    Unhealthy,
}

impl Verdict {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Verdict::Healthy)
    }
}

impl From<Verdict> for bool {
    fn from(verdict: Verdict) -> bool {
        verdict.is_healthy()
    }
}

/// Managed cluster addressed by the lifecycle API
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterTarget {
    pub subscription_id: String,
    pub resource_group: String,
    pub cluster_name: String,
}

impl ClusterTarget {
    pub fn new(
        subscription_id: impl Into<String>,
        resource_group: impl Into<String>,
        cluster_name: impl Into<String>,
    ) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            resource_group: resource_group.into(),
            cluster_name: cluster_name.into(),
        }
    }

    pub fn cluster_key(&self) -> ClusterKey {
        ClusterKey(format!(
            "{}/{}/{}",
            self.subscription_id, self.resource_group, self.cluster_name
        ))
    }
}

/// Single-flight key: subscription + resource group + cluster name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterKey(pub String);

impl fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a remediation attempt did not succeed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum FailureReason {
    /// Bad or missing credentials or identifiers; not retried by the guard
    Configuration(String),
    /// Network, throttling or server-side failure; retried on a later event
    Transient(String),
    /// The caller's cancellation fired before the operation completed
    Cancelled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Configuration(msg) => write!(f, "configuration error: {}", msg),
            FailureReason::Transient(msg) => write!(f, "transient error: {}", msg),
            FailureReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Status of a remediation attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    InFlight,
    Succeeded,
    Failed(FailureReason),
}

/// One abort invocation against a cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemediationAttempt {
    pub cluster_key: ClusterKey,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: AttemptStatus,
}

impl RemediationAttempt {
    pub fn in_flight(cluster_key: ClusterKey) -> Self {
        Self {
            cluster_key,
            started_at: Utc::now(),
            finished_at: None,
            status: AttemptStatus::InFlight,
        }
    }

    /// Close the attempt with the given terminal status
    pub fn finish(mut self, status: AttemptStatus) -> Self {
        self.finished_at = Some(Utc::now());
        self.status = status;
        self
    }

    pub fn is_in_flight(&self) -> bool {
        self.status == AttemptStatus::InFlight
    }

    pub fn succeeded(&self) -> bool {
        self.status == AttemptStatus::Succeeded
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        match &self.status {
            AttemptStatus::Failed(reason) => Some(reason),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pod_phase_parse() {
        assert_eq!(PodPhase::parse(Some("Running")), PodPhase::Running);
        assert_eq!(PodPhase::parse(Some("Failed")), PodPhase::Failed);
        assert_eq!(PodPhase::parse(Some("Evicted")), PodPhase::Unknown);
        assert_eq!(PodPhase::parse(None), PodPhase::Unknown);
    }

    #[test]
    fn test_cluster_key_composition() {
        let target = ClusterTarget::new("sub-1", "rg-a", "cluster-x");
        assert_eq!(target.cluster_key().to_string(), "sub-1/rg-a/cluster-x");
    }

    #[test]
    fn test_attempt_finish() {
        let attempt = RemediationAttempt::in_flight(ClusterKey("k".into()));
        assert!(attempt.is_in_flight());

        let done = attempt.finish(AttemptStatus::Failed(FailureReason::Cancelled));
        assert!(done.finished_at.is_some());
        assert_eq!(done.failure(), Some(&FailureReason::Cancelled));
        assert!(!done.succeeded());
    }
}
