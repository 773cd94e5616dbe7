//! `Workload` custom resource binding
//!
//! The CRD itself is installed by the cluster operator; this type only lets
//! the guard read and update records through the API server.

use crate::models::{WorkloadKey, WorkloadRecord};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A job whose pods are monitored for health
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(
    group = "monitoring.healthcheck.dev",
    version = "v1",
    kind = "Workload",
    plural = "workloads",
    namespaced
)]
pub struct WorkloadSpec {
    /// Value of the job selector label carried by the workload's pods
    #[serde(rename = "jobName")]
    pub job_name: String,

    /// Last health verdict, written only by the sampler
    #[serde(default = "default_health")]
    pub health: bool,
}

fn default_health() -> bool {
    true
}

impl Workload {
    pub fn key(&self) -> WorkloadKey {
        WorkloadKey::new(self.namespace().unwrap_or_default(), self.name_any())
    }

    /// Flatten into the registry's record shape
    pub fn to_record(&self) -> WorkloadRecord {
        WorkloadRecord {
            key: self.key(),
            job_identifier: self.spec.job_name.clone(),
            health: self.spec.health,
            version: self.resource_version().unwrap_or_default(),
        }
    }
}
