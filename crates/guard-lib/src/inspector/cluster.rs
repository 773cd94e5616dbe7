//! Inspector backed by the Kubernetes API and metrics.k8s.io

use super::WorkloadInspector;
use crate::error::Result;
use crate::models::{ContainerRecord, ContainerUsage, PodMetricRecord, PodPhase, PodRecord};
use crate::session::SharedKubeClient;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind, ListParams};
use kube::ResourceExt;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Lists pods and pod metrics through the shared cluster client
pub struct KubeInspector {
    client: Arc<SharedKubeClient>,
    metrics_resource: ApiResource,
}

#[derive(Debug, Deserialize)]
struct RawContainerMetrics {
    name: String,
    #[serde(default)]
    usage: BTreeMap<String, String>,
}

impl KubeInspector {
    pub fn new(client: Arc<SharedKubeClient>) -> Self {
        let gvk = GroupVersionKind::gvk("metrics.k8s.io", "v1beta1", "PodMetrics");
        Self {
            client,
            metrics_resource: ApiResource::from_gvk_with_plural(&gvk, "pods"),
        }
    }

    /// Convert an API pod into the inspector's record shape
    pub fn pod_record(pod: &Pod) -> PodRecord {
        let status = pod.status.as_ref();

        let containers = status
            .and_then(|s| s.container_statuses.as_ref())
            .map(|statuses| {
                statuses
                    .iter()
                    .map(|cs| ContainerRecord {
                        name: cs.name.clone(),
                        restart_count: cs.restart_count.max(0) as u32,
                        waiting_reason: cs
                            .state
                            .as_ref()
                            .and_then(|state| state.waiting.as_ref())
                            .and_then(|waiting| waiting.reason.clone()),
                    })
                    .collect()
            })
            .unwrap_or_default();

        PodRecord {
            name: pod.name_any(),
            namespace: pod.namespace().unwrap_or_default(),
            phase: PodPhase::parse(status.and_then(|s| s.phase.as_deref())),
            labels: pod.labels().clone(),
            created_at: pod.metadata.creation_timestamp.as_ref().map(|t| t.0),
            containers,
        }
    }

    fn metric_record(obj: &DynamicObject, namespace: &str) -> PodMetricRecord {
        let containers: Vec<RawContainerMetrics> = obj
            .data
            .get("containers")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        PodMetricRecord {
            pod_name: obj.name_any(),
            namespace: obj.namespace().unwrap_or_else(|| namespace.to_string()),
            containers: containers
                .into_iter()
                .map(|c| ContainerUsage {
                    cpu: c.usage.get("cpu").cloned().unwrap_or_default(),
                    memory: c.usage.get("memory").cloned().unwrap_or_default(),
                    name: c.name,
                })
                .collect(),
        }
    }
}

#[async_trait]
impl WorkloadInspector for KubeInspector {
    async fn list_pods(&self, namespace: &str) -> Result<Vec<PodRecord>> {
        let client = self.client.get().await?;
        let pods: Api<Pod> = Api::namespaced(client, namespace);

        let list = pods.list(&ListParams::default()).await?;
        debug!(namespace = %namespace, count = list.items.len(), "Listed pods");

        Ok(list.items.iter().map(Self::pod_record).collect())
    }

    async fn list_pod_metrics(&self, namespace: &str) -> Result<Vec<PodMetricRecord>> {
        let client = self.client.get().await?;
        let api: Api<DynamicObject> =
            Api::namespaced_with(client, namespace, &self.metrics_resource);

        let list = api.list(&ListParams::default()).await?;
        Ok(list
            .items
            .iter()
            .map(|obj| Self::metric_record(obj, namespace))
            .collect())
    }
}
