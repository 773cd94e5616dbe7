//! Registry backed by `Workload` custom resources

use super::{WorkloadRegistry, WriteOutcome};
use crate::crd::Workload;
use crate::error::Result;
use crate::models::{WorkloadKey, WorkloadRecord};
use crate::session::SharedKubeClient;
use async_trait::async_trait;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::ResourceExt;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

pub struct KubeRegistry {
    client: Arc<SharedKubeClient>,
}

impl KubeRegistry {
    pub fn new(client: Arc<SharedKubeClient>) -> Self {
        Self { client }
    }

    /// Merge patch carrying the expected resourceVersion as a precondition.
    /// The API server answers 409 if the stored version differs.
    pub fn health_patch(expected_version: &str, health: bool) -> serde_json::Value {
        json!({
            "metadata": { "resourceVersion": expected_version },
            "spec": { "health": health }
        })
    }
}

#[async_trait]
impl WorkloadRegistry for KubeRegistry {
    async fn list(&self) -> Result<Vec<WorkloadRecord>> {
        let client = self.client.get().await?;
        let api: Api<Workload> = Api::all(client);

        let list = api.list(&ListParams::default()).await?;
        Ok(list.items.iter().map(Workload::to_record).collect())
    }

    async fn get(&self, key: &WorkloadKey) -> Result<Option<WorkloadRecord>> {
        let client = self.client.get().await?;
        let api: Api<Workload> = Api::namespaced(client, &key.namespace);

        Ok(api.get_opt(&key.name).await?.map(|wl| wl.to_record()))
    }

    async fn compare_and_set_health(
        &self,
        key: &WorkloadKey,
        expected_version: &str,
        health: bool,
    ) -> Result<WriteOutcome> {
        let client = self.client.get().await?;
        let api: Api<Workload> = Api::namespaced(client, &key.namespace);
        let patch = Self::health_patch(expected_version, health);

        match api
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(updated) => Ok(WriteOutcome::Written {
                new_version: updated.resource_version().unwrap_or_default(),
            }),
            Err(kube::Error::Api(resp)) if resp.code == 409 => {
                debug!(workload = %key, "Health write lost a version race");
                Ok(WriteOutcome::Conflict)
            }
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(WriteOutcome::NotFound),
            Err(e) => Err(e.into()),
        }
    }
}
