//! Shared cluster client management
//!
//! The Kubernetes client is built lazily on first use and shared by the
//! sampler and the controller. Concurrent first users wait on a single
//! construction; a failed construction is not remembered, so the next caller
//! tries again.

use crate::credential::{TokenCredential, ARM_SCOPE};
use crate::error::{GuardError, Result};
use crate::health::{components, HealthRegistry};
use crate::lifecycle::ArmLifecycleClient;
use crate::models::ClusterTarget;
use async_trait::async_trait;
use kube::config::{KubeConfigOptions, Kubeconfig};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info, warn};

/// Builds a client on demand
#[async_trait]
pub trait ClientFactory<T>: Send + Sync {
    async fn build(&self) -> Result<T>;
}

/// Construct-once client handle with retryable initialization
pub struct SharedClient<T> {
    factory: Arc<dyn ClientFactory<T>>,
    cell: OnceCell<T>,
    health: Option<HealthRegistry>,
    failures: AtomicU64,
}

impl<T: Clone + Send + Sync> SharedClient<T> {
    pub fn new(factory: Arc<dyn ClientFactory<T>>) -> Self {
        Self {
            factory,
            cell: OnceCell::new(),
            health: None,
            failures: AtomicU64::new(0),
        }
    }

    /// Report construction failures to the given health registry
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Get the client, building it if this is the first successful call
    pub async fn get(&self) -> Result<T> {
        let client = self
            .cell
            .get_or_try_init(|| async {
                match self.factory.build().await {
                    Ok(client) => {
                        info!("Cluster client initialized");
                        if let Some(health) = &self.health {
                            health.set_healthy(components::CLUSTER_CLIENT).await;
                        }
                        Ok(client)
                    }
                    Err(e) => {
                        let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
                        warn!(
                            error = %e,
                            failures = failures,
                            configuration = e.is_configuration(),
                            "Cluster client initialization failed, will retry on next use"
                        );
                        if let Some(health) = &self.health {
                            if e.is_configuration() {
                                health
                                    .set_unhealthy(components::CLUSTER_CLIENT, e.to_string())
                                    .await;
                            } else {
                                health
                                    .set_degraded(components::CLUSTER_CLIENT, e.to_string())
                                    .await;
                            }
                        }
                        Err(e)
                    }
                }
            })
            .await?;

        Ok(client.clone())
    }

    pub fn is_initialized(&self) -> bool {
        self.cell.initialized()
    }

    /// Number of failed construction attempts so far
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }
}

pub type SharedKubeClient = SharedClient<kube::Client>;

/// Where the Kubernetes client gets its credentials from
pub enum KubeClientSource {
    /// In-cluster service account or local kubeconfig
    Ambient,
    /// Cluster-admin kubeconfig fetched from Resource Manager
    AksAdmin {
        target: ClusterTarget,
        arm: ArmLifecycleClient,
        credential: Arc<dyn TokenCredential>,
    },
}

/// Builds `kube::Client` instances from the configured source
pub struct KubeClientFactory {
    source: KubeClientSource,
}

impl KubeClientFactory {
    pub fn new(source: KubeClientSource) -> Self {
        Self { source }
    }
}

#[async_trait]
impl ClientFactory<kube::Client> for KubeClientFactory {
    async fn build(&self) -> Result<kube::Client> {
        match &self.source {
            KubeClientSource::Ambient => Ok(kube::Client::try_default().await?),
            KubeClientSource::AksAdmin {
                target,
                arm,
                credential,
            } => {
                let token = credential.get_token(ARM_SCOPE).await?;
                let yaml = arm.list_cluster_admin_kubeconfig(target, &token).await?;

                let kubeconfig = Kubeconfig::from_yaml(&yaml).map_err(|e| {
                    GuardError::Configuration(format!("invalid cluster kubeconfig: {}", e))
                })?;
                let config =
                    kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                        .await
                        .map_err(|e| {
                            GuardError::Configuration(format!("unusable cluster kubeconfig: {}", e))
                        })?;

                kube::Client::try_from(config).map_err(GuardError::from)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::ComponentStatus;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Fails a configurable number of times, then hands out its build count
    struct FlakyFactory {
        builds: AtomicUsize,
        fail_first: usize,
        transient: bool,
    }

    impl FlakyFactory {
        fn new(fail_first: usize) -> Self {
            Self {
                builds: AtomicUsize::new(0),
                fail_first,
                transient: false,
            }
        }

        fn transient(fail_first: usize) -> Self {
            Self {
                transient: true,
                ..Self::new(fail_first)
            }
        }
    }

    #[async_trait]
    impl ClientFactory<usize> for FlakyFactory {
        async fn build(&self) -> Result<usize> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let n = self.builds.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first && self.transient {
                Err(GuardError::TransientApi("HTTP 503".into()))
            } else if n < self.fail_first {
                Err(GuardError::Configuration("no credentials".into()))
            } else {
                Ok(n)
            }
        }
    }

    #[tokio::test]
    async fn test_concurrent_first_users_share_one_build() {
        let factory = Arc::new(FlakyFactory::new(0));
        let shared = Arc::new(SharedClient::new(factory.clone()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let shared = shared.clone();
            handles.push(tokio::spawn(async move { shared.get().await.unwrap() }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), 0);
        }

        assert_eq!(factory.builds.load(Ordering::SeqCst), 1);
        assert!(shared.is_initialized());
    }

    #[tokio::test]
    async fn test_failed_build_is_retried() {
        let factory = Arc::new(FlakyFactory::new(1));
        let health = HealthRegistry::new();
        health.register(components::CLUSTER_CLIENT).await;
        let shared = SharedClient::new(factory.clone()).with_health(health.clone());

        let err = shared.get().await.unwrap_err();
        assert!(err.is_configuration());
        assert!(!shared.is_initialized());
        assert_eq!(shared.failure_count(), 1);
        assert_eq!(health.health().await.status, ComponentStatus::Unhealthy);

        assert_eq!(shared.get().await.unwrap(), 1);
        assert_eq!(shared.get().await.unwrap(), 1);
        assert_eq!(factory.builds.load(Ordering::SeqCst), 2);
        assert_eq!(health.health().await.status, ComponentStatus::Healthy);
    }

    #[tokio::test]
    async fn test_transient_build_failure_only_degrades() {
        let factory = Arc::new(FlakyFactory::transient(1));
        let health = HealthRegistry::new();
        health.register(components::CLUSTER_CLIENT).await;
        let shared = SharedClient::new(factory.clone()).with_health(health.clone());

        let err = shared.get().await.unwrap_err();
        assert!(!err.is_configuration());
        assert_eq!(
            health.status_of(components::CLUSTER_CLIENT).await,
            Some(ComponentStatus::Degraded)
        );
        assert_eq!(health.liveness().await.status, ComponentStatus::Degraded);

        assert_eq!(shared.get().await.unwrap(), 1);
        assert_eq!(health.health().await.status, ComponentStatus::Healthy);
    }
}
