//! Guard configuration
//!
//! Everything comes from `GUARD_*` environment variables. Cluster
//! identifiers have no defaults and must be supplied.

use anyhow::{Context, Result};
use guard_lib::lifecycle::DEFAULT_ARM_ENDPOINT;
use guard_lib::models::ClusterTarget;
use guard_lib::remediation::{CooldownPolicy, FixedCooldown, NoCooldown};
use guard_lib::sampler::DEFAULT_JOB_LABEL_KEY;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// How the Kubernetes client authenticates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum KubeSource {
    /// In-cluster service account or local kubeconfig
    #[default]
    Ambient,
    /// Admin kubeconfig fetched from Resource Manager
    AksAdmin,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuardConfig {
    #[serde(default)]
    pub subscription_id: String,

    #[serde(default)]
    pub tenant_id: String,

    #[serde(default)]
    pub resource_group: String,

    #[serde(default)]
    pub cluster_name: String,

    /// Seconds between sampling ticks
    #[serde(default = "default_sampling_interval")]
    pub sampling_interval_secs: u64,

    /// Pod label whose value is matched against a workload's job name
    #[serde(default = "default_job_label_key")]
    pub job_label_key: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default)]
    pub kube_client_source: KubeSource,

    /// Hold off re-aborting for this long after a successful abort
    #[serde(default)]
    pub remediation_cooldown_secs: Option<u64>,

    /// Give up polling an abort operation after this long
    #[serde(default)]
    pub abort_poll_timeout_secs: Option<u64>,

    #[serde(default = "default_arm_endpoint")]
    pub arm_endpoint: String,
}

fn default_sampling_interval() -> u64 {
    30
}

fn default_job_label_key() -> String {
    DEFAULT_JOB_LABEL_KEY.to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_arm_endpoint() -> String {
    DEFAULT_ARM_ENDPOINT.to_string()
}

impl GuardConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("GUARD").try_parsing(true))
            .build()
            .context("Failed to read GUARD_* environment")?;

        Self::from_config(config)
    }

    pub fn from_config(config: config::Config) -> Result<Self> {
        let parsed: GuardConfig = config
            .try_deserialize()
            .context("Invalid guard configuration")?;
        parsed.validate()?;
        Ok(parsed)
    }

    fn validate(&self) -> Result<()> {
        let missing: Vec<&str> = [
            ("GUARD_SUBSCRIPTION_ID", &self.subscription_id),
            ("GUARD_TENANT_ID", &self.tenant_id),
            ("GUARD_RESOURCE_GROUP", &self.resource_group),
            ("GUARD_CLUSTER_NAME", &self.cluster_name),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name)
        .collect();

        if !missing.is_empty() {
            anyhow::bail!("Missing required configuration: {}", missing.join(", "));
        }
        if self.sampling_interval_secs == 0 {
            anyhow::bail!("GUARD_SAMPLING_INTERVAL_SECS must be positive");
        }
        if self.job_label_key.trim().is_empty() {
            anyhow::bail!("GUARD_JOB_LABEL_KEY must not be empty");
        }
        Ok(())
    }

    pub fn target(&self) -> ClusterTarget {
        ClusterTarget::new(
            &self.subscription_id,
            &self.resource_group,
            &self.cluster_name,
        )
    }

    pub fn sampling_interval(&self) -> Duration {
        Duration::from_secs(self.sampling_interval_secs)
    }

    pub fn abort_poll_timeout(&self) -> Option<Duration> {
        self.abort_poll_timeout_secs.map(Duration::from_secs)
    }

    pub fn cooldown_policy(&self) -> Arc<dyn CooldownPolicy> {
        match self.remediation_cooldown_secs {
            Some(secs) if secs > 0 => Arc::new(FixedCooldown {
                after_success: Duration::from_secs(secs),
            }),
            _ => Arc::new(NoCooldown),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> config::ConfigBuilder<config::builder::DefaultState> {
        config::Config::builder()
            .set_override("subscription_id", "sub-1")
            .unwrap()
            .set_override("tenant_id", "tenant-1")
            .unwrap()
            .set_override("resource_group", "rg-data")
            .unwrap()
            .set_override("cluster_name", "aks-data")
            .unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = GuardConfig::from_config(builder().build().unwrap()).unwrap();

        assert_eq!(config.sampling_interval(), Duration::from_secs(30));
        assert_eq!(config.job_label_key, "job-name");
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.kube_client_source, KubeSource::Ambient);
        assert_eq!(config.arm_endpoint, "https://management.azure.com");
        assert_eq!(config.abort_poll_timeout(), None);
        assert_eq!(config.cooldown_policy().name(), "none");
        assert_eq!(
            config.target().cluster_key().0,
            "sub-1/rg-data/aks-data"
        );
    }

    #[test]
    fn test_missing_identifiers_are_rejected() {
        let config = config::Config::builder()
            .set_override("subscription_id", "sub-1")
            .unwrap()
            .build()
            .unwrap();

        let err = GuardConfig::from_config(config).unwrap_err().to_string();
        assert!(err.contains("GUARD_TENANT_ID"));
        assert!(err.contains("GUARD_RESOURCE_GROUP"));
        assert!(err.contains("GUARD_CLUSTER_NAME"));
        assert!(!err.contains("GUARD_SUBSCRIPTION_ID"));
    }

    #[test]
    fn test_overrides() {
        let config = builder()
            .set_override("sampling_interval_secs", 45)
            .unwrap()
            .set_override("job_label_key", "app.kubernetes.io/job")
            .unwrap()
            .set_override("kube_client_source", "aks-admin")
            .unwrap()
            .set_override("remediation_cooldown_secs", 900)
            .unwrap()
            .set_override("abort_poll_timeout_secs", 1200)
            .unwrap()
            .build()
            .unwrap();

        let config = GuardConfig::from_config(config).unwrap();
        assert_eq!(config.sampling_interval(), Duration::from_secs(45));
        assert_eq!(config.job_label_key, "app.kubernetes.io/job");
        assert_eq!(config.kube_client_source, KubeSource::AksAdmin);
        assert_eq!(config.cooldown_policy().name(), "fixed");
        assert_eq!(config.abort_poll_timeout(), Some(Duration::from_secs(1200)));
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        let config = builder()
            .set_override("sampling_interval_secs", 0)
            .unwrap()
            .build()
            .unwrap();

        assert!(GuardConfig::from_config(config).is_err());
    }
}
