//! Periodic health sampling
//!
//! On every tick the sampler lists tracked workloads, inspects the pods of
//! each namespace once, derives a verdict per workload and writes it back
//! when it changed. A failed inspection leaves the namespace's stored values
//! untouched until the next tick.

use crate::health::{components, HealthRegistry};
use crate::inspector::{SampleSet, WorkloadInspector};
use crate::models::{Verdict, WorkloadRecord};
use crate::observability::{GuardMetrics, StructuredLogger};
use crate::registry::{WorkloadRegistry, WriteOutcome};
use anyhow::Result;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Label on pods that carries the workload's job identifier
pub const DEFAULT_JOB_LABEL_KEY: &str = "job-name";

/// Configuration for the sampling loop
#[derive(Debug, Clone)]
pub struct SamplerConfig {
    /// Time between tick starts (default: 30 seconds)
    pub interval: Duration,
    /// Pod label matched against `jobIdentifier`
    pub job_label_key: String,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            job_label_key: DEFAULT_JOB_LABEL_KEY.to_string(),
        }
    }
}

/// What happened during one tick
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// The registry could not be listed; nothing was evaluated
    pub skipped: bool,
    pub workloads: usize,
    pub unhealthy: usize,
    pub unchanged: usize,
    pub writes: usize,
    pub conflicts: usize,
    /// Records deleted between list and write
    pub vanished: usize,
    pub write_errors: usize,
    /// Namespaces whose pods could not be listed
    pub namespaces_failed: usize,
}

/// Samples pod health on a fixed timer
pub struct HealthSampler {
    inspector: Arc<dyn WorkloadInspector>,
    registry: Arc<dyn WorkloadRegistry>,
    config: SamplerConfig,
    health: Option<HealthRegistry>,
    logger: Option<StructuredLogger>,
    metrics: GuardMetrics,
}

impl HealthSampler {
    pub fn new(
        inspector: Arc<dyn WorkloadInspector>,
        registry: Arc<dyn WorkloadRegistry>,
        config: SamplerConfig,
    ) -> Self {
        Self {
            inspector,
            registry,
            config,
            health: None,
            logger: None,
            metrics: GuardMetrics::new(),
        }
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// Run ticks until `shutdown` fires. Ticks never overlap: a slow tick
    /// pushes the next one back instead of bunching up.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            label_key = %self.config.job_label_key,
            "Starting health sampler"
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        report = self.tick() => {
                            debug!(
                                workloads = report.workloads,
                                unhealthy = report.unhealthy,
                                writes = report.writes,
                                conflicts = report.conflicts,
                                namespaces_failed = report.namespaces_failed,
                                "Sampling tick complete"
                            );
                        }
                        _ = shutdown.cancelled() => {
                            info!("Sampling tick interrupted by shutdown");
                            break;
                        }
                    }
                }
            }
        }

        info!("Health sampler stopped");
    }

    /// Execute one sampling pass
    pub async fn tick(&self) -> TickReport {
        let start = Instant::now();
        let mut report = TickReport::default();

        let workloads = match self.registry.list().await {
            Ok(workloads) => workloads,
            Err(e) => {
                warn!(error = %e, "Failed to list workloads, skipping tick");
                self.set_degraded(format!("workload listing failed: {}", e)).await;
                self.metrics.observe_skipped_tick(start.elapsed().as_secs_f64());
                report.skipped = true;
                return report;
            }
        };
        report.workloads = workloads.len();

        let mut by_namespace: BTreeMap<String, Vec<WorkloadRecord>> = BTreeMap::new();
        for record in workloads {
            by_namespace
                .entry(record.key.namespace.clone())
                .or_default()
                .push(record);
        }

        let now = Utc::now();
        for (namespace, records) in by_namespace {
            let pods = match self.inspector.list_pods(&namespace).await {
                Ok(pods) => pods,
                Err(e) => {
                    warn!(
                        namespace = %namespace,
                        workloads = records.len(),
                        error = %e,
                        "Failed to list pods, keeping previous health values"
                    );
                    report.namespaces_failed += 1;
                    self.metrics.inc_namespace_failures();
                    continue;
                }
            };

            let usage = match self.inspector.list_pod_metrics(&namespace).await {
                Ok(usage) => usage,
                Err(e) => {
                    debug!(namespace = %namespace, error = %e, "Pod metrics unavailable");
                    Vec::new()
                }
            };

            let samples = SampleSet::build(&pods, &usage, &self.config.job_label_key, now);
            for record in &records {
                let pods = samples.for_job(&record.job_identifier);
                debug!(
                    workload = %record.key,
                    pods = pods.len(),
                    restarts = pods.iter().map(|s| s.restart_count).sum::<u32>(),
                    longest_pending_secs = pods
                        .iter()
                        .filter_map(|s| s.pending_duration)
                        .max()
                        .map(|d| d.as_secs())
                        .unwrap_or(0),
                    "Sampled workload pods"
                );
                self.apply(record, samples.verdict_for(&record.job_identifier), &mut report)
                    .await;
            }
        }

        if report.namespaces_failed > 0 {
            self.set_degraded(format!(
                "{} namespace(s) could not be inspected",
                report.namespaces_failed
            ))
            .await;
        } else if let Some(health) = &self.health {
            health.set_healthy(components::SAMPLER).await;
        }

        self.metrics
            .observe_tick(start.elapsed().as_secs_f64(), report.unhealthy as i64);
        report
    }

    /// Persist a verdict if it differs from the stored value
    async fn apply(&self, record: &WorkloadRecord, verdict: Verdict, report: &mut TickReport) {
        let healthy = verdict.is_healthy();
        if !healthy {
            report.unhealthy += 1;
        }
        if record.health == healthy {
            report.unchanged += 1;
            return;
        }

        match self
            .registry
            .compare_and_set_health(&record.key, &record.version, healthy)
            .await
        {
            Ok(WriteOutcome::Written { new_version }) => {
                report.writes += 1;
                self.metrics.inc_health_writes();
                debug!(workload = %record.key, version = %new_version, "Health updated");
                if let Some(logger) = &self.logger {
                    logger.log_verdict_change(&record.key, &record.job_identifier, verdict);
                }
            }
            Ok(WriteOutcome::Conflict) => {
                report.conflicts += 1;
                self.metrics.inc_cas_conflicts();
                debug!(workload = %record.key, "Record changed concurrently, discarding verdict");
            }
            Ok(WriteOutcome::NotFound) => {
                report.vanished += 1;
                debug!(workload = %record.key, "Record deleted before write");
            }
            Err(e) => {
                report.write_errors += 1;
                warn!(workload = %record.key, error = %e, "Failed to write health");
            }
        }
    }

    async fn set_degraded(&self, message: String) {
        if let Some(health) = &self.health {
            health.set_degraded(components::SAMPLER, message).await;
        }
    }
}

/// Builder for the health sampler
pub struct HealthSamplerBuilder {
    inspector: Option<Arc<dyn WorkloadInspector>>,
    registry: Option<Arc<dyn WorkloadRegistry>>,
    config: SamplerConfig,
    health: Option<HealthRegistry>,
    logger: Option<StructuredLogger>,
}

impl HealthSamplerBuilder {
    pub fn new() -> Self {
        Self {
            inspector: None,
            registry: None,
            config: SamplerConfig::default(),
            health: None,
            logger: None,
        }
    }

    pub fn inspector(mut self, inspector: Arc<dyn WorkloadInspector>) -> Self {
        self.inspector = Some(inspector);
        self
    }

    pub fn registry(mut self, registry: Arc<dyn WorkloadRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    pub fn job_label_key(mut self, key: impl Into<String>) -> Self {
        self.config.job_label_key = key.into();
        self
    }

    pub fn health_registry(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn build(self) -> Result<HealthSampler> {
        let inspector = self
            .inspector
            .ok_or_else(|| anyhow::anyhow!("Inspector is required"))?;
        let registry = self
            .registry
            .ok_or_else(|| anyhow::anyhow!("Registry is required"))?;
        if self.config.interval.is_zero() {
            anyhow::bail!("Sampling interval must be positive");
        }

        let mut sampler = HealthSampler::new(inspector, registry, self.config);
        sampler.health = self.health;
        sampler.logger = self.logger;
        Ok(sampler)
    }
}

impl Default for HealthSamplerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
