//! Event-driven reaction to workload health
//!
//! Invoked once per change to a workload record. An unhealthy record leads
//! to an abort against the configured cluster; the outcome is logged and
//! never turned into a reconcile failure.

use crate::error::{GuardError, Result};
use crate::health::{components, HealthRegistry};
use crate::models::{ClusterTarget, RemediationAttempt, WorkloadKey};
use crate::observability::{GuardMetrics, StructuredLogger};
use crate::registry::WorkloadRegistry;
use crate::remediation::{CooldownPolicy, Decision, RemediationState, RemediationTracker};
use crate::remediator::Remediator;
use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The record no longer exists
    Deleted,
    Healthy,
    Remediated(RemediationAttempt),
    RemediationFailed(RemediationAttempt),
    /// Unhealthy, but the cooldown policy held off
    Suppressed(RemediationState),
}

pub struct Reconciler {
    registry: Arc<dyn WorkloadRegistry>,
    remediator: Arc<Remediator>,
    target: ClusterTarget,
    tracker: RemediationTracker,
    logger: StructuredLogger,
    health: Option<HealthRegistry>,
    metrics: GuardMetrics,
}

impl Reconciler {
    pub fn new(
        registry: Arc<dyn WorkloadRegistry>,
        remediator: Arc<Remediator>,
        target: ClusterTarget,
        policy: Arc<dyn CooldownPolicy>,
    ) -> Self {
        let logger = StructuredLogger::new(target.cluster_name.clone());
        Self {
            registry,
            remediator,
            target,
            tracker: RemediationTracker::new(policy),
            logger,
            health: None,
            metrics: GuardMetrics::new(),
        }
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn state(&self, key: &WorkloadKey) -> Option<RemediationState> {
        self.tracker.state(key)
    }

    /// React to the current state of one workload record. Only a failure to
    /// read the record is returned as an error.
    pub async fn reconcile(
        &self,
        key: &WorkloadKey,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome> {
        let record = match self.registry.get(key).await {
            Ok(Some(record)) => record,
            Ok(None) | Err(GuardError::NotFound(_)) => {
                debug!(workload = %key, "Workload deleted, nothing to do");
                self.tracker.forget(key);
                return Ok(ReconcileOutcome::Deleted);
            }
            Err(e) => {
                warn!(workload = %key, error = %e, "Failed to read workload");
                if let Some(health) = &self.health {
                    health
                        .set_degraded(components::RECONCILER, e.to_string())
                        .await;
                }
                return Err(e);
            }
        };

        if let Some(health) = &self.health {
            health.set_healthy(components::RECONCILER).await;
        }

        if record.health {
            self.tracker.observe_healthy(key);
            return Ok(ReconcileOutcome::Healthy);
        }

        if let Decision::Suppress(state) = self.tracker.begin(key, Utc::now()) {
            info!(
                workload = %key,
                policy = self.tracker.policy_name(),
                state = ?state,
                "Workload unhealthy, remediation held off by cooldown"
            );
            self.metrics.inc_remediations_suppressed();
            return Ok(ReconcileOutcome::Suppressed(state));
        }

        self.logger
            .log_remediation_started(key, &record.job_identifier);
        let attempt = self.remediator.abort(&self.target, cancel).await;
        self.logger.log_remediation_finished(key, &attempt);

        let state = self.tracker.finish(key, &attempt, Utc::now());
        debug!(workload = %key, state = ?state, "Remediation state updated");

        if attempt.succeeded() {
            Ok(ReconcileOutcome::Remediated(attempt))
        } else {
            Ok(ReconcileOutcome::RemediationFailed(attempt))
        }
    }
}
