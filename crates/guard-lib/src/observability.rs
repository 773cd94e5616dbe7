//! Observability for the health guard
//!
//! Provides:
//! - Prometheus metrics for sampling ticks and remediation attempts
//! - Structured JSON log events with tracing

use crate::models::{RemediationAttempt, Verdict, WorkloadKey};
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for tick and poll latencies (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0,
];

static GLOBAL_METRICS: OnceLock<GuardMetricsInner> = OnceLock::new();

struct GuardMetricsInner {
    tick_latency_seconds: Histogram,
    ticks: IntCounter,
    skipped_ticks: IntCounter,
    namespace_failures: IntCounter,
    health_writes: IntCounter,
    cas_conflicts: IntCounter,
    unhealthy_workloads: IntGauge,
    abort_calls: IntCounter,
    remediation_outcomes: IntCounterVec,
    remediation_latency_seconds: Histogram,
    remediations_suppressed: IntCounter,
}

impl GuardMetricsInner {
    fn new() -> Self {
        Self {
            tick_latency_seconds: register_histogram!(
                "health_guard_tick_latency_seconds",
                "Time spent in one sampling tick",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register tick_latency_seconds"),

            ticks: register_int_counter!(
                "health_guard_ticks_total",
                "Sampling ticks executed"
            )
            .expect("Failed to register ticks_total"),

            skipped_ticks: register_int_counter!(
                "health_guard_skipped_ticks_total",
                "Sampling ticks abandoned because workloads could not be listed"
            )
            .expect("Failed to register skipped_ticks_total"),

            namespace_failures: register_int_counter!(
                "health_guard_namespace_failures_total",
                "Namespaces skipped in a tick because the inspector failed"
            )
            .expect("Failed to register namespace_failures_total"),

            health_writes: register_int_counter!(
                "health_guard_health_writes_total",
                "Workload health values changed by the sampler"
            )
            .expect("Failed to register health_writes_total"),

            cas_conflicts: register_int_counter!(
                "health_guard_cas_conflicts_total",
                "Health writes discarded because the record version moved"
            )
            .expect("Failed to register cas_conflicts_total"),

            unhealthy_workloads: register_int_gauge!(
                "health_guard_unhealthy_workloads",
                "Workloads judged unhealthy in the last tick"
            )
            .expect("Failed to register unhealthy_workloads"),

            abort_calls: register_int_counter!(
                "health_guard_abort_calls_total",
                "Abort requests sent to the cluster lifecycle API"
            )
            .expect("Failed to register abort_calls_total"),

            remediation_outcomes: register_int_counter_vec!(
                "health_guard_remediation_outcomes_total",
                "Finished remediation attempts by outcome",
                &["outcome"]
            )
            .expect("Failed to register remediation_outcomes_total"),

            remediation_latency_seconds: register_histogram!(
                "health_guard_remediation_latency_seconds",
                "Time from abort request to terminal state",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register remediation_latency_seconds"),

            remediations_suppressed: register_int_counter!(
                "health_guard_remediations_suppressed_total",
                "Unhealthy events that did not trigger an abort because of cooldown"
            )
            .expect("Failed to register remediations_suppressed_total"),
        }
    }
}

/// Handle to the process-wide metrics. Clones share the same metrics.
#[derive(Clone)]
pub struct GuardMetrics {
    _private: (),
}

impl Default for GuardMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GuardMetrics {
    /// Create a handle, registering the metrics on first call
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(GuardMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &GuardMetricsInner {
        GLOBAL_METRICS.get_or_init(GuardMetricsInner::new)
    }

    pub fn observe_tick(&self, duration_secs: f64, unhealthy: i64) {
        self.inner().tick_latency_seconds.observe(duration_secs);
        self.inner().ticks.inc();
        self.inner().unhealthy_workloads.set(unhealthy);
    }

    /// A tick that ended before sampling anything still counts as a tick
    pub fn observe_skipped_tick(&self, duration_secs: f64) {
        self.inner().tick_latency_seconds.observe(duration_secs);
        self.inner().ticks.inc();
        self.inner().skipped_ticks.inc();
    }

    pub fn skipped_ticks(&self) -> u64 {
        self.inner().skipped_ticks.get()
    }

    pub fn inc_namespace_failures(&self) {
        self.inner().namespace_failures.inc();
    }

    pub fn inc_health_writes(&self) {
        self.inner().health_writes.inc();
    }

    pub fn inc_cas_conflicts(&self) {
        self.inner().cas_conflicts.inc();
    }

    pub fn inc_abort_calls(&self) {
        self.inner().abort_calls.inc();
    }

    pub fn inc_remediations_suppressed(&self) {
        self.inner().remediations_suppressed.inc();
    }

    /// Record a finished attempt under its outcome label
    pub fn observe_remediation(&self, attempt: &RemediationAttempt) {
        let outcome = match attempt.failure() {
            None => "succeeded",
            Some(crate::models::FailureReason::Configuration(_)) => "configuration_error",
            Some(crate::models::FailureReason::Transient(_)) => "transient_error",
            Some(crate::models::FailureReason::Cancelled) => "cancelled",
        };
        self.inner()
            .remediation_outcomes
            .with_label_values(&[outcome])
            .inc();

        if let Some(finished) = attempt.finished_at {
            let secs = (finished - attempt.started_at).num_milliseconds() as f64 / 1000.0;
            self.inner().remediation_latency_seconds.observe(secs.max(0.0));
        }
    }
}

/// Structured logger for guard events
#[derive(Clone)]
pub struct StructuredLogger {
    cluster: String,
}

impl StructuredLogger {
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
        }
    }

    pub fn log_verdict_change(&self, workload: &WorkloadKey, job: &str, verdict: Verdict) {
        match verdict {
            Verdict::Unhealthy => warn!(
                event = "verdict_changed",
                cluster = %self.cluster,
                workload = %workload,
                job = %job,
                healthy = false,
                "Workload became unhealthy"
            ),
            Verdict::Healthy => info!(
                event = "verdict_changed",
                cluster = %self.cluster,
                workload = %workload,
                job = %job,
                healthy = true,
                "Workload recovered"
            ),
        }
    }

    pub fn log_remediation_started(&self, workload: &WorkloadKey, job: &str) {
        warn!(
            event = "remediation_started",
            cluster = %self.cluster,
            workload = %workload,
            job = %job,
            "Workload is unhealthy, aborting latest cluster operation"
        );
    }

    pub fn log_remediation_finished(&self, workload: &WorkloadKey, attempt: &RemediationAttempt) {
        match attempt.failure() {
            None => info!(
                event = "remediation_finished",
                cluster = %self.cluster,
                workload = %workload,
                cluster_key = %attempt.cluster_key,
                "Aborted latest cluster operation"
            ),
            Some(reason) => warn!(
                event = "remediation_finished",
                cluster = %self.cluster,
                workload = %workload,
                cluster_key = %attempt.cluster_key,
                reason = %reason,
                "Failed to abort latest cluster operation"
            ),
        }
    }

    pub fn log_startup(&self, version: &str, interval_secs: u64) {
        info!(
            event = "guard_started",
            cluster = %self.cluster,
            guard_version = %version,
            sampling_interval_secs = interval_secs,
            "Health guard started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "guard_shutdown",
            cluster = %self.cluster,
            reason = %reason,
            "Health guard shutting down"
        );
    }
}
