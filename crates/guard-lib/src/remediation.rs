//! Per-workload remediation state
//!
//! ```text
//! Healthy --unhealthy--> RemediationInFlight --attempt done--> Unhealthy
//!                                                          \--> RemediationCooldown{until}
//! any --healthy--> Healthy
//! ```
//!
//! Whether a finished attempt puts the workload into cooldown is decided by
//! a pluggable [`CooldownPolicy`]. While in cooldown, unhealthy events do not
//! trigger another abort.

use crate::models::{RemediationAttempt, WorkloadKey};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RemediationState {
    Healthy,
    Unhealthy,
    RemediationInFlight,
    RemediationCooldown { until: DateTime<Utc> },
}

/// Decides how long to hold off after a finished attempt
pub trait CooldownPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// `None` leaves the workload eligible for another abort right away
    fn cooldown_after(&self, attempt: &RemediationAttempt) -> Option<Duration>;
}

/// Re-abort on every unhealthy event; only concurrent calls are collapsed
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCooldown;

impl CooldownPolicy for NoCooldown {
    fn name(&self) -> &'static str {
        "none"
    }

    fn cooldown_after(&self, _attempt: &RemediationAttempt) -> Option<Duration> {
        None
    }
}

/// Hold off for a fixed time after a successful abort. Failed attempts are
/// retried on the next event.
#[derive(Debug, Clone, Copy)]
pub struct FixedCooldown {
    pub after_success: Duration,
}

impl CooldownPolicy for FixedCooldown {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn cooldown_after(&self, attempt: &RemediationAttempt) -> Option<Duration> {
        attempt.succeeded().then_some(self.after_success)
    }
}

/// Outcome of asking whether to remediate an unhealthy workload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Remediate,
    Suppress(RemediationState),
}

pub struct RemediationTracker {
    states: DashMap<WorkloadKey, RemediationState>,
    policy: Arc<dyn CooldownPolicy>,
}

impl RemediationTracker {
    pub fn new(policy: Arc<dyn CooldownPolicy>) -> Self {
        Self {
            states: DashMap::new(),
            policy,
        }
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    pub fn state(&self, key: &WorkloadKey) -> Option<RemediationState> {
        self.states.get(key).map(|s| s.clone())
    }

    pub fn observe_healthy(&self, key: &WorkloadKey) {
        self.states.insert(key.clone(), RemediationState::Healthy);
    }

    /// Atomically decide and, when remediating, move to `RemediationInFlight`
    pub fn begin(&self, key: &WorkloadKey, now: DateTime<Utc>) -> Decision {
        let mut entry = self
            .states
            .entry(key.clone())
            .or_insert(RemediationState::Unhealthy);

        if let RemediationState::RemediationCooldown { until } = *entry {
            if until > now {
                return Decision::Suppress(entry.clone());
            }
            debug!(workload = %key, "Remediation cooldown expired");
        }

        *entry = RemediationState::RemediationInFlight;
        Decision::Remediate
    }

    /// Record a finished attempt and return the resulting state
    pub fn finish(
        &self,
        key: &WorkloadKey,
        attempt: &RemediationAttempt,
        now: DateTime<Utc>,
    ) -> RemediationState {
        let next = match self.policy.cooldown_after(attempt) {
            None => RemediationState::Unhealthy,
            Some(cooldown) => match chrono::Duration::from_std(cooldown)
                .ok()
                .and_then(|d| now.checked_add_signed(d))
            {
                Some(until) => RemediationState::RemediationCooldown { until },
                None => {
                    warn!(workload = %key, ?cooldown, "Cooldown out of range, ignoring");
                    RemediationState::Unhealthy
                }
            },
        };

        self.states.insert(key.clone(), next.clone());
        next
    }

    pub fn forget(&self, key: &WorkloadKey) {
        self.states.remove(key);
    }
}

impl Default for RemediationTracker {
    fn default() -> Self {
        Self::new(Arc::new(NoCooldown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AttemptStatus, ClusterKey, FailureReason};

    fn key() -> WorkloadKey {
        WorkloadKey::new("default", "etl")
    }

    fn succeeded() -> RemediationAttempt {
        RemediationAttempt::in_flight(ClusterKey("s/rg/c".into())).finish(AttemptStatus::Succeeded)
    }

    fn failed() -> RemediationAttempt {
        RemediationAttempt::in_flight(ClusterKey("s/rg/c".into())).finish(AttemptStatus::Failed(
            FailureReason::Transient("503".into()),
        ))
    }

    #[test]
    fn test_no_cooldown_never_suppresses() {
        let tracker = RemediationTracker::default();
        let now = Utc::now();

        for _ in 0..3 {
            assert_eq!(tracker.begin(&key(), now), Decision::Remediate);
            assert_eq!(
                tracker.state(&key()),
                Some(RemediationState::RemediationInFlight)
            );
            assert_eq!(
                tracker.finish(&key(), &succeeded(), now),
                RemediationState::Unhealthy
            );
        }
    }

    #[test]
    fn test_fixed_cooldown_suppresses_until_expiry() {
        let tracker = RemediationTracker::new(Arc::new(FixedCooldown {
            after_success: Duration::from_secs(600),
        }));
        let now = Utc::now();

        assert_eq!(tracker.begin(&key(), now), Decision::Remediate);
        let state = tracker.finish(&key(), &succeeded(), now);
        let RemediationState::RemediationCooldown { until } = state else {
            panic!("expected cooldown, got {:?}", state);
        };
        assert_eq!(until, now + chrono::Duration::seconds(600));

        let later = now + chrono::Duration::seconds(300);
        assert!(matches!(
            tracker.begin(&key(), later),
            Decision::Suppress(RemediationState::RemediationCooldown { .. })
        ));

        let expired = now + chrono::Duration::seconds(601);
        assert_eq!(tracker.begin(&key(), expired), Decision::Remediate);
    }

    #[test]
    fn test_fixed_cooldown_ignores_failed_attempts() {
        let tracker = RemediationTracker::new(Arc::new(FixedCooldown {
            after_success: Duration::from_secs(600),
        }));
        let now = Utc::now();

        tracker.begin(&key(), now);
        assert_eq!(
            tracker.finish(&key(), &failed(), now),
            RemediationState::Unhealthy
        );
        assert_eq!(tracker.begin(&key(), now), Decision::Remediate);
    }

    #[test]
    fn test_recovery_clears_cooldown() {
        let tracker = RemediationTracker::new(Arc::new(FixedCooldown {
            after_success: Duration::from_secs(600),
        }));
        let now = Utc::now();

        tracker.begin(&key(), now);
        tracker.finish(&key(), &succeeded(), now);
        tracker.observe_healthy(&key());

        assert_eq!(tracker.state(&key()), Some(RemediationState::Healthy));
        assert_eq!(tracker.begin(&key(), now), Decision::Remediate);
    }

    #[test]
    fn test_forget_drops_state() {
        let tracker = RemediationTracker::default();
        tracker.observe_healthy(&key());
        tracker.forget(&key());
        assert_eq!(tracker.state(&key()), None);
    }
}
