//! Remediation: abort the cluster's latest operation
//!
//! Concurrent `abort` calls for the same cluster collapse into one request.
//! The first caller (the leader) talks to the lifecycle API; later callers
//! wait for the leader's result. The slot is released when the leader
//! finishes, fails, is cancelled, or has its future dropped.

use crate::credential::{TokenCredential, ARM_SCOPE};
use crate::error::{GuardError, Result};
use crate::health::{components, HealthRegistry};
use crate::lifecycle::ClusterLifecycleApi;
use crate::models::{AttemptStatus, ClusterKey, ClusterTarget, FailureReason, RemediationAttempt};
use crate::observability::GuardMetrics;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type SlotMap = Arc<Mutex<HashMap<ClusterKey, InFlight>>>;

struct InFlight {
    attempt: RemediationAttempt,
    done: watch::Receiver<Option<RemediationAttempt>>,
}

enum Role {
    Leader(SlotGuard),
    Follower(watch::Receiver<Option<RemediationAttempt>>),
}

/// Owns a single-flight slot. Dropping it without `complete` publishes a
/// cancelled attempt so followers never wait forever.
struct SlotGuard {
    slots: SlotMap,
    attempt: RemediationAttempt,
    done: Option<watch::Sender<Option<RemediationAttempt>>>,
}

impl SlotGuard {
    fn complete(mut self, status: AttemptStatus) -> RemediationAttempt {
        let finished = self.attempt.clone().finish(status);
        self.release(finished.clone());
        finished
    }

    fn release(&mut self, finished: RemediationAttempt) {
        lock(&self.slots).remove(&self.attempt.cluster_key);
        if let Some(done) = self.done.take() {
            done.send_replace(Some(finished));
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if self.done.is_some() {
            debug!(cluster_key = %self.attempt.cluster_key, "Remediation leader dropped");
            let cancelled = self
                .attempt
                .clone()
                .finish(AttemptStatus::Failed(FailureReason::Cancelled));
            self.release(cancelled);
        }
    }
}

fn lock(slots: &SlotMap) -> MutexGuard<'_, HashMap<ClusterKey, InFlight>> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Single-flight wrapper around the lifecycle API's abort call
pub struct Remediator {
    credential: Arc<dyn TokenCredential>,
    lifecycle: Arc<dyn ClusterLifecycleApi>,
    slots: SlotMap,
    health: Option<HealthRegistry>,
    metrics: GuardMetrics,
}

impl Remediator {
    pub fn new(
        credential: Arc<dyn TokenCredential>,
        lifecycle: Arc<dyn ClusterLifecycleApi>,
    ) -> Self {
        Self {
            credential,
            lifecycle,
            slots: Arc::new(Mutex::new(HashMap::new())),
            health: None,
            metrics: GuardMetrics::new(),
        }
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// The attempt currently running against `key`, if any
    pub fn in_flight(&self, key: &ClusterKey) -> Option<RemediationAttempt> {
        lock(&self.slots).get(key).map(|slot| slot.attempt.clone())
    }

    /// Abort the latest operation on `target`, joining an attempt already
    /// in flight for the same cluster. Never fails: the returned attempt
    /// carries the terminal status.
    pub async fn abort(
        &self,
        target: &ClusterTarget,
        cancel: &CancellationToken,
    ) -> RemediationAttempt {
        let key = target.cluster_key();

        let role = {
            let mut slots = lock(&self.slots);
            match slots.get(&key) {
                Some(slot) => Role::Follower(slot.done.clone()),
                None => {
                    let attempt = RemediationAttempt::in_flight(key.clone());
                    let (tx, rx) = watch::channel(None);
                    slots.insert(
                        key.clone(),
                        InFlight {
                            attempt: attempt.clone(),
                            done: rx,
                        },
                    );
                    Role::Leader(SlotGuard {
                        slots: self.slots.clone(),
                        attempt,
                        done: Some(tx),
                    })
                }
            }
        };

        match role {
            Role::Follower(done) => {
                debug!(cluster_key = %key, "Joining in-flight remediation");
                Self::follow(key, done, cancel).await
            }
            Role::Leader(guard) => {
                let status = match self.execute(target, cancel).await {
                    Ok(()) => AttemptStatus::Succeeded,
                    Err(e) => AttemptStatus::Failed(e.into()),
                };
                let attempt = guard.complete(status);
                self.record(&attempt).await;
                attempt
            }
        }
    }

    async fn follow(
        key: ClusterKey,
        mut done: watch::Receiver<Option<RemediationAttempt>>,
        cancel: &CancellationToken,
    ) -> RemediationAttempt {
        tokio::select! {
            result = done.wait_for(Option::is_some) => match result {
                Ok(finished) => match finished.as_ref() {
                    Some(attempt) => attempt.clone(),
                    None => RemediationAttempt::in_flight(key)
                        .finish(AttemptStatus::Failed(FailureReason::Cancelled)),
                },
                Err(_) => RemediationAttempt::in_flight(key).finish(AttemptStatus::Failed(
                    FailureReason::Transient("remediation leader went away".into()),
                )),
            },
            _ = cancel.cancelled() => {
                RemediationAttempt::in_flight(key)
                    .finish(AttemptStatus::Failed(FailureReason::Cancelled))
            }
        }
    }

    /// Credential, abort request, completion poll. Cancellation is observed
    /// at every suspension point.
    async fn execute(&self, target: &ClusterTarget, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(GuardError::Cancelled),
            result = async {
                let token = self
                    .credential
                    .get_token(ARM_SCOPE)
                    .await
                    .map_err(|e| match e {
                        GuardError::Cancelled => e,
                        other => GuardError::Configuration(format!(
                            "credential acquisition failed: {}",
                            other
                        )),
                    })?;

                self.metrics.inc_abort_calls();
                let mut poller = self
                    .lifecycle
                    .begin_abort_latest_operation(target, &token)
                    .await?;
                poller.poll_until_done(cancel).await
            } => result,
        }
    }

    async fn record(&self, attempt: &RemediationAttempt) {
        self.metrics.observe_remediation(attempt);

        match attempt.failure() {
            None => {
                info!(cluster_key = %attempt.cluster_key, "Remediation succeeded");
                if let Some(health) = &self.health {
                    health.set_healthy(components::REMEDIATOR).await;
                }
            }
            Some(FailureReason::Configuration(msg)) => {
                error!(
                    cluster_key = %attempt.cluster_key,
                    error = %msg,
                    "Remediation cannot run until configuration is fixed"
                );
                if let Some(health) = &self.health {
                    health
                        .set_degraded(components::REMEDIATOR, msg.clone())
                        .await;
                }
            }
            Some(FailureReason::Transient(msg)) => {
                warn!(
                    cluster_key = %attempt.cluster_key,
                    error = %msg,
                    "Remediation failed, will retry on a later event"
                );
            }
            Some(FailureReason::Cancelled) => {
                info!(cluster_key = %attempt.cluster_key, "Remediation cancelled");
            }
        }
    }
}
