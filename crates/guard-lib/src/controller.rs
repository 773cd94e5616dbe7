//! Kubernetes event source for the reconciler
//!
//! Watches `Workload` resources in all namespaces. The runtime serialises
//! reconciles per object and re-delivers on failure. A failed abort is
//! retried on a timer, since the sampler stays silent while the verdict
//! does not change.

use crate::crd::Workload;
use crate::error::GuardError;
use crate::health::{components, HealthRegistry};
use crate::models::FailureReason;
use crate::reconciler::{ReconcileOutcome, Reconciler};
use crate::session::SharedKubeClient;
use futures::StreamExt;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Api, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Requeue delay after a transient failure to read the record or abort
const ERROR_REQUEUE: Duration = Duration::from_secs(15);

/// Requeue delay when the failure needs operator attention
const CONFIGURATION_REQUEUE: Duration = Duration::from_secs(300);

/// Pause between attempts to obtain the cluster client at startup
const CLIENT_RETRY: Duration = Duration::from_secs(10);

pub struct Context {
    pub reconciler: Arc<Reconciler>,
    pub shutdown: CancellationToken,
}

/// Run the controller until `shutdown` fires
pub async fn run(
    client: Arc<SharedKubeClient>,
    reconciler: Arc<Reconciler>,
    health: Option<HealthRegistry>,
    shutdown: CancellationToken,
) {
    let kube_client = loop {
        match client.get().await {
            Ok(c) => break c,
            Err(_) => {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(CLIENT_RETRY) => continue,
                }
            }
        }
    };

    info!("Starting Workload controller");
    if let Some(health) = &health {
        health.set_healthy(components::RECONCILER).await;
    }

    let api: Api<Workload> = Api::all(kube_client);
    let context = Arc::new(Context {
        reconciler,
        shutdown: shutdown.clone(),
    });

    Controller::new(api, Config::default().any_semantic())
        .graceful_shutdown_on(shutdown.cancelled_owned())
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => debug!(workload = %object, "Reconciled"),
                Err(e) => debug!(error = %e, "Reconcile did not complete"),
            }
        })
        .await;

    info!("Workload controller stopped");
}

#[instrument(skip(workload, ctx), fields(workload = %workload.key()))]
async fn reconcile(workload: Arc<Workload>, ctx: Arc<Context>) -> Result<Action, GuardError> {
    let outcome = ctx
        .reconciler
        .reconcile(&workload.key(), &ctx.shutdown)
        .await?;

    let action = next_action(&outcome);
    if let ReconcileOutcome::RemediationFailed(attempt) = &outcome {
        debug!(
            status = ?attempt.status,
            action = ?action,
            "Remediation deferred"
        );
    }
    Ok(action)
}

/// Failed aborts come back on a timer; everything else waits for the next change
fn next_action(outcome: &ReconcileOutcome) -> Action {
    match outcome {
        ReconcileOutcome::RemediationFailed(attempt) => match attempt.failure() {
            Some(FailureReason::Transient(_)) => Action::requeue(ERROR_REQUEUE),
            Some(FailureReason::Configuration(_)) => Action::requeue(CONFIGURATION_REQUEUE),
            _ => Action::await_change(),
        },
        _ => Action::await_change(),
    }
}

fn error_policy(workload: Arc<Workload>, err: &GuardError, _ctx: Arc<Context>) -> Action {
    if err.is_configuration() {
        error!(
            error = %err,
            workload = %workload.name_any(),
            "Reconcile blocked by configuration error"
        );
        Action::requeue(CONFIGURATION_REQUEUE)
    } else {
        warn!(
            error = %err,
            workload = %workload.name_any(),
            "Reconcile failed, requeueing"
        );
        Action::requeue(ERROR_REQUEUE)
    }
}
