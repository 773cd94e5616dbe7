//! Health guard - workload health monitoring and auto-remediation
//!
//! Samples pod health for every tracked workload, records verdicts on the
//! workload resources, and aborts the cluster's latest operation when a
//! workload turns unhealthy.

use anyhow::{Context, Result};
use guard_lib::{
    controller,
    credential::{DefaultCredentialChain, TokenCredential},
    health::{components, HealthRegistry},
    inspector::KubeInspector,
    lifecycle::ArmLifecycleClient,
    observability::{GuardMetrics, StructuredLogger},
    registry::{KubeRegistry, WorkloadRegistry},
    session::{KubeClientFactory, KubeClientSource, SharedClient},
    HealthSamplerBuilder, Reconciler, Remediator,
};
use health_guard::{
    api,
    config::{GuardConfig, KubeSource},
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const GUARD_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting health-guard");

    let config = GuardConfig::load()?;
    let target = config.target();
    info!(
        cluster = %target.cluster_name,
        resource_group = %target.resource_group,
        kube_client_source = ?config.kube_client_source,
        "Guard configured"
    );

    let health_registry = HealthRegistry::new();
    health_registry.register(components::SAMPLER).await;
    health_registry.register(components::RECONCILER).await;
    health_registry.register(components::REMEDIATOR).await;
    health_registry.register(components::CLUSTER_CLIENT).await;

    // Register metrics before the first scrape
    let _metrics = GuardMetrics::new();

    let logger = StructuredLogger::new(&target.cluster_name);
    logger.log_startup(GUARD_VERSION, config.sampling_interval_secs);

    let credential: Arc<dyn TokenCredential> =
        Arc::new(DefaultCredentialChain::from_env(&config.tenant_id));
    let arm = ArmLifecycleClient::new(&config.arm_endpoint)
        .context("Failed to create Resource Manager client")?
        .with_poll_timeout(config.abort_poll_timeout());

    let source = match config.kube_client_source {
        KubeSource::Ambient => KubeClientSource::Ambient,
        KubeSource::AksAdmin => KubeClientSource::AksAdmin {
            target: target.clone(),
            arm: arm.clone(),
            credential: credential.clone(),
        },
    };
    let client = Arc::new(
        SharedClient::new(Arc::new(KubeClientFactory::new(source)))
            .with_health(health_registry.clone()),
    );

    let registry: Arc<dyn WorkloadRegistry> = Arc::new(KubeRegistry::new(client.clone()));
    let sampler = HealthSamplerBuilder::new()
        .inspector(Arc::new(KubeInspector::new(client.clone())))
        .registry(registry.clone())
        .interval(config.sampling_interval())
        .job_label_key(config.job_label_key.clone())
        .health_registry(health_registry.clone())
        .logger(logger.clone())
        .build()
        .context("Failed to build health sampler")?;

    let remediator = Arc::new(
        Remediator::new(credential, Arc::new(arm)).with_health(health_registry.clone()),
    );
    let reconciler = Arc::new(
        Reconciler::new(registry, remediator, target, config.cooldown_policy())
            .with_health(health_registry.clone())
            .with_logger(logger.clone()),
    );

    let shutdown = CancellationToken::new();

    let sampler_handle = tokio::spawn(sampler.run(shutdown.clone()));
    let controller_handle = tokio::spawn(controller::run(
        client,
        reconciler,
        Some(health_registry.clone()),
        shutdown.clone(),
    ));

    let app_state = Arc::new(api::AppState::new(health_registry.clone()));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state, shutdown.clone()));

    // Mark guard as ready after initialization
    health_registry.set_ready(true).await;

    let reason = shutdown_signal().await;
    logger.log_shutdown(reason);
    shutdown.cancel();

    let (sampler_result, controller_result) = tokio::join!(sampler_handle, controller_handle);
    if let Err(e) = sampler_result {
        warn!(error = %e, "Sampler task ended abnormally");
    }
    if let Err(e) = controller_result {
        warn!(error = %e, "Controller task ended abnormally");
    }
    match api_handle.await {
        Ok(Err(e)) => warn!(error = %e, "API server failed"),
        Err(e) => warn!(error = %e, "API server task ended abnormally"),
        Ok(Ok(())) => {}
    }

    info!("Shutdown complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT received",
        _ = terminate => "SIGTERM received",
    }
}
