//! Health guard library
//!
//! This crate provides the core functionality for:
//! - Sampling pod health for tracked workloads
//! - Persisting verdicts with compare-and-set writes
//! - Reacting to unhealthy workloads by aborting the cluster's latest operation
//! - Health checks and observability

pub mod controller;
pub mod credential;
pub mod crd;
pub mod error;
pub mod health;
pub mod inspector;
pub mod lifecycle;
pub mod models;
pub mod observability;
pub mod reconciler;
pub mod registry;
pub mod remediation;
pub mod remediator;
pub mod sampler;
pub mod session;

#[cfg(test)]
mod testing;

pub use error::{GuardError, Result};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{GuardMetrics, StructuredLogger};
pub use reconciler::{ReconcileOutcome, Reconciler};
pub use remediation::{CooldownPolicy, FixedCooldown, NoCooldown, RemediationState};
pub use remediator::Remediator;
pub use sampler::{HealthSampler, HealthSamplerBuilder, SamplerConfig, TickReport};
