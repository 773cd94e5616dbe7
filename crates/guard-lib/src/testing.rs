//! Test doubles shared by the remediation tests

use crate::credential::{AccessToken, TokenCredential};
use crate::error::{GuardError, Result};
use crate::lifecycle::{ClusterLifecycleApi, CompletedPoller, OperationPoller};
use crate::models::ClusterTarget;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub fn target() -> ClusterTarget {
    ClusterTarget::new("sub-1", "rg-data", "aks-data")
}

/// Credential that always succeeds or always fails
pub struct StaticCredential {
    pub fail: bool,
    pub calls: AtomicUsize,
}

impl StaticCredential {
    pub fn ok() -> Self {
        Self {
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl TokenCredential for StaticCredential {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn get_token(&self, _scope: &str) -> Result<AccessToken> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(GuardError::TransientApi("az: not logged in".into()));
        }
        Ok(AccessToken::new(
            "test-token",
            Utc::now() + chrono::Duration::hours(1),
        ))
    }
}

#[derive(Debug, Clone, Copy)]
pub enum AbortBehaviour {
    /// No operation was running
    Noop,
    /// Operation runs for the given time, then succeeds
    PollFor(Duration),
    /// The abort request itself fails with a 503
    Unavailable,
}

/// Lifecycle API counting abort requests
pub struct MockLifecycle {
    pub behaviour: AbortBehaviour,
    pub calls: AtomicUsize,
}

impl MockLifecycle {
    pub fn new(behaviour: AbortBehaviour) -> Self {
        Self {
            behaviour,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

struct SleepingPoller {
    duration: Duration,
}

#[async_trait]
impl OperationPoller for SleepingPoller {
    async fn poll_until_done(&mut self, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            _ = cancel.cancelled() => Err(GuardError::Cancelled),
            _ = tokio::time::sleep(self.duration) => Ok(()),
        }
    }
}

#[async_trait]
impl ClusterLifecycleApi for MockLifecycle {
    async fn begin_abort_latest_operation(
        &self,
        _target: &ClusterTarget,
        _token: &AccessToken,
    ) -> Result<Box<dyn OperationPoller>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.behaviour {
            AbortBehaviour::Noop => Ok(Box::new(CompletedPoller)),
            AbortBehaviour::PollFor(duration) => Ok(Box::new(SleepingPoller { duration })),
            AbortBehaviour::Unavailable => {
                Err(GuardError::from_status(503, "service unavailable"))
            }
        }
    }
}
