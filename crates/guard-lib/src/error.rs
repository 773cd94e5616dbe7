//! Error taxonomy shared by the sampler, reconciler and remediator

use crate::models::FailureReason;
use thiserror::Error;

/// Errors raised by the guard's collaborators
#[derive(Debug, Error)]
pub enum GuardError {
    /// Bad or missing credentials or identifiers. Retrying will not help.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Network, throttling or 5xx failure. Safe to retry on the next tick or event.
    #[error("transient API error: {0}")]
    TransientApi(String),

    /// The record disappeared between read and act
    #[error("not found: {0}")]
    NotFound(String),

    /// Compare-and-set rejected because the version moved on
    #[error("version conflict on {0}")]
    Conflict(String),

    /// The caller's cancellation token fired
    #[error("operation cancelled")]
    Cancelled,

    /// Long-running operation did not finish in time
    #[error("operation timed out after {0} seconds")]
    PollTimeout(u64),
}

pub type Result<T> = std::result::Result<T, GuardError>;

impl GuardError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GuardError::TransientApi(_) | GuardError::PollTimeout(_))
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, GuardError::Configuration(_))
    }

    /// Classify an HTTP status returned by a remote API
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = format!("HTTP {}: {}", status, message.into());
        match status {
            401 | 403 => GuardError::Configuration(message),
            404 => GuardError::NotFound(message),
            409 => GuardError::Conflict(message),
            _ => GuardError::TransientApi(message),
        }
    }
}

impl From<kube::Error> for GuardError {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(resp) => GuardError::from_status(resp.code, resp.message.clone()),
            kube::Error::InferConfig(_) | kube::Error::Auth(_) => {
                GuardError::Configuration(err.to_string())
            }
            _ => GuardError::TransientApi(err.to_string()),
        }
    }
}

impl From<reqwest::Error> for GuardError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => GuardError::from_status(status.as_u16(), err.to_string()),
            None => GuardError::TransientApi(err.to_string()),
        }
    }
}

impl From<GuardError> for FailureReason {
    fn from(err: GuardError) -> Self {
        match err {
            GuardError::Configuration(msg) => FailureReason::Configuration(msg),
            // A missing cluster means the configured identifiers are wrong
            GuardError::NotFound(msg) => FailureReason::Configuration(msg),
            GuardError::Cancelled => FailureReason::Cancelled,
            other => FailureReason::Transient(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(GuardError::from_status(401, "denied").is_configuration());
        assert!(GuardError::from_status(403, "forbidden").is_configuration());
        assert!(GuardError::from_status(503, "busy").is_transient());
        assert!(GuardError::from_status(429, "slow down").is_transient());
        assert!(matches!(
            GuardError::from_status(409, "stale"),
            GuardError::Conflict(_)
        ));
        assert!(matches!(
            GuardError::from_status(404, "gone"),
            GuardError::NotFound(_)
        ));
    }

    #[test]
    fn test_failure_reason_mapping() {
        assert_eq!(
            FailureReason::from(GuardError::Cancelled),
            FailureReason::Cancelled
        );
        assert!(matches!(
            FailureReason::from(GuardError::PollTimeout(30)),
            FailureReason::Transient(_)
        ));
        assert!(matches!(
            FailureReason::from(GuardError::NotFound("cluster".into())),
            FailureReason::Configuration(_)
        ));
    }
}
