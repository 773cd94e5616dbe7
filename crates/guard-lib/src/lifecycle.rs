//! Managed-cluster lifecycle API (Azure Resource Manager)
//!
//! Wraps the asynchronous "abort latest operation" call and the
//! long-running-operation polling that follows it.

use crate::credential::AccessToken;
use crate::error::{GuardError, Result};
use crate::models::ClusterTarget;
use async_trait::async_trait;
use base64::Engine;
use reqwest::header::{HeaderMap, LOCATION, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

/// API version for Microsoft.ContainerService managed clusters
const AKS_API_VERSION: &str = "2025-03-01";

/// Default Resource Manager endpoint
pub const DEFAULT_ARM_ENDPOINT: &str = "https://management.azure.com";

/// Default timeout for a single HTTP request
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Poll interval when the service sends no Retry-After
const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;

const AZURE_ASYNC_OPERATION: &str = "azure-asyncoperation";

/// Issues abort requests against a managed cluster
#[async_trait]
pub trait ClusterLifecycleApi: Send + Sync {
    /// Start aborting whatever operation is currently running on the cluster.
    /// Aborting an idle cluster completes immediately and is not an error.
    async fn begin_abort_latest_operation(
        &self,
        target: &ClusterTarget,
        token: &AccessToken,
    ) -> Result<Box<dyn OperationPoller>>;
}

/// Handle on a long-running operation
#[async_trait]
pub trait OperationPoller: Send {
    /// Poll until the operation reaches a terminal state or `cancel` fires
    async fn poll_until_done(&mut self, cancel: &CancellationToken) -> Result<()>;
}

/// Poller for an operation that finished synchronously
pub struct CompletedPoller;

#[async_trait]
impl OperationPoller for CompletedPoller {
    async fn poll_until_done(&mut self, _cancel: &CancellationToken) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct AsyncOperationStatus {
    status: String,
    #[serde(default)]
    error: Option<ArmErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ArmErrorDetail {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct CredentialResults {
    #[serde(default)]
    kubeconfigs: Vec<CredentialResult>,
}

#[derive(Debug, Deserialize)]
struct CredentialResult {
    #[allow(dead_code)]
    name: String,
    /// Base64 encoded kubeconfig
    value: String,
}

/// How the poller learns about progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollStyle {
    /// `Azure-AsyncOperation`: body carries a status field
    AsyncOperation,
    /// `Location`: 202 while running, 200/204 once done
    Location,
}

/// Polls an ARM long-running operation
pub struct ArmOperationPoller {
    http: Client,
    url: String,
    style: PollStyle,
    bearer: String,
    interval: Duration,
    timeout: Option<Duration>,
}

impl ArmOperationPoller {
    async fn poll_once(&self) -> Result<(bool, Option<Duration>)> {
        let response = self
            .http
            .get(&self.url)
            .bearer_auth(&self.bearer)
            .send()
            .await?;

        let status = response.status();
        let retry_after = retry_after(response.headers());

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GuardError::from_status(status.as_u16(), body));
        }

        let done = match self.style {
            PollStyle::Location => status != StatusCode::ACCEPTED,
            PollStyle::AsyncOperation => {
                let op: AsyncOperationStatus = response.json().await.map_err(|e| {
                    GuardError::TransientApi(format!("invalid operation status: {}", e))
                })?;
                match op.status.as_str() {
                    "Succeeded" => true,
                    "Failed" | "Canceled" => {
                        let detail = op
                            .error
                            .map(|e| format!("{}: {}", e.code, e.message))
                            .unwrap_or_default();
                        return Err(GuardError::TransientApi(format!(
                            "abort operation ended {} {}",
                            op.status, detail
                        )));
                    }
                    other => {
                        debug!(status = %other, "Abort operation still running");
                        false
                    }
                }
            }
        };

        Ok((done, retry_after))
    }
}

#[async_trait]
impl OperationPoller for ArmOperationPoller {
    async fn poll_until_done(&mut self, cancel: &CancellationToken) -> Result<()> {
        let start = Instant::now();

        loop {
            let (done, retry_after) = tokio::select! {
                _ = cancel.cancelled() => return Err(GuardError::Cancelled),
                polled = self.poll_once() => polled?,
            };

            if done {
                debug!(elapsed_ms = start.elapsed().as_millis(), "Abort operation completed");
                return Ok(());
            }

            if let Some(timeout) = self.timeout {
                if start.elapsed() >= timeout {
                    return Err(GuardError::PollTimeout(timeout.as_secs()));
                }
            }

            let wait = retry_after.unwrap_or(self.interval);
            tokio::select! {
                _ = cancel.cancelled() => return Err(GuardError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Resource Manager client for managed clusters
#[derive(Clone)]
pub struct ArmLifecycleClient {
    http: Client,
    endpoint: String,
    poll_interval: Duration,
    poll_timeout: Option<Duration>,
}

impl ArmLifecycleClient {
    /// Create a client for the given Resource Manager endpoint
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let endpoint = endpoint.into();
        let parsed = Url::parse(&endpoint).map_err(|e| {
            GuardError::Configuration(format!(
                "invalid Resource Manager endpoint {}: {}",
                endpoint, e
            ))
        })?;
        if !matches!(parsed.scheme(), "https" | "http") {
            return Err(GuardError::Configuration(format!(
                "unsupported Resource Manager endpoint scheme: {}",
                parsed.scheme()
            )));
        }

        let http = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|e| GuardError::Configuration(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            endpoint: parsed.as_str().trim_end_matches('/').to_string(),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            poll_timeout: None,
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.poll_timeout = timeout;
        self
    }

    fn cluster_url(&self, target: &ClusterTarget, action: &str) -> String {
        format!(
            "{}/subscriptions/{}/resourceGroups/{}/providers/Microsoft.ContainerService/managedClusters/{}/{}?api-version={}",
            self.endpoint,
            target.subscription_id,
            target.resource_group,
            target.cluster_name,
            action,
            AKS_API_VERSION
        )
    }

    /// Fetch the cluster-admin kubeconfig as YAML
    pub async fn list_cluster_admin_kubeconfig(
        &self,
        target: &ClusterTarget,
        token: &AccessToken,
    ) -> Result<String> {
        let url = self.cluster_url(target, "listClusterAdminCredential");
        debug!(url = %url, "POST request");

        let response = self
            .http
            .post(&url)
            .bearer_auth(&token.token)
            .header("Content-Length", "0")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match GuardError::from_status(status.as_u16(), body) {
                GuardError::NotFound(msg) => GuardError::Configuration(msg),
                other => other,
            });
        }

        let creds: CredentialResults = response.json().await.map_err(|e| {
            GuardError::TransientApi(format!("invalid credential response: {}", e))
        })?;

        let kubeconfig = creds
            .kubeconfigs
            .first()
            .ok_or_else(|| GuardError::Configuration("no kubeconfig available".into()))?;

        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&kubeconfig.value)
            .map_err(|e| GuardError::Configuration(format!("failed to decode kubeconfig: {}", e)))?;

        String::from_utf8(decoded)
            .map_err(|e| GuardError::Configuration(format!("invalid kubeconfig: {}", e)))
    }
}

#[async_trait]
impl ClusterLifecycleApi for ArmLifecycleClient {
    async fn begin_abort_latest_operation(
        &self,
        target: &ClusterTarget,
        token: &AccessToken,
    ) -> Result<Box<dyn OperationPoller>> {
        let url = self.cluster_url(target, "abort");
        info!(
            cluster = %target.cluster_name,
            resource_group = %target.resource_group,
            "Requesting abort of latest cluster operation"
        );

        let response = self
            .http
            .post(&url)
            .bearer_auth(&token.token)
            .header("Content-Length", "0")
            .send()
            .await?;

        let status = response.status();
        match status {
            StatusCode::ACCEPTED => {
                let headers = response.headers();
                let async_op = headers
                    .get(AZURE_ASYNC_OPERATION)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| (v.to_string(), PollStyle::AsyncOperation));
                let location = headers
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| (v.to_string(), PollStyle::Location));

                match async_op.or(location) {
                    Some((poll_url, style)) => Ok(Box::new(ArmOperationPoller {
                        http: self.http.clone(),
                        url: poll_url,
                        style,
                        bearer: token.token.clone(),
                        interval: self.poll_interval,
                        timeout: self.poll_timeout,
                    })),
                    None => Ok(Box::new(CompletedPoller)),
                }
            }
            s if s.is_success() => {
                debug!(status = %s, "Abort completed synchronously");
                Ok(Box::new(CompletedPoller))
            }
            s => {
                let body = response.text().await.unwrap_or_default();
                Err(match GuardError::from_status(s.as_u16(), body) {
                    // The cluster is not where the configuration says it is
                    GuardError::NotFound(msg) => GuardError::Configuration(msg),
                    other => other,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn target() -> ClusterTarget {
        ClusterTarget::new("sub", "rg", "aks")
    }

    fn token() -> AccessToken {
        AccessToken::new("t0k", Utc::now() + chrono::Duration::hours(1))
    }

    #[test]
    fn test_invalid_endpoint_is_configuration_error() {
        assert!(ArmLifecycleClient::new("management.azure.com")
            .err()
            .unwrap()
            .is_configuration());
        assert!(ArmLifecycleClient::new("ftp://management.azure.com")
            .err()
            .unwrap()
            .is_configuration());
        assert!(ArmLifecycleClient::new("https://management.azure.com/").is_ok());
    }

    const ABORT_PATH: &str =
        "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.ContainerService/managedClusters/aks/abort";

    fn client(server: &mockito::Server) -> ArmLifecycleClient {
        ArmLifecycleClient::new(server.url())
            .unwrap()
            .with_poll_interval(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_abort_idle_cluster_is_noop() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", ABORT_PATH)
            .match_query(mockito::Matcher::UrlEncoded(
                "api-version".into(),
                AKS_API_VERSION.into(),
            ))
            .match_header("authorization", "Bearer t0k")
            .with_status(204)
            .create_async()
            .await;

        let mut poller = client(&server)
            .begin_abort_latest_operation(&target(), &token())
            .await
            .unwrap();
        poller
            .poll_until_done(&CancellationToken::new())
            .await
            .unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_abort_polls_async_operation() {
        let mut server = mockito::Server::new_async().await;
        let op_url = format!("{}/operations/op-1", server.url());

        server
            .mock("POST", ABORT_PATH)
            .match_query(mockito::Matcher::Any)
            .with_status(202)
            .with_header("azure-asyncoperation", &op_url)
            .create_async()
            .await;
        let status = server
            .mock("GET", "/operations/op-1")
            .with_status(200)
            .with_body(r#"{"status":"Succeeded"}"#)
            .create_async()
            .await;

        let mut poller = client(&server)
            .begin_abort_latest_operation(&target(), &token())
            .await
            .unwrap();
        poller
            .poll_until_done(&CancellationToken::new())
            .await
            .unwrap();

        status.assert_async().await;
    }

    #[tokio::test]
    async fn test_failed_operation_is_transient() {
        let mut server = mockito::Server::new_async().await;
        let op_url = format!("{}/operations/op-2", server.url());

        server
            .mock("POST", ABORT_PATH)
            .match_query(mockito::Matcher::Any)
            .with_status(202)
            .with_header("azure-asyncoperation", &op_url)
            .create_async()
            .await;
        server
            .mock("GET", "/operations/op-2")
            .with_status(200)
            .with_body(r#"{"status":"Failed","error":{"code":"Boom","message":"nope"}}"#)
            .create_async()
            .await;

        let mut poller = client(&server)
            .begin_abort_latest_operation(&target(), &token())
            .await
            .unwrap();
        let err = poller
            .poll_until_done(&CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_abort_error_classification() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", ABORT_PATH)
            .match_query(mockito::Matcher::Any)
            .with_status(503)
            .create_async()
            .await;

        let err = client(&server)
            .begin_abort_latest_operation(&target(), &token())
            .await
            .err()
            .unwrap();
        assert!(err.is_transient());

        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", ABORT_PATH)
            .match_query(mockito::Matcher::Any)
            .with_status(401)
            .create_async()
            .await;

        let err = client(&server)
            .begin_abort_latest_operation(&target(), &token())
            .await
            .err()
            .unwrap();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_poll_stops_on_cancel() {
        let mut server = mockito::Server::new_async().await;
        let op_url = format!("{}/operations/op-3", server.url());

        server
            .mock("POST", ABORT_PATH)
            .match_query(mockito::Matcher::Any)
            .with_status(202)
            .with_header("location", &op_url)
            .create_async()
            .await;
        server
            .mock("GET", "/operations/op-3")
            .with_status(202)
            .with_header("retry-after", "60")
            .expect_at_least(1)
            .create_async()
            .await;

        let mut poller = client(&server)
            .begin_abort_latest_operation(&target(), &token())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = poller.poll_until_done(&cancel).await.unwrap_err();
        assert!(matches!(err, GuardError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_list_cluster_admin_kubeconfig() {
        let mut server = mockito::Server::new_async().await;
        let encoded = base64::engine::general_purpose::STANDARD.encode("apiVersion: v1\n");
        server
            .mock(
                "POST",
                "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.ContainerService/managedClusters/aks/listClusterAdminCredential",
            )
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(format!(
                r#"{{"kubeconfigs":[{{"name":"clusterAdmin","value":"{}"}}]}}"#,
                encoded
            ))
            .create_async()
            .await;

        let yaml = client(&server)
            .list_cluster_admin_kubeconfig(&target(), &token())
            .await
            .unwrap();
        assert_eq!(yaml, "apiVersion: v1\n");
    }
}
