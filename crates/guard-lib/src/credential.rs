//! Ambient credential chain for the Resource Manager API
//!
//! Tokens come from the environment (service principal) or from an existing
//! Azure CLI session. Nothing is ever read from source literals.

use crate::error::{GuardError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Scope for Azure Resource Manager
pub const ARM_SCOPE: &str = "https://management.azure.com/.default";

/// Tokens are refreshed this long before they expire
const EXPIRY_MARGIN_SECS: i64 = 5 * 60;

const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";

/// Bearer token with its expiry
#[derive(Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_on: DateTime<Utc>,
}

impl AccessToken {
    pub fn new(token: impl Into<String>, expires_on: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            expires_on,
        }
    }

    /// True if the token is still usable with the refresh margin applied
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_on - ChronoDuration::seconds(EXPIRY_MARGIN_SECS) > now
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expires_on", &self.expires_on)
            .finish()
    }
}

/// Source of bearer tokens
#[async_trait]
pub trait TokenCredential: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    async fn get_token(&self, scope: &str) -> Result<AccessToken>;
}

/// Service principal credential from `AZURE_CLIENT_ID` / `AZURE_CLIENT_SECRET`
pub struct EnvironmentCredential {
    http: reqwest::Client,
    authority_host: String,
    tenant_id: String,
    client_id: String,
    client_secret: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

impl EnvironmentCredential {
    /// Build from the process environment. `AZURE_TENANT_ID` wins over the
    /// configured tenant when both are present. Returns `None` when no
    /// service principal is configured.
    pub fn from_env(default_tenant: &str) -> Option<Self> {
        let client_id = std::env::var("AZURE_CLIENT_ID").ok()?;
        let client_secret = std::env::var("AZURE_CLIENT_SECRET").ok()?;
        let tenant_id =
            std::env::var("AZURE_TENANT_ID").unwrap_or_else(|_| default_tenant.to_string());
        let authority_host = std::env::var("AZURE_AUTHORITY_HOST")
            .unwrap_or_else(|_| DEFAULT_AUTHORITY_HOST.to_string());

        Some(Self::new(authority_host, tenant_id, client_id, client_secret))
    }

    pub fn new(
        authority_host: impl Into<String>,
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            authority_host: authority_host.into(),
            tenant_id: tenant_id.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    fn token_url(&self) -> String {
        format!(
            "{}/{}/oauth2/v2.0/token",
            self.authority_host.trim_end_matches('/'),
            self.tenant_id
        )
    }
}

#[async_trait]
impl TokenCredential for EnvironmentCredential {
    fn name(&self) -> &'static str {
        "environment"
    }

    async fn get_token(&self, scope: &str) -> Result<AccessToken> {
        let response = self
            .http
            .post(self.token_url())
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", scope),
            ])
            .send()
            .await
            .map_err(|e| GuardError::Configuration(format!("token request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GuardError::Configuration(format!(
                "token endpoint returned {}: {}",
                status, body
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| GuardError::Configuration(format!("invalid token response: {}", e)))?;

        Ok(AccessToken::new(
            body.access_token,
            Utc::now() + ChronoDuration::seconds(body.expires_in),
        ))
    }
}

/// Token from the signed-in Azure CLI session
pub struct AzureCliCredential {
    tenant_id: Option<String>,
    program: String,
    timeout: Duration,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CliToken {
    access_token: String,
    #[serde(default)]
    expires_on: Option<String>,
    /// Unix timestamp, only emitted by newer CLI versions
    #[serde(default, rename = "expires_on")]
    expires_on_unix: Option<i64>,
}

impl AzureCliCredential {
    pub fn new(tenant_id: Option<String>) -> Self {
        Self {
            tenant_id,
            program: "az".to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Override the CLI executable (for tests)
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn parse_output(stdout: &[u8]) -> Result<AccessToken> {
        let parsed: CliToken = serde_json::from_slice(stdout)
            .map_err(|e| GuardError::Configuration(format!("unexpected az output: {}", e)))?;

        let expires_on = match (parsed.expires_on_unix, parsed.expires_on.as_deref()) {
            (Some(ts), _) => Utc.timestamp_opt(ts, 0).single(),
            (None, Some(local)) => NaiveDateTime::parse_from_str(local, "%Y-%m-%d %H:%M:%S%.f")
                .ok()
                .and_then(|naive| Local.from_local_datetime(&naive).single())
                .map(|dt| dt.with_timezone(&Utc)),
            (None, None) => None,
        }
        .ok_or_else(|| GuardError::Configuration("az output has no usable expiry".into()))?;

        Ok(AccessToken::new(parsed.access_token, expires_on))
    }
}

#[async_trait]
impl TokenCredential for AzureCliCredential {
    fn name(&self) -> &'static str {
        "azure_cli"
    }

    async fn get_token(&self, scope: &str) -> Result<AccessToken> {
        let resource = scope.trim_end_matches("/.default");
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(["account", "get-access-token", "--output", "json", "--resource", resource]);
        if let Some(tenant) = &self.tenant_id {
            cmd.args(["--tenant", tenant]);
        }
        cmd.kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| GuardError::Configuration("az CLI timed out".into()))?
            .map_err(|e| GuardError::Configuration(format!("failed to run az CLI: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GuardError::Configuration(format!(
                "az CLI exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        Self::parse_output(&output.stdout)
    }
}

/// Tries each credential in order and caches the first token obtained
pub struct DefaultCredentialChain {
    sources: Vec<Arc<dyn TokenCredential>>,
    cached: Mutex<Option<AccessToken>>,
}

impl DefaultCredentialChain {
    pub fn new(sources: Vec<Arc<dyn TokenCredential>>) -> Self {
        Self {
            sources,
            cached: Mutex::new(None),
        }
    }

    /// Environment service principal (when configured), then the Azure CLI
    pub fn from_env(tenant_id: &str) -> Self {
        let mut sources: Vec<Arc<dyn TokenCredential>> = Vec::new();
        if let Some(env) = EnvironmentCredential::from_env(tenant_id) {
            sources.push(Arc::new(env));
        }
        sources.push(Arc::new(AzureCliCredential::new(Some(tenant_id.to_string()))));
        Self::new(sources)
    }
}

#[async_trait]
impl TokenCredential for DefaultCredentialChain {
    fn name(&self) -> &'static str {
        "default_chain"
    }

    async fn get_token(&self, scope: &str) -> Result<AccessToken> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.is_fresh(Utc::now()) {
                return Ok(token.clone());
            }
        }

        let mut failures = Vec::new();
        for source in &self.sources {
            match source.get_token(scope).await {
                Ok(token) => {
                    info!(credential = source.name(), "Acquired management token");
                    *cached = Some(token.clone());
                    return Ok(token);
                }
                Err(e) => {
                    debug!(credential = source.name(), error = %e, "Credential unavailable");
                    failures.push(format!("{}: {}", source.name(), e));
                }
            }
        }

        warn!(attempts = failures.len(), "No credential in chain produced a token");
        Err(GuardError::Configuration(format!(
            "no credential available ({})",
            failures.join("; ")
        )))
    }
}
