//! Broker credential providers
//!
//! A [`ConfigProvider`] is invoked once per connection attempt and never
//! cached, so rotated credentials are picked up by the next reconnect.

use crate::config::{ConfigError, CredentialsSection};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Complete connection parameters for one session
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerCredentials {
    pub host_url: String,
    pub namespace: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for BrokerCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerCredentials")
            .field("host_url", &self.host_url)
            .field("namespace", &self.namespace)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Credentials as delivered by a provider, before completeness is checked
///
/// Accepts both the camelCase keys and the `SOLACE_*` keys served by the
/// legacy configuration function.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialCredentials {
    #[serde(alias = "SOLACE_HOST_URL")]
    pub host_url: Option<String>,
    #[serde(alias = "SOLACE_VPN_NAME")]
    pub namespace: Option<String>,
    #[serde(alias = "SOLACE_USERNAME")]
    pub username: Option<String>,
    #[serde(alias = "SOLACE_PASSWORD")]
    pub password: Option<String>,
    /// Error message reported by a configuration endpoint
    #[serde(default)]
    pub error: Option<String>,
}

impl From<BrokerCredentials> for PartialCredentials {
    fn from(credentials: BrokerCredentials) -> Self {
        Self {
            host_url: Some(credentials.host_url),
            namespace: Some(credentials.namespace),
            username: Some(credentials.username),
            password: Some(credentials.password),
            error: None,
        }
    }
}

impl PartialCredentials {
    /// Require every field to be present and non-blank
    pub fn complete(self) -> Result<BrokerCredentials, ConfigError> {
        fn present(value: &Option<String>) -> bool {
            value.as_deref().is_some_and(|v| !v.trim().is_empty())
        }

        let missing: Vec<String> = [
            ("hostUrl", present(&self.host_url)),
            ("namespace", present(&self.namespace)),
            ("username", present(&self.username)),
            ("password", present(&self.password)),
        ]
        .into_iter()
        .filter(|(_, ok)| !ok)
        .map(|(name, _)| name.to_string())
        .collect();

        if !missing.is_empty() {
            return Err(ConfigError::MissingCredentials(missing));
        }

        Ok(BrokerCredentials {
            host_url: self.host_url.unwrap_or_default(),
            namespace: self.namespace.unwrap_or_default(),
            username: self.username.unwrap_or_default(),
            password: self.password.unwrap_or_default(),
        })
    }
}

/// External collaborator supplying broker credentials
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    /// Fetch a fresh, complete set of credentials
    async fn fetch(&self) -> Result<BrokerCredentials, ConfigError>;
}

/// Reads credentials from environment variables on every fetch
#[derive(Debug, Clone)]
pub struct EnvConfigProvider {
    host_url_env: String,
    namespace_env: String,
    username_env: String,
    password_env: String,
}

impl EnvConfigProvider {
    pub fn new(
        host_url_env: impl Into<String>,
        namespace_env: impl Into<String>,
        username_env: impl Into<String>,
        password_env: impl Into<String>,
    ) -> Self {
        Self {
            host_url_env: host_url_env.into(),
            namespace_env: namespace_env.into(),
            username_env: username_env.into(),
            password_env: password_env.into(),
        }
    }
}

impl Default for EnvConfigProvider {
    fn default() -> Self {
        Self::new(
            "BROKER_HOST_URL",
            "BROKER_NAMESPACE",
            "BROKER_USERNAME",
            "BROKER_PASSWORD",
        )
    }
}

#[async_trait]
impl ConfigProvider for EnvConfigProvider {
    async fn fetch(&self) -> Result<BrokerCredentials, ConfigError> {
        PartialCredentials {
            host_url: std::env::var(&self.host_url_env).ok(),
            namespace: std::env::var(&self.namespace_env).ok(),
            username: std::env::var(&self.username_env).ok(),
            password: std::env::var(&self.password_env).ok(),
            error: None,
        }
        .complete()
    }
}

/// Fetches credentials from a configuration endpoint
#[derive(Debug, Clone)]
pub struct HttpConfigProvider {
    client: reqwest::Client,
    url: String,
    token_env: Option<String>,
}

impl HttpConfigProvider {
    pub fn new(
        url: impl Into<String>,
        token_env: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::Fetch(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            url: url.into(),
            token_env,
        })
    }
}

#[async_trait]
impl ConfigProvider for HttpConfigProvider {
    async fn fetch(&self) -> Result<BrokerCredentials, ConfigError> {
        let mut request = self.client.post(&self.url).json(&serde_json::json!({}));

        if let Some(token_env) = &self.token_env {
            let token = std::env::var(token_env)
                .map_err(|_| ConfigError::EnvVarNotFound(token_env.clone()))?;
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ConfigError::Fetch(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ConfigError::Fetch(e.to_string()))?;

        let parsed = serde_json::from_str::<PartialCredentials>(&body);

        if !status.is_success() {
            let detail = parsed
                .ok()
                .and_then(|p| p.error)
                .unwrap_or_else(|| format!("HTTP {status}"));
            return Err(ConfigError::Fetch(detail));
        }

        let partial = parsed
            .map_err(|e| ConfigError::Fetch(format!("Invalid configuration payload: {e}")))?;
        if let Some(error) = partial.error.clone() {
            return Err(ConfigError::Fetch(error));
        }

        debug!(url = %self.url, "Fetched broker configuration");
        partial.complete()
    }
}

/// Serves a fixed set of credentials, still rejecting blank fields
#[derive(Debug, Clone)]
pub struct StaticConfigProvider {
    credentials: BrokerCredentials,
}

impl StaticConfigProvider {
    pub fn new(credentials: BrokerCredentials) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl ConfigProvider for StaticConfigProvider {
    async fn fetch(&self) -> Result<BrokerCredentials, ConfigError> {
        PartialCredentials::from(self.credentials.clone()).complete()
    }
}

/// Build the provider selected by the `[credentials]` section
pub fn provider_from_config(
    section: &CredentialsSection,
) -> Result<Arc<dyn ConfigProvider>, ConfigError> {
    match section {
        CredentialsSection::Env {
            host_url_env,
            namespace_env,
            username_env,
            password_env,
        } => Ok(Arc::new(EnvConfigProvider::new(
            host_url_env,
            namespace_env,
            username_env,
            password_env,
        ))),
        CredentialsSection::Http {
            url,
            token_env,
            timeout_ms,
        } => Ok(Arc::new(HttpConfigProvider::new(
            url.clone(),
            token_env.clone(),
            Duration::from_millis(*timeout_ms),
        )?)),
    }
}
