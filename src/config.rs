//! Configuration system for the broker client
//!
//! Configuration is read from TOML. Every field has a default, so an empty
//! file (or no file at all) yields a usable configuration. Broker credentials
//! are never stored here: the `[credentials]` section only says where a
//! [`ConfigProvider`](crate::credentials::ConfigProvider) should fetch them
//! from on each connection attempt.

use crate::session::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Main client configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub credentials: CredentialsSection,
}

/// Client section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientSection {
    /// Client identifier stem (must match [a-zA-Z0-9._-]+)
    #[serde(default = "default_client_name")]
    pub name: String,
    /// Bounded wait for a success/failure event after a connect attempt starts
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Session keep-alive interval
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Capacity of the outbound request channel of each session
    #[serde(default = "default_request_channel_capacity")]
    pub request_channel_capacity: usize,
}

fn default_client_name() -> String {
    "brokerlink".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    30_000
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_request_channel_capacity() -> usize {
    10
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            name: default_client_name(),
            connect_timeout_ms: default_connect_timeout_ms(),
            keep_alive_secs: default_keep_alive_secs(),
            request_channel_capacity: default_request_channel_capacity(),
        }
    }
}

impl ClientSection {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Retry section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySection {
    /// Consecutive failures tolerated before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay; the first retry waits `base * 2`
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound on any single retry delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    2_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetrySection {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

/// Where broker credentials come from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum CredentialsSection {
    /// Read from environment variables on every fetch
    Env {
        #[serde(default = "default_host_url_env")]
        host_url_env: String,
        #[serde(default = "default_namespace_env")]
        namespace_env: String,
        #[serde(default = "default_username_env")]
        username_env: String,
        #[serde(default = "default_password_env")]
        password_env: String,
    },
    /// Fetched from a configuration endpoint on every fetch
    Http {
        url: String,
        /// Environment variable holding a bearer token for the endpoint
        token_env: Option<String>,
        #[serde(default = "default_http_timeout_ms")]
        timeout_ms: u64,
    },
}

fn default_host_url_env() -> String {
    "BROKER_HOST_URL".to_string()
}

fn default_namespace_env() -> String {
    "BROKER_NAMESPACE".to_string()
}

fn default_username_env() -> String {
    "BROKER_USERNAME".to_string()
}

fn default_password_env() -> String {
    "BROKER_PASSWORD".to_string()
}

fn default_http_timeout_ms() -> u64 {
    10_000
}

impl Default for CredentialsSection {
    fn default() -> Self {
        Self::Env {
            host_url_env: default_host_url_env(),
            namespace_env: default_namespace_env(),
            username_env: default_username_env(),
            password_env: default_password_env(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid client name: {0}")]
    InvalidClientName(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Missing required broker credentials: {}", .0.join(", "))]
    MissingCredentials(Vec<String>),
    #[error("Failed to fetch broker configuration: {0}")]
    Fetch(String),
}

impl ClientConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text and validate it
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate field ranges and cross-field consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_client_name(&self.client.name)?;

        if self.client.connect_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "client.connect_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.client.request_channel_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "client.request_channel_capacity must be greater than 0".to_string(),
            ));
        }

        self.retry
            .policy()
            .validate()
            .map_err(ConfigError::InvalidConfig)?;

        if let CredentialsSection::Http { url, .. } = &self.credentials {
            url::Url::parse(url).map_err(|e| {
                ConfigError::InvalidConfig(format!("credentials.url '{url}' is not a valid URL: {e}"))
            })?;
        }

        Ok(())
    }
}

/// Validate client name format: [a-zA-Z0-9._-]+
fn validate_client_name(name: &str) -> Result<(), ConfigError> {
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if name.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidClientName(format!(
            "Client name '{name}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}
