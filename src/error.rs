//! Error taxonomy for broker sessions
//!
//! Transport and provider failures are translated into [`BrokerError`] at the
//! connection manager boundary; raw transport errors never reach callers.
//! Reason strings are sanitized before they are stored so that credentials
//! echoed back by a broker or a configuration endpoint never end up in logs.

use crate::config::ConfigError;
use crate::session::state::ConnectionState;
use crate::topic::TopicError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Main error type for broker client operations
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BrokerError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Connection attempt timed out after {timeout_ms}ms")]
    ConnectTimeout { timeout_ms: u64 },

    #[error("Connection rejected: {reason}")]
    ConnectRejected { reason: String },

    #[error("Transport dropped: {reason}")]
    TransportDropped { reason: String },

    #[error("Retries exhausted after {attempts} attempts, last error: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },

    #[error("Subscription registration failed for {topic}: {reason}")]
    SubscribeRegistrationFailed { topic: String, reason: String },

    #[error("Invalid topic '{topic}': {source}")]
    InvalidTopic {
        topic: String,
        #[source]
        source: TopicError,
    },

    #[error("Publish to {topic} failed: {reason}")]
    PublishFailed { topic: String, reason: String },

    #[error("Connection attempt cancelled by disconnect")]
    Cancelled,
}

impl BrokerError {
    /// Create configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: sanitize_error_message(&message.into()),
        }
    }

    /// Create connect rejected error
    pub fn connect_rejected<S: Into<String>>(reason: S) -> Self {
        Self::ConnectRejected {
            reason: sanitize_error_message(&reason.into()),
        }
    }

    /// Create transport dropped error
    pub fn transport_dropped<S: Into<String>>(reason: S) -> Self {
        Self::TransportDropped {
            reason: sanitize_error_message(&reason.into()),
        }
    }

    /// Create subscription registration error
    pub fn subscribe_registration_failed<S: Into<String>>(topic: &str, reason: S) -> Self {
        Self::SubscribeRegistrationFailed {
            topic: topic.to_string(),
            reason: sanitize_error_message(&reason.into()),
        }
    }

    /// Create publish failure error
    pub fn publish_failed<S: Into<String>>(topic: &str, reason: S) -> Self {
        Self::PublishFailed {
            topic: topic.to_string(),
            reason: sanitize_error_message(&reason.into()),
        }
    }

    /// Create invalid topic error
    pub fn invalid_topic(topic: &str, source: TopicError) -> Self {
        Self::InvalidTopic {
            topic: topic.to_string(),
            source,
        }
    }

    /// Whether the retry scheduler may re-attempt after this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectTimeout { .. } | Self::ConnectRejected { .. } | Self::TransportDropped { .. }
        )
    }
}

impl From<ConfigError> for BrokerError {
    fn from(error: ConfigError) -> Self {
        Self::configuration(error.to_string())
    }
}

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|passwd|token|key|secret)[=:]\s*\S+").expect("valid secret pattern")
});

static URL_CREDENTIALS_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"://[^/@\s:]+:[^/@\s]+@").expect("valid url credential pattern"));

const MAX_MESSAGE_LEN: usize = 500;

/// Redact secrets and cap length of error messages that may echo credentials
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = SECRET_PATTERN
        .replace_all(message, "${1}=***")
        .to_string();

    sanitized = URL_CREDENTIALS_PATTERN
        .replace_all(&sanitized, "://***@")
        .to_string();

    if sanitized.len() > MAX_MESSAGE_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_MESSAGE_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for broker client operations
pub type BrokerResult<T> = Result<T, BrokerError>;
