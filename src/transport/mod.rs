//! Transport abstraction for broker sessions
//!
//! A [`Transport`] creates one [`Session`] per connection attempt. Sessions
//! report their lifecycle and inbound messages through an event channel owned
//! by the connection manager, which is the only place where transport errors
//! are translated into [`BrokerError`](crate::error::BrokerError).

use crate::credentials::BrokerCredentials;
use crate::session::registry::Message;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod mqtt;

pub use mqtt::MqttTransport;

/// Events emitted by a live or pending session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The broker accepted the session
    Up,
    /// The attempt failed before the session came up (network, TLS, timeout)
    ConnectFailed(String),
    /// The broker actively refused the session (authentication, authorization)
    Rejected(String),
    /// An established session was lost
    Dropped(String),
    /// Inbound message on a subscribed topic
    Message(Message),
}

/// Raw transport failures
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid session options: {0}")]
    InvalidOptions(String),

    #[error("Session already started")]
    AlreadyStarted,

    #[error("Transport request failed: {0}")]
    Request(String),

    #[error("Broker refused request: {0}")]
    Refused(String),

    #[error("Session closed")]
    Closed,
}

/// Factory for broker sessions
pub trait Transport: Send + Sync {
    /// Build a session for the given credentials; no I/O happens until
    /// [`Session::connect`] is called
    fn create_session(
        &self,
        credentials: &BrokerCredentials,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Arc<dyn Session>, TransportError>;
}

/// One broker session handle
#[async_trait::async_trait]
pub trait Session: Send + Sync {
    /// Start connecting; the outcome arrives as a [`SessionEvent`]
    fn connect(&self) -> Result<(), TransportError>;

    /// Register a topic filter with the broker
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Remove a topic filter from the broker
    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Send a payload in direct (non-persistent) delivery mode
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError>;

    /// Release the session; must not block and must be idempotent
    fn dispose(&self);

    /// Release the session, waiting until requests already issued have
    /// been flushed to the broker
    async fn close(&self) {
        self.dispose();
    }
}
