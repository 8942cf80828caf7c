//! Public facade over the connection manager and subscription registry
//!
//! ```rust,no_run
//! use brokerlink::{BrokerClient, ClientConfig};
//!
//! # tokio_test::block_on(async {
//! let client = BrokerClient::from_config(&ClientConfig::default())?;
//! client
//!     .subscribe("fleet/+/position", |message| {
//!         println!("{}: {:?}", message.topic(), message.payload_str());
//!     })
//!     .await?;
//! client.connect().await?;
//! client.publish("fleet/dispatch", "hello").await?;
//! client.disconnect();
//! # Ok::<(), brokerlink::BrokerError>(())
//! # });
//! ```

use crate::config::ClientConfig;
use crate::credentials::{provider_from_config, ConfigProvider};
use crate::error::{BrokerError, BrokerResult};
use crate::session::{
    ConnectionManager, ConnectionState, ConnectionStats, Message, StatusEvent,
    SubscriptionRegistry,
};
use crate::topic::{validate_topic_filter, validate_topic_name};
use crate::transport::{MqttTransport, Transport};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

pub use crate::session::StatusSubscription;

/// Single entry point for broker connectivity
///
/// Cheap to clone; clones share the same session and subscriptions.
#[derive(Clone, Debug)]
pub struct BrokerClient {
    manager: ConnectionManager,
    registry: Arc<SubscriptionRegistry>,
}

impl BrokerClient {
    /// Build a client around explicit collaborators
    pub fn new(
        config: &ClientConfig,
        provider: Arc<dyn ConfigProvider>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new());
        let manager = ConnectionManager::new(
            transport,
            provider,
            Arc::clone(&registry),
            config.retry.policy(),
            config.client.connect_timeout(),
        );
        Self { manager, registry }
    }

    /// Build a client using the MQTT transport and the configured credential source
    pub fn from_config(config: &ClientConfig) -> BrokerResult<Self> {
        config.validate()?;
        let provider = provider_from_config(&config.credentials)?;
        let transport = Arc::new(MqttTransport::from_config(&config.client));
        Ok(Self::new(config, provider, transport))
    }

    /// Connect, retrying with backoff; joins an attempt already in flight
    pub async fn connect(&self) -> BrokerResult<()> {
        self.manager.connect().await
    }

    /// Disconnect and forget all subscriptions
    pub fn disconnect(&self) {
        self.manager.disconnect();
        self.registry.clear();
    }

    /// Disconnect but keep subscriptions for replay on the next `connect()`
    pub fn disconnect_preserving_subscriptions(&self) {
        self.manager.disconnect();
    }

    /// Disconnect after everything already published has reached the broker,
    /// and forget all subscriptions
    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
        self.registry.clear();
    }

    /// Bind `handler` to a topic filter
    ///
    /// Never fails because of connection state: the binding is registered
    /// with the broker now if connected, otherwise on the next connection.
    /// Re-subscribing a filter replaces its handler, and retries the broker
    /// registration if the previous one was refused.
    pub async fn subscribe<F>(&self, topic: &str, handler: F) -> BrokerResult<()>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        validate_topic_filter(topic).map_err(|e| BrokerError::invalid_topic(topic, e))?;

        let replaced = self.registry.insert(topic, Arc::new(handler));
        if replaced && self.registry.is_registered(topic) {
            debug!("Replaced handler for {}", topic);
            return Ok(());
        }

        match self.manager.live_session() {
            Some(session) => match session.subscribe(topic).await {
                Ok(()) => self.registry.set_registered(topic, true),
                Err(e) => {
                    // Replayed on the next connection
                    self.registry.set_registered(topic, false);
                    warn!(
                        "{}",
                        BrokerError::subscribe_registration_failed(topic, e.to_string())
                    );
                }
            },
            None => debug!("Deferred subscription to {} until connected", topic),
        }
        Ok(())
    }

    /// Remove a binding; idempotent
    pub async fn unsubscribe(&self, topic: &str) {
        if !self.registry.remove(topic) {
            return;
        }

        if let Some(session) = self.manager.live_session() {
            if let Err(e) = session.unsubscribe(topic).await {
                warn!("Failed to unsubscribe from {}: {}", topic, e);
            }
        }
    }

    /// Publish on the live session; fails fast when not connected
    pub async fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> BrokerResult<()> {
        validate_topic_name(topic).map_err(|e| BrokerError::invalid_topic(topic, e))?;

        let session = self.manager.live_session().ok_or_else(|| BrokerError::NotConnected {
            state: self.manager.status(),
        })?;

        session
            .publish(topic, payload.into())
            .await
            .map_err(|e| BrokerError::publish_failed(topic, e.to_string()))?;
        self.manager.record_publish();
        Ok(())
    }

    /// Current connection state
    pub fn status(&self) -> ConnectionState {
        self.manager.status()
    }

    /// Call `listener` for every state transition, in order
    pub fn on_status_change<F>(&self, listener: F) -> StatusSubscription
    where
        F: Fn(&StatusEvent) + Send + Sync + 'static,
    {
        self.manager.on_status_change(Arc::new(listener))
    }

    /// Stream of state transitions
    pub fn status_events(&self) -> broadcast::Receiver<StatusEvent> {
        self.manager.status_events()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.manager.stats()
    }

    /// Topic filters currently bound
    pub fn subscriptions(&self) -> Vec<String> {
        self.registry.topics()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CredentialsSection;
    use crate::testing::{MockConfigProvider, MockTransport};

    fn client(transport: &MockTransport) -> BrokerClient {
        BrokerClient::new(
            &ClientConfig::default(),
            Arc::new(MockConfigProvider::default()),
            Arc::new(transport.clone()),
        )
    }

    #[test]
    fn test_from_config_with_env_source() {
        let client = BrokerClient::from_config(&ClientConfig::default()).unwrap();
        assert_eq!(client.status(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_from_config_rejects_invalid_http_url() {
        let mut config = ClientConfig::default();
        config.credentials = CredentialsSection::Http {
            url: "not a url".to_string(),
            token_env: None,
            timeout_ms: 1000,
        };

        let result = BrokerClient::from_config(&config);
        assert!(matches!(result, Err(BrokerError::Configuration { .. })));
    }

    #[tokio::test]
    async fn test_subscribe_rejects_malformed_filter() {
        let transport = MockTransport::new();
        let client = client(&transport);

        let result = client.subscribe("a/#/b", |_| {}).await;

        assert!(matches!(result, Err(BrokerError::InvalidTopic { .. })));
        assert!(client.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_publish_rejects_wildcard_topic() {
        let transport = MockTransport::new();
        let client = client(&transport);

        let result = client.publish("a/+", "x").await;

        assert!(matches!(result, Err(BrokerError::InvalidTopic { .. })));
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let transport = MockTransport::new();
        let client = client(&transport);
        client.subscribe("a", |_| {}).await.unwrap();

        client.unsubscribe("a").await;
        client.unsubscribe("a").await;
        client.unsubscribe("never-subscribed").await;

        assert!(client.subscriptions().is_empty());
        // Not connected, so nothing reaches the transport
        assert!(transport.unsubscribe_calls().is_empty());
    }

    #[tokio::test]
    async fn test_status_subscription_cancel() {
        let transport = MockTransport::new();
        let client = client(&transport);

        let subscription = client.on_status_change(|_| {});

        assert!(subscription.cancel());
        assert!(!subscription.cancel());
    }
}
