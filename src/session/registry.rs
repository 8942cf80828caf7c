//! Topic to handler bindings
//!
//! Bindings survive disconnects and are replayed against every new session.
//! Lookups and mutations are mutually exclusive; handlers always run outside
//! the lock so a handler may subscribe or unsubscribe without deadlocking.

use crate::error::BrokerError;
use crate::subscription_span;
use crate::topic::topic_matches;
use crate::transport::Session;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn, Instrument};

/// An inbound message, decoded once at the transport boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    topic: String,
    payload: Bytes,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Payload as UTF-8, if it is valid
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Decode a JSON payload
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// Caller-supplied message handler
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// Outcome of replaying all bindings against a new session
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReplayReport {
    pub registered: Vec<String>,
    pub failed: Vec<BrokerError>,
}

struct Binding {
    handler: MessageHandler,
    /// The broker confirmed this filter on the current or last session
    registered: bool,
}

/// Topic filter to handler map, keyed last-write-wins
#[derive(Default)]
pub struct SubscriptionRegistry {
    bindings: RwLock<HashMap<String, Binding>>,
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("topics", &self.topics())
            .finish()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Binding>> {
        self.bindings
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Binding>> {
        self.bindings
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Bind a handler; returns `true` if an existing binding was replaced
    ///
    /// A replaced binding keeps its registration status.
    pub fn insert(&self, topic: &str, handler: MessageHandler) -> bool {
        let mut bindings = self.write();
        match bindings.get_mut(topic) {
            Some(binding) => {
                binding.handler = handler;
                true
            }
            None => {
                bindings.insert(
                    topic.to_string(),
                    Binding {
                        handler,
                        registered: false,
                    },
                );
                false
            }
        }
    }

    /// Record whether the broker accepted the filter
    pub fn set_registered(&self, topic: &str, registered: bool) {
        if let Some(binding) = self.write().get_mut(topic) {
            binding.registered = registered;
        }
    }

    /// Whether the broker accepted the filter on the latest attempt
    pub fn is_registered(&self, topic: &str) -> bool {
        self.read()
            .get(topic)
            .is_some_and(|binding| binding.registered)
    }

    /// Remove a binding; returns `true` if it existed
    pub fn remove(&self, topic: &str) -> bool {
        self.write().remove(topic).is_some()
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.read().contains_key(topic)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Registered topic filters, sorted
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.read().keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Deliver a message to every binding whose filter matches its topic
    ///
    /// Returns the number of handlers invoked.
    pub fn dispatch(&self, message: &Message) -> usize {
        let handlers: Vec<MessageHandler> = self
            .read()
            .iter()
            .filter(|(filter, _)| topic_matches(filter, message.topic()))
            .map(|(_, binding)| Arc::clone(&binding.handler))
            .collect();

        if handlers.is_empty() {
            debug!(topic = %message.topic(), "No handler bound for inbound message");
        }

        for handler in &handlers {
            handler(message.clone());
        }
        handlers.len()
    }

    /// Register every binding with the session
    ///
    /// A failure for one topic is logged and does not stop the others.
    pub async fn replay(&self, session: &dyn Session) -> ReplayReport {
        let topics = self.topics();
        let span = subscription_span!(topics = topics.len());

        async move {
            let mut report = ReplayReport::default();

            for topic in topics {
                match session.subscribe(&topic).await {
                    Ok(()) => {
                        debug!("Replayed subscription: {}", topic);
                        self.set_registered(&topic, true);
                        report.registered.push(topic);
                    }
                    Err(e) => {
                        self.set_registered(&topic, false);
                        let error = BrokerError::subscribe_registration_failed(&topic, e.to_string());
                        warn!("{}", error);
                        report.failed.push(error);
                    }
                }
            }

            debug!(
                registered = report.registered.len(),
                failed = report.failed.len(),
                "Subscription replay finished"
            );
            report
        }
        .instrument(span)
        .await
    }
}
