//! Mock implementations for testing
//!
//! [`MockTransport`] scripts connection outcomes and records every call the
//! connection manager makes, so the state machine can be exercised without a
//! broker. [`MockConfigProvider`] counts credential fetches.

use crate::config::ConfigError;
use crate::credentials::{BrokerCredentials, ConfigProvider};
use crate::session::registry::Message;
use crate::transport::{Session, SessionEvent, Transport, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

/// Scripted outcome of one `Session::connect` call
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectScript {
    /// Report `Up` immediately
    Succeed,
    /// Report `Up` after a delay
    SucceedAfter(Duration),
    /// Report a broker refusal
    Reject(String),
    /// Report a network-level failure
    Fail(String),
    /// Never report anything
    Hang,
}

#[derive(Debug)]
struct MockState {
    script: VecDeque<ConnectScript>,
    fallback: ConnectScript,
    next_session_id: u64,
    sessions_created: usize,
    connect_attempts: usize,
    disposals: usize,
    graceful_closes: usize,
    subscribe_calls: Vec<String>,
    unsubscribe_calls: Vec<String>,
    published: Vec<(String, Bytes)>,
    failing_subscribes: HashSet<String>,
    fail_publish: bool,
    seen_credentials: Vec<BrokerCredentials>,
    current: Option<(u64, mpsc::UnboundedSender<SessionEvent>)>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            script: VecDeque::new(),
            fallback: ConnectScript::Succeed,
            next_session_id: 1,
            sessions_created: 0,
            connect_attempts: 0,
            disposals: 0,
            graceful_closes: 0,
            subscribe_calls: Vec::new(),
            unsubscribe_calls: Vec::new(),
            published: Vec::new(),
            failing_subscribes: HashSet::new(),
            fail_publish: false,
            seen_credentials: Vec::new(),
            current: None,
        }
    }
}

/// Scriptable in-memory transport
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport whose connect outcomes follow `script`, then succeed
    pub fn with_script(script: impl IntoIterator<Item = ConnectScript>) -> Self {
        let transport = Self::new();
        transport.lock().script.extend(script);
        transport
    }

    /// Sample credentials accepted by the mock
    pub fn credentials() -> BrokerCredentials {
        BrokerCredentials {
            host_url: "mqtt://broker.test:1883".to_string(),
            namespace: "test".to_string(),
            username: "tester".to_string(),
            password: "secret".to_string(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue further connect outcomes
    pub fn push_script(&self, outcome: ConnectScript) {
        self.lock().script.push_back(outcome);
    }

    /// Outcome used once the script is empty
    pub fn set_fallback(&self, outcome: ConnectScript) {
        self.lock().fallback = outcome;
    }

    /// Make transport-level subscribes for `topic` fail
    pub fn fail_subscribe(&self, topic: &str) {
        self.lock().failing_subscribes.insert(topic.to_string());
    }

    /// Let the broker grant a topic again after [`fail_subscribe`](Self::fail_subscribe)
    pub fn allow_subscribe(&self, topic: &str) {
        self.lock().failing_subscribes.remove(topic);
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.lock().fail_publish = fail;
    }

    pub fn sessions_created(&self) -> usize {
        self.lock().sessions_created
    }

    pub fn connect_attempts(&self) -> usize {
        self.lock().connect_attempts
    }

    pub fn disposals(&self) -> usize {
        self.lock().disposals
    }

    /// Sessions released through `Session::close`
    pub fn graceful_closes(&self) -> usize {
        self.lock().graceful_closes
    }

    pub fn subscribe_calls(&self) -> Vec<String> {
        self.lock().subscribe_calls.clone()
    }

    pub fn unsubscribe_calls(&self) -> Vec<String> {
        self.lock().unsubscribe_calls.clone()
    }

    pub fn published(&self) -> Vec<(String, Bytes)> {
        self.lock().published.clone()
    }

    pub fn seen_credentials(&self) -> Vec<BrokerCredentials> {
        self.lock().seen_credentials.clone()
    }

    pub fn clear_history(&self) {
        let mut state = self.lock();
        state.subscribe_calls.clear();
        state.unsubscribe_calls.clear();
        state.published.clear();
    }

    /// Whether a connected session is currently attached
    pub fn has_live_session(&self) -> bool {
        self.lock().current.is_some()
    }

    /// Inject an inbound message into the current session
    pub fn deliver(&self, topic: &str, payload: impl Into<Bytes>) -> bool {
        let state = self.lock();
        match &state.current {
            Some((_, events)) => events
                .send(SessionEvent::Message(Message::new(topic, payload)))
                .is_ok(),
            None => false,
        }
    }

    /// Simulate the broker dropping the current session
    pub fn drop_connection(&self, reason: &str) -> bool {
        let current = self.lock().current.take();
        match current {
            Some((_, events)) => events
                .send(SessionEvent::Dropped(reason.to_string()))
                .is_ok(),
            None => false,
        }
    }
}

impl Transport for MockTransport {
    fn create_session(
        &self,
        credentials: &BrokerCredentials,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Arc<dyn Session>, TransportError> {
        let mut state = self.lock();
        state.sessions_created += 1;
        state.seen_credentials.push(credentials.clone());
        let id = state.next_session_id;
        state.next_session_id += 1;

        Ok(Arc::new(MockSession {
            id,
            state: Arc::clone(&self.state),
            events,
            started: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }))
    }
}

/// Session handed out by [`MockTransport`]
#[derive(Debug)]
pub struct MockSession {
    id: u64,
    state: Arc<Mutex<MockState>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    started: AtomicBool,
    disposed: AtomicBool,
}

impl MockSession {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.disposed.load(Ordering::SeqCst) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Session for MockSession {
    fn connect(&self) -> Result<(), TransportError> {
        self.ensure_open()?;
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyStarted);
        }

        let outcome = {
            let mut state = self.lock();
            state.connect_attempts += 1;
            let outcome = match state.script.pop_front() {
                Some(outcome) => outcome,
                None => state.fallback.clone(),
            };
            if matches!(
                outcome,
                ConnectScript::Succeed | ConnectScript::SucceedAfter(_)
            ) {
                state.current = Some((self.id, self.events.clone()));
            }
            outcome
        };

        match outcome {
            ConnectScript::Succeed => {
                let _ = self.events.send(SessionEvent::Up);
            }
            ConnectScript::SucceedAfter(delay) => {
                let events = self.events.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = events.send(SessionEvent::Up);
                });
            }
            ConnectScript::Reject(reason) => {
                let _ = self.events.send(SessionEvent::Rejected(reason));
            }
            ConnectScript::Fail(reason) => {
                let _ = self.events.send(SessionEvent::ConnectFailed(reason));
            }
            ConnectScript::Hang => {}
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = self.lock();
        state.subscribe_calls.push(topic.to_string());
        if state.failing_subscribes.contains(topic) {
            return Err(TransportError::Refused(format!("subscribe to {topic}: NotAuthorized")));
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.lock().unsubscribe_calls.push(topic.to_string());
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = self.lock();
        if state.fail_publish {
            return Err(TransportError::Request("publish refused".to_string()));
        }
        state.published.push((topic.to_string(), payload));
        Ok(())
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut state = self.lock();
        state.disposals += 1;
        if state
            .current
            .as_ref()
            .is_some_and(|(id, _)| *id == self.id)
        {
            state.current = None;
        }
    }

    async fn close(&self) {
        if !self.disposed.load(Ordering::SeqCst) {
            self.lock().graceful_closes += 1;
        }
        self.dispose();
    }
}

/// Credential provider returning fixed credentials and counting fetches
#[derive(Debug)]
pub struct MockConfigProvider {
    credentials: Mutex<BrokerCredentials>,
    missing_fields: Mutex<Option<Vec<String>>>,
    fetches: AtomicUsize,
}

impl Default for MockConfigProvider {
    fn default() -> Self {
        Self::new(MockTransport::credentials())
    }
}

impl MockConfigProvider {
    pub fn new(credentials: BrokerCredentials) -> Self {
        Self {
            credentials: Mutex::new(credentials),
            missing_fields: Mutex::new(None),
            fetches: AtomicUsize::new(0),
        }
    }

    /// Provider that reports the given fields as missing
    pub fn missing(fields: &[&str]) -> Self {
        let provider = Self::default();
        provider.set_missing(Some(fields.iter().map(|f| f.to_string()).collect()));
        provider
    }

    pub fn set_missing(&self, fields: Option<Vec<String>>) {
        *self
            .missing_fields
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = fields;
    }

    /// Replace the credentials returned by later fetches
    pub fn rotate(&self, credentials: BrokerCredentials) {
        *self
            .credentials
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = credentials;
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConfigProvider for MockConfigProvider {
    async fn fetch(&self) -> Result<BrokerCredentials, ConfigError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let missing = self
            .missing_fields
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(fields) = missing {
            return Err(ConfigError::MissingCredentials(fields));
        }

        Ok(self
            .credentials
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone())
    }
}
