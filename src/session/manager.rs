//! Connection state machine and supervisor task
//!
//! One supervisor task runs per connection cycle. A cycle starts with
//! `connect()` and ends on terminal failure or `disconnect()`. Every state
//! change is applied under the core lock and checked against the cycle's
//! generation, so a cancelled supervisor can never emit a stale transition
//! or touch a session owned by a newer cycle.
//!
//! Status listeners are invoked outside the core lock, in transition order,
//! by whichever thread currently drains the pending queue. A listener may
//! call back into the manager.

use super::registry::SubscriptionRegistry;
use super::retry::{RetryDecision, RetryPolicy, RetryScheduler};
use super::state::{log_state_transition, ConnectionState, StatusEvent, StatusReason};
use super::stats::{ConnectionStats, StatsRecorder};
use crate::connection_span;
use crate::credentials::ConfigProvider;
use crate::error::{BrokerError, BrokerResult};
use crate::transport::{Session, SessionEvent, Transport, TransportError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// Capacity of the status broadcast channel
const STATUS_CHANNEL_CAPACITY: usize = 64;

/// Callback invoked for every status transition
pub type StatusListener = Arc<dyn Fn(&StatusEvent) + Send + Sync>;

/// Result of the current connection cycle, as seen by `connect()` callers
#[derive(Debug, Clone, PartialEq)]
enum AttemptOutcome {
    Pending,
    Connected,
    Failed(BrokerError),
}

#[derive(Debug, Clone, PartialEq)]
struct CycleOutcome {
    generation: u64,
    outcome: AttemptOutcome,
}

struct Core {
    state: ConnectionState,
    in_flight: bool,
    generation: u64,
    session: Option<Arc<dyn Session>>,
    supervisor: Option<JoinHandle<()>>,
    pending_notifications: VecDeque<StatusEvent>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    provider: Arc<dyn ConfigProvider>,
    registry: Arc<SubscriptionRegistry>,
    policy: RetryPolicy,
    connect_timeout: Duration,
    core: Mutex<Core>,
    listeners: Mutex<Vec<(u64, StatusListener)>>,
    next_listener_id: AtomicU64,
    delivering: Mutex<()>,
    state_tx: watch::Sender<ConnectionState>,
    outcome_tx: watch::Sender<CycleOutcome>,
    status_tx: broadcast::Sender<StatusEvent>,
    stats: StatsRecorder,
}

/// Owns the session and drives the connect/retry/disconnect state machine
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.status())
            .field("policy", &self.inner.policy)
            .field("connect_timeout", &self.inner.connect_timeout)
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        provider: Arc<dyn ConfigProvider>,
        registry: Arc<SubscriptionRegistry>,
        policy: RetryPolicy,
        connect_timeout: Duration,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (outcome_tx, _) = watch::channel(CycleOutcome {
            generation: 0,
            outcome: AttemptOutcome::Failed(BrokerError::Cancelled),
        });
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                transport,
                provider,
                registry,
                policy,
                connect_timeout,
                core: Mutex::new(Core {
                    state: ConnectionState::Disconnected,
                    in_flight: false,
                    generation: 0,
                    session: None,
                    supervisor: None,
                    pending_notifications: VecDeque::new(),
                }),
                listeners: Mutex::new(Vec::new()),
                next_listener_id: AtomicU64::new(1),
                delivering: Mutex::new(()),
                state_tx,
                outcome_tx,
                status_tx,
                stats: StatsRecorder::default(),
            }),
        }
    }

    /// Start a connection cycle, or join the one in flight
    ///
    /// Resolves when the cycle reaches a live session or fails terminally;
    /// intermediate retries do not resolve it.
    pub async fn connect(&self) -> BrokerResult<()> {
        let (generation, mut outcome_rx) = {
            let mut core = self.inner.lock_core();
            if core.in_flight {
                debug!(
                    generation = core.generation,
                    "Connection cycle already in flight, joining it"
                );
            } else {
                core.in_flight = true;
                core.generation += 1;
                let generation = core.generation;
                self.inner.outcome_tx.send_replace(CycleOutcome {
                    generation,
                    outcome: AttemptOutcome::Pending,
                });

                let span = connection_span!(generation = generation);
                let handle = tokio::spawn(
                    Inner::run_cycle(Arc::clone(&self.inner), generation).instrument(span),
                );
                core.supervisor = Some(handle);
            }
            (core.generation, self.inner.outcome_tx.subscribe())
        };

        loop {
            let current = outcome_rx.borrow_and_update().clone();
            if current.generation != generation {
                return Err(BrokerError::Cancelled);
            }
            match current.outcome {
                AttemptOutcome::Connected => return Ok(()),
                AttemptOutcome::Failed(error) => return Err(error),
                AttemptOutcome::Pending => {}
            }
            if outcome_rx.changed().await.is_err() {
                return Err(BrokerError::Cancelled);
            }
        }
    }

    /// Tear down the cycle synchronously; never fails
    ///
    /// Cancels any pending retry timer and disposes the session. Subscription
    /// bindings are left untouched. Requests already handed to the session
    /// are flushed in the background.
    pub fn disconnect(&self) {
        if let Some(session) = self.detach() {
            session.dispose();
        }
        info!("Disconnected from broker");
    }

    /// Like [`disconnect`](Self::disconnect), but waits until the session has
    /// flushed everything already published before returning
    pub async fn shutdown(&self) {
        if let Some(session) = self.detach() {
            session.close().await;
        }
        info!("Broker session shut down");
    }

    /// Stop the cycle, move to `Disconnected` and hand back the session
    fn detach(&self) -> Option<Arc<dyn Session>> {
        let session = {
            let mut core = self.inner.lock_core();
            let generation = core.generation;
            let was_active = core.in_flight;
            core.generation += 1;
            core.in_flight = false;

            if let Some(handle) = core.supervisor.take() {
                handle.abort();
            }
            let session = core.session.take();

            self.inner.outcome_tx.send_if_modified(|current| {
                if current.generation == generation && current.outcome == AttemptOutcome::Pending {
                    current.outcome = AttemptOutcome::Failed(BrokerError::Cancelled);
                    true
                } else {
                    false
                }
            });

            if was_active || core.state != ConnectionState::Disconnected {
                if core.state == ConnectionState::Connected {
                    self.inner.stats.record_session_end();
                }
                self.inner.emit(
                    &mut core,
                    StatusEvent::new(ConnectionState::Disconnected, StatusReason::DisconnectRequested),
                );
            }
            session
        };
        self.inner.flush_notifications();
        session
    }

    /// Snapshot of the current state
    pub fn status(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Watch receiver for state snapshots
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Ordered stream of status events
    pub fn status_events(&self) -> broadcast::Receiver<StatusEvent> {
        self.inner.status_tx.subscribe()
    }

    /// Register a status listener
    ///
    /// The listener stays registered until [`StatusSubscription::cancel`] is
    /// called; dropping the handle does not remove it.
    pub fn on_status_change(&self, listener: StatusListener) -> StatusSubscription {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.inner.lock_listeners().push((id, listener));
        StatusSubscription {
            inner: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// The session, but only while `Connected`
    pub fn live_session(&self) -> Option<Arc<dyn Session>> {
        let core = self.inner.lock_core();
        if core.state == ConnectionState::Connected {
            core.session.clone()
        } else {
            None
        }
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.inner.registry
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.inner.policy
    }

    pub fn stats(&self) -> ConnectionStats {
        self.inner.stats.snapshot(self.status())
    }

    pub(crate) fn record_publish(&self) {
        self.inner.stats.record_publish();
    }
}

impl Inner {
    fn lock_core(&self) -> MutexGuard<'_, Core> {
        self.core
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_listeners(&self) -> MutexGuard<'_, Vec<(u64, StatusListener)>> {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply a transition; caller holds the core lock
    fn emit(&self, core: &mut Core, event: StatusEvent) {
        let from = core.state;
        core.state = event.state;
        self.state_tx.send_replace(event.state);
        log_state_transition(from, &event);
        // No receivers is fine
        let _ = self.status_tx.send(event.clone());
        core.pending_notifications.push_back(event);
    }

    /// Deliver queued notifications to listeners, in order
    fn flush_notifications(&self) {
        loop {
            let guard = match self.delivering.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                // The current deliverer will pick up our events
                Err(TryLockError::WouldBlock) => return,
            };

            loop {
                let next = self.lock_core().pending_notifications.pop_front();
                let Some(event) = next else {
                    break;
                };
                let listeners: Vec<StatusListener> = self
                    .lock_listeners()
                    .iter()
                    .map(|(_, listener)| Arc::clone(listener))
                    .collect();
                for listener in listeners {
                    listener(&event);
                }
            }

            drop(guard);
            if self.lock_core().pending_notifications.is_empty() {
                return;
            }
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock_core().generation == generation
    }

    /// Transition if `generation` is still current
    fn transition(&self, generation: u64, state: ConnectionState, reason: StatusReason) -> bool {
        {
            let mut core = self.lock_core();
            if core.generation != generation {
                return false;
            }
            self.emit(&mut core, StatusEvent::new(state, reason));
        }
        self.flush_notifications();
        true
    }

    fn set_outcome(&self, generation: u64, outcome: AttemptOutcome) {
        self.outcome_tx.send_if_modified(|current| {
            if current.generation == generation && current.outcome != outcome {
                current.outcome = outcome;
                true
            } else {
                false
            }
        });
    }

    /// Move to `Connected` and release waiting `connect()` callers
    fn mark_connected(&self, generation: u64) -> bool {
        {
            let mut core = self.lock_core();
            if core.generation != generation {
                return false;
            }
            self.stats.record_connected();
            self.emit(
                &mut core,
                StatusEvent::new(ConnectionState::Connected, StatusReason::Established),
            );
            self.set_outcome(generation, AttemptOutcome::Connected);
        }
        self.flush_notifications();
        true
    }

    /// End the cycle with a terminal failure
    fn finish(&self, generation: u64, reason: StatusReason, error: BrokerError) {
        {
            let mut core = self.lock_core();
            if core.generation != generation {
                return;
            }
            core.in_flight = false;
            core.supervisor = None;
            self.emit(
                &mut core,
                StatusEvent::new(ConnectionState::Disconnected, reason),
            );
            self.set_outcome(generation, AttemptOutcome::Failed(error));
        }
        self.flush_notifications();
    }

    fn install_session(&self, generation: u64, session: Arc<dyn Session>) -> bool {
        let mut core = self.lock_core();
        if core.generation != generation {
            return false;
        }
        if let Some(previous) = core.session.replace(session) {
            previous.dispose();
        }
        true
    }

    /// Dispose `session` and clear it if it is still the installed one
    fn release_session(&self, generation: u64, session: &Arc<dyn Session>) {
        session.dispose();
        let mut core = self.lock_core();
        if core.generation == generation
            && core
                .session
                .as_ref()
                .is_some_and(|installed| Arc::ptr_eq(installed, session))
        {
            core.session = None;
        }
    }

    async fn run_cycle(inner: Arc<Inner>, generation: u64) {
        let mut scheduler = RetryScheduler::new(inner.policy.clone());

        loop {
            let attempt = scheduler.attempt() + 1;
            if !inner.transition(
                generation,
                ConnectionState::Connecting,
                StatusReason::AttemptStarted { attempt },
            ) {
                return;
            }
            inner.stats.record_attempt();

            let error = match inner.establish(generation).await {
                Ok((session, mut events)) => {
                    scheduler.reset();
                    if !inner.mark_connected(generation) {
                        session.dispose();
                        return;
                    }

                    // A listener may have disconnected during the Connected notification
                    if !inner.is_current(generation) {
                        return;
                    }
                    let report = inner.registry.replay(session.as_ref()).await;
                    if !report.failed.is_empty() {
                        warn!(
                            "{} of {} subscriptions failed to replay",
                            report.failed.len(),
                            report.failed.len() + report.registered.len()
                        );
                    }

                    let error = inner.pump(generation, &mut events).await;
                    inner.stats.record_drop();
                    inner.release_session(generation, &session);
                    inner.set_outcome(generation, AttemptOutcome::Pending);
                    error
                }
                Err(error) => error,
            };

            if !error.is_retryable() {
                inner.finish(generation, StatusReason::Failed(error.clone()), error);
                return;
            }

            match scheduler.record_failure() {
                RetryDecision::Retry { attempt, delay } => {
                    if !inner.transition(
                        generation,
                        ConnectionState::Disconnected,
                        StatusReason::RetryScheduled {
                            attempt,
                            delay,
                            error,
                        },
                    ) {
                        return;
                    }
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::Exhausted { attempts } => {
                    let terminal = BrokerError::RetriesExhausted {
                        attempts,
                        last_error: error.to_string(),
                    };
                    inner.finish(
                        generation,
                        StatusReason::RetriesExhausted { attempts, error },
                        terminal,
                    );
                    return;
                }
            }
        }
    }

    /// One attempt: fetch credentials, build a session and wait for it to come up
    async fn establish(
        &self,
        generation: u64,
    ) -> BrokerResult<(Arc<dyn Session>, mpsc::UnboundedReceiver<SessionEvent>)> {
        let credentials = self.provider.fetch().await?;
        debug!(namespace = %credentials.namespace, "Fetched broker credentials");

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let session = self
            .transport
            .create_session(&credentials, events_tx)
            .map_err(translate_session_error)?;

        if !self.install_session(generation, Arc::clone(&session)) {
            session.dispose();
            return Err(BrokerError::Cancelled);
        }

        if let Err(e) = session.connect() {
            self.release_session(generation, &session);
            return Err(translate_session_error(e));
        }

        let timeout_ms = u64::try_from(self.connect_timeout.as_millis()).unwrap_or(u64::MAX);
        let result = match tokio::time::timeout(self.connect_timeout, wait_for_up(&mut events)).await
        {
            Ok(result) => result,
            Err(_) => Err(BrokerError::ConnectTimeout { timeout_ms }),
        };

        match result {
            Ok(()) => Ok((session, events)),
            Err(error) => {
                self.release_session(generation, &session);
                Err(error)
            }
        }
    }

    /// Route inbound messages until the session ends
    async fn pump(
        &self,
        generation: u64,
        events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    ) -> BrokerError {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Message(_) if !self.is_current(generation) => {
                    return BrokerError::Cancelled;
                }
                SessionEvent::Message(message) => {
                    self.stats.record_message();
                    self.registry.dispatch(&message);
                }
                SessionEvent::Dropped(reason)
                | SessionEvent::ConnectFailed(reason)
                | SessionEvent::Rejected(reason) => {
                    return BrokerError::transport_dropped(reason);
                }
                SessionEvent::Up => debug!("Ignoring repeated session confirmation"),
            }
        }
        BrokerError::transport_dropped("session event stream closed")
    }
}

/// Handle for removing a status listener
#[derive(Debug, Clone)]
pub struct StatusSubscription {
    inner: Weak<Inner>,
    id: u64,
}

impl StatusSubscription {
    /// Remove the listener; returns `true` if it was still registered
    pub fn cancel(&self) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        let mut listeners = inner.lock_listeners();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != self.id);
        listeners.len() != before
    }
}

/// Wait for the first decisive event of a pending session
async fn wait_for_up(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> BrokerResult<()> {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Up => return Ok(()),
            SessionEvent::Rejected(reason) | SessionEvent::ConnectFailed(reason) => {
                return Err(BrokerError::connect_rejected(reason));
            }
            SessionEvent::Dropped(reason) => return Err(BrokerError::transport_dropped(reason)),
            SessionEvent::Message(message) => {
                debug!(topic = %message.topic(), "Dropping message received before confirmation");
            }
        }
    }
    Err(BrokerError::transport_dropped(
        "session closed before confirmation",
    ))
}

/// Translate a transport failure at the manager boundary
fn translate_session_error(error: TransportError) -> BrokerError {
    match error {
        TransportError::InvalidOptions(message) => BrokerError::configuration(message),
        other => BrokerError::connect_rejected(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translate_session_error() {
        assert!(matches!(
            translate_session_error(TransportError::InvalidOptions("bad url".into())),
            BrokerError::Configuration { .. }
        ));
        assert!(matches!(
            translate_session_error(TransportError::Request("io".into())),
            BrokerError::ConnectRejected { .. }
        ));
        assert!(matches!(
            translate_session_error(TransportError::AlreadyStarted),
            BrokerError::ConnectRejected { .. }
        ));
    }

    #[tokio::test]
    async fn test_wait_for_up_skips_early_messages() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(SessionEvent::Message(crate::session::registry::Message::new(
            "early",
            bytes::Bytes::new(),
        )))
        .unwrap();
        tx.send(SessionEvent::Up).unwrap();

        assert_eq!(wait_for_up(&mut rx).await, Ok(()));
    }

    #[tokio::test]
    async fn test_wait_for_up_classifies_failures() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(SessionEvent::Rejected("bad password".into())).unwrap();
        assert!(matches!(
            wait_for_up(&mut rx).await,
            Err(BrokerError::ConnectRejected { .. })
        ));

        drop(tx);
        assert!(matches!(
            wait_for_up(&mut rx).await,
            Err(BrokerError::TransportDropped { .. })
        ));
    }
}
