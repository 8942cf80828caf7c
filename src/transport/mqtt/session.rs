//! rumqttc-backed transport and session I/O

use super::events::{classify_connection_error, is_terminal, route_event, PollEvent};
use super::options::{build_mqtt_options, MqttSessionOptions};
use crate::config::ClientSection;
use crate::credentials::BrokerCredentials;
use crate::transport::{Session, SessionEvent, Transport, TransportError};
use bytes::Bytes;
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, EventLoop};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long a subscribe waits for the broker's SubAck
pub const SUBACK_TIMEOUT: Duration = Duration::from_secs(10);

/// How long closing waits for queued packets and the DISCONNECT to be flushed
pub const CLOSE_GRACE: Duration = Duration::from_secs(5);

type SubscribeReply = oneshot::Sender<Result<(), String>>;

/// Matches SubAcks to the subscribe calls waiting for them
///
/// rumqttc sends requests in queue order, so the n-th outgoing SUBSCRIBE
/// belongs to the n-th queued entry.
#[derive(Default)]
struct SubscribeTracker {
    queued: VecDeque<(String, SubscribeReply)>,
    in_flight: HashMap<u16, (String, SubscribeReply)>,
}

impl SubscribeTracker {
    fn sent(&mut self, pkid: u16) {
        if let Some(entry) = self.queued.pop_front() {
            self.in_flight.insert(pkid, entry);
        }
    }

    fn acked(&mut self, pkid: u16, outcome: Result<(), String>) {
        match self.in_flight.remove(&pkid) {
            Some((topic, reply)) => {
                debug!(pkid, topic = %topic, granted = outcome.is_ok(), "SubAck received");
                let _ = reply.send(outcome);
            }
            None => debug!(pkid, "SubAck for unknown packet id"),
        }
    }

    /// Drop every waiter; their calls fail with `Closed`
    fn clear(&mut self) {
        self.queued.clear();
        self.in_flight.clear();
    }
}

/// State shared between a session handle and its poll task
#[derive(Default)]
struct Shared {
    closing: AtomicBool,
    subscribes: Mutex<SubscribeTracker>,
}

impl Shared {
    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    fn subscribes(&self) -> MutexGuard<'_, SubscribeTracker> {
        self.subscribes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Transport creating one rumqttc client per session
#[derive(Debug, Clone)]
pub struct MqttTransport {
    options: MqttSessionOptions,
}

impl MqttTransport {
    pub fn new(name: impl Into<String>, keep_alive: Duration, request_channel_capacity: usize) -> Self {
        Self {
            options: MqttSessionOptions {
                name: name.into(),
                keep_alive,
                request_channel_capacity,
            },
        }
    }

    pub fn from_config(config: &ClientSection) -> Self {
        Self::new(
            config.name.clone(),
            Duration::from_secs(config.keep_alive_secs),
            config.request_channel_capacity,
        )
    }
}

impl Transport for MqttTransport {
    fn create_session(
        &self,
        credentials: &BrokerCredentials,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Arc<dyn Session>, TransportError> {
        let mqtt_options = build_mqtt_options(credentials, &self.options)?;
        debug!(
            client_id = %mqtt_options.client_id(),
            "Created MQTT session options"
        );

        let (client, event_loop) =
            AsyncClient::new(mqtt_options, self.options.request_channel_capacity.max(1));

        Ok(Arc::new(MqttSession {
            client,
            event_loop: Mutex::new(Some(event_loop)),
            poll_task: Mutex::new(None),
            events,
            shared: Arc::new(Shared::default()),
            subscribe_order: tokio::sync::Mutex::new(()),
        }))
    }
}

/// A single rumqttc client plus its polling task
pub struct MqttSession {
    client: AsyncClient,
    event_loop: Mutex<Option<EventLoop>>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    shared: Arc<Shared>,
    /// Keeps tracker order equal to request-channel order
    subscribe_order: tokio::sync::Mutex<()>,
}

impl MqttSession {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.shared.is_closing() {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    /// Mark the session closing and take its poll task; `None` if already closing
    fn begin_close(&self) -> Option<Option<JoinHandle<()>>> {
        if self.shared.closing.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(
            self.poll_task
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take(),
        )
    }

    /// Poll until a terminal event, the flushed DISCONNECT, or until nobody listens
    async fn run_event_loop(
        mut event_loop: EventLoop,
        events: mpsc::UnboundedSender<SessionEvent>,
        shared: Arc<Shared>,
    ) {
        let mut session_up = false;

        loop {
            let polled = match event_loop.poll().await {
                Ok(event) => route_event(&event),
                Err(error) if shared.is_closing() => {
                    debug!("MQTT connection ended while closing: {}", error);
                    break;
                }
                Err(error) => Some(PollEvent::Session(classify_connection_error(
                    &error, session_up,
                ))),
            };

            let Some(polled) = polled else {
                continue;
            };

            match polled {
                PollEvent::SubscribeSent(pkid) => shared.subscribes().sent(pkid),
                PollEvent::SubscribeAcked { pkid, outcome } => {
                    shared.subscribes().acked(pkid, outcome)
                }
                PollEvent::DisconnectSent => {
                    debug!("MQTT DISCONNECT flushed");
                    break;
                }
                PollEvent::Session(session_event) => {
                    if session_event == SessionEvent::Up {
                        session_up = true;
                    }
                    let terminal = is_terminal(&session_event);

                    // While closing, keep polling so queued requests still go out
                    if events.send(session_event).is_err() && !shared.is_closing() {
                        debug!("Session event receiver gone, stopping MQTT poll loop");
                        break;
                    }
                    if terminal {
                        break;
                    }
                }
            }
        }

        drop(event_loop);
        shared.subscribes().clear();
        debug!("MQTT poll loop stopped");
    }
}

/// Queue a DISCONNECT behind everything already requested and wait for the
/// poll task to flush it; abort the task if that takes longer than `CLOSE_GRACE`
async fn close_gracefully(client: AsyncClient, poll_task: Option<JoinHandle<()>>) {
    let Some(mut poll_task) = poll_task else {
        return;
    };

    let flushed = tokio::time::timeout(CLOSE_GRACE, async {
        if let Err(e) = client.disconnect().await {
            debug!("MQTT disconnect request not delivered: {}", e);
        }
        let _ = (&mut poll_task).await;
    })
    .await;

    if flushed.is_err() {
        warn!(
            "MQTT session did not close within {}s, aborting",
            CLOSE_GRACE.as_secs()
        );
        poll_task.abort();
    }
}

#[async_trait::async_trait]
impl Session for MqttSession {
    fn connect(&self) -> Result<(), TransportError> {
        self.ensure_open()?;

        let event_loop = self
            .event_loop
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or(TransportError::AlreadyStarted)?;

        let handle = tokio::spawn(Self::run_event_loop(
            event_loop,
            self.events.clone(),
            Arc::clone(&self.shared),
        ));
        *self
            .poll_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
        Ok(())
    }

    /// Resolves once the broker granted or refused the filter
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        let (reply_tx, reply_rx) = oneshot::channel();

        {
            let _order = self.subscribe_order.lock().await;
            self.shared
                .subscribes()
                .queued
                .push_back((topic.to_string(), reply_tx));

            if let Err(e) = self.client.subscribe(topic, QoS::AtLeastOnce).await {
                self.shared.subscribes().queued.pop_back();
                return Err(TransportError::Request(format!(
                    "subscribe to {topic} failed: {e}"
                )));
            }
        }

        match tokio::time::timeout(SUBACK_TIMEOUT, reply_rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(TransportError::Refused(reason)),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Request(format!(
                "no SubAck for {topic} within {}s",
                SUBACK_TIMEOUT.as_secs()
            ))),
        }
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.client
            .unsubscribe(topic)
            .await
            .map_err(|e| TransportError::Request(format!("unsubscribe from {topic} failed: {e}")))
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(|e| TransportError::Request(format!("publish to {topic} failed: {e}")))
    }

    fn dispose(&self) {
        let Some(poll_task) = self.begin_close() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(close_gracefully(self.client.clone(), poll_task));
            }
            Err(_) => {
                if let Some(handle) = poll_task {
                    handle.abort();
                }
            }
        }
        info!("MQTT session closing");
    }

    async fn close(&self) {
        let Some(poll_task) = self.begin_close() else {
            return;
        };
        close_gracefully(self.client.clone(), poll_task).await;
        info!("MQTT session closed");
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        if let Some(handle) = self
            .poll_task
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}
