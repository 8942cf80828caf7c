//! Pure routing of rumqttc events
//!
//! Lifecycle packets and inbound publishes become [`SessionEvent`]s for the
//! connection manager. Subscribe bookkeeping and the outgoing DISCONNECT stay
//! inside the session and never reach the manager.

use crate::session::registry::Message;
use crate::transport::SessionEvent;
use rumqttc::v5::mqttbytes::v5::{Packet, SubAck, SubscribeReasonCode};
use rumqttc::v5::{ConnectionError, Event};
use rumqttc::Outgoing;
use tracing::trace;

/// What the poll loop should do with one polled event
#[derive(Debug, Clone, PartialEq)]
pub enum PollEvent {
    /// Forward to the connection manager
    Session(SessionEvent),
    /// A SUBSCRIBE left with this packet id
    SubscribeSent(u16),
    /// The broker answered a SUBSCRIBE
    SubscribeAcked { pkid: u16, outcome: Result<(), String> },
    /// The DISCONNECT packet, and everything queued before it, was flushed
    DisconnectSent,
}

/// Map a polled event to a poll action, if it is one the session cares about
pub fn route_event(event: &Event) -> Option<PollEvent> {
    match event {
        Event::Incoming(packet) => match packet {
            Packet::ConnAck(_) => Some(PollEvent::Session(SessionEvent::Up)),
            Packet::Publish(publish) => Some(PollEvent::Session(SessionEvent::Message(
                Message::new(
                    String::from_utf8_lossy(&publish.topic).to_string(),
                    publish.payload.clone(),
                ),
            ))),
            Packet::Disconnect(disconnect) => Some(PollEvent::Session(SessionEvent::Dropped(
                format!("broker sent disconnect: {:?}", disconnect.reason_code),
            ))),
            Packet::SubAck(suback) => Some(PollEvent::SubscribeAcked {
                pkid: suback.pkid,
                outcome: suback_outcome(suback),
            }),
            other => {
                trace!("Ignoring inbound packet: {:?}", other);
                None
            }
        },
        Event::Outgoing(Outgoing::Subscribe(pkid)) => Some(PollEvent::SubscribeSent(*pkid)),
        Event::Outgoing(Outgoing::Disconnect) => Some(PollEvent::DisconnectSent),
        Event::Outgoing(_) => None,
    }
}

/// `Ok` if every filter in the SubAck was granted
pub fn suback_outcome(suback: &SubAck) -> Result<(), String> {
    let refused: Vec<String> = suback
        .return_codes
        .iter()
        .filter(|code| !matches!(code, SubscribeReasonCode::Success(_)))
        .map(|code| format!("{code:?}"))
        .collect();

    if refused.is_empty() {
        Ok(())
    } else {
        Err(format!("broker refused subscription: {}", refused.join(", ")))
    }
}

/// Classify a poll error; `session_up` tells whether a ConnAck was seen
pub fn classify_connection_error(error: &ConnectionError, session_up: bool) -> SessionEvent {
    match error {
        ConnectionError::ConnectionRefused(code) => {
            SessionEvent::Rejected(format!("broker refused connection: {code:?}"))
        }
        other if session_up => SessionEvent::Dropped(other.to_string()),
        other => SessionEvent::ConnectFailed(other.to_string()),
    }
}

/// Whether the poll loop must stop after emitting this event
pub fn is_terminal(event: &SessionEvent) -> bool {
    matches!(
        event,
        SessionEvent::ConnectFailed(_) | SessionEvent::Rejected(_) | SessionEvent::Dropped(_)
    )
}
