//! Connection state and status notifications
//!
//! Pure types and functions describing the connection state machine; the
//! transitions themselves are driven by [`ConnectionManager`](super::ConnectionManager).

use crate::error::BrokerError;
use std::time::Duration;
use tracing::{error, info, warn};

/// Connection state of a broker client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No session and no attempt in progress (also the state between retries)
    #[default]
    Disconnected,
    /// A session is being established
    Connecting,
    /// The session is live; publishes are accepted
    Connected,
}

impl ConnectionState {
    /// Check if this state allows publishing
    pub fn can_publish(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Why a transition happened
#[derive(Debug, Clone, PartialEq)]
pub enum StatusReason {
    /// A (re-)connection attempt started; `attempt` counts from 1 since the last success
    AttemptStarted { attempt: u32 },
    /// The broker confirmed the session
    Established,
    /// The attempt or live session failed and a retry is scheduled
    RetryScheduled {
        attempt: u32,
        delay: Duration,
        error: BrokerError,
    },
    /// Consecutive failures reached the configured bound
    RetriesExhausted { attempts: u32, error: BrokerError },
    /// A non-retryable failure ended the connection cycle
    Failed(BrokerError),
    /// Caller invoked `disconnect()`
    DisconnectRequested,
}

/// A single ordered status notification
#[derive(Debug, Clone, PartialEq)]
pub struct StatusEvent {
    pub state: ConnectionState,
    pub reason: StatusReason,
}

impl StatusEvent {
    pub fn new(state: ConnectionState, reason: StatusReason) -> Self {
        Self { state, reason }
    }

    /// Whether this event ends a connection cycle without a live session
    pub fn is_terminal_failure(&self) -> bool {
        matches!(
            self.reason,
            StatusReason::RetriesExhausted { .. } | StatusReason::Failed(_)
        )
    }
}

/// Log connection state transition
pub fn log_state_transition(from: ConnectionState, event: &StatusEvent) {
    match (&from, &event.state, &event.reason) {
        (_, ConnectionState::Connected, _) => {
            info!("Broker session established");
        }
        (ConnectionState::Connected, ConnectionState::Disconnected, StatusReason::RetryScheduled { error, .. }) => {
            warn!("Broker session lost: {}", error);
        }
        (_, _, StatusReason::RetryScheduled { attempt, delay, error }) => {
            warn!(
                "Connection attempt failed ({}), retry {} in {}ms",
                error,
                attempt,
                delay.as_millis()
            );
        }
        (_, _, StatusReason::RetriesExhausted { attempts, error }) => {
            error!(
                "Giving up after {} consecutive failures, last error: {}",
                attempts, error
            );
        }
        (_, _, StatusReason::Failed(error)) => {
            error!("Connection failed permanently: {}", error);
        }
        (_, _, StatusReason::AttemptStarted { attempt }) => {
            info!("Starting connection attempt {}", attempt);
        }
        _ => {
            info!(
                "Connection state: {:?} -> {:?} ({:?})",
                from, event.state, event.reason
            );
        }
    }
}
