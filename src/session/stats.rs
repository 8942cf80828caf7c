//! Connection statistics and health assessment

use super::state::ConnectionState;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Inbound silence after which a live session is reported unhealthy
pub const MESSAGE_SILENCE_THRESHOLD: Duration = Duration::from_secs(300);

/// Point-in-time view of a client's connection history
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStats {
    pub state: ConnectionState,
    pub connect_attempts: u64,
    pub successful_connections: u64,
    pub drops: u64,
    pub messages_delivered: u64,
    pub publishes: u64,
    /// Wall-clock time the current session came up
    pub connected_since: Option<DateTime<Utc>>,
    pub uptime: Option<Duration>,
    pub time_since_last_message: Option<Duration>,
    pub is_healthy: bool,
}

/// Healthy when connected and either no message yet or the last one is recent
pub fn determine_health_status(
    uptime: Option<Duration>,
    time_since_last_message: Option<Duration>,
) -> bool {
    match (uptime, time_since_last_message) {
        (Some(_), None) => true,
        (Some(_), Some(last_message)) => last_message < MESSAGE_SILENCE_THRESHOLD,
        _ => false,
    }
}

#[derive(Debug, Default)]
struct Timestamps {
    connected_at: Option<(Instant, DateTime<Utc>)>,
    last_message_at: Option<Instant>,
}

/// Lock-light counters updated by the connection manager
#[derive(Debug, Default)]
pub(crate) struct StatsRecorder {
    connect_attempts: AtomicU64,
    successful_connections: AtomicU64,
    drops: AtomicU64,
    messages_delivered: AtomicU64,
    publishes: AtomicU64,
    timestamps: Mutex<Timestamps>,
}

impl StatsRecorder {
    fn timestamps(&self) -> std::sync::MutexGuard<'_, Timestamps> {
        self.timestamps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn record_attempt(&self) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_connected(&self) {
        self.successful_connections.fetch_add(1, Ordering::Relaxed);
        let mut timestamps = self.timestamps();
        timestamps.connected_at = Some((Instant::now(), Utc::now()));
        timestamps.last_message_at = None;
    }

    pub(crate) fn record_drop(&self) {
        self.drops.fetch_add(1, Ordering::Relaxed);
        self.record_session_end();
    }

    pub(crate) fn record_session_end(&self) {
        self.timestamps().connected_at = None;
    }

    pub(crate) fn record_message(&self) {
        self.messages_delivered.fetch_add(1, Ordering::Relaxed);
        self.timestamps().last_message_at = Some(Instant::now());
    }

    pub(crate) fn record_publish(&self) {
        self.publishes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, state: ConnectionState) -> ConnectionStats {
        let now = Instant::now();
        let (connected_since, uptime, time_since_last_message) = {
            let timestamps = self.timestamps();
            (
                timestamps.connected_at.map(|(_, wall)| wall),
                timestamps
                    .connected_at
                    .map(|(started, _)| now.duration_since(started)),
                timestamps
                    .last_message_at
                    .map(|at| now.duration_since(at)),
            )
        };

        ConnectionStats {
            state,
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            successful_connections: self.successful_connections.load(Ordering::Relaxed),
            drops: self.drops.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            publishes: self.publishes.load(Ordering::Relaxed),
            connected_since,
            uptime,
            time_since_last_message,
            is_healthy: determine_health_status(uptime, time_since_last_message),
        }
    }
}
