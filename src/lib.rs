//! brokerlink - resilient publish/subscribe broker client
//!
//! Maintains one session with a remote message broker, reconnecting with
//! bounded exponential backoff, replaying topic subscriptions after every
//! reconnect, and only accepting publishes on a live session.
//!
//! # Overview
//!
//! - [`BrokerClient`] - the facade: connect, subscribe, publish, disconnect, status
//! - [`session`] - connection state machine, retry policy, subscription registry
//! - [`credentials`] - per-attempt credential providers (environment, HTTP, static)
//! - [`transport`] - the session seam and its MQTT implementation
//!
//! # Quick Start
//!
//! ```rust
//! use brokerlink::{RetryPolicy, RetryScheduler, RetryDecision};
//! use std::time::Duration;
//!
//! let mut scheduler = RetryScheduler::new(RetryPolicy::default());
//! assert_eq!(
//!     scheduler.record_failure(),
//!     RetryDecision::Retry { attempt: 1, delay: Duration::from_secs(4) }
//! );
//! ```

pub mod client;
pub mod config;
pub mod credentials;
pub mod error;
pub mod observability;
pub mod session;
pub mod testing;
pub mod topic;
pub mod transport;

pub use client::{BrokerClient, StatusSubscription};
pub use config::{ClientConfig, ConfigError};
pub use credentials::{BrokerCredentials, ConfigProvider};
pub use error::{BrokerError, BrokerResult};
pub use session::{
    ConnectionState, ConnectionStats, Message, RetryDecision, RetryPolicy, RetryScheduler,
    StatusEvent, StatusReason,
};
