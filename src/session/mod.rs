//! Session lifecycle: state machine, retry policy, subscriptions and statistics

pub mod manager;
pub mod registry;
pub mod retry;
pub mod state;
pub mod stats;

pub use manager::{ConnectionManager, StatusListener, StatusSubscription};
pub use registry::{Message, MessageHandler, ReplayReport, SubscriptionRegistry};
pub use retry::{RetryDecision, RetryPolicy, RetryScheduler};
pub use state::{ConnectionState, StatusEvent, StatusReason};
pub use stats::ConnectionStats;
