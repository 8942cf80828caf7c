//! MQTT v5 transport built on rumqttc
//!
//! - [`options`] - pure host URL parsing and session option assembly
//! - [`events`] - pure routing of rumqttc events into [`SessionEvent`](crate::transport::SessionEvent)s
//! - [`session`] - the I/O side: client, poll loop and disposal
//!
//! Reconnection is not handled here. A session lives for one connection and
//! reports its end; the connection manager decides what happens next.

pub mod events;
pub mod options;
pub mod session;

pub use options::{parse_host_url, BrokerEndpoint, MqttSessionOptions};
pub use session::{MqttSession, MqttTransport};
