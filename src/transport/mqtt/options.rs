//! Pure session option building for the MQTT transport
//!
//! Host URL parsing, client identifier generation and `MqttOptions` assembly.
//! Nothing here performs I/O.

use crate::credentials::BrokerCredentials;
use crate::transport::TransportError;
use rumqttc::v5::MqttOptions;
use rumqttc::Transport as RumqttcTransport;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

/// Largest packet the session will send or accept
pub const MAX_PACKET_SIZE: u32 = 256 * 1024;

/// Lower bound applied to the configured keep-alive
pub const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

const PLAIN_PORT: u16 = 1883;
const TLS_PORT: u16 = 8883;

/// Per-transport settings that do not come from the credentials provider
#[derive(Debug, Clone)]
pub struct MqttSessionOptions {
    pub name: String,
    pub keep_alive: Duration,
    pub request_channel_capacity: usize,
}

/// Where and how to reach the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

/// Parse a broker host URL
///
/// `mqtt://` and `tcp://` are plain, `mqtts://` and `ssl://` use TLS. A value
/// without a scheme is treated as a TLS host on the native MQTT port.
/// WebSocket URLs are rejected; the session speaks MQTT over TCP only.
pub fn parse_host_url(host_url: &str) -> Result<BrokerEndpoint, TransportError> {
    let trimmed = host_url.trim();
    let invalid = || TransportError::InvalidOptions(format!("invalid broker host URL '{trimmed}'"));

    if trimmed.is_empty() {
        return Err(invalid());
    }

    let (url, tls) = if trimmed.contains("://") {
        let url = Url::parse(trimmed).map_err(|_| invalid())?;
        let tls = match url.scheme() {
            "mqtt" | "tcp" => false,
            "mqtts" | "ssl" => true,
            "ws" | "wss" => {
                return Err(TransportError::InvalidOptions(format!(
                    "WebSocket broker URLs are not supported ('{trimmed}'), use mqtts://host[:port]"
                )));
            }
            other => {
                return Err(TransportError::InvalidOptions(format!(
                    "unsupported broker URL scheme '{other}'"
                )));
            }
        };
        (url, tls)
    } else {
        (Url::parse(&format!("mqtts://{trimmed}")).map_err(|_| invalid())?, true)
    };

    let host = url
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(invalid)?
        .to_string();
    let port = url.port().unwrap_or(if tls { TLS_PORT } else { PLAIN_PORT });

    Ok(BrokerEndpoint { host, port, tls })
}

/// Generate a fresh client identifier for one session
pub fn client_id(namespace: &str, name: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{namespace}-{name}-{}", &suffix[..8])
}

/// Assemble rumqttc options for a session
pub fn build_mqtt_options(
    credentials: &BrokerCredentials,
    options: &MqttSessionOptions,
) -> Result<MqttOptions, TransportError> {
    let endpoint = parse_host_url(&credentials.host_url)?;

    let mut mqtt_options = MqttOptions::new(
        client_id(&credentials.namespace, &options.name),
        endpoint.host,
        endpoint.port,
    );

    if endpoint.tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    mqtt_options.set_credentials(&credentials.username, &credentials.password);
    mqtt_options.set_keep_alive(options.keep_alive.max(MIN_KEEP_ALIVE));
    mqtt_options.set_max_packet_size(Some(MAX_PACKET_SIZE));

    Ok(mqtt_options)
}
