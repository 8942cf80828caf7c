//! Configuration loading tests
//!
//! Load a TOML file from disk, build the credential source it selects and
//! drive a client through it.


use brokerlink::config::{ClientConfig, ConfigError, CredentialsSection};
use brokerlink::credentials::provider_from_config;
use brokerlink::error::BrokerError;
use brokerlink::session::ConnectionState;
use brokerlink::testing::MockTransport;
use brokerlink::BrokerClient;
use serde_json::json;
use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{content}").unwrap();
    file
}

#[test]
fn test_config_file_with_http_source() {
    let file = write_config(
        r#"
[client]
name = "dispatch-console"
connect_timeout_ms = 5000

[retry]
max_attempts = 3
base_delay_ms = 500
max_delay_ms = 4000

[credentials]
source = "http"
url = "https://config.example.com/get-broker-config"
token_env = "DISPATCH_CONFIG_TOKEN"
"#,
    );

    let config = ClientConfig::load_from_file(file.path()).unwrap();

    assert_eq!(config.client.name, "dispatch-console");
    assert_eq!(config.retry.policy().max_attempts, 3);
    assert_eq!(
        config.credentials,
        CredentialsSection::Http {
            url: "https://config.example.com/get-broker-config".to_string(),
            token_env: Some("DISPATCH_CONFIG_TOKEN".to_string()),
            timeout_ms: 10_000,
        }
    );
}

#[test]
fn test_invalid_file_is_rejected() {
    let file = write_config(
        r#"
[retry]
max_attempts = 0
"#,
    );

    let result = ClientConfig::load_from_file(file.path());

    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_effective_config_round_trips_through_toml() {
    let file = write_config("[client]\nname = \"dispatcher\"\n");
    let config = ClientConfig::load_from_file(file.path()).unwrap();

    let rendered = toml::to_string_pretty(&config).unwrap();
    let reparsed = ClientConfig::from_toml_str(&rendered).unwrap();

    assert_eq!(reparsed, config);
}

#[tokio::test]
async fn test_client_fetches_credentials_from_endpoint() {
    // Arrange
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/get-broker-config"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "hostUrl": "mqtts://broker.example.com",
            "namespace": "fleet",
            "username": "dispatcher",
            "password": "s3cret"
        })))
        .mount(&server)
        .await;

    let file = write_config(&format!(
        "[credentials]\nsource = \"http\"\nurl = \"{}/get-broker-config\"\n",
        server.uri()
    ));
    let config = ClientConfig::load_from_file(file.path()).unwrap();
    let provider = provider_from_config(&config.credentials).unwrap();
    let transport = MockTransport::new();
    let client = BrokerClient::new(&config, provider, Arc::new(transport.clone()));

    // Act
    client.connect().await.unwrap();

    // Assert
    assert_eq!(client.status(), ConnectionState::Connected);
    let seen = transport.seen_credentials();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].host_url, "mqtts://broker.example.com");
    assert_eq!(seen[0].namespace, "fleet");
    client.disconnect();
}

#[tokio::test]
async fn test_incomplete_endpoint_payload_is_fatal() {
    // Arrange
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/get-broker-config"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "hostUrl": "mqtts://broker.example.com",
            "namespace": "fleet"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = test_helpers::test_config(5);
    config.credentials = CredentialsSection::Http {
        url: format!("{}/get-broker-config", server.uri()),
        token_env: None,
        timeout_ms: 2_000,
    };
    let provider = provider_from_config(&config.credentials).unwrap();
    let transport = MockTransport::new();
    let client = BrokerClient::new(&config, provider, Arc::new(transport.clone()));

    // Act
    let result = client.connect().await;

    // Assert: no retry, no session
    assert!(matches!(result, Err(BrokerError::Configuration { .. })));
    assert_eq!(transport.sessions_created(), 0);
    assert_eq!(client.status(), ConnectionState::Disconnected);
}
