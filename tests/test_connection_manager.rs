//! Connection manager state machine tests
//!
//! Exercises retry timing, attempt exclusivity, cancellation and replay
//! against the scriptable mock transport on a paused clock.


use brokerlink::error::BrokerError;
use brokerlink::session::{ConnectionState, Message, StatusEvent, StatusReason};
use brokerlink::testing::{ConnectScript, MockConfigProvider, MockTransport};
use brokerlink::BrokerCredentials;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use test_helpers::{drain, manager, settle, wait_for, CONNECT_TIMEOUT_MS};
use tokio::time::Instant;

fn noop_handler() -> brokerlink::session::MessageHandler {
    Arc::new(|_message: Message| {})
}

#[tokio::test(start_paused = true)]
async fn test_retry_delays_follow_capped_doubling() {
    // Arrange: every attempt is refused
    let transport = MockTransport::new();
    transport.set_fallback(ConnectScript::Reject("not authorized".into()));
    let provider = Arc::new(MockConfigProvider::default());
    let manager = manager(&transport, &provider, 5);
    let mut events = manager.status_events();
    let started = Instant::now();

    // Act
    let result = manager.connect().await;

    // Assert
    let delays: Vec<Duration> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event.reason {
            StatusReason::RetryScheduled { delay, .. } => Some(delay),
            _ => None,
        })
        .collect();
    assert_eq!(
        delays,
        vec![
            Duration::from_millis(200),
            Duration::from_millis(400),
            Duration::from_millis(800),
            Duration::from_millis(1000),
        ]
    );
    assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
    assert!(started.elapsed() >= Duration::from_millis(2400));
    assert!(matches!(
        result,
        Err(BrokerError::RetriesExhausted { attempts: 5, .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_exhaustion_schedules_no_further_attempts() {
    // Arrange
    let transport = MockTransport::new();
    transport.set_fallback(ConnectScript::Reject("denied".into()));
    let provider = Arc::new(MockConfigProvider::default());
    let manager = manager(&transport, &provider, 3);

    // Act
    let result = manager.connect().await;
    tokio::time::sleep(Duration::from_secs(120)).await;

    // Assert
    match result {
        Err(BrokerError::RetriesExhausted {
            attempts,
            last_error,
        }) => {
            assert_eq!(attempts, 3);
            assert!(last_error.contains("denied"));
        }
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }
    assert_eq!(transport.connect_attempts(), 3);
    assert_eq!(provider.fetches(), 3);
    assert_eq!(manager.status(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_three_rejections_produce_documented_sequence() {
    // Arrange
    let transport = MockTransport::new();
    transport.set_fallback(ConnectScript::Reject("bad credentials".into()));
    let provider = Arc::new(MockConfigProvider::default());
    let manager = manager(&transport, &provider, 3);
    let mut events = manager.status_events();

    // Act
    let _ = manager.connect().await;

    // Assert
    let events = drain(&mut events);
    let states: Vec<ConnectionState> = events.iter().map(|event| event.state).collect();
    assert_eq!(
        states,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Disconnected,
        ]
    );
    assert_eq!(events[0].reason, StatusReason::AttemptStarted { attempt: 1 });
    assert!(matches!(
        events[1].reason,
        StatusReason::RetryScheduled { attempt: 1, .. }
    ));
    assert_eq!(events[2].reason, StatusReason::AttemptStarted { attempt: 2 });
    assert!(matches!(
        events[3].reason,
        StatusReason::RetryScheduled { attempt: 2, .. }
    ));
    assert!(matches!(
        events[5].reason,
        StatusReason::RetriesExhausted {
            attempts: 3,
            error: BrokerError::ConnectRejected { .. }
        }
    ));
    assert!(events[5].is_terminal_failure());
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_connects_share_one_attempt() {
    // Arrange: the broker takes a while to answer
    let transport = MockTransport::with_script([ConnectScript::SucceedAfter(Duration::from_millis(
        300,
    ))]);
    let provider = Arc::new(MockConfigProvider::default());
    let manager = manager(&transport, &provider, 5);

    // Act
    let (first, second) = tokio::join!(manager.connect(), manager.connect());

    // Assert
    assert!(first.is_ok());
    assert!(second.is_ok());
    assert_eq!(transport.connect_attempts(), 1);
    assert_eq!(transport.sessions_created(), 1);
    assert_eq!(provider.fetches(), 1);
    assert_eq!(manager.status(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_connect_while_connected_is_noop() {
    let transport = MockTransport::new();
    let provider = Arc::new(MockConfigProvider::default());
    let manager = manager(&transport, &provider, 5);

    manager.connect().await.unwrap();
    manager.connect().await.unwrap();

    assert_eq!(transport.connect_attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_replays_each_topic_once() {
    // Arrange
    let transport = MockTransport::new();
    let provider = Arc::new(MockConfigProvider::default());
    let manager = manager(&transport, &provider, 5);
    manager.registry().insert("fleet/+/gps", noop_handler());
    manager.registry().insert("orders/new", noop_handler());
    let mut events = manager.status_events();

    manager.connect().await.unwrap();
    settle().await;
    assert_eq!(
        transport.subscribe_calls(),
        vec!["fleet/+/gps", "orders/new"]
    );
    transport.clear_history();

    // Act: the broker drops the session
    assert!(transport.drop_connection("network reset"));
    wait_for(&mut events, |event| {
        matches!(event.reason, StatusReason::RetryScheduled { .. })
    })
    .await;
    wait_for(&mut events, |event| event.state == ConnectionState::Connected).await;
    settle().await;

    // Assert
    assert_eq!(
        transport.subscribe_calls(),
        vec!["fleet/+/gps", "orders/new"]
    );
    assert_eq!(transport.connect_attempts(), 2);
    assert!(transport.disposals() >= 1);
    assert_eq!(manager.stats().drops, 1);
}

#[tokio::test(start_paused = true)]
async fn test_drop_error_is_transport_dropped() {
    let transport = MockTransport::new();
    let provider = Arc::new(MockConfigProvider::default());
    let manager = manager(&transport, &provider, 5);
    let mut events = manager.status_events();

    manager.connect().await.unwrap();
    transport.drop_connection("keep-alive timeout");

    let event = wait_for(&mut events, |event| {
        matches!(event.reason, StatusReason::RetryScheduled { .. })
    })
    .await;
    match event.reason {
        StatusReason::RetryScheduled {
            attempt,
            delay,
            error,
        } => {
            assert_eq!(attempt, 1);
            assert_eq!(delay, Duration::from_millis(200));
            assert!(matches!(error, BrokerError::TransportDropped { .. }));
        }
        other => panic!("unexpected reason {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_pending_retry() {
    // Arrange: first attempt fails, anything after would succeed
    let transport = MockTransport::with_script([ConnectScript::Reject("denied".into())]);
    let provider = Arc::new(MockConfigProvider::default());
    let manager = manager(&transport, &provider, 5);
    let mut events = manager.status_events();

    let connecting = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.connect().await })
    };
    wait_for(&mut events, |event| {
        matches!(event.reason, StatusReason::RetryScheduled { .. })
    })
    .await;

    // Act
    manager.disconnect();
    tokio::time::sleep(Duration::from_secs(60)).await;

    // Assert
    assert_eq!(connecting.await.unwrap(), Err(BrokerError::Cancelled));
    assert_eq!(transport.connect_attempts(), 1);
    assert_eq!(manager.status(), ConnectionState::Disconnected);
    let last = drain(&mut events).pop().unwrap();
    assert_eq!(last.reason, StatusReason::DisconnectRequested);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_disposes_live_session() {
    let transport = MockTransport::new();
    let provider = Arc::new(MockConfigProvider::default());
    let manager = manager(&transport, &provider, 5);
    manager.registry().insert("a", noop_handler());

    manager.connect().await.unwrap();
    assert!(manager.live_session().is_some());

    manager.disconnect();
    manager.disconnect();

    assert_eq!(manager.status(), ConnectionState::Disconnected);
    assert!(manager.live_session().is_none());
    assert_eq!(transport.disposals(), 1);
    assert!(!transport.has_live_session());
    // Bindings survive a manager-level disconnect
    assert!(manager.registry().contains("a"));
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_when_idle_emits_nothing() {
    let transport = MockTransport::new();
    let provider = Arc::new(MockConfigProvider::default());
    let manager = manager(&transport, &provider, 5);
    let mut events = manager.status_events();

    manager.disconnect();

    assert!(drain(&mut events).is_empty());
    assert_eq!(manager.status(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_missing_credentials_fail_without_retry() {
    // Arrange
    let transport = MockTransport::new();
    let provider = Arc::new(MockConfigProvider::missing(&["hostUrl", "password"]));
    let manager = manager(&transport, &provider, 5);
    let mut events = manager.status_events();

    // Act
    let result = manager.connect().await;
    tokio::time::sleep(Duration::from_secs(60)).await;

    // Assert
    match result {
        Err(BrokerError::Configuration { message }) => {
            assert!(message.contains("hostUrl"));
            assert!(message.contains("password"));
        }
        other => panic!("expected Configuration error, got {other:?}"),
    }
    assert_eq!(provider.fetches(), 1);
    assert_eq!(transport.sessions_created(), 0);

    let events = drain(&mut events);
    assert_eq!(events.len(), 2);
    assert!(matches!(
        events[1],
        StatusEvent {
            state: ConnectionState::Disconnected,
            reason: StatusReason::Failed(BrokerError::Configuration { .. }),
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_invalid_host_is_configuration_error() {
    struct BadHostTransport;

    impl brokerlink::transport::Transport for BadHostTransport {
        fn create_session(
            &self,
            _credentials: &BrokerCredentials,
            _events: tokio::sync::mpsc::UnboundedSender<brokerlink::transport::SessionEvent>,
        ) -> Result<Arc<dyn brokerlink::transport::Session>, brokerlink::transport::TransportError>
        {
            Err(brokerlink::transport::TransportError::InvalidOptions(
                "unsupported scheme".into(),
            ))
        }
    }

    let provider = Arc::new(MockConfigProvider::default());
    let config = test_helpers::test_config(5);
    let manager = brokerlink::session::ConnectionManager::new(
        Arc::new(BadHostTransport),
        provider.clone(),
        Arc::new(brokerlink::session::SubscriptionRegistry::new()),
        config.retry.policy(),
        config.client.connect_timeout(),
    );

    let result = manager.connect().await;

    assert!(matches!(result, Err(BrokerError::Configuration { .. })));
    assert_eq!(provider.fetches(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_hanging_attempt_times_out_and_retries() {
    // Arrange
    let transport = MockTransport::with_script([ConnectScript::Hang]);
    let provider = Arc::new(MockConfigProvider::default());
    let manager = manager(&transport, &provider, 5);
    let mut events = manager.status_events();

    // Act
    let result = manager.connect().await;

    // Assert
    assert!(result.is_ok());
    let retry = drain(&mut events)
        .into_iter()
        .find(|event| matches!(event.reason, StatusReason::RetryScheduled { .. }))
        .unwrap();
    assert!(matches!(
        retry.reason,
        StatusReason::RetryScheduled {
            error: BrokerError::ConnectTimeout { timeout_ms },
            ..
        } if timeout_ms == CONNECT_TIMEOUT_MS
    ));
    assert_eq!(transport.connect_attempts(), 2);
    assert_eq!(transport.disposals(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_success_resets_retry_counter() {
    // Arrange: two failures, success, then a drop
    let transport = MockTransport::with_script([
        ConnectScript::Fail("unreachable".into()),
        ConnectScript::Fail("unreachable".into()),
    ]);
    let provider = Arc::new(MockConfigProvider::default());
    let manager = manager(&transport, &provider, 3);
    let mut events = manager.status_events();

    manager.connect().await.unwrap();
    drain(&mut events);

    // Act
    transport.drop_connection("reset");
    let retry = wait_for(&mut events, |event| {
        matches!(event.reason, StatusReason::RetryScheduled { .. })
    })
    .await;

    // Assert: a fresh budget, not the third strike
    assert!(matches!(
        retry.reason,
        StatusReason::RetryScheduled { attempt: 1, .. }
    ));
    wait_for(&mut events, |event| event.state == ConnectionState::Connected).await;
}

#[tokio::test(start_paused = true)]
async fn test_connect_after_exhaustion_starts_new_cycle() {
    let transport = MockTransport::with_script([
        ConnectScript::Reject("denied".into()),
        ConnectScript::Reject("denied".into()),
    ]);
    let provider = Arc::new(MockConfigProvider::default());
    let manager = manager(&transport, &provider, 2);

    let first = manager.connect().await;
    let second = manager.connect().await;

    assert!(matches!(
        first,
        Err(BrokerError::RetriesExhausted { attempts: 2, .. })
    ));
    assert!(second.is_ok());
    assert_eq!(transport.connect_attempts(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_credentials_fetched_for_every_attempt() {
    // Arrange
    let transport = MockTransport::new();
    let provider = Arc::new(MockConfigProvider::default());
    let manager = manager(&transport, &provider, 5);
    let mut events = manager.status_events();
    manager.connect().await.unwrap();

    // Act: rotate, then force a reconnect
    let rotated = BrokerCredentials {
        username: "rotated-user".to_string(),
        ..MockTransport::credentials()
    };
    provider.rotate(rotated.clone());
    transport.drop_connection("rotation");
    wait_for(&mut events, |event| {
        matches!(event.reason, StatusReason::RetryScheduled { .. })
    })
    .await;
    wait_for(&mut events, |event| event.state == ConnectionState::Connected).await;

    // Assert
    assert_eq!(provider.fetches(), 2);
    assert_eq!(transport.seen_credentials().last(), Some(&rotated));
}

#[tokio::test(start_paused = true)]
async fn test_inbound_messages_reach_handlers() {
    let transport = MockTransport::new();
    let provider = Arc::new(MockConfigProvider::default());
    let manager = manager(&transport, &provider, 5);
    let received = Arc::new(Mutex::new(Vec::new()));
    {
        let received = received.clone();
        manager.registry().insert(
            "fleet/#",
            Arc::new(move |message: Message| {
                received
                    .lock()
                    .unwrap()
                    .push(message.payload_str().unwrap_or_default().to_string());
            }),
        );
    }

    manager.connect().await.unwrap();
    transport.deliver("fleet/truck-7/gps", "52.1,4.3");
    transport.deliver("weather/now", "sunny");
    settle().await;

    assert_eq!(*received.lock().unwrap(), vec!["52.1,4.3".to_string()]);
    let stats = manager.stats();
    assert_eq!(stats.messages_delivered, 2);
    assert_eq!(stats.successful_connections, 1);
    assert!(stats.is_healthy);
}

#[tokio::test(start_paused = true)]
async fn test_listeners_observe_transitions_in_order() {
    // Arrange
    let transport = MockTransport::with_script([ConnectScript::Reject("denied".into())]);
    let provider = Arc::new(MockConfigProvider::default());
    let manager = manager(&transport, &provider, 5);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let subscription = {
        let seen = seen.clone();
        manager.on_status_change(Arc::new(move |event: &StatusEvent| {
            seen.lock().unwrap().push(event.state);
        }))
    };

    // Act
    manager.connect().await.unwrap();
    subscription.cancel();
    manager.disconnect();

    // Assert: nothing recorded after cancel
    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Connected,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_no_replay_after_disconnect_during_connected_notification() {
    // Arrange: "a" is already registered with the broker
    let transport = MockTransport::new();
    let provider = Arc::new(MockConfigProvider::default());
    let manager = manager(&transport, &provider, 5);
    manager.registry().insert("a", noop_handler());
    manager.registry().set_registered("a", true);
    {
        let handle = manager.clone();
        manager.on_status_change(Arc::new(move |event: &StatusEvent| {
            if event.reason == StatusReason::Established {
                handle.disconnect();
            }
        }));
    }

    // Act
    manager.connect().await.unwrap();
    settle().await;

    // Assert: the abandoned session was never replayed onto
    assert_eq!(manager.status(), ConnectionState::Disconnected);
    assert_eq!(transport.disposals(), 1);
    assert!(transport.subscribe_calls().is_empty());
    assert!(manager.registry().is_registered("a"));
}
