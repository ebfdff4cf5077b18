//! Bridge tests against a live broker
//!
//! Each test runs its own in-process broker on a random port, so connect,
//! subscribe, publish, telemetry delivery and reconnection all go over a real
//! WebSocket connection.


use mqtt_test_broker::{Publication, TestBroker};
use neasmart_bridge::config::{MqttSection, ReconnectSection};
use neasmart_bridge::error::BridgeError;
use neasmart_bridge::fingerprint;
use neasmart_bridge::protocol::{Command, OperatingMode, TelemetryFrame};
use neasmart_bridge::testing::MockTokenProvider;
use neasmart_bridge::transport::mqtt::ConnectionState;
use neasmart_bridge::transport::{BridgeEvent, MqttBridge};
use rumqttc::ConnectReturnCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

const EMAIL: &str = "user@example.com";
const DEVICE: &str = "dev-1";
const WAIT: Duration = Duration::from_secs(5);

fn settings(broker: &TestBroker, initial_delay_ms: u64) -> MqttSection {
    MqttSection {
        broker_url: broker.url(),
        connect_timeout_secs: 5,
        reconnect: ReconnectSection {
            initial_delay_ms,
            max_delay_ms: initial_delay_ms * 4,
            multiplier: 2.0,
            max_attempts: Some(5),
        },
        ..MqttSection::default()
    }
}

fn bridge(broker: &TestBroker, provider: Arc<MockTokenProvider>) -> MqttBridge {
    MqttBridge::new(EMAIL, DEVICE, settings(broker, 10), provider).unwrap()
}

async fn next_event(events: &mut broadcast::Receiver<BridgeEvent>) -> BridgeEvent {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("no bridge event in time")
        .unwrap()
}

async fn wait_for_subscriptions(broker: &TestBroker, count: usize) {
    broker
        .wait_until(WAIT, "telemetry subscriptions", |b| {
            b.subscribe_requests().len() >= count
        })
        .await;
}

#[tokio::test]
async fn test_connect_reaches_connected_with_derived_credentials() {
    let broker = TestBroker::start().await;
    let provider = Arc::new(MockTokenProvider::with_grant("token-1", "sid-1"));
    let mut bridge = bridge(&broker, provider.clone());
    let mut events = bridge.subscribe_events();

    bridge.connect().await.unwrap();

    assert_eq!(next_event(&mut events).await, BridgeEvent::Connected);
    assert_eq!(bridge.state(), ConnectionState::Connected);
    assert!(bridge.is_connected());
    assert_eq!(provider.verify_calls(), 1);

    let connects = broker.connects();
    assert_eq!(connects.len(), 1);
    let connect = &connects[0];
    assert_eq!(connect.client_id, "app-sid-1");
    assert_eq!(
        connect.username.as_deref(),
        Some("user@example.com?x-amz-customauthorizer-name=app-front")
    );
    assert_eq!(connect.password.as_deref(), Some("token-1"));
    assert_eq!(connect.keep_alive, 60);
    assert!(connect.clean_session);

    assert_eq!(connect.handshake.path, "/mqtt");
    assert_eq!(connect.handshake.subprotocol.as_deref(), Some("mqtt"));
    assert_eq!(connect.handshake.origin.as_deref(), Some(fingerprint::ORIGIN));
    assert_eq!(
        connect.handshake.user_agent.as_deref(),
        Some(fingerprint::USER_AGENT)
    );

    wait_for_subscriptions(&broker, 2).await;
    let mut topics = broker.subscribe_requests();
    topics.sort();
    assert_eq!(topics, vec!["client/dev-1/realtime", "client/user@example.com"]);

    bridge.close().await.unwrap();
}

#[tokio::test]
async fn test_command_arrives_byte_exact_on_device_topic() {
    let broker = TestBroker::start().await;
    let mut bridge = bridge(&broker, Arc::new(MockTokenProvider::new()));
    bridge.connect().await.unwrap();

    bridge
        .publish_command(&Command::SetTemperature {
            zone: 3,
            celsius: 22.0,
        })
        .await
        .unwrap();

    broker
        .wait_until(WAIT, "command publication", |b| !b.publications().is_empty())
        .await;
    assert_eq!(
        broker.publications(),
        vec![Publication {
            topic: "client/dev-1".to_string(),
            payload: br#"{"11":"REQ_TH","12":{"2":716,"15":0},"35":"0","36":3}"#.to_vec(),
        }]
    );

    bridge.close().await.unwrap();
}

#[tokio::test]
async fn test_close_flushes_queued_command_before_disconnect() {
    let broker = TestBroker::start().await;
    let mut bridge = bridge(&broker, Arc::new(MockTokenProvider::new()));
    let mut events = bridge.subscribe_events();
    bridge.connect().await.unwrap();
    assert_eq!(next_event(&mut events).await, BridgeEvent::Connected);

    bridge
        .publish_command(&Command::SetOperatingMode {
            zone: 2,
            mode: OperatingMode::Off,
        })
        .await
        .unwrap();
    bridge.close().await.unwrap();

    // Nothing is awaited between publish and close: the broker must still
    // see the command, followed by a clean DISCONNECT
    broker
        .wait_until(WAIT, "DISCONNECT", |b| b.disconnects() == 1)
        .await;
    assert_eq!(
        broker.publications(),
        vec![Publication {
            topic: "client/dev-1".to_string(),
            payload: br#"{"11":"REQ_TH","12":{"15":2},"35":"0","36":2}"#.to_vec(),
        }]
    );
    assert_eq!(next_event(&mut events).await, BridgeEvent::Closed);
    assert_eq!(bridge.state(), ConnectionState::Disconnected);

    // No reconnection follows a requested close
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(broker.connects().len(), 1);
}

#[tokio::test]
async fn test_injected_frame_reaches_telemetry_handler() {
    let broker = TestBroker::start().await;
    let mut bridge = bridge(&broker, Arc::new(MockTokenProvider::new()));

    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<TelemetryFrame>();
    bridge
        .subscribe_telemetry(move |frame: &TelemetryFrame| {
            let _ = frames_tx.send(frame.clone());
        })
        .await;

    bridge.connect().await.unwrap();
    wait_for_subscriptions(&broker, 2).await;

    // Malformed frames are dropped without disturbing the session
    assert_eq!(broker.inject("client/dev-1/realtime", b"{not json"), 1);
    assert_eq!(
        broker.inject(
            "client/dev-1/realtime",
            br#"{"11":"REQ_TH","12":{"2":716,"15":1},"35":"0","36":3}"#,
        ),
        1
    );

    let frame = tokio::time::timeout(WAIT, frames_rx.recv())
        .await
        .expect("no telemetry in time")
        .unwrap();
    assert_eq!(frame.topic.as_deref(), Some("client/dev-1/realtime"));
    let update = frame.zone_update().unwrap();
    assert_eq!(update.zone, 3);
    assert_eq!(update.target_temperature, Some(22.0));
    assert_eq!(update.operating_mode, Some(OperatingMode::Absence));

    assert!(frames_rx.try_recv().is_err());
    assert!(bridge.is_connected());

    bridge.close().await.unwrap();
}

#[tokio::test]
async fn test_dropped_connection_yields_reconnected_with_fresh_grant() {
    let broker = TestBroker::start().await;
    let provider = Arc::new(MockTokenProvider::with_grant("token-1", "sid-1"));
    let mut bridge = bridge(&broker, provider.clone());
    let mut events = bridge.subscribe_events();

    bridge.connect().await.unwrap();
    assert_eq!(next_event(&mut events).await, BridgeEvent::Connected);
    wait_for_subscriptions(&broker, 2).await;

    provider.rotate("token-2", "sid-2");
    broker.drop_connections();

    assert!(matches!(
        next_event(&mut events).await,
        BridgeEvent::Reconnecting { attempt: 1, .. }
    ));
    assert_eq!(next_event(&mut events).await, BridgeEvent::Reconnected);
    assert_eq!(bridge.state(), ConnectionState::Connected);

    let connects = broker.connects();
    assert_eq!(connects.len(), 2);
    assert_eq!(connects[1].client_id, "app-sid-2");
    assert_eq!(connects[1].password.as_deref(), Some("token-2"));
    // Introspection only guards the first connection
    assert_eq!(provider.verify_calls(), 1);

    wait_for_subscriptions(&broker, 4).await;
    bridge
        .publish_command(&Command::SetRingLight {
            zone: 1,
            enabled: true,
        })
        .await
        .unwrap();
    broker
        .wait_until(WAIT, "publication after reconnect", |b| {
            !b.publications().is_empty()
        })
        .await;

    bridge.close().await.unwrap();
}

#[tokio::test]
async fn test_publish_while_reconnecting_is_retried_once_connected() {
    let broker = TestBroker::start().await;
    let mut bridge = MqttBridge::new(
        EMAIL,
        DEVICE,
        settings(&broker, 300),
        Arc::new(MockTokenProvider::new()),
    )
    .unwrap();
    let mut events = bridge.subscribe_events();

    bridge.connect().await.unwrap();
    assert_eq!(next_event(&mut events).await, BridgeEvent::Connected);

    broker.drop_connections();
    assert!(matches!(
        next_event(&mut events).await,
        BridgeEvent::Reconnecting { .. }
    ));
    assert!(!bridge.is_connected());

    bridge
        .publish_command(&Command::SetTemperature {
            zone: 1,
            celsius: 21.5,
        })
        .await
        .unwrap();

    broker
        .wait_until(WAIT, "retried publication", |b| !b.publications().is_empty())
        .await;
    assert_eq!(broker.connects().len(), 2);
    assert_eq!(
        broker.publications()[0].payload,
        br#"{"11":"REQ_TH","12":{"2":707,"15":0},"35":"0","36":1}"#.to_vec()
    );

    bridge.close().await.unwrap();
}

#[tokio::test]
async fn test_authorizer_refusal_is_not_retried() {
    let broker = TestBroker::start().await;
    broker.refuse_next_connect(ConnectReturnCode::NotAuthorized);
    let provider = Arc::new(MockTokenProvider::new());
    let mut bridge = bridge(&broker, provider.clone());
    let mut events = bridge.subscribe_events();

    let result = bridge.connect().await;
    assert!(matches!(result, Err(BridgeError::AuthorizerRejected { .. })));
    assert!(matches!(
        next_event(&mut events).await,
        BridgeEvent::SessionExpired { .. }
    ));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(broker.connects().len(), 1);
    assert_eq!(provider.grant_calls(), 1);
}
