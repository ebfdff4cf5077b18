//! MQTT-over-WebSocket bridge to the Nea Smart broker
//!
//! The module separates pure functions from I/O so the retry policy and
//! event routing can be tested without a broker.
//!
//! # Architecture
//!
//! - [`connection`] - Connection parameters, failure classification, backoff
//! - [`message_handler`] - Event routing and telemetry dispatch
//! - [`health_monitor`] - Reconnection decisions and state transitions
//! - [`client`] - The supervised session itself
//!
//! # Usage
//!
//! ```rust,no_run
//! use neasmart_bridge::config::MqttSection;
//! use neasmart_bridge::protocol::Command;
//! use neasmart_bridge::testing::MockTokenProvider;
//! use neasmart_bridge::transport::MqttBridge;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let provider = Arc::new(MockTokenProvider::new());
//! let mut bridge = MqttBridge::new("user@example.com", "dev-1", MqttSection::default(), provider)?;
//! bridge.subscribe_telemetry(|frame| println!("{:?}", frame.zone_update())).await;
//! bridge.connect().await?;
//! bridge.publish_command(&Command::SetTemperature { zone: 1, celsius: 21.5 }).await?;
//! bridge.close().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;

pub use client::{BridgeEvent, MqttBridge};
pub use connection::{
    classify_connection_error, ConnectFailure, ConnectionParams, ConnectionState, FailureKind,
    MqttError, ReconnectConfig, AUTHORIZER_NAME,
};
pub use health_monitor::{
    ConnectPhase, ConnectionEvent, HealthMonitor, ReconnectionDecision,
};
pub use message_handler::{EventRoute, MessageHandler, TelemetryHandler, TelemetryHandlers};
