//! Event routing and telemetry dispatch
//!
//! Routing is pure. Decoded frames cross an mpsc channel to a dispatcher task
//! so a slow handler never stalls the event loop that keeps the connection
//! alive. When the dispatcher falls behind and the channel is full, new frames
//! are dropped rather than waited on.

use crate::error::BridgeError;
use crate::protocol::{decode_telemetry, TelemetryFrame};
use rumqttc::{Event, Outgoing, Packet, SubscribeReasonCode};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Callback invoked for every decoded telemetry frame
pub type TelemetryHandler = Arc<dyn Fn(&TelemetryFrame) + Send + Sync>;

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to appropriate handler
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                },
                Packet::Disconnect => EventRoute::Disconnected,
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    accepted: Self::validate_subscription_success(&suback.return_codes).is_ok(),
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(Outgoing::Disconnect) => EventRoute::DisconnectSent,
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Only frames on our own telemetry topics are decoded
    pub fn should_process_message(topic: &str, subscriptions: &[String]) -> bool {
        let wanted = subscriptions.iter().any(|s| s == topic);
        if !wanted {
            debug!(topic, "Ignoring message on unexpected topic");
        }
        wanted
    }

    /// Decode a payload and tag it with its topic
    pub fn decode_frame(topic: &str, payload: &[u8]) -> Result<TelemetryFrame, BridgeError> {
        Ok(decode_telemetry(payload)?.with_topic(topic))
    }

    pub fn validate_subscription_success(codes: &[SubscribeReasonCode]) -> Result<(), String> {
        if codes
            .iter()
            .any(|code| matches!(code, SubscribeReasonCode::Failure))
        {
            Err(format!("Subscription failed with return codes: {codes:?}"))
        } else {
            Ok(())
        }
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    ConnectionAcknowledged,
    MessageReceived { topic: String, payload: Vec<u8> },
    /// Broker sent DISCONNECT
    Disconnected,
    SubscriptionConfirmed { packet_id: u16, accepted: bool },
    /// PingResp and similar
    InfrastructureEvent(String),
    /// Our DISCONNECT was written; everything queued before it has gone out
    DisconnectSent,
    OutgoingEvent,
}

/// Registered telemetry handlers, shared with the dispatcher task
#[derive(Clone, Default)]
pub struct TelemetryHandlers {
    handlers: Arc<RwLock<Vec<TelemetryHandler>>>,
}

impl TelemetryHandlers {
    pub async fn register(&self, handler: TelemetryHandler) {
        self.handlers.write().await.push(handler);
    }

    pub async fn len(&self) -> usize {
        self.handlers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Invoke every handler in registration order
    pub async fn dispatch(&self, frame: &TelemetryFrame) {
        let handlers = self.handlers.read().await.clone();
        for handler in handlers {
            handler(frame);
        }
    }
}

/// Sending half used by the event loop supervisor
#[derive(Clone)]
pub struct MessageForwarder {
    sender: mpsc::Sender<TelemetryFrame>,
}

impl MessageForwarder {
    /// Decode and queue a received message without waiting
    ///
    /// Malformed frames, and frames arriving while the dispatcher queue is
    /// full, are logged and dropped.
    pub fn forward(&self, topic: &str, payload: &[u8]) {
        let frame = match MessageHandler::decode_frame(topic, payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(topic, error = %e, "Dropping malformed telemetry frame");
                return;
            }
        };

        match self.sender.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(topic, "Telemetry handlers falling behind, frame dropped");
            }
            Err(TrySendError::Closed(_)) => {
                warn!(topic, "Telemetry dispatcher gone, frame dropped");
            }
        }
    }
}

/// Start the dispatcher task
///
/// The task ends once every [`MessageForwarder`] clone has been dropped.
pub fn spawn_dispatcher(handlers: TelemetryHandlers, capacity: usize) -> (MessageForwarder, JoinHandle<()>) {
    let (sender, mut receiver) = mpsc::channel::<TelemetryFrame>(capacity);
    let handle = tokio::spawn(async move {
        while let Some(frame) = receiver.recv().await {
            handlers.dispatch(&frame).await;
        }
        debug!("Telemetry dispatcher stopped");
    });
    (MessageForwarder { sender }, handle)
}
