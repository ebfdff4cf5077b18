//! Broker session with supervised reconnection
//!
//! [`MqttBridge`] owns one MQTT 3.1.1 session over WebSocket. A supervisor
//! task polls the rumqttc event loop; when the connection drops it asks the
//! [`TokenProvider`] for a fresh grant, rebuilds the client with newly derived
//! parameters and swaps it in so publishers pick it up transparently.

use super::connection::{
    classify_connection_error, configure_mqtt_options, ConnectFailure, ConnectionParams,
    ConnectionState, FailureKind, MqttError, ReconnectConfig,
};
use super::health_monitor::{ConnectPhase, ConnectionEvent, HealthMonitor, ReconnectionDecision};
use super::message_handler::{
    spawn_dispatcher, EventRoute, MessageForwarder, MessageHandler, TelemetryHandlers,
};
use crate::config::{ConfigError, MqttSection};
use crate::error::{BridgeError, BridgeResult};
use crate::protocol::{command_topic, encode_command, telemetry_topics, validate_segment};
use crate::protocol::{Command, TelemetryFrame};
use crate::transport::{AccessGrant, TokenProvider};
use rumqttc::{AsyncClient, EventLoop, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn, Instrument};

/// Request channel capacity between client handles and the event loop
const CLIENT_CHANNEL_CAPACITY: usize = 10;

const TELEMETRY_BUFFER: usize = 64;

const EVENT_BUFFER: usize = 32;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// How long `close()` lets queued requests and the DISCONNECT reach the broker
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Introspection tries before `connect()` gives up on a transient error
const VERIFY_ATTEMPTS: u32 = 3;

/// Lifecycle notifications for callers
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    /// First CONNACK of this session
    Connected,
    /// Connection lost; attempt `attempt` starts after `delay`
    Reconnecting { attempt: u32, delay: Duration },
    /// Connection restored; commands sent while down must be re-issued
    Reconnected,
    /// Token or authorizer rejected; a new login is required
    SessionExpired { reason: String },
    /// Retrying stopped for a reason other than authentication
    Disconnected { reason: String },
    /// `close()` completed
    Closed,
}

/// What the bridge asks of its supervisor task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SupervisorSignal {
    Run,
    /// Keep polling until the queued DISCONNECT is written, then stop
    Drain,
    Stop,
}

/// MQTT bridge for one installation
pub struct MqttBridge {
    email: String,
    device_id: String,
    settings: MqttSection,
    reconnect_config: ReconnectConfig,
    provider: Arc<dyn TokenProvider>,
    client: Arc<RwLock<Option<AsyncClient>>>,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: Option<watch::Sender<SupervisorSignal>>,
    supervisor_handle: Option<JoinHandle<()>>,
    dispatcher_handle: Option<JoinHandle<()>>,
    handlers: TelemetryHandlers,
    events: broadcast::Sender<BridgeEvent>,
}

impl MqttBridge {
    pub fn new<E: Into<String>, D: Into<String>>(
        email: E,
        device_id: D,
        settings: MqttSection,
        provider: Arc<dyn TokenProvider>,
    ) -> BridgeResult<Self> {
        let email = email.into();
        let device_id = device_id.into();
        for (name, segment) in [("email", &email), ("device id", &device_id)] {
            validate_segment(segment).map_err(|e| {
                BridgeError::Config(ConfigError::InvalidConfig(format!(
                    "{name} unusable in topics: {e}"
                )))
            })?;
        }

        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        Ok(Self {
            email,
            device_id,
            reconnect_config: ReconnectConfig::from(&settings.reconnect),
            settings,
            provider,
            client: Arc::new(RwLock::new(None)),
            state_tx,
            state_rx,
            shutdown_tx: None,
            supervisor_handle: None,
            dispatcher_handle: None,
            handlers: TelemetryHandlers::default(),
            events,
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        HealthMonitor::can_publish(&self.state())
    }

    /// Receive lifecycle events from now on
    pub fn subscribe_events(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }

    /// Register a handler for decoded telemetry
    ///
    /// Handlers run one at a time, in registration order, on a dedicated task.
    pub async fn subscribe_telemetry<F>(&self, handler: F)
    where
        F: Fn(&TelemetryFrame) + Send + Sync + 'static,
    {
        self.handlers.register(Arc::new(handler)).await;
    }

    /// Open the broker session and wait for the first CONNACK
    #[instrument(skip(self), fields(device_id = %self.device_id))]
    pub async fn connect(&mut self) -> BridgeResult<()> {
        if self.supervisor_handle.is_some() {
            if self.is_connected() {
                return Ok(());
            }
            self.stop_tasks(SupervisorSignal::Stop).await;
        }

        self.transition(ConnectionState::Connecting);

        let result = self.start_session().await;
        if let Err(e) = &result {
            error!(error = %e, "Broker connection failed");
            self.stop_tasks(SupervisorSignal::Stop).await;
            if !matches!(self.state(), ConnectionState::Failed(_)) {
                self.transition(ConnectionState::Disconnected);
            }
        }
        result
    }

    async fn start_session(&mut self) -> BridgeResult<()> {
        let grant = self.provider.access_grant().await?;
        self.verify_with_retry(&grant).await?;

        let params = ConnectionParams::derive(&self.email, &grant, &self.settings);
        let options = configure_mqtt_options(&params)?;
        let (client, event_loop) = AsyncClient::new(options, CLIENT_CHANNEL_CAPACITY);
        *self.client.write().await = Some(client);

        info!(client_id = %params.client_id, broker = %params.broker_url, "Connecting to broker");

        let (shutdown_tx, shutdown_rx) = watch::channel(SupervisorSignal::Run);
        let (forwarder, dispatcher) = spawn_dispatcher(self.handlers.clone(), TELEMETRY_BUFFER);

        let supervisor = Supervisor {
            email: self.email.clone(),
            settings: self.settings.clone(),
            reconnect_config: self.reconnect_config.clone(),
            provider: self.provider.clone(),
            client: self.client.clone(),
            state_tx: self.state_tx.clone(),
            events: self.events.clone(),
            forwarder,
            subscriptions: telemetry_topics(&self.email, &self.device_id).to_vec(),
            phase: ConnectPhase::Initial,
            attempts: 0,
        };

        let state_rx = self.state_tx.subscribe();
        self.shutdown_tx = Some(shutdown_tx);
        self.dispatcher_handle = Some(dispatcher);
        let span = crate::mqtt_span!(device_id = %self.device_id);
        self.supervisor_handle = Some(tokio::spawn(
            supervisor.run(event_loop, shutdown_rx).instrument(span),
        ));

        let timeout = Duration::from_secs(self.settings.connect_timeout_secs);
        Self::wait_for_connection_confirmation(state_rx, timeout).await
    }

    async fn verify_with_retry(&self, grant: &AccessGrant) -> BridgeResult<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.provider.verify_grant(grant).await {
                Err(e) if e.is_transient() && attempt < VERIFY_ATTEMPTS => {
                    let delay = self.reconnect_config.calculate_backoff_delay(attempt);
                    warn!(attempt, ?delay, error = %e, "Token introspection failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    /// Wait until the state reaches Connected or a terminal state
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> BridgeResult<()> {
        let outcome = tokio::time::timeout(timeout, async {
            loop {
                let state = state_rx.borrow_and_update().clone();
                match state {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Failed(failure) => return Err(BridgeError::from(failure)),
                    ConnectionState::Disconnected => {
                        return Err(BridgeError::network("session closed while connecting"))
                    }
                    ConnectionState::Connecting | ConnectionState::Reconnecting(_) => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(BridgeError::network("state channel closed"));
                }
            }
        })
        .await;

        match outcome {
            Ok(result) => result,
            Err(_) => Err(BridgeError::network(format!(
                "no CONNACK within {}s",
                timeout.as_secs()
            ))),
        }
    }

    /// Encode and publish a command on the device's command topic
    ///
    /// A transient failure, or a publish attempted while reconnecting, is
    /// retried once after the session is back.
    #[instrument(skip(self), fields(zone = command.zone()))]
    pub async fn publish_command(&self, command: &Command) -> BridgeResult<()> {
        let payload = encode_command(command)?;
        let topic = command_topic(&self.device_id);

        match self.publish_once(&topic, &payload).await {
            Err(e) if self.is_retryable(&e) => {
                warn!(error = %e, "Publish failed, retrying once");
                self.wait_until_connected(Duration::from_secs(self.settings.connect_timeout_secs))
                    .await?;
                self.publish_once(&topic, &payload).await
            }
            other => other,
        }
    }

    fn is_retryable(&self, error: &BridgeError) -> bool {
        match error {
            BridgeError::NotConnected { .. } => matches!(
                self.state(),
                ConnectionState::Connecting | ConnectionState::Reconnecting(_)
            ),
            other => other.is_transient(),
        }
    }

    async fn publish_once(&self, topic: &str, payload: &str) -> BridgeResult<()> {
        self.check_connection_state()?;

        let client = self.client.read().await.clone().ok_or_else(|| {
            BridgeError::NotConnected {
                state: format!("{:?}", self.state()),
            }
        })?;

        client
            .publish(topic, QoS::AtMostOnce, false, payload.as_bytes().to_vec())
            .await
            .map_err(MqttError::PublishFailed)?;

        debug!(topic, payload, "Published command");
        Ok(())
    }

    fn check_connection_state(&self) -> BridgeResult<()> {
        let state = self.state();
        if HealthMonitor::can_publish(&state) {
            Ok(())
        } else {
            Err(BridgeError::NotConnected {
                state: format!("{state:?}"),
            })
        }
    }

    async fn wait_until_connected(&self, timeout: Duration) -> BridgeResult<()> {
        let mut state_rx = self.state_rx.clone();
        let outcome = tokio::time::timeout(timeout, async {
            loop {
                let state = state_rx.borrow_and_update().clone();
                match state {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Connecting | ConnectionState::Reconnecting(_) => {}
                    other => {
                        return Err(BridgeError::NotConnected {
                            state: format!("{other:?}"),
                        })
                    }
                }
                if state_rx.changed().await.is_err() {
                    return Err(BridgeError::NotConnected {
                        state: "closed".to_string(),
                    });
                }
            }
        })
        .await;

        outcome.unwrap_or_else(|_| {
            Err(BridgeError::NotConnected {
                state: format!("{:?}", self.state()),
            })
        })
    }

    /// Tear down the session and stop retrying
    ///
    /// When connected, commands already handed to the client are written
    /// ahead of a DISCONNECT before the transport is dropped.
    pub async fn close(&mut self) -> BridgeResult<()> {
        let signal = if self.request_disconnect().await {
            SupervisorSignal::Drain
        } else {
            SupervisorSignal::Stop
        };
        self.stop_tasks(signal).await;
        self.transition(HealthMonitor::determine_next_state(ConnectionEvent::Closed));
        let _ = self.events.send(BridgeEvent::Closed);
        info!("Broker bridge closed");
        Ok(())
    }

    /// Queue a DISCONNECT behind any pending publishes; true if queued
    async fn request_disconnect(&self) -> bool {
        if self.supervisor_handle.is_none() || !self.is_connected() {
            return false;
        }
        let Some(client) = self.client.read().await.clone() else {
            return false;
        };
        match tokio::time::timeout(DRAIN_TIMEOUT, client.disconnect()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!(error = %e, "Disconnect request not delivered");
                false
            }
            Err(_) => {
                warn!("Request queue full, closing without DISCONNECT");
                false
            }
        }
    }

    async fn stop_tasks(&mut self, signal: SupervisorSignal) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(signal);
            debug!(?signal, "Sent shutdown signal to supervisor");
        }
        self.client.write().await.take();

        // The dispatcher exits once the supervisor drops its forwarder
        for (name, handle) in [
            ("supervisor", self.supervisor_handle.take()),
            ("dispatcher", self.dispatcher_handle.take()),
        ] {
            let Some(mut handle) = handle else { continue };
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await {
                Ok(Ok(())) => debug!(task = name, "Task shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => warn!(task = name, error = %e, "Task ended with error"),
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!(task = name, "Task did not stop in time, aborting");
                    handle.abort();
                }
            }
        }
    }

    fn transition(&self, next: ConnectionState) {
        let previous = self.state_tx.send_replace(next.clone());
        if previous != next {
            HealthMonitor::log_state_transition(&previous, &next);
        }
    }
}

impl Drop for MqttBridge {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(SupervisorSignal::Stop);
        }
        for handle in [self.supervisor_handle.take(), self.dispatcher_handle.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
    }
}

/// What the supervisor does after an event
enum Flow {
    Continue,
    Lost(ConnectFailure),
    Finished,
}

/// State owned by the supervisor task
struct Supervisor {
    email: String,
    settings: MqttSection,
    reconnect_config: ReconnectConfig,
    provider: Arc<dyn TokenProvider>,
    client: Arc<RwLock<Option<AsyncClient>>>,
    state_tx: watch::Sender<ConnectionState>,
    events: broadcast::Sender<BridgeEvent>,
    forwarder: MessageForwarder,
    subscriptions: Vec<String>,
    phase: ConnectPhase,
    attempts: u32,
}

impl Supervisor {
    async fn run(
        mut self,
        mut event_loop: EventLoop,
        mut shutdown_rx: watch::Receiver<SupervisorSignal>,
    ) {
        debug!("Broker supervisor started");

        loop {
            let polled = tokio::select! {
                changed = shutdown_rx.changed() => {
                    let signal = *shutdown_rx.borrow();
                    if changed.is_err() || signal == SupervisorSignal::Stop {
                        info!("Shutdown signal received, stopping supervisor");
                        break;
                    }
                    if signal == SupervisorSignal::Drain {
                        info!("Close requested, flushing pending requests");
                        self.drain(&mut event_loop).await;
                        break;
                    }
                    continue;
                }
                polled = event_loop.poll() => polled,
            };

            let failure = match polled {
                Ok(event) => match self.process_event_route(MessageHandler::route_mqtt_event(&event)).await {
                    Flow::Continue => continue,
                    Flow::Finished => break,
                    Flow::Lost(failure) => failure,
                },
                Err(e) => classify_connection_error(&e),
            };

            warn!(kind = ?failure.kind, reason = %failure.message, "Broker connection interrupted");
            match self.recover(failure, &mut shutdown_rx).await {
                Some(new_event_loop) => event_loop = new_event_loop,
                None => break,
            }
        }

        debug!("Broker supervisor stopped");
    }

    /// Poll until our DISCONNECT has been written or the connection ends
    async fn drain(&self, event_loop: &mut EventLoop) {
        let flushed = tokio::time::timeout(DRAIN_TIMEOUT, async {
            loop {
                match event_loop.poll().await {
                    Ok(event) => match MessageHandler::route_mqtt_event(&event) {
                        EventRoute::DisconnectSent => return true,
                        EventRoute::MessageReceived { topic, payload }
                            if MessageHandler::should_process_message(&topic, &self.subscriptions) =>
                        {
                            self.forwarder.forward(&topic, &payload);
                        }
                        _ => {}
                    },
                    Err(e) => {
                        debug!(error = %e, "Connection ended while flushing");
                        return false;
                    }
                }
            }
        })
        .await;

        match flushed {
            Ok(true) => debug!("Pending requests flushed, DISCONNECT sent"),
            Ok(false) => {}
            Err(_) => warn!("Timed out flushing pending requests"),
        }
    }

    /// Handle one routed event
    async fn process_event_route(&mut self, route: EventRoute) -> Flow {
        match route {
            EventRoute::ConnectionAcknowledged => {
                self.on_connected().await;
                Flow::Continue
            }
            EventRoute::MessageReceived { topic, payload } => {
                if MessageHandler::should_process_message(&topic, &self.subscriptions) {
                    self.forwarder.forward(&topic, &payload);
                }
                Flow::Continue
            }
            EventRoute::Disconnected => Flow::Lost(ConnectFailure::new(
                FailureKind::Network,
                "broker sent DISCONNECT",
            )),
            EventRoute::SubscriptionConfirmed { packet_id, accepted } => {
                if accepted {
                    debug!(packet_id, "Subscription confirmed");
                } else {
                    warn!(packet_id, "Broker refused a telemetry subscription");
                }
                Flow::Continue
            }
            EventRoute::InfrastructureEvent(event) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event);
                Flow::Continue
            }
            EventRoute::DisconnectSent => {
                debug!("DISCONNECT written");
                Flow::Finished
            }
            EventRoute::OutgoingEvent => Flow::Continue,
        }
    }

    async fn on_connected(&mut self) {
        self.transition(HealthMonitor::determine_next_state(
            ConnectionEvent::ConnAckReceived,
        ));
        self.attempts = 0;
        self.resubscribe().await;

        let event = match self.phase {
            ConnectPhase::Initial => BridgeEvent::Connected,
            ConnectPhase::Established => BridgeEvent::Reconnected,
        };
        self.phase = ConnectPhase::Established;
        let _ = self.events.send(event);
    }

    async fn resubscribe(&self) {
        let Some(client) = self.client.read().await.clone() else {
            return;
        };
        for topic in &self.subscriptions {
            match client.subscribe(topic.as_str(), QoS::AtMostOnce).await {
                Ok(()) => debug!(topic = %topic, "Subscribed"),
                Err(e) => error!(topic = %topic, error = %MqttError::SubscriptionFailed(e), "Subscribe failed"),
            }
        }
    }

    /// Back off and reconnect until a new event loop is ready or retrying stops
    async fn recover(
        &mut self,
        mut failure: ConnectFailure,
        shutdown_rx: &mut watch::Receiver<SupervisorSignal>,
    ) -> Option<EventLoop> {
        loop {
            let decision = HealthMonitor::should_attempt_reconnection(
                self.attempts,
                &failure,
                self.phase,
                &self.reconnect_config,
                *shutdown_rx.borrow() != SupervisorSignal::Run,
            );

            match decision {
                ReconnectionDecision::Proceed { attempt, delay } => {
                    self.attempts = attempt;
                    self.transition(HealthMonitor::determine_next_state(
                        ConnectionEvent::ReconnectionStarted(attempt),
                    ));
                    let _ = self.events.send(BridgeEvent::Reconnecting { attempt, delay });

                    let max_display = self
                        .reconnect_config
                        .max_attempts
                        .map_or("∞".to_string(), |max| max.to_string());
                    info!("Attempting reconnection {}/{} after {:?}", attempt, max_display, delay);

                    if !interruptible_sleep(shutdown_rx, delay).await {
                        return None;
                    }

                    match self.open_connection().await {
                        Ok(event_loop) => return Some(event_loop),
                        Err(next) => {
                            warn!(kind = ?next.kind, reason = %next.message, "Reconnection attempt failed");
                            failure = next;
                        }
                    }
                }
                ReconnectionDecision::AbortShutdownRequested => {
                    info!("Shutdown requested, stopping reconnection");
                    return None;
                }
                ReconnectionDecision::AbortMaxAttemptsExceeded => {
                    let reason = format!(
                        "gave up after {} attempts: {}",
                        self.attempts, failure.message
                    );
                    self.fail(ConnectFailure::new(failure.kind, reason));
                    return None;
                }
                ReconnectionDecision::AbortFatal(fatal) => {
                    self.fail(fatal);
                    return None;
                }
            }
        }
    }

    /// Derive fresh parameters and swap in a new client
    async fn open_connection(&self) -> Result<EventLoop, ConnectFailure> {
        let grant = self
            .provider
            .access_grant()
            .await
            .map_err(|e| ConnectFailure::from_token_error(&e))?;

        let params = ConnectionParams::derive(&self.email, &grant, &self.settings);
        let options = configure_mqtt_options(&params)
            .map_err(|e| ConnectFailure::new(FailureKind::TransportRejected, e.to_string()))?;

        let (client, event_loop) = AsyncClient::new(options, CLIENT_CHANNEL_CAPACITY);
        *self.client.write().await = Some(client);
        debug!(client_id = %params.client_id, "Created new connection for reconnection attempt");
        Ok(event_loop)
    }

    fn fail(&self, failure: ConnectFailure) {
        let event = if failure.kind.requires_reauthentication() {
            BridgeEvent::SessionExpired {
                reason: failure.message.clone(),
            }
        } else {
            BridgeEvent::Disconnected {
                reason: failure.message.clone(),
            }
        };
        self.transition(HealthMonitor::determine_next_state(
            ConnectionEvent::PermanentFailure(failure),
        ));
        let _ = self.events.send(event);
    }

    fn transition(&self, next: ConnectionState) {
        let previous = self.state_tx.send_replace(next.clone());
        if previous != next {
            HealthMonitor::log_state_transition(&previous, &next);
        }
    }
}

/// Sleep unless shutdown is requested first; false means stop
async fn interruptible_sleep(
    shutdown_rx: &mut watch::Receiver<SupervisorSignal>,
    delay: Duration,
) -> bool {
    tokio::select! {
        changed = shutdown_rx.changed() => {
            if changed.is_err() || *shutdown_rx.borrow() != SupervisorSignal::Run {
                info!("Shutdown signal received during reconnection delay, stopping");
                return false;
            }
            true
        }
        _ = tokio::time::sleep(delay) => true,
    }
}
