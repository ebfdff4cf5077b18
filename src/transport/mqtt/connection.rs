//! Pure connection parameter derivation and error classification
//!
//! Nothing in this module touches the network. Connection parameters are a
//! function of the account email, the current access grant and the MQTT
//! section of the configuration.

use crate::config::{MqttSection, ReconnectSection};
use crate::error::BridgeError;
use crate::fingerprint;
use crate::transport::AccessGrant;
use rumqttc::{ConnectReturnCode, ConnectionError, MqttOptions, Transport};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Custom authorizer the broker's edge routes usernames to
pub const AUTHORIZER_NAME: &str = "app-front";

const MAX_PACKET_SIZE: usize = 256 * 1024;

/// Connection state of the bridge
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Not started, or closed by the caller
    Disconnected,
    /// First connection attempt in progress
    Connecting,
    /// CONNACK received, subscriptions issued
    Connected,
    /// Connection lost; the value is the attempt about to run
    Reconnecting(u32),
    /// Retrying stopped
    Failed(ConnectFailure),
}

/// Why a connection attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// CONNACK refused the credentials
    AuthorizerRejected,
    /// WebSocket upgrade answered with 401/403
    TransportRejected,
    /// No valid token could be obtained
    SessionExpired,
    /// Anything else at the socket or protocol level
    Network,
}

impl FailureKind {
    /// Failures that require a new login rather than another attempt
    pub fn requires_reauthentication(self) -> bool {
        matches!(self, Self::AuthorizerRejected | Self::SessionExpired)
    }
}

/// Classified connection failure
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ConnectFailure {
    pub fn new<S: Into<String>>(kind: FailureKind, message: S) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Classify an error returned while obtaining a token
    pub fn from_token_error(error: &BridgeError) -> Self {
        let kind = if error.is_transient() {
            FailureKind::Network
        } else {
            FailureKind::SessionExpired
        };
        Self::new(kind, error.to_string())
    }
}

impl fmt::Display for ConnectFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl From<ConnectFailure> for BridgeError {
    fn from(failure: ConnectFailure) -> Self {
        match failure.kind {
            FailureKind::AuthorizerRejected => BridgeError::authorizer_rejected(failure.message),
            FailureKind::TransportRejected => BridgeError::transport_rejected(failure.message),
            FailureKind::SessionExpired => BridgeError::session_expired(failure.message),
            FailureKind::Network => BridgeError::network(failure.message),
        }
    }
}

/// Sort an event loop error into the failure taxonomy
pub fn classify_connection_error(error: &ConnectionError) -> ConnectFailure {
    match error {
        ConnectionError::ConnectionRefused(code) => match code {
            ConnectReturnCode::BadUserNamePassword
            | ConnectReturnCode::NotAuthorized
            | ConnectReturnCode::BadClientId => ConnectFailure::new(
                FailureKind::AuthorizerRejected,
                format!("broker refused connection: {code:?}"),
            ),
            other => ConnectFailure::new(
                FailureKind::Network,
                format!("broker refused connection: {other:?}"),
            ),
        },
        other => {
            let message = other.to_string();
            if is_http_rejection(&message) {
                ConnectFailure::new(FailureKind::TransportRejected, message)
            } else {
                ConnectFailure::new(FailureKind::Network, message)
            }
        }
    }
}

/// WebSocket handshake errors surface the HTTP status only in their text
pub fn is_http_rejection(message: &str) -> bool {
    message.contains("HTTP error: 401") || message.contains("HTTP error: 403")
}

/// Reconnection backoff
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// None retries forever
    pub max_attempts: Option<u32>,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::from(&ReconnectSection::default())
    }
}

impl From<&ReconnectSection> for ReconnectConfig {
    fn from(section: &ReconnectSection) -> Self {
        Self {
            max_attempts: section.max_attempts,
            initial_delay: Duration::from_millis(section.initial_delay_ms),
            max_delay: Duration::from_millis(section.max_delay_ms),
            multiplier: section.multiplier,
        }
    }
}

impl ReconnectConfig {
    /// Delay before the given 1-based attempt, exponential up to `max_delay`
    pub fn calculate_backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let scaled = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = scaled.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Everything needed to open one broker session
#[derive(Clone, PartialEq)]
pub struct ConnectionParams {
    pub broker_url: String,
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub keep_alive: Duration,
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("broker_url", &self.broker_url)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &"***")
            .field("keep_alive", &self.keep_alive)
            .finish()
    }
}

impl ConnectionParams {
    /// Derive parameters from the account and a fresh grant
    pub fn derive(email: &str, grant: &AccessGrant, settings: &MqttSection) -> Self {
        Self {
            broker_url: settings.broker_url.clone(),
            client_id: format!("app-{}", grant.sid),
            username: format!("{email}?x-amz-customauthorizer-name={AUTHORIZER_NAME}"),
            password: grant.access_token.clone(),
            keep_alive: Duration::from_secs(settings.keep_alive_secs),
        }
    }
}

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Publishing failed")]
    PublishFailed(#[source] rumqttc::ClientError),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] rumqttc::ClientError),
}

impl From<MqttError> for BridgeError {
    fn from(error: MqttError) -> Self {
        match error {
            MqttError::InvalidBrokerUrl(url) => BridgeError::Config(
                crate::config::ConfigError::InvalidConfig(format!("invalid broker URL '{url}'")),
            ),
            MqttError::PublishFailed(e) => BridgeError::network(format!("publish failed: {e}")),
            MqttError::SubscriptionFailed(e) => {
                BridgeError::network(format!("subscribe failed: {e}"))
            }
        }
    }
}

/// Build MQTT 3.1.1 options for a WebSocket broker
///
/// The fingerprint headers are attached to the upgrade request; the broker
/// edge rejects upgrades that lack them.
pub fn configure_mqtt_options(params: &ConnectionParams) -> Result<MqttOptions, MqttError> {
    let url = Url::parse(&params.broker_url)
        .map_err(|_| MqttError::InvalidBrokerUrl(params.broker_url.clone()))?;

    let transport = match url.scheme() {
        "wss" => Transport::wss_with_default_config(),
        "ws" => Transport::Ws,
        _ => return Err(MqttError::InvalidBrokerUrl(params.broker_url.clone())),
    };
    let port = url
        .port_or_known_default()
        .ok_or_else(|| MqttError::InvalidBrokerUrl(params.broker_url.clone()))?;

    // WebSocket transports take the full URL as the host
    let mut options = MqttOptions::new(params.client_id.clone(), params.broker_url.clone(), port);
    options.set_transport(transport);
    options.set_credentials(params.username.clone(), params.password.clone());
    options.set_keep_alive(params.keep_alive);
    options.set_clean_session(true);
    options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
    options.set_request_modifier(|mut request: http::Request<()>| async move {
        request
            .headers_mut()
            .extend(fingerprint::websocket_headers());
        request
    });

    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grant() -> AccessGrant {
        AccessGrant {
            access_token: "token-abc".to_string(),
            sid: "sid-42".to_string(),
        }
    }

    #[test]
    fn test_params_derived_from_grant() {
        let params = ConnectionParams::derive("user@example.com", &grant(), &MqttSection::default());
        assert_eq!(params.client_id, "app-sid-42");
        assert_eq!(
            params.username,
            "user@example.com?x-amz-customauthorizer-name=app-front"
        );
        assert_eq!(params.password, "token-abc");
        assert_eq!(params.keep_alive, Duration::from_secs(60));
        assert!(!format!("{params:?}").contains("token-abc"));
    }

    #[test]
    fn test_configure_options_for_wss() {
        let params = ConnectionParams::derive("user@example.com", &grant(), &MqttSection::default());
        let options = configure_mqtt_options(&params).unwrap();
        assert_eq!(options.client_id(), "app-sid-42");
        assert_eq!(options.keep_alive(), Duration::from_secs(60));
        assert!(options.clean_session());
        assert_eq!(
            options.broker_address(),
            ("wss://mqtt.nea2aws.aws.rehau.cloud/mqtt".to_string(), 443)
        );
    }

    #[test]
    fn test_non_websocket_url_rejected() {
        let settings = MqttSection {
            broker_url: "mqtt://localhost:1883".to_string(),
            ..MqttSection::default()
        };
        let params = ConnectionParams::derive("a@b.c", &grant(), &settings);
        assert!(matches!(
            configure_mqtt_options(&params),
            Err(MqttError::InvalidBrokerUrl(_))
        ));
    }

    #[test]
    fn test_refused_credentials_are_authorizer_rejections() {
        for code in [
            ConnectReturnCode::BadUserNamePassword,
            ConnectReturnCode::NotAuthorized,
            ConnectReturnCode::BadClientId,
        ] {
            let failure = classify_connection_error(&ConnectionError::ConnectionRefused(code));
            assert_eq!(failure.kind, FailureKind::AuthorizerRejected);
        }

        let failure = classify_connection_error(&ConnectionError::ConnectionRefused(
            ConnectReturnCode::ServiceUnavailable,
        ));
        assert_eq!(failure.kind, FailureKind::Network);
    }

    #[test]
    fn test_io_errors_are_network_failures() {
        let error = ConnectionError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert_eq!(classify_connection_error(&error).kind, FailureKind::Network);
    }

    #[test]
    fn test_http_rejection_detection() {
        assert!(is_http_rejection("Websocket: HTTP error: 403 Forbidden"));
        assert!(is_http_rejection("Websocket: HTTP error: 401 Unauthorized"));
        assert!(!is_http_rejection("Websocket: HTTP error: 502 Bad Gateway"));
    }

    #[test]
    fn test_failure_maps_to_bridge_error() {
        let error: BridgeError =
            ConnectFailure::new(FailureKind::AuthorizerRejected, "NotAuthorized").into();
        assert!(matches!(error, BridgeError::AuthorizerRejected { .. }));

        let error: BridgeError = ConnectFailure::new(FailureKind::Network, "reset").into();
        assert!(error.is_transient());
    }

    #[test]
    fn test_backoff_grows_then_caps() {
        let config = ReconnectConfig::default();
        assert_eq!(config.calculate_backoff_delay(1), Duration::from_secs(1));
        assert_eq!(config.calculate_backoff_delay(2), Duration::from_secs(2));
        assert_eq!(config.calculate_backoff_delay(6), Duration::from_secs(32));
        assert_eq!(config.calculate_backoff_delay(7), Duration::from_secs(60));
        assert_eq!(config.calculate_backoff_delay(500), Duration::from_secs(60));
    }
}
