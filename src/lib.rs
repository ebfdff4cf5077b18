//! Nea Smart session and protocol bridge
//!
//! Authenticates a REHAU account through OAuth2 authorization code with PKCE
//! and an emailed one-time code, locates the account's heating installation,
//! and exchanges zone commands and telemetry with the vendor's MQTT broker
//! over a WebSocket.
//!
//! # Overview
//!
//! - [`auth`] - Login, MFA, token refresh and the in-memory token store
//! - [`installation`] - Installation and zone lookup over the REST API
//! - [`protocol`] - Numeric-key JSON codec, units and topic names
//! - [`transport`] - The supervised MQTT-over-WebSocket bridge
//! - [`config`] - TOML configuration with defaults for the public endpoints
//!
//! # Quick Start
//!
//! ```rust
//! use neasmart_bridge::protocol::{encode_command, Command, OperatingMode};
//!
//! let payload = encode_command(&Command::SetOperatingMode {
//!     zone: 2,
//!     mode: OperatingMode::Absence,
//! })
//! .unwrap();
//! assert_eq!(payload, r#"{"11":"REQ_TH","12":{"15":1},"35":"0","36":2}"#);
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod installation;
pub mod observability;
pub mod protocol;
pub mod testing;
pub mod transport;

pub use auth::{AuthSession, AuthState, Credentials, MfaChallenge, TokenSet, TokenStore};
pub use config::BridgeConfig;
pub use error::{BridgeError, BridgeResult};
pub use installation::{Installation, InstallationDirectory, Zone};
pub use protocol::{Command, OperatingMode, TelemetryFrame, ZoneUpdate};
pub use transport::{AccessGrant, BridgeEvent, ConnectionState, MqttBridge, TokenProvider};
