//! Broker transport
//!
//! The bridge never sees credentials. It asks a [`TokenProvider`] for an
//! [`AccessGrant`] before every connection attempt and derives the MQTT
//! client identifier, username and password from it.

use crate::error::BridgeResult;
use std::fmt;

pub mod mqtt;

/// Access token plus the session identifier it belongs to
#[derive(Clone, PartialEq, Eq)]
pub struct AccessGrant {
    pub access_token: String,
    pub sid: String,
}

impl fmt::Debug for AccessGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessGrant")
            .field("access_token", &"***")
            .field("sid", &self.sid)
            .finish()
    }
}

/// Source of valid access grants for the broker connection
///
/// Implemented by [`crate::auth::AuthSession`]; tests substitute
/// [`crate::testing::MockTokenProvider`].
#[async_trait::async_trait]
pub trait TokenProvider: Send + Sync {
    /// A grant whose token will not expire within the safety margin
    async fn access_grant(&self) -> BridgeResult<AccessGrant>;

    /// Confirm the grant is still active on the server side
    async fn verify_grant(&self, grant: &AccessGrant) -> BridgeResult<()>;
}

pub use mqtt::{BridgeEvent, ConnectionState, MqttBridge};
