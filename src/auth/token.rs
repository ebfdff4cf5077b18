//! Token set and expiry bookkeeping
//!
//! Pure data: nothing here performs I/O. [`TokenStore`] answers the single
//! question the session cares about, whether the current access token may
//! still be handed out given a safety margin.

use crate::error::{BridgeError, BridgeResult};
use crate::transport::AccessGrant;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lifetime assumed when the token endpoint omits `expires_in`.
const DEFAULT_EXPIRES_IN_SECS: i64 = 86_400;

/// Access/refresh token pair plus the session identifier the broker needs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    /// `sid` claim, used to build the MQTT client identifier
    pub sid: String,
}

impl TokenSet {
    /// Build a token set from a token endpoint response
    ///
    /// `previous_refresh_token` is kept when the endpoint does not rotate it.
    pub fn from_response(
        response: TokenResponse,
        previous_refresh_token: Option<&str>,
        now: DateTime<Utc>,
    ) -> BridgeResult<Self> {
        let refresh_token = response
            .refresh_token
            .filter(|t| !t.is_empty())
            .or_else(|| previous_refresh_token.map(str::to_string))
            .ok_or_else(|| {
                BridgeError::unexpected_response("token response carries no refresh token")
            })?;

        let sid = session_id_from_claims(&response.access_token)
            .or(response.sid)
            .ok_or_else(|| {
                BridgeError::unexpected_response("access token carries no session identifier")
            })?;

        let expires_in = response.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        let expires_at = checked_expiry(now, expires_in)?;

        Ok(Self {
            access_token: response.access_token,
            refresh_token,
            expires_at,
            sid,
        })
    }

    /// True while the token expires more than `margin` after `now`
    pub fn is_fresh(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        self.expires_at - to_chrono(margin) > now
    }

    /// Remaining lifetime, negative once expired
    pub fn remaining(&self, now: DateTime<Utc>) -> chrono::Duration {
        self.expires_at - now
    }
}

/// `now + expires_in`, rejecting negative or unrepresentable lifetimes
fn checked_expiry(now: DateTime<Utc>, expires_in: i64) -> BridgeResult<DateTime<Utc>> {
    if expires_in < 0 {
        return Err(BridgeError::unexpected_response(format!(
            "token lifetime is negative: {expires_in}"
        )));
    }
    chrono::Duration::try_seconds(expires_in)
        .and_then(|lifetime| now.checked_add_signed(lifetime))
        .ok_or_else(|| {
            BridgeError::unexpected_response(format!("token lifetime out of range: {expires_in}"))
        })
}

impl From<&TokenSet> for AccessGrant {
    fn from(tokens: &TokenSet) -> Self {
        AccessGrant {
            access_token: tokens.access_token.clone(),
            sid: tokens.sid.clone(),
        }
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(i64::try_from(duration.as_millis()).unwrap_or(i64::MAX))
}

/// Token endpoint response body (both grants)
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub sid: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
}

/// Read the `sid` claim from a JWT access token without verifying it
pub fn session_id_from_claims(access_token: &str) -> Option<String> {
    let payload = access_token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    claims
        .get("sid")
        .and_then(|sid| sid.as_str())
        .filter(|sid| !sid.is_empty())
        .map(str::to_string)
}

/// Holder of the current token set
#[derive(Debug, Default, Clone)]
pub struct TokenStore {
    tokens: Option<TokenSet>,
}

impl TokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tokens(tokens: TokenSet) -> Self {
        Self {
            tokens: Some(tokens),
        }
    }

    pub fn current(&self) -> Option<&TokenSet> {
        self.tokens.as_ref()
    }

    pub fn replace(&mut self, tokens: TokenSet) {
        self.tokens = Some(tokens);
    }

    pub fn clear(&mut self) {
        self.tokens = None;
    }

    /// The token set if its access token may still be used at `now`
    pub fn fresh_tokens(&self, now: DateTime<Utc>, margin: Duration) -> Option<&TokenSet> {
        self.tokens.as_ref().filter(|t| t.is_fresh(now, margin))
    }
}
