//! Error taxonomy for the Nea Smart session and protocol bridge
//!
//! Every fallible public operation returns [`BridgeError`]. The variants map
//! one-to-one onto the recovery a caller has to perform: user input
//! (credentials, MFA code), a full re-login, or nothing at all because the
//! failure is transient and the bridge retries it internally.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Main error type for bridge operations
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Invalid credentials: {message}")]
    InvalidCredentials { message: String },

    #[error("MFA code expired for challenge {challenge_id}")]
    MfaExpired { challenge_id: String },

    #[error("MFA code rejected: {message}")]
    MfaInvalid { message: String },

    #[error("Authorization failed: {message}")]
    AuthorizationFailed { message: String },

    #[error("Session expired, a full login is required: {message}")]
    SessionExpired { message: String },

    #[error("No installations found for this account")]
    NoInstallationsFound,

    #[error("Transport rejected by broker edge: {message}")]
    TransportRejected { message: String },

    #[error("Broker authorizer rejected connection: {message}")]
    AuthorizerRejected { message: String },

    #[error("Malformed telemetry frame: {message}")]
    MalformedFrame { message: String },

    #[error("Network error: {message}")]
    NetworkError { message: String },

    #[error("Not connected - current state: {state}")]
    NotConnected { state: String },

    #[error("Unexpected response: {message}")]
    UnexpectedResponse { message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl BridgeError {
    /// Create invalid credentials error
    pub fn invalid_credentials<S: Into<String>>(message: S) -> Self {
        Self::InvalidCredentials {
            message: sanitize_error_message(&message.into()),
        }
    }

    /// Create MFA rejection error
    pub fn mfa_invalid<S: Into<String>>(message: S) -> Self {
        Self::MfaInvalid {
            message: sanitize_error_message(&message.into()),
        }
    }

    /// Create authorization failure error
    pub fn authorization_failed<S: Into<String>>(message: S) -> Self {
        Self::AuthorizationFailed {
            message: sanitize_error_message(&message.into()),
        }
    }

    /// Create session expired error
    pub fn session_expired<S: Into<String>>(message: S) -> Self {
        Self::SessionExpired {
            message: sanitize_error_message(&message.into()),
        }
    }

    /// Create transport rejection error
    pub fn transport_rejected<S: Into<String>>(message: S) -> Self {
        Self::TransportRejected {
            message: sanitize_error_message(&message.into()),
        }
    }

    /// Create authorizer rejection error
    pub fn authorizer_rejected<S: Into<String>>(message: S) -> Self {
        Self::AuthorizerRejected {
            message: sanitize_error_message(&message.into()),
        }
    }

    /// Create malformed frame error
    pub fn malformed_frame<S: Into<String>>(message: S) -> Self {
        Self::MalformedFrame {
            message: message.into(),
        }
    }

    /// Create network error
    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::NetworkError {
            message: sanitize_error_message(&message.into()),
        }
    }

    /// Create unexpected response error
    pub fn unexpected_response<S: Into<String>>(message: S) -> Self {
        Self::UnexpectedResponse {
            message: sanitize_error_message(&message.into()),
        }
    }

    /// Transient failures are retried internally with backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NetworkError { .. })
    }

    /// Errors after which the caller has to restart the full login
    pub fn requires_reauthentication(&self) -> bool {
        matches!(
            self,
            Self::SessionExpired { .. } | Self::AuthorizerRejected { .. }
        )
    }
}

impl From<reqwest::Error> for BridgeError {
    fn from(error: reqwest::Error) -> Self {
        Self::network(error.to_string())
    }
}

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|pass_code|code_verifier|secret)[=:]\s*[^\s&,]+")
        .expect("secret pattern is a valid regex")
});

static JWT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"eyJ[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+\.[A-Za-z0-9_-]*")
        .expect("jwt pattern is a valid regex")
});

const MAX_MESSAGE_LEN: usize = 500;

/// Strip secrets from messages that may embed response bodies or URLs
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = SECRET_PATTERN
        .replace_all(message, "${1}=***")
        .to_string();
    sanitized = JWT_PATTERN.replace_all(&sanitized, "***JWT***").to_string();

    if sanitized.len() > MAX_MESSAGE_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_MESSAGE_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;
