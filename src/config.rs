//! Bridge configuration loaded from TOML
//!
//! Only the account email is mandatory. Endpoints, client identifiers and
//! timing parameters default to the values the vendor's mobile app uses.
//! Secrets are never stored in the file: `password_env` names the environment
//! variable holding the account password.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Main bridge configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeConfig {
    pub account: AccountSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub api: ApiSection,
    #[serde(default)]
    pub mqtt: MqttSection,
    #[serde(default)]
    pub storage: StorageSection,
}

/// Account section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccountSection {
    /// Account email, also used in the MQTT username and topics
    pub email: String,
    /// Environment variable containing the account password
    #[serde(default = "default_password_env")]
    pub password_env: String,
    /// Installation to control; the first listed installation when absent
    pub installation_id: Option<String>,
}

fn default_password_env() -> String {
    "NEASMART_PASSWORD".to_string()
}

/// OAuth endpoint section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthSection {
    #[serde(default = "default_auth_base_url")]
    pub base_url: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
    #[serde(default = "default_scope")]
    pub scope: String,
    /// Verification medium used when the account lists none
    #[serde(default = "default_medium_id")]
    pub default_medium_id: String,
    /// Refresh the access token when it expires within this many seconds
    #[serde(default = "default_refresh_margin")]
    pub refresh_margin_secs: u64,
    /// How long an emailed MFA code is accepted
    #[serde(default = "default_mfa_timeout")]
    pub mfa_timeout_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            base_url: default_auth_base_url(),
            client_id: default_client_id(),
            redirect_uri: default_redirect_uri(),
            scope: default_scope(),
            default_medium_id: default_medium_id(),
            refresh_margin_secs: default_refresh_margin(),
            mfa_timeout_secs: default_mfa_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl AuthSection {
    pub fn refresh_margin(&self) -> Duration {
        Duration::from_secs(self.refresh_margin_secs)
    }

    pub fn mfa_timeout(&self) -> Duration {
        Duration::from_secs(self.mfa_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_auth_base_url() -> String {
    "https://accounts.rehau.com".to_string()
}

fn default_client_id() -> String {
    "3f5d915d-a06f-42b9-89cc-2e5d63aa96f1".to_string()
}

fn default_redirect_uri() -> String {
    "https://rehau-smartheating-email-gallery-public.s3.eu-central-1.amazonaws.com/publicimages/preprod/rehau.jpg".to_string()
}

fn default_scope() -> String {
    "email roles profile offline_access groups".to_string()
}

fn default_medium_id() -> String {
    "101e2b44-60d1-45e3-b649-f5ef7d75f5a0".to_string()
}

fn default_refresh_margin() -> u64 {
    60
}

fn default_mfa_timeout() -> u64 {
    600 // 10 minutes
}

fn default_request_timeout() -> u64 {
    30
}

/// Installation API section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiSection {
    #[serde(default = "default_api_base_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            base_url: default_api_base_url(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_api_base_url() -> String {
    "https://api.nea2aws.aws.rehau.cloud".to_string()
}

/// MQTT section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// WebSocket broker URL
    #[serde(default = "default_broker_url")]
    pub broker_url: String,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Upper bound on waiting for the first CONNACK
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub reconnect: ReconnectSection,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            broker_url: default_broker_url(),
            keep_alive_secs: default_keep_alive(),
            connect_timeout_secs: default_connect_timeout(),
            reconnect: ReconnectSection::default(),
        }
    }
}

fn default_broker_url() -> String {
    "wss://mqtt.nea2aws.aws.rehau.cloud/mqtt".to_string()
}

fn default_keep_alive() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    30
}

/// Reconnection backoff section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// None retries forever
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            multiplier: default_multiplier(),
            max_attempts: None,
        }
    }
}

fn default_initial_delay() -> u64 {
    1000
}

fn default_max_delay() -> u64 {
    60_000
}

fn default_multiplier() -> f64 {
    2.0
}

/// Where the CLI host keeps the persisted token set
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageSection {
    #[serde(default = "default_token_file")]
    pub token_file: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            token_file: default_token_file(),
        }
    }
}

fn default_token_file() -> PathBuf {
    PathBuf::from("neasmart-tokens.json")
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid email address: {0}")]
    InvalidEmail(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BridgeConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text and validate it
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Minimal configuration for an account with every other value defaulted
    pub fn for_account(email: &str) -> Self {
        Self {
            account: AccountSection {
                email: email.to_string(),
                password_env: default_password_env(),
                installation_id: None,
            },
            auth: AuthSection::default(),
            api: ApiSection::default(),
            mqtt: MqttSection::default(),
            storage: StorageSection::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_email(&self.account.email)?;
        validate_url(&self.auth.base_url, &["http", "https"])?;
        validate_url(&self.api.base_url, &["http", "https"])?;
        validate_url(&self.mqtt.broker_url, &["ws", "wss"])?;

        if self.auth.mfa_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "auth.mfa_timeout_secs must be greater than 0".to_string(),
            ));
        }

        let reconnect = &self.mqtt.reconnect;
        if reconnect.initial_delay_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.reconnect.initial_delay_ms must be greater than 0".to_string(),
            ));
        }
        if reconnect.max_delay_ms < reconnect.initial_delay_ms {
            return Err(ConfigError::InvalidConfig(
                "mqtt.reconnect.max_delay_ms must not be below initial_delay_ms".to_string(),
            ));
        }
        if reconnect.multiplier <= 1.0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.reconnect.multiplier must be greater than 1.0".to_string(),
            ));
        }
        if reconnect.max_attempts == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "mqtt.reconnect.max_attempts must be greater than 0 or omitted".to_string(),
            ));
        }

        Ok(())
    }

    /// Read the account password from the configured environment variable
    pub fn account_password(&self) -> Result<String, ConfigError> {
        std::env::var(&self.account.password_env)
            .map_err(|_| ConfigError::EnvVarNotFound(self.account.password_env.clone()))
    }
}

fn validate_email(email: &str) -> Result<(), ConfigError> {
    let mut parts = email.splitn(2, '@');
    let local = parts.next().unwrap_or_default();
    let domain = parts.next().unwrap_or_default();

    if local.is_empty() || domain.is_empty() || email.chars().any(char::is_whitespace) {
        return Err(ConfigError::InvalidEmail(email.to_string()));
    }
    Ok(())
}

fn validate_url(raw: &str, schemes: &[&str]) -> Result<(), ConfigError> {
    let url = Url::parse(raw)
        .map_err(|e| ConfigError::InvalidConfig(format!("invalid URL '{raw}': {e}")))?;
    if !schemes.contains(&url.scheme()) {
        return Err(ConfigError::InvalidConfig(format!(
            "URL '{raw}' must use one of {schemes:?}"
        )));
    }
    Ok(())
}
