//! Installation and zone metadata
//!
//! [`InstallationDirectory`] reads the account's installations from the REST
//! API once, before the broker session starts. The device identifier it
//! returns addresses all MQTT topics; zone numbers address the zones.

use crate::config::ApiSection;
use crate::error::{BridgeError, BridgeResult};
use crate::fingerprint;
use crate::protocol::codec::{fahrenheit_tenths_to_celsius, round_tenth, zone_update_from_readings};
use crate::protocol::messages::{ChannelReadings, ZoneUpdate};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};
use url::Url;

/// Bounds used when a channel reports no limits
pub const DEFAULT_MIN_TEMPERATURE: f64 = 5.0;
pub const DEFAULT_MAX_TEMPERATURE: f64 = 35.0;

/// One heating zone; temperatures in Celsius rounded to 0.1
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    /// Protocol identifier, the only value ever sent in commands
    pub number: u32,
    /// Informational channel identifier
    pub channel_id: Option<String>,
    pub name: String,
    pub current_temperature: Option<f64>,
    pub target_temperature: Option<f64>,
    pub min_temperature: f64,
    pub max_temperature: f64,
    /// Heating demand in percent
    pub demand: u8,
}

impl Zone {
    /// Merge a telemetry update addressed to this zone
    ///
    /// Returns false and leaves the zone untouched when the update names a
    /// different zone number.
    pub fn apply(&mut self, update: &ZoneUpdate) -> bool {
        if update.zone != self.number {
            return false;
        }
        if let Some(t) = update.current_temperature {
            self.current_temperature = Some(t);
        }
        if let Some(t) = update.target_temperature {
            self.target_temperature = Some(t);
        }
        if let Some(t) = update.min_temperature {
            self.min_temperature = t;
        }
        if let Some(t) = update.max_temperature {
            self.max_temperature = t;
        }
        if let Some(d) = update.demand {
            self.demand = d;
        }
        true
    }

    pub fn is_heating(&self) -> bool {
        self.demand > 0
    }
}

/// A controller installation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Installation {
    pub id: String,
    /// Device identifier used in MQTT topics
    pub device_id: String,
    pub name: String,
    pub zones: Vec<Zone>,
}

impl Installation {
    pub fn zone(&self, number: u32) -> Option<&Zone> {
        self.zones.iter().find(|z| z.number == number)
    }

    /// Route an update to its zone; false when no zone matches
    pub fn apply(&mut self, update: &ZoneUpdate) -> bool {
        self.zones.iter_mut().any(|zone| zone.apply(update))
    }
}

#[derive(Debug, Deserialize)]
struct InstallEnvelope {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: Option<InstallData>,
}

#[derive(Debug, Default, Deserialize)]
struct InstallData {
    #[serde(default)]
    user: RawUser,
}

#[derive(Debug, Default, Deserialize)]
struct RawUser {
    #[serde(default)]
    installs: Vec<RawInstall>,
}

#[derive(Debug, Deserialize)]
struct RawInstall {
    unique: String,
    #[serde(default, rename = "_id")]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    groups: Vec<RawGroup>,
}

#[derive(Debug, Deserialize)]
struct RawGroup {
    #[serde(default)]
    zones: Vec<RawZone>,
}

#[derive(Debug, Deserialize)]
struct RawZone {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    number: Option<Value>,
    #[serde(default)]
    channels: Vec<RawChannel>,
}

#[derive(Debug, Deserialize)]
struct RawChannel {
    #[serde(default)]
    number: Option<Value>,
    #[serde(flatten)]
    readings: ChannelReadings,
}

impl RawInstall {
    fn matches(&self, selector: &str) -> bool {
        self.unique == selector || self.id.as_deref() == Some(selector)
    }

    fn into_installation(self) -> Installation {
        let mut zones = Vec::new();
        for raw in self.groups.into_iter().flat_map(|g| g.zones) {
            let Some(number) = raw.number.as_ref().and_then(zone_number) else {
                warn!(zone = ?raw.name, "Skipping zone without a zone number");
                continue;
            };
            let Some(channel) = raw.channels.into_iter().next() else {
                debug!(zone = number, "Skipping zone without channels");
                continue;
            };
            zones.push(build_zone(number, raw.name, channel));
        }

        Installation {
            id: self.id.unwrap_or_else(|| self.unique.clone()),
            name: self.name.unwrap_or_else(|| self.unique.clone()),
            device_id: self.unique,
            zones,
        }
    }
}

fn zone_number(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|z| u32::try_from(z).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn build_zone(number: u32, name: Option<String>, channel: RawChannel) -> Zone {
    let update = zone_update_from_readings(number, &channel.readings);
    Zone {
        number,
        channel_id: channel.number.map(|v| match v {
            Value::String(s) => s,
            other => other.to_string(),
        }),
        name: name.unwrap_or_else(|| format!("Zone {number}")),
        current_temperature: update.current_temperature,
        target_temperature: update.target_temperature.or_else(|| {
            channel
                .readings
                .setpoint_h_normal
                .map(|t| round_tenth(fahrenheit_tenths_to_celsius(t)))
        }),
        min_temperature: update.min_temperature.unwrap_or(DEFAULT_MIN_TEMPERATURE),
        max_temperature: update.max_temperature.unwrap_or(DEFAULT_MAX_TEMPERATURE),
        demand: update.demand.unwrap_or(0),
    }
}

/// Client for the installation data endpoint
#[derive(Debug, Clone)]
pub struct InstallationDirectory {
    http: Client,
    base_url: Url,
    email: String,
}

impl InstallationDirectory {
    pub fn new<S: Into<String>>(settings: &ApiSection, email: S) -> BridgeResult<Self> {
        let base_url = Url::parse(&settings.base_url).map_err(|e| {
            BridgeError::Config(crate::config::ConfigError::InvalidConfig(format!(
                "api.base_url: {e}"
            )))
        })?;

        let http = Client::builder()
            .default_headers(fingerprint::http_headers())
            .timeout(std::time::Duration::from_secs(settings.request_timeout_secs))
            .build()?;

        Ok(Self {
            http,
            base_url,
            email: email.into(),
        })
    }

    /// Fetch one installation with its zones
    ///
    /// Without a selector the first installation in the listed order is used.
    #[instrument(skip(self, access_token), fields(email = %self.email))]
    pub async fn fetch_installation(
        &self,
        access_token: &str,
        installation_id: Option<&str>,
    ) -> BridgeResult<Installation> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| BridgeError::unexpected_response("api base url cannot hold a path"))?
            .pop_if_empty()
            .extend(["v2", "users", self.email.as_str(), "getDataofInstall"]);

        let mut request = self
            .http
            .get(url)
            .header(reqwest::header::AUTHORIZATION, access_token);
        if let Some(id) = installation_id {
            request = request.query(&[("demand", id), ("installsList", id)]);
        }

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(BridgeError::authorization_failed(format!(
                "installation data answered with HTTP {status}"
            )));
        }
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(BridgeError::network(format!(
                "installation data answered with HTTP {status}"
            )));
        }
        if !status.is_success() {
            return Err(BridgeError::unexpected_response(format!(
                "installation data answered with HTTP {status}"
            )));
        }

        let envelope: InstallEnvelope = response.json().await.map_err(|e| {
            BridgeError::unexpected_response(format!("installation data body: {e}"))
        })?;
        if !envelope.success {
            return Err(BridgeError::unexpected_response(
                "installation data reported failure",
            ));
        }

        let installs = envelope.data.unwrap_or_default().user.installs;
        debug!(count = installs.len(), "Installations listed");

        let selected = match installation_id {
            Some(id) => installs.into_iter().find(|i| i.matches(id)),
            None => installs.into_iter().next(),
        };

        let installation = selected
            .ok_or(BridgeError::NoInstallationsFound)?
            .into_installation();
        debug!(
            device_id = %installation.device_id,
            zones = installation.zones.len(),
            "Installation selected"
        );
        Ok(installation)
    }
}
