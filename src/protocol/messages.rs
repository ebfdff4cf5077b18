//! Typed commands and telemetry for the zone control protocol

use crate::protocol::fields::{ParameterField, ProtocolField};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Zone operating mode as carried in parameter field 15
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    /// Comfort setpoint
    Presence,
    /// Reduced setpoint
    Absence,
    Off,
    /// Follow the controller's schedule
    Auto,
}

impl OperatingMode {
    pub const fn wire_value(self) -> u8 {
        match self {
            Self::Presence => 0,
            Self::Absence => 1,
            Self::Off => 2,
            Self::Auto => 4,
        }
    }

    pub fn from_wire(value: u64) -> Option<Self> {
        match value {
            0 => Some(Self::Presence),
            1 => Some(Self::Absence),
            2 => Some(Self::Off),
            4 => Some(Self::Auto),
            _ => None,
        }
    }
}

impl std::str::FromStr for OperatingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "presence" | "comfort" => Ok(Self::Presence),
            "absence" | "eco" | "away" => Ok(Self::Absence),
            "off" => Ok(Self::Off),
            "auto" | "schedule" => Ok(Self::Auto),
            other => Err(format!("unknown operating mode '{other}'")),
        }
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Presence => "presence",
            Self::Absence => "absence",
            Self::Off => "off",
            Self::Auto => "auto",
        };
        f.write_str(name)
    }
}

/// Outbound zone command
///
/// The zone number is the only identifier that ever reaches the wire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    SetTemperature { zone: u32, celsius: f64 },
    SetOperatingMode { zone: u32, mode: OperatingMode },
    SetRingLight { zone: u32, enabled: bool },
}

impl Command {
    pub fn zone(&self) -> u32 {
        match *self {
            Self::SetTemperature { zone, .. }
            | Self::SetOperatingMode { zone, .. }
            | Self::SetRingLight { zone, .. } => zone,
        }
    }
}

/// Named per-channel readings, in tenths of a degree Fahrenheit
///
/// Appears in installation data and in the `data.data` object of realtime
/// frames.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ChannelReadings {
    #[serde(default)]
    pub temp_zone: Option<f64>,
    #[serde(default)]
    pub setpoint_used: Option<f64>,
    #[serde(default)]
    pub setpoint_h_normal: Option<f64>,
    #[serde(default)]
    pub setpoint_h_reduced: Option<f64>,
    /// Heating demand in percent
    #[serde(default)]
    pub demand: Option<f64>,
    #[serde(default)]
    pub limit_h_min: Option<f64>,
    #[serde(default)]
    pub limit_h_max: Option<f64>,
}

impl ChannelReadings {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Partial zone state decoded from a telemetry frame, temperatures in Celsius
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ZoneUpdate {
    pub zone: u32,
    pub current_temperature: Option<f64>,
    pub target_temperature: Option<f64>,
    pub min_temperature: Option<f64>,
    pub max_temperature: Option<f64>,
    pub demand: Option<u8>,
    pub operating_mode: Option<OperatingMode>,
    pub ring_light: Option<bool>,
}

/// Decoded inbound frame
///
/// Known top-level fields are kept by [`ProtocolField`]; everything else is
/// preserved untouched in `unknown`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelemetryFrame {
    /// Topic the frame arrived on, when received through the bridge
    pub topic: Option<String>,
    pub fields: BTreeMap<ProtocolField, Value>,
    pub unknown: Map<String, Value>,
}

impl TelemetryFrame {
    pub fn with_topic<S: Into<String>>(mut self, topic: S) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn field(&self, field: ProtocolField) -> Option<&Value> {
        self.fields.get(&field)
    }

    pub fn message_type(&self) -> Option<&str> {
        self.field(ProtocolField::MessageType)?.as_str()
    }

    /// Zone number from field 36, accepting numbers and numeric strings
    pub fn zone(&self) -> Option<u32> {
        match self.field(ProtocolField::Zone)? {
            Value::Number(n) => n.as_u64().and_then(|z| u32::try_from(z).ok()),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn parameter(&self, field: ParameterField) -> Option<&Value> {
        self.field(ProtocolField::Parameters)?
            .as_object()?
            .get(field.key())
    }

    /// Named channel readings from a nested `data.data` object
    pub fn channel_readings(&self) -> Option<ChannelReadings> {
        let nested = self.unknown.get("data")?.get("data")?;
        let readings: ChannelReadings = serde_json::from_value(nested.clone()).ok()?;
        (!readings.is_empty()).then_some(readings)
    }
}
