//! Numeric field keys of the zone control protocol
//!
//! Every key that appears on the wire is defined here and nowhere else.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Top-level keys of a command or telemetry object
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProtocolField {
    /// Message type, `"REQ_TH"` for thermostat requests
    MessageType,
    /// Nested parameter object
    Parameters,
    /// Always the string `"0"` in outbound requests
    Reserved,
    /// Zone number
    Zone,
}

impl ProtocolField {
    pub const ALL: [ProtocolField; 4] = [
        Self::MessageType,
        Self::Parameters,
        Self::Reserved,
        Self::Zone,
    ];

    pub const fn key(self) -> &'static str {
        match self {
            Self::MessageType => "11",
            Self::Parameters => "12",
            Self::Reserved => "35",
            Self::Zone => "36",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|field| field.key() == key)
    }
}

impl fmt::Display for ProtocolField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Keys inside the [`ProtocolField::Parameters`] object
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ParameterField {
    /// Target temperature in tenths of a degree Fahrenheit
    Setpoint,
    /// Operating mode, see [`crate::protocol::OperatingMode`]
    OperatingMode,
    /// Controller ring light, 0 or 1
    RingLight,
}

impl ParameterField {
    pub const ALL: [ParameterField; 3] = [Self::Setpoint, Self::OperatingMode, Self::RingLight];

    pub const fn key(self) -> &'static str {
        match self {
            Self::Setpoint => "2",
            Self::OperatingMode => "15",
            Self::RingLight => "34",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|field| field.key() == key)
    }
}

impl fmt::Display for ParameterField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Message type of thermostat requests
pub const THERMOSTAT_REQUEST: &str = "REQ_TH";

/// Value of [`ProtocolField::Reserved`] in outbound requests
pub const RESERVED_VALUE: &str = "0";
