//! Wire codec for zone commands and telemetry
//!
//! Temperatures travel as integer tenths of a degree Fahrenheit. Outbound
//! objects are built key by key so the serialized order is exactly
//! `11, 12, 35, 36` with the parameter keys in the order given.

use crate::error::BridgeError;
use crate::protocol::fields::{ParameterField, ProtocolField, RESERVED_VALUE, THERMOSTAT_REQUEST};
use crate::protocol::messages::{ChannelReadings, Command, OperatingMode, TelemetryFrame, ZoneUpdate};
use serde_json::{Map, Value};
use thiserror::Error;

/// Codec failures
#[derive(Debug, Error, PartialEq)]
pub enum CodecError {
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("payload is a JSON {0}, expected an object")]
    NotAnObject(&'static str),
    #[error("temperature {0} cannot be encoded")]
    NonFiniteTemperature(f64),
}

impl From<CodecError> for BridgeError {
    fn from(error: CodecError) -> Self {
        BridgeError::malformed_frame(error.to_string())
    }
}

/// Celsius to wire tenths of a degree Fahrenheit, rounding half away from zero
pub fn celsius_to_fahrenheit_tenths(celsius: f64) -> i64 {
    ((celsius * 9.0 / 5.0 + 32.0) * 10.0).round() as i64
}

/// Wire tenths of a degree Fahrenheit to Celsius
pub fn fahrenheit_tenths_to_celsius(tenths: f64) -> f64 {
    (tenths / 10.0 - 32.0) * 5.0 / 9.0
}

/// Round to one decimal for display
pub fn round_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

pub fn encode_set_temperature(zone: u32, celsius: f64) -> Result<String, CodecError> {
    encode_command(&Command::SetTemperature { zone, celsius })
}

/// Serialize a command to its compact wire form
pub fn encode_command(command: &Command) -> Result<String, CodecError> {
    Ok(command_value(command)?.to_string())
}

/// Build the JSON object for a command, keys in wire order
pub fn command_value(command: &Command) -> Result<Value, CodecError> {
    let mut params = Map::new();
    match *command {
        Command::SetTemperature { celsius, .. } => {
            if !celsius.is_finite() {
                return Err(CodecError::NonFiniteTemperature(celsius));
            }
            params.insert(
                ParameterField::Setpoint.key().to_string(),
                Value::from(celsius_to_fahrenheit_tenths(celsius)),
            );
            params.insert(
                ParameterField::OperatingMode.key().to_string(),
                Value::from(OperatingMode::Presence.wire_value()),
            );
        }
        Command::SetOperatingMode { mode, .. } => {
            params.insert(
                ParameterField::OperatingMode.key().to_string(),
                Value::from(mode.wire_value()),
            );
        }
        Command::SetRingLight { enabled, .. } => {
            params.insert(
                ParameterField::RingLight.key().to_string(),
                Value::from(u8::from(enabled)),
            );
        }
    }

    let mut message = Map::new();
    message.insert(
        ProtocolField::MessageType.key().to_string(),
        Value::from(THERMOSTAT_REQUEST),
    );
    message.insert(ProtocolField::Parameters.key().to_string(), Value::Object(params));
    message.insert(
        ProtocolField::Reserved.key().to_string(),
        Value::from(RESERVED_VALUE),
    );
    message.insert(
        ProtocolField::Zone.key().to_string(),
        Value::from(command.zone()),
    );
    Ok(Value::Object(message))
}

/// Parse an inbound payload into a frame
pub fn decode_telemetry(payload: &[u8]) -> Result<TelemetryFrame, CodecError> {
    let value: Value =
        serde_json::from_slice(payload).map_err(|e| CodecError::InvalidJson(e.to_string()))?;

    let object = match value {
        Value::Object(object) => object,
        other => return Err(CodecError::NotAnObject(json_kind(&other))),
    };

    let mut frame = TelemetryFrame::default();
    for (key, value) in object {
        match ProtocolField::from_key(&key) {
            Some(field) => {
                frame.fields.insert(field, value);
            }
            None => {
                frame.unknown.insert(key, value);
            }
        }
    }
    Ok(frame)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Convert channel readings into Celsius zone fields
pub fn zone_update_from_readings(zone: u32, readings: &ChannelReadings) -> ZoneUpdate {
    let celsius = |tenths: Option<f64>| tenths.map(|t| round_tenth(fahrenheit_tenths_to_celsius(t)));
    // Zero limits mean "not configured"
    let limit = |tenths: Option<f64>| celsius(tenths.filter(|t| *t != 0.0));

    ZoneUpdate {
        zone,
        current_temperature: celsius(readings.temp_zone),
        target_temperature: celsius(readings.setpoint_used),
        min_temperature: limit(readings.limit_h_min),
        max_temperature: limit(readings.limit_h_max),
        demand: readings.demand.map(|d| d.clamp(0.0, 100.0).round() as u8),
        operating_mode: None,
        ring_light: None,
    }
}

impl TelemetryFrame {
    /// Partial zone state carried by this frame
    ///
    /// `None` when the frame names no zone in field 36.
    pub fn zone_update(&self) -> Option<ZoneUpdate> {
        let zone = self.zone()?;
        let mut update = match self.channel_readings() {
            Some(readings) => zone_update_from_readings(zone, &readings),
            None => ZoneUpdate {
                zone,
                ..ZoneUpdate::default()
            },
        };

        if update.target_temperature.is_none() {
            update.target_temperature = self
                .parameter(ParameterField::Setpoint)
                .and_then(Value::as_f64)
                .map(|t| round_tenth(fahrenheit_tenths_to_celsius(t)));
        }
        update.operating_mode = self
            .parameter(ParameterField::OperatingMode)
            .and_then(Value::as_u64)
            .and_then(OperatingMode::from_wire);
        update.ring_light = self
            .parameter(ParameterField::RingLight)
            .and_then(Value::as_u64)
            .map(|v| v != 0);

        Some(update)
    }
}
