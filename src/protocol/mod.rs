//! Zone control protocol
//!
//! Field keys, typed messages, the JSON codec and the topic layout used on
//! the broker.

pub mod codec;
pub mod fields;
pub mod messages;
pub mod topics;

pub use codec::{
    celsius_to_fahrenheit_tenths, decode_telemetry, encode_command, encode_set_temperature,
    fahrenheit_tenths_to_celsius, CodecError,
};
pub use fields::{ParameterField, ProtocolField};
pub use messages::*;
pub use topics::*;
