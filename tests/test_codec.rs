//! Wire format tests for commands and telemetry
//!
//! Outbound payloads are compared byte for byte; inbound frames are checked
//! for what a caller can observe after decoding.

use neasmart_bridge::error::BridgeError;
use neasmart_bridge::protocol::{
    command_topic, decode_telemetry, encode_command, encode_set_temperature, Command,
    OperatingMode, ProtocolField,
};
use neasmart_bridge::transport::mqtt::MessageHandler;
use proptest::prelude::*;

#[test]
fn test_set_temperature_wire_bytes() {
    let payload = encode_set_temperature(3, 22.0).unwrap();
    assert_eq!(payload, r#"{"11":"REQ_TH","12":{"2":716,"15":0},"35":"0","36":3}"#);
}

#[test]
fn test_set_temperature_rounds_to_nearest_fahrenheit_tenth() {
    // 21.5 C = 70.7 F exactly; 20.3 C = 68.54 F
    assert_eq!(
        encode_set_temperature(1, 21.5).unwrap(),
        r#"{"11":"REQ_TH","12":{"2":707,"15":0},"35":"0","36":1}"#
    );
    assert_eq!(
        encode_set_temperature(12, 20.3).unwrap(),
        r#"{"11":"REQ_TH","12":{"2":685,"15":0},"35":"0","36":12}"#
    );
}

#[test]
fn test_mode_and_ring_light_wire_bytes() {
    let off = encode_command(&Command::SetOperatingMode {
        zone: 4,
        mode: OperatingMode::Off,
    })
    .unwrap();
    assert_eq!(off, r#"{"11":"REQ_TH","12":{"15":2},"35":"0","36":4}"#);

    let light = encode_command(&Command::SetRingLight {
        zone: 4,
        enabled: false,
    })
    .unwrap();
    assert_eq!(light, r#"{"11":"REQ_TH","12":{"34":0},"35":"0","36":4}"#);
}

#[test]
fn test_command_topic_uses_device_id() {
    assert_eq!(command_topic("6595d1d5cceecee9ce9772e1"), "client/6595d1d5cceecee9ce9772e1");
}

#[test]
fn test_malformed_payloads_are_rejected() {
    for payload in [&b"{not json"[..], b"", b"42", b"[1,2]", b"null"] {
        let error: BridgeError = decode_telemetry(payload).unwrap_err().into();
        assert!(
            matches!(error, BridgeError::MalformedFrame { .. }),
            "payload {:?} gave {error:?}",
            String::from_utf8_lossy(payload)
        );
    }
}

#[test]
fn test_unknown_fields_preserved() {
    let frame = decode_telemetry(
        br#"{"11":"REP_TH","36":"2","99":{"x":1},"type":"channel_update","data":{"data":{"temp_zone":700}}}"#,
    )
    .unwrap();

    assert_eq!(frame.message_type(), Some("REP_TH"));
    assert_eq!(frame.zone(), Some(2));
    assert!(frame.field(ProtocolField::Parameters).is_none());
    assert_eq!(frame.unknown["99"]["x"], 1);
    assert_eq!(frame.unknown["type"], "channel_update");

    let update = frame.zone_update().unwrap();
    assert_eq!(update.zone, 2);
    assert_eq!(update.current_temperature, Some(21.1));
}

#[test]
fn test_decoded_parameters_yield_mode_and_setpoint() {
    let frame = MessageHandler::decode_frame(
        "client/dev-1/realtime",
        br#"{"11":"REQ_TH","12":{"2":716,"15":1,"34":1},"35":"0","36":3}"#,
    )
    .unwrap();

    let update = frame.zone_update().unwrap();
    assert_eq!(update.zone, 3);
    assert_eq!(update.target_temperature, Some(22.0));
    assert_eq!(update.operating_mode, Some(OperatingMode::Absence));
    assert_eq!(update.ring_light, Some(true));
    assert_eq!(frame.topic.as_deref(), Some("client/dev-1/realtime"));
}

proptest! {
    #[test]
    fn prop_setpoint_survives_the_wire_within_a_tenth(
        celsius in 5.0f64..=35.0,
        zone in 0u32..64,
    ) {
        let payload = encode_set_temperature(zone, celsius).unwrap();
        let update = decode_telemetry(payload.as_bytes())
            .unwrap()
            .zone_update()
            .unwrap();

        prop_assert_eq!(update.zone, zone);
        let decoded = update.target_temperature.unwrap();
        prop_assert!((decoded - celsius).abs() <= 0.1, "{} -> {}", celsius, decoded);
    }

    #[test]
    fn prop_non_object_json_never_decodes(value in prop_oneof![
        any::<i64>().prop_map(|n| n.to_string()),
        "[a-z]{0,8}".prop_map(|s| format!("\"{s}\"")),
        Just("true".to_string()),
    ]) {
        prop_assert!(decode_telemetry(value.as_bytes()).is_err());
    }
}
