//! MQTT topic layout
//!
//! Commands go to `client/{device}`. Telemetry arrives on the account topic
//! `client/{email}` and on `client/{device}/realtime`.

use thiserror::Error;

const TOPIC_ROOT: &str = "client";

/// Topic segment validation errors
#[derive(Debug, Error, PartialEq)]
pub enum TopicError {
    #[error("topic segment cannot be empty")]
    EmptySegment,
    #[error("topic segment contains reserved character: '{0}'")]
    ReservedChar(char),
}

/// Reject segments that would change the topic structure or act as wildcards
pub fn validate_segment(segment: &str) -> Result<(), TopicError> {
    if segment.is_empty() {
        return Err(TopicError::EmptySegment);
    }
    match segment.chars().find(|c| matches!(c, '/' | '+' | '#' | '\0')) {
        Some(ch) => Err(TopicError::ReservedChar(ch)),
        None => Ok(()),
    }
}

pub fn command_topic(device_id: &str) -> String {
    format!("{TOPIC_ROOT}/{device_id}")
}

pub fn account_topic(email: &str) -> String {
    format!("{TOPIC_ROOT}/{email}")
}

pub fn realtime_topic(device_id: &str) -> String {
    format!("{TOPIC_ROOT}/{device_id}/realtime")
}

/// Both telemetry subscriptions for an account and device
pub fn telemetry_topics(email: &str, device_id: &str) -> [String; 2] {
    [account_topic(email), realtime_topic(device_id)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_topic_layout() {
        assert_eq!(command_topic("dev-1"), "client/dev-1");
        assert_eq!(account_topic("user@example.com"), "client/user@example.com");
        assert_eq!(realtime_topic("dev-1"), "client/dev-1/realtime");
        assert_eq!(
            telemetry_topics("a@b.c", "d"),
            ["client/a@b.c".to_string(), "client/d/realtime".to_string()]
        );
    }

    #[test]
    fn test_segment_validation() {
        assert_eq!(validate_segment(""), Err(TopicError::EmptySegment));
        assert_eq!(validate_segment("a/b"), Err(TopicError::ReservedChar('/')));
        assert_eq!(validate_segment("dev+"), Err(TopicError::ReservedChar('+')));
        assert!(validate_segment("user.name@example.com").is_ok());
    }

    proptest! {
        #[test]
        fn valid_segments_build_three_level_realtime_topic(segment in "[A-Za-z0-9@._-]{1,40}") {
            prop_assert!(validate_segment(&segment).is_ok());
            let topic = realtime_topic(&segment);
            prop_assert_eq!(topic.split('/').count(), 3);
        }
    }
}
