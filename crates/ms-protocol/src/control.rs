//! Consumer control frames.
//!
//! The consumer answers data frames asynchronously with small JSON objects
//! carrying a mandatory `type` and an optional `value`.  The type set is
//! open-ended (collision variants share a suffix), so frames deserialize
//! into a plain struct and are classified afterwards rather than into a
//! closed enum.

use serde::Deserialize;
use serde_json::Value;

// ---------------------------------------------------------------------------
// ControlFrame
// ---------------------------------------------------------------------------

/// A raw control frame as received from the consumer.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    #[serde(default)]
    pub value: Option<Value>,
}

/// What the shipper should do about a control frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    /// `OK`: no-op acknowledgement.
    Ok,
    /// `DATA_RECEIVED`: no-op.
    DataReceived,
    /// `BUFFER_UPDATE`: consumer-advertised record-count credit.
    BufferUpdate(i64),
    /// Any type ending in `COLLISION`: upstream contention, feed backoff.
    Collision,
    /// `DROPPED`: batch discarded by the consumer; collision plus error.
    Dropped,
    /// `ERROR`: server-side failure; the connection is suspect.
    ServerError,
    /// `MALFORMED_REQUEST`: the consumer rejected the frame.
    MalformedRequest,
    /// `PONG`: reserved for async ping matching.
    Pong,
    /// A recognized type whose payload could not be interpreted.
    Invalid,
    /// An unrecognized type; logged and ignored.
    Unknown,
}

impl ControlFrame {
    pub fn parse(json: &str) -> Result<ControlFrame, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn classify(&self) -> ControlKind {
        match self.frame_type.as_str() {
            "OK" => ControlKind::Ok,
            "DATA_RECEIVED" => ControlKind::DataReceived,
            "BUFFER_UPDATE" => match self.integer_value() {
                Some(n) => ControlKind::BufferUpdate(n),
                None => ControlKind::Invalid,
            },
            "DROPPED" => ControlKind::Dropped,
            "ERROR" => ControlKind::ServerError,
            "MALFORMED_REQUEST" => ControlKind::MalformedRequest,
            "PONG" => ControlKind::Pong,
            t if t.ends_with("COLLISION") => ControlKind::Collision,
            _ => ControlKind::Unknown,
        }
    }

    /// `value` as a decimal integer; the consumer sends it either as a JSON
    /// number or as a digit string.
    fn integer_value(&self) -> Option<i64> {
        match &self.value {
            Some(Value::Number(n)) => n.as_i64(),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(json: &str) -> ControlKind {
        ControlFrame::parse(json).unwrap().classify()
    }

    #[test]
    fn classifies_known_types() {
        assert_eq!(classify(r#"{"type":"OK"}"#), ControlKind::Ok);
        assert_eq!(
            classify(r#"{"type":"DATA_RECEIVED"}"#),
            ControlKind::DataReceived
        );
        assert_eq!(classify(r#"{"type":"DROPPED"}"#), ControlKind::Dropped);
        assert_eq!(classify(r#"{"type":"ERROR"}"#), ControlKind::ServerError);
        assert_eq!(
            classify(r#"{"type":"MALFORMED_REQUEST"}"#),
            ControlKind::MalformedRequest
        );
        assert_eq!(classify(r#"{"type":"PONG"}"#), ControlKind::Pong);
    }

    #[test]
    fn any_collision_suffix_is_a_collision() {
        assert_eq!(
            classify(r#"{"type":"LOW_COLLISION"}"#),
            ControlKind::Collision
        );
        assert_eq!(
            classify(r#"{"type":"HIGH_COLLISION"}"#),
            ControlKind::Collision
        );
        assert_eq!(classify(r#"{"type":"COLLISION"}"#), ControlKind::Collision);
    }

    #[test]
    fn buffer_update_parses_number_and_string_values() {
        assert_eq!(
            classify(r#"{"type":"BUFFER_UPDATE","value":64}"#),
            ControlKind::BufferUpdate(64)
        );
        assert_eq!(
            classify(r#"{"type":"BUFFER_UPDATE","value":"128"}"#),
            ControlKind::BufferUpdate(128)
        );
        assert_eq!(
            classify(r#"{"type":"BUFFER_UPDATE","value":"nope"}"#),
            ControlKind::Invalid
        );
        assert_eq!(
            classify(r#"{"type":"BUFFER_UPDATE"}"#),
            ControlKind::Invalid
        );
    }

    #[test]
    fn unknown_types_do_not_error() {
        assert_eq!(classify(r#"{"type":"FUTURE_THING"}"#), ControlKind::Unknown);
    }

    #[test]
    fn missing_type_is_a_parse_error() {
        assert!(ControlFrame::parse(r#"{"value":1}"#).is_err());
    }
}
