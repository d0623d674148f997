//! The metric record and the batch envelope.
//!
//! Records arrive from collectors as JSON strings on the upstream queue.
//! Deserialization is deliberately stricter than a derived `Deserialize`:
//! legacy collectors string-encode numeric values, and a single malformed
//! field must reject the record with a diagnosable error rather than
//! defaulting silently.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// One metric sample: timestamp, name, value, tag mapping.
///
/// The `error` flag is process-internal (set by the processor when a policy
/// step rejects the record); it never appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct Record {
    /// Seconds since the epoch, fractional part permitted.
    pub timestamp: f64,
    pub metric: String,
    pub value: f64,
    /// Sorted so the binary encoding of a record is deterministic.
    pub tags: BTreeMap<String, String>,
    #[serde(skip)]
    pub error: bool,
}

impl Record {
    /// Deserialize a record from the JSON produced by collectors.
    ///
    /// Field rules:
    /// - `timestamp`: JSON number; absent means 0.
    /// - `metric`: non-empty JSON string; absent means empty.
    /// - `value`: JSON number, or a string parseable as one (legacy
    ///   collectors string-encode values); absent means 0.
    /// - `tags`: absent, `null`, or an object with string values.
    pub fn from_json(bytes: &[u8]) -> Result<Record, RecordError> {
        let parsed: Value =
            serde_json::from_slice(bytes).map_err(|e| RecordError::Json(e.to_string()))?;
        let obj = match parsed {
            Value::Object(map) => map,
            other => return Err(RecordError::Json(format!("expected object, got {other}"))),
        };

        let mut record = Record::default();

        match obj.get("timestamp") {
            None => {}
            Some(Value::Number(n)) => match n.as_f64() {
                Some(ts) => record.timestamp = ts,
                None => return Err(RecordError::Timestamp(n.to_string())),
            },
            Some(other) => return Err(RecordError::Timestamp(other.to_string())),
        }

        match obj.get("metric") {
            None => {}
            Some(Value::String(s)) if !s.is_empty() => record.metric = s.clone(),
            Some(other) => return Err(RecordError::Name(other.to_string())),
        }

        match obj.get("value") {
            None => {}
            Some(Value::Number(n)) => match n.as_f64() {
                Some(v) => record.value = v,
                None => return Err(RecordError::Value(n.to_string())),
            },
            Some(Value::String(s)) => match s.parse::<f64>() {
                Ok(v) => record.value = v,
                Err(_) => return Err(RecordError::Value(s.clone())),
            },
            Some(other) => return Err(RecordError::Value(other.to_string())),
        }

        match obj.get("tags") {
            None | Some(Value::Null) => {}
            Some(Value::Object(map)) => {
                for (k, v) in map {
                    match v {
                        Value::String(s) => {
                            record.tags.insert(k.clone(), s.clone());
                        }
                        other => return Err(RecordError::Tags(other.to_string())),
                    }
                }
            }
            Some(other) => return Err(RecordError::Tags(other.to_string())),
        }

        Ok(record)
    }

    /// Float-tolerant equality, for tests that round-trip through an
    /// encoding which may not preserve every bit of a double.
    pub fn approx_eq(&self, other: &Record) -> bool {
        const EPS: f64 = 1e-9;
        (self.timestamp - other.timestamp).abs() < EPS
            && (self.value - other.value).abs() < EPS
            && self.metric == other.metric
            && self.tags == other.tags
    }
}

// ---------------------------------------------------------------------------
// RecordBatch
// ---------------------------------------------------------------------------

/// The batch envelope sent to the consumer.
///
/// `control` is always `null` outbound; the field exists for wire
/// compatibility with consumers that multiplex control onto the same
/// envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct RecordBatch {
    pub control: Option<Value>,
    pub metrics: Vec<Record>,
}

impl RecordBatch {
    pub fn new(metrics: Vec<Record>) -> Self {
        RecordBatch {
            control: None,
            metrics,
        }
    }

    /// Serialize as the JSON wire form `{"control":null,"metrics":[...]}`.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("Illegal metric timestamp: {0}")]
    Timestamp(String),
    #[error("Illegal metric name: {0}")]
    Name(String),
    #[error("Illegal metric value: {0}")]
    Value(String),
    #[error("Illegal metric tags: {0}")]
    Tags(String),
    #[error("Invalid metric json: {0}")]
    Json(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Case {
        input: &'static str,
        // Prefix of the expected error Display, or "" for success.
        error: &'static str,
        expected: fn() -> Record,
    }

    fn empty() -> Record {
        Record::default()
    }

    #[test]
    fn from_json_field_rules() {
        let cases = [
            // timestamp
            Case { input: r#"{ "timestamp":"1.0"}"#, error: "Illegal metric timestamp:", expected: empty },
            Case { input: r#"{ "timestamp":""}"#, error: "Illegal metric timestamp:", expected: empty },
            Case { input: r#"{ "timestamp":[]}"#, error: "Illegal metric timestamp:", expected: empty },
            Case {
                input: r#"{ "timestamp":123456.00000}"#,
                error: "",
                expected: || Record { timestamp: 123456.0, ..Record::default() },
            },
            // metric name
            Case { input: r#"{ "metric":1}"#, error: "Illegal metric name:", expected: empty },
            Case { input: r#"{ "metric":[]}"#, error: "Illegal metric name:", expected: empty },
            Case { input: r#"{ "metric":""}"#, error: "Illegal metric name:", expected: empty },
            Case {
                input: r#"{ "metric":"1"}"#,
                error: "",
                expected: || Record { metric: "1".to_owned(), ..Record::default() },
            },
            // value
            Case { input: r#"{ "value":""}"#, error: "Illegal metric value:", expected: empty },
            Case { input: r#"{ "value":"a"}"#, error: "Illegal metric value:", expected: empty },
            Case { input: r#"{ "value":[]}"#, error: "Illegal metric value:", expected: empty },
            Case { input: r#"{ "value":{}}"#, error: "Illegal metric value:", expected: empty },
            Case {
                input: r#"{ "value":1}"#,
                error: "",
                expected: || Record { value: 1.0, ..Record::default() },
            },
            Case {
                input: r#"{ "value":1.0}"#,
                error: "",
                expected: || Record { value: 1.0, ..Record::default() },
            },
            Case {
                input: r#"{ "value":"1"}"#,
                error: "",
                expected: || Record { value: 1.0, ..Record::default() },
            },
            // tags
            Case { input: r#"{ "tags":1}"#, error: "Illegal metric tags:", expected: empty },
            Case { input: r#"{ "tags":""}"#, error: "Illegal metric tags:", expected: empty },
            Case { input: r#"{ "tags":"a"}"#, error: "Illegal metric tags:", expected: empty },
            Case { input: r#"{ "tags":[]}"#, error: "Illegal metric tags:", expected: empty },
            Case { input: r#"{ "tags":null}"#, error: "", expected: empty },
            Case { input: r#"{ "tags":{}}"#, error: "", expected: empty },
            Case {
                input: r#"{ "tags":{"1":"1","2":"2"}}"#,
                error: "",
                expected: || Record {
                    tags: BTreeMap::from([
                        ("1".to_owned(), "1".to_owned()),
                        ("2".to_owned(), "2".to_owned()),
                    ]),
                    ..Record::default()
                },
            },
            // a complete record
            Case {
                input: r#"{
                    "timestamp": 0,
                    "metric": "la",
                    "value": 15.25,
                    "tags": { "tenant_id": "XXX" }
                }"#,
                error: "",
                expected: || Record {
                    timestamp: 0.0,
                    metric: "la".to_owned(),
                    value: 15.25,
                    tags: BTreeMap::from([("tenant_id".to_owned(), "XXX".to_owned())]),
                    error: false,
                },
            },
        ];

        for case in &cases {
            match Record::from_json(case.input.as_bytes()) {
                Ok(actual) => {
                    assert!(
                        case.error.is_empty(),
                        "{}: expected error prefix {:?}, got {:?}",
                        case.input,
                        case.error,
                        actual
                    );
                    assert_eq!(actual, (case.expected)(), "{}", case.input);
                }
                Err(e) => {
                    assert!(
                        !case.error.is_empty(),
                        "{}: unexpected error {e}",
                        case.input
                    );
                    assert!(
                        e.to_string().starts_with(case.error),
                        "{}: expected error prefix {:?}, got {:?}",
                        case.input,
                        case.error,
                        e.to_string()
                    );
                }
            }
        }
    }

    #[test]
    fn from_json_rejects_non_objects() {
        assert!(Record::from_json(b"[1,2]").is_err());
        assert!(Record::from_json(b"not json at all").is_err());
        assert!(Record::from_json(b"{\"bad").is_err());
    }

    #[test]
    fn batch_envelope_has_null_control() {
        let batch = RecordBatch::new(vec![Record {
            timestamp: 1.5,
            metric: "cpu".to_owned(),
            value: 0.25,
            tags: BTreeMap::new(),
            error: false,
        }]);
        let json = batch.to_json().unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["control"], Value::Null);
        assert_eq!(value["metrics"][0]["metric"], "cpu");
        // The internal error flag never reaches the wire.
        assert!(value["metrics"][0].get("error").is_none());
    }

    #[test]
    fn json_round_trip_is_float_tolerant() {
        let original = Record {
            timestamp: 1401285855.123,
            metric: "df.bytes.free".to_owned(),
            value: 15.25,
            tags: BTreeMap::from([("device".to_owned(), "sda1".to_owned())]),
            error: false,
        };
        let json = serde_json::to_vec(&original).unwrap();
        let parsed = Record::from_json(&json).unwrap();
        assert!(parsed.approx_eq(&original));
    }
}
