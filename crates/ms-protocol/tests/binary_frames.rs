// Binary frame encoding: golden fixture, round-trip laws, and the
// cross-frame dictionary invariant.

use std::collections::HashMap;

use ms_protocol::{
    Dictionary, ProtocolError, Record, RecordBatch, decode_binary, decode_binary_snappy,
    encode_binary, encode_binary_snappy,
};

fn record(timestamp: f64, metric: &str, value: f64, tags: &[(&str, &str)]) -> Record {
    Record {
        timestamp,
        metric: metric.to_owned(),
        value,
        tags: tags
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect(),
        error: false,
    }
}

fn fixture_batch() -> RecordBatch {
    RecordBatch::new(vec![
        record(1.0, "foo", 2.0, &[]),
        record(3.0, "bar", 5.0, &[]),
        record(7.0, "baz", 11.0, &[]),
    ])
}

// Known-good frame for `fixture_batch` against a fresh dictionary:
// version 0, count 3, three untagged records, delta dict {1:foo,2:bar,3:baz}.
const GOLDEN_HEX: &str = "00000000033ff0000000000000000000\
                          01400000000000000000400800000000\
                          00000000000240140000000000000040\
                          1c000000000000000000034026000000\
                          000000007b2231223a22666f6f222c22\
                          32223a22626172222c2233223a226261\
                          7a227d";

fn golden_bytes() -> Vec<u8> {
    let hex: String = GOLDEN_HEX.chars().filter(|c| !c.is_whitespace()).collect();
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).unwrap())
        .collect()
}

#[test]
fn golden_fixture_is_byte_exact() {
    let dict = Dictionary::new();
    let frame = encode_binary(&fixture_batch(), &dict).unwrap();
    assert_eq!(frame, golden_bytes());
}

#[test]
fn golden_fixture_snappy_round_trips() {
    let dict = Dictionary::new();
    let frame = encode_binary_snappy(&fixture_batch(), &dict).unwrap();
    assert_ne!(frame, golden_bytes(), "snappy output should be compressed");

    let (decoded, _) = decode_binary_snappy(&frame, &HashMap::new()).unwrap();
    assert_eq!(decoded.metrics.len(), 3);
    for (got, want) in decoded.metrics.iter().zip(fixture_batch().metrics.iter()) {
        assert!(got.approx_eq(want));
    }
}

#[test]
fn decode_is_the_inverse_of_encode() {
    let dict = Dictionary::new();
    let batch = RecordBatch::new(vec![
        record(
            1401285855.0,
            "df.bytes.free",
            1073741824.0,
            &[("device", "sda1"), ("host", "alpha")],
        ),
        record(
            1401285856.5,
            "cpu.user",
            0.375,
            &[("host", "alpha")],
        ),
    ]);

    let frame = encode_binary(&batch, &dict).unwrap();
    let (decoded, deltas) = decode_binary(&frame, &HashMap::new()).unwrap();

    assert_eq!(decoded.metrics.len(), batch.metrics.len());
    for (got, want) in decoded.metrics.iter().zip(batch.metrics.iter()) {
        assert!(got.approx_eq(want), "{got:?} != {want:?}");
    }
    // Fresh dictionary: every referenced string is a delta.
    // foo strings: 2 names + host + alpha + device + sda1 = 6 distinct.
    assert_eq!(deltas.len(), 6);
}

#[test]
fn second_frame_carries_only_new_strings() {
    let dict = Dictionary::new();
    let first = RecordBatch::new(vec![record(1.0, "cpu.user", 0.5, &[("host", "alpha")])]);
    let second = RecordBatch::new(vec![record(2.0, "cpu.user", 0.75, &[("host", "beta")])]);

    let mut known: HashMap<u32, String> = HashMap::new();

    let frame1 = encode_binary(&first, &dict).unwrap();
    let (_, deltas1) = decode_binary(&frame1, &known).unwrap();
    known.extend(deltas1);
    assert_eq!(known.len(), 3); // cpu.user, host, alpha

    let frame2 = encode_binary(&second, &dict).unwrap();
    let (decoded2, deltas2) = decode_binary(&frame2, &known).unwrap();
    // Only "beta" is new on the second frame.
    assert_eq!(deltas2.len(), 1);
    assert_eq!(deltas2.values().next().unwrap(), "beta");
    assert!(decoded2.metrics[0].approx_eq(&second.metrics[0]));
}

#[test]
fn unknown_id_without_delta_is_an_error() {
    let dict = Dictionary::new();
    let batch = RecordBatch::new(vec![record(1.0, "cpu.user", 0.5, &[])]);
    let frame = encode_binary(&batch, &dict).unwrap();

    // Decoding with neither prior knowledge nor the frame's deltas fails.
    // Strip the delta JSON and replace it with an empty dictionary.
    let body_len = frame.len() - br#"{"1":"cpu.user"}"#.len();
    let mut stripped = frame[..body_len].to_vec();
    stripped.extend_from_slice(b"{}");

    match decode_binary(&stripped, &HashMap::new()) {
        Err(ProtocolError::UnknownId(1)) => {}
        other => panic!("expected UnknownId(1), got {other:?}"),
    }
}

#[test]
fn truncated_frames_are_rejected() {
    let dict = Dictionary::new();
    let frame = encode_binary(&fixture_batch(), &dict).unwrap();
    assert!(matches!(
        decode_binary(&frame[..10], &HashMap::new()),
        Err(ProtocolError::Truncated) | Err(ProtocolError::Json(_))
    ));
    assert!(matches!(
        decode_binary(&[], &HashMap::new()),
        Err(ProtocolError::Truncated)
    ));
}

#[test]
fn empty_batch_encodes_as_header_plus_empty_deltas() {
    let dict = Dictionary::new();
    let frame = encode_binary(&RecordBatch::new(vec![]), &dict).unwrap();
    // version + count + "{}"
    assert_eq!(frame, vec![0, 0, 0, 0, 0, b'{', b'}']);
    let (decoded, deltas) = decode_binary(&frame, &HashMap::new()).unwrap();
    assert!(decoded.metrics.is_empty());
    assert!(deltas.is_empty());
}

#[test]
fn tag_map_uses_deterministic_wire_order() {
    // BTreeMap ordering makes two encodings of the same record identical.
    let batch = RecordBatch::new(vec![record(
        9.0,
        "net.if.in",
        100.0,
        &[("zz", "1"), ("aa", "2"), ("mm", "3")],
    )]);
    let a = encode_binary(&batch, &Dictionary::new()).unwrap();
    let b = encode_binary(&batch, &Dictionary::new()).unwrap();
    assert_eq!(a, b);
}
