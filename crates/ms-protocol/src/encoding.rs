//! Binary frame encoding.
//!
//! Big-endian layout:
//!
//! ```text
//!  i8   api_version          = 0
//!  i32  metric_count
//!  repeated metric_count times:
//!    f64 timestamp
//!    i32 metric_name_id      (dictionary id)
//!    f64 value
//!    i8  tag_count
//!    repeated tag_count times:
//!      i32 tag_key_id
//!      i32 tag_value_id
//!  JSON delta_dictionary     { "id": "string", ... }  -- appended, UTF-8
//! ```
//!
//! The delta dictionary carries exactly the strings first assigned while
//! encoding this frame, so a consumer that has seen every prior frame on
//! the connection can always resolve every id.

use std::collections::{BTreeMap, HashMap};

use crate::dictionary::Dictionary;
use crate::record::{Record, RecordBatch};

pub const API_VERSION: u8 = 0;

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encode a batch against `dict`, appending the delta dictionary entries
/// assigned during this call.
pub fn encode_binary(batch: &RecordBatch, dict: &Dictionary) -> Result<Vec<u8>, ProtocolError> {
    let mut deltas: BTreeMap<u32, String> = BTreeMap::new();
    let mut translate = |s: &str| {
        let (id, new) = dict.translate(s);
        if new {
            deltas.insert(id, s.to_owned());
        }
        id
    };

    let mut buf = Vec::new();
    buf.push(API_VERSION);
    buf.extend_from_slice(&(batch.metrics.len() as i32).to_be_bytes());
    for record in &batch.metrics {
        buf.extend_from_slice(&record.timestamp.to_be_bytes());
        buf.extend_from_slice(&translate(&record.metric).to_be_bytes());
        buf.extend_from_slice(&record.value.to_be_bytes());
        buf.push(record.tags.len() as u8);
        for (key, value) in &record.tags {
            buf.extend_from_slice(&translate(key).to_be_bytes());
            buf.extend_from_slice(&translate(value).to_be_bytes());
        }
    }
    let json = serde_json::to_vec(&deltas)?;
    buf.extend_from_slice(&json);
    Ok(buf)
}

/// `encode_binary`, then snappy-compress the whole frame.
pub fn encode_binary_snappy(
    batch: &RecordBatch,
    dict: &Dictionary,
) -> Result<Vec<u8>, ProtocolError> {
    let raw = encode_binary(batch, dict)?;
    Ok(snap::raw::Encoder::new().compress_vec(&raw)?)
}

// ---------------------------------------------------------------------------
// Decoding (tests and the mock consumer)
// ---------------------------------------------------------------------------

/// Decode a binary frame.
///
/// `known` holds the id→string entries accumulated from prior frames on the
/// same connection.  Returns the batch and the frame's delta entries; the
/// caller is expected to fold the deltas into `known` before the next frame.
pub fn decode_binary(
    frame: &[u8],
    known: &HashMap<u32, String>,
) -> Result<(RecordBatch, BTreeMap<u32, String>), ProtocolError> {
    let mut cursor = Cursor { buf: frame, pos: 0 };

    let version = cursor.u8()?;
    if version != API_VERSION {
        return Err(ProtocolError::Version(version));
    }
    let count = cursor.i32()?;
    if count < 0 {
        return Err(ProtocolError::Truncated);
    }

    // Two passes over the id space: the body must be walked to find where
    // the delta JSON starts, but ids can only be resolved once the deltas
    // are parsed.
    struct RawRecord {
        timestamp: f64,
        name_id: u32,
        value: f64,
        tags: Vec<(u32, u32)>,
    }
    let mut raw = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let timestamp = cursor.f64()?;
        let name_id = cursor.u32()?;
        let value = cursor.f64()?;
        let tag_count = cursor.u8()?;
        let mut tags = Vec::with_capacity(tag_count as usize);
        for _ in 0..tag_count {
            tags.push((cursor.u32()?, cursor.u32()?));
        }
        raw.push(RawRecord {
            timestamp,
            name_id,
            value,
            tags,
        });
    }

    let deltas: BTreeMap<u32, String> = serde_json::from_slice(cursor.rest())?;
    let resolve = |id: u32| -> Result<String, ProtocolError> {
        deltas
            .get(&id)
            .or_else(|| known.get(&id))
            .cloned()
            .ok_or(ProtocolError::UnknownId(id))
    };

    let mut metrics = Vec::with_capacity(raw.len());
    for r in raw {
        let mut tags = BTreeMap::new();
        for (key_id, value_id) in r.tags {
            tags.insert(resolve(key_id)?, resolve(value_id)?);
        }
        metrics.push(Record {
            timestamp: r.timestamp,
            metric: resolve(r.name_id)?,
            value: r.value,
            tags,
            error: false,
        });
    }

    Ok((RecordBatch::new(metrics), deltas))
}

/// Snappy-decompress, then `decode_binary`.
pub fn decode_binary_snappy(
    frame: &[u8],
    known: &HashMap<u32, String>,
) -> Result<(RecordBatch, BTreeMap<u32, String>), ProtocolError> {
    let raw = snap::raw::Decoder::new().decompress_vec(frame)?;
    decode_binary(&raw, known)
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unsupported frame version {0}")]
    Version(u8),
    #[error("truncated binary frame")]
    Truncated,
    #[error("id {0} not present in the translation dictionary")]
    UnknownId(u32),
    #[error("delta dictionary: {0}")]
    Json(#[from] serde_json::Error),
    #[error("snappy: {0}")]
    Snappy(#[from] snap::Error),
}

// ---------------------------------------------------------------------------
// Cursor
// ---------------------------------------------------------------------------

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.pos + n > self.buf.len() {
            return Err(ProtocolError::Truncated);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().expect("4 bytes")))
    }

    fn i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(i32::from_be_bytes(self.take(4)?.try_into().expect("4 bytes")))
    }

    fn f64(&mut self) -> Result<f64, ProtocolError> {
        Ok(f64::from_be_bytes(self.take(8)?.try_into().expect("8 bytes")))
    }

    fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}
