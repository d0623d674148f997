// ms-protocol: Metric shipper wire types and encodings.
//
// Everything that crosses a process boundary lives here: the metric record
// and its strict JSON deserialization, the batch envelope, the consumer's
// control frames, and the dictionary-compressed binary frame format.

pub mod control;
pub mod dictionary;
pub mod encoding;
pub mod record;

pub use control::{ControlFrame, ControlKind};
pub use dictionary::Dictionary;
pub use encoding::{
    ProtocolError, decode_binary, decode_binary_snappy, encode_binary, encode_binary_snappy,
};
pub use record::{Record, RecordBatch, RecordError};
