//! Frame codec: the three-part wire frame.
//!
//! ```text
//! [2 bytes: metadata_length][metadata_length bytes: JSON object][content-length bytes: payload]
//! ```
//!
//! The metadata object must carry `byteorder`, `content-length`,
//! `content-type` and `content-encoding`. Extra keys are ignored.

use bytes::{BufMut, Bytes, BytesMut};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::message::Message;
use crate::error::{FrameError, Result};

/// Size of the big-endian length prefix in front of the metadata header.
pub const FIXED_HEADER_LEN: usize = 2;

/// Content type whose payload is decoded as a JSON object.
pub const JSON_CONTENT_TYPE: &str = "text/json";

/// Encoding used for JSON metadata and JSON payloads.
pub const UTF8_ENCODING: &str = "utf-8";

/// Encoding tag for opaque payloads.
pub const BINARY_ENCODING: &str = "binary";

/// Keys every metadata header must contain.
pub const REQUIRED_KEYS: [&str; 4] = [
    "byteorder",
    "content-length",
    "content-type",
    "content-encoding",
];

/// Decoded metadata header.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Metadata {
    /// Byte order of the sender. Informational only.
    pub byteorder: String,
    #[serde(rename = "content-type")]
    pub content_type: String,
    #[serde(rename = "content-encoding")]
    pub content_encoding: String,
    /// Exact payload length in bytes.
    #[serde(rename = "content-length")]
    pub content_length: usize,
}

impl Metadata {
    /// Metadata describing a payload of `content_length` bytes sent from this machine.
    pub fn new(content_length: usize, content_type: &str, content_encoding: &str) -> Self {
        Self {
            byteorder: native_byteorder().to_string(),
            content_type: content_type.to_string(),
            content_encoding: content_encoding.to_string(),
            content_length,
        }
    }

    /// Validate an untyped header map.
    ///
    /// Fails with `MalformedHeader` naming the first missing key, or when a
    /// value has the wrong type.
    pub fn from_map(map: Map<String, Value>) -> Result<Self> {
        if let Some(missing) = REQUIRED_KEYS.iter().find(|key| !map.contains_key(**key)) {
            return Err(FrameError::MalformedHeader(format!(
                "missing required header {missing:?}"
            )));
        }
        serde_json::from_value(Value::Object(map))
            .map_err(|e| FrameError::MalformedHeader(e.to_string()))
    }

    /// Whether the payload should be decoded as a JSON object.
    pub fn is_structured(&self) -> bool {
        self.content_type == JSON_CONTENT_TYPE
    }

    fn to_json(&self) -> Value {
        json!({
            "byteorder": self.byteorder,
            "content-type": self.content_type,
            "content-encoding": self.content_encoding,
            "content-length": self.content_length,
        })
    }
}

/// One complete frame: metadata plus exactly `content-length` payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub metadata: Metadata,
    pub payload: Bytes,
}

impl Frame {
    /// Decode the payload according to its content type.
    pub fn message(&self) -> Result<Message> {
        Message::decode(&self.metadata, self.payload.clone())
    }
}

/// Byte-order tag of the local machine.
pub fn native_byteorder() -> &'static str {
    if cfg!(target_endian = "big") {
        "big"
    } else {
        "little"
    }
}

/// Encode a payload into wire bytes, failing if the metadata header does
/// not fit the 2-byte length prefix.
pub fn encode(payload: &[u8], content_type: &str, content_encoding: &str) -> Result<Bytes> {
    let metadata = Metadata::new(payload.len(), content_type, content_encoding);
    let header = metadata.to_json().to_string();
    let header_len = u16::try_from(header.len()).map_err(|_| {
        FrameError::MalformedHeader(format!(
            "metadata header of {} bytes exceeds length prefix",
            header.len()
        ))
    })?;

    let mut out = BytesMut::with_capacity(FIXED_HEADER_LEN + header.len() + payload.len());
    out.put_u16(header_len);
    out.put_slice(header.as_bytes());
    out.put_slice(payload);
    Ok(out.freeze())
}

/// Parse metadata bytes into an untyped map.
///
/// Zero bytes decode to an empty map.
pub fn parse_header_map(bytes: &[u8]) -> Result<Map<String, Value>> {
    if bytes.is_empty() {
        return Ok(Map::new());
    }
    let text = std::str::from_utf8(bytes)
        .map_err(|e| FrameError::MalformedHeader(format!("metadata is not UTF-8: {e}")))?;
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(FrameError::MalformedHeader(format!(
            "metadata is not an object: {other}"
        ))),
        Err(e) => Err(FrameError::MalformedHeader(e.to_string())),
    }
}

/// Decode and validate metadata header bytes.
pub fn decode_metadata(bytes: &[u8]) -> Result<Metadata> {
    Metadata::from_map(parse_header_map(bytes)?)
}

/// Decode one complete frame from the front of `input`.
///
/// Returns `Ok(None)` if `input` does not yet hold a whole frame, otherwise
/// the frame and the number of bytes it occupied.
pub fn decode_frame(input: &[u8]) -> Result<Option<(Frame, usize)>> {
    if input.len() < FIXED_HEADER_LEN {
        return Ok(None);
    }
    let header_len = usize::from(u16::from_be_bytes([input[0], input[1]]));
    let header_end = FIXED_HEADER_LEN + header_len;
    if input.len() < header_end {
        return Ok(None);
    }
    let metadata = decode_metadata(&input[FIXED_HEADER_LEN..header_end])?;
    let frame_end = header_end + metadata.content_length;
    if input.len() < frame_end {
        return Ok(None);
    }
    let payload = Bytes::copy_from_slice(&input[header_end..frame_end]);
    Ok(Some((Frame { metadata, payload }, frame_end)))
}
