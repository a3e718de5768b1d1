//! Decoded request/response bodies and the outbound payload triple.

use bytes::Bytes;
use serde_json::{Map, Value};

use super::frame::{self, Metadata, BINARY_ENCODING, JSON_CONTENT_TYPE, UTF8_ENCODING};
use crate::error::{FrameError, Result};

/// A decoded payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// `text/json` payload decoded into a JSON object.
    Structured(Map<String, Value>),
    /// Any other content type, passed through untouched.
    Opaque(Bytes),
}

impl Message {
    /// Decode `payload` as described by `metadata`.
    pub fn decode(metadata: &Metadata, payload: Bytes) -> Result<Self> {
        if !metadata.is_structured() {
            return Ok(Message::Opaque(payload));
        }

        if !is_utf8(&metadata.content_encoding) {
            return Err(FrameError::UnsupportedEncoding(
                metadata.content_encoding.clone(),
            ));
        }

        let text = std::str::from_utf8(&payload)
            .map_err(|e| FrameError::MalformedPayload(e.to_string()))?;
        match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => Ok(Message::Structured(map)),
            Ok(other) => Err(FrameError::MalformedPayload(format!(
                "expected a JSON object, got {other}"
            ))),
            Err(e) => Err(FrameError::MalformedPayload(e.to_string())),
        }
    }

    /// Look up a string field of a structured message.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        match self {
            Message::Structured(map) => map.get(key).and_then(Value::as_str),
            Message::Opaque(_) => None,
        }
    }

    pub fn as_structured(&self) -> Option<&Map<String, Value>> {
        match self {
            Message::Structured(map) => Some(map),
            Message::Opaque(_) => None,
        }
    }

    pub fn as_opaque(&self) -> Option<&Bytes> {
        match self {
            Message::Opaque(bytes) => Some(bytes),
            Message::Structured(_) => None,
        }
    }
}

/// Payload bytes together with the content type and encoding to advertise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub body: Bytes,
    pub content_type: String,
    pub content_encoding: String,
}

impl Payload {
    pub fn new(
        body: impl Into<Bytes>,
        content_type: impl Into<String>,
        content_encoding: impl Into<String>,
    ) -> Self {
        Self {
            body: body.into(),
            content_type: content_type.into(),
            content_encoding: content_encoding.into(),
        }
    }

    /// A `text/json` payload holding `value` encoded as UTF-8.
    pub fn json(value: &Value) -> Self {
        Self::new(value.to_string(), JSON_CONTENT_TYPE, UTF8_ENCODING)
    }

    /// An opaque payload with the given content type.
    pub fn binary(body: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        Self::new(body, content_type, BINARY_ENCODING)
    }

    /// Encode into wire bytes, rejecting type strings too long to frame.
    pub fn encode(&self) -> Result<Bytes> {
        frame::encode(&self.body, &self.content_type, &self.content_encoding)
    }
}

fn is_utf8(encoding: &str) -> bool {
    encoding.eq_ignore_ascii_case("utf-8") || encoding.eq_ignore_ascii_case("utf8")
}
