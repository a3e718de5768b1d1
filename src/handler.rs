//! Message handlers.
//!
//! The event loop hands every decoded request to a `MessageHandler` and
//! encodes whatever `Payload` comes back. Handlers run on the loop thread,
//! so they must not block.

use serde_json::json;
use thiserror::Error;

use crate::protocol::{Message, Payload};

/// Failure reported by a handler.
///
/// The loop turns this into an error-result payload for the peer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Turns a decoded request into a response payload.
pub trait MessageHandler {
    fn handle(&mut self, request: &Message) -> Result<Payload, HandlerError>;
}

impl<F> MessageHandler for F
where
    F: FnMut(&Message) -> Result<Payload, HandlerError>,
{
    fn handle(&mut self, request: &Message) -> Result<Payload, HandlerError> {
        self(request)
    }
}

/// Error-result payload sent when a handler fails.
pub fn error_payload(err: &HandlerError) -> Payload {
    Payload::json(&json!({ "result": format!("Error: {err}") }))
}

/// Content type of the binary reply produced by `SearchHandler`.
pub const SERVER_BINARY_CONTENT_TYPE: &str = "binary/custom-server-binary-type";

/// Demonstration handler answering `search` actions from a fixed table.
///
/// - `{"action": "search", "value": q}` answers `{"result": <answer>}`
/// - any other action answers `{"result": "Error: invalid action ..."}`
/// - opaque requests echo their first 10 bytes back as binary
#[derive(Debug, Clone)]
pub struct SearchHandler {
    entries: Vec<(String, String)>,
}

impl SearchHandler {
    pub fn new() -> Self {
        Self::with_entries([
            ("morpheus", "Follow the white rabbit. \u{1f430}"),
            ("ring", "In the caves beneath the Misty Mountains. \u{1f48d}"),
            ("\u{1f436}", "\u{1f43e} Playing ball! \u{1f3d0}"),
        ])
    }

    pub fn with_entries<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Answer for `query`, or a "no match" sentence.
    pub fn lookup(&self, query: &str) -> String {
        self.entries
            .iter()
            .find(|(key, _)| key == query)
            .map(|(_, answer)| answer.clone())
            .unwrap_or_else(|| format!("No match for \"{query}\"."))
    }
}

impl Default for SearchHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageHandler for SearchHandler {
    fn handle(&mut self, request: &Message) -> Result<Payload, HandlerError> {
        match request {
            Message::Structured(map) => {
                let action = map.get("action").and_then(|v| v.as_str());
                let result = match action {
                    Some("search") => {
                        let query = map
                            .get("value")
                            .and_then(|v| v.as_str())
                            .ok_or_else(|| HandlerError::new("search requires a string \"value\""))?;
                        self.lookup(query)
                    }
                    Some(other) => format!("Error: invalid action \"{other}\"."),
                    None => "Error: invalid action \"None\".".to_string(),
                };
                Ok(Payload::json(&json!({ "result": result })))
            }
            Message::Opaque(bytes) => {
                let head = &bytes[..bytes.len().min(10)];
                let mut body = b"First 10 bytes of request: ".to_vec();
                body.extend_from_slice(head);
                Ok(Payload::binary(body, SERVER_BINARY_CONTENT_TYPE))
            }
        }
    }
}
