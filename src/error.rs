//! Error types for framewire.
//!
//! Every variant is connection-local: the event loop tears down the
//! offending connection and keeps serving the others.

use thiserror::Error;

/// Errors raised while decoding, dispatching, or transporting one frame.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Metadata header bytes are not a JSON object or lack a required key.
    #[error("malformed header: {0}")]
    MalformedHeader(String),

    /// A `text/json` payload could not be decoded into a JSON object.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The declared `content-encoding` is not one we can decode.
    #[error("unsupported content encoding: {0:?}")]
    UnsupportedEncoding(String),

    /// The declared `content-length` exceeds the configured maximum.
    #[error("payload of {length} bytes exceeds maximum {max}")]
    PayloadTooLarge { length: usize, max: usize },

    /// The peer closed its end (zero-length read).
    #[error("peer closed")]
    PeerClosed,

    /// The message handler failed and no error payload could be produced.
    #[error("handler failure: {0}")]
    HandlerFailure(String),

    /// OS-level socket failure other than would-block.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}

impl FrameError {
    /// Whether this error is an orderly close rather than a failure.
    pub fn is_peer_closed(&self) -> bool {
        matches!(self, FrameError::PeerClosed)
    }
}

/// Result type alias using `FrameError`.
pub type Result<T> = std::result::Result<T, FrameError>;
