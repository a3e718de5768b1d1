//! framewire: length-prefixed JSON-header frames over TCP.
//!
//! Each frame is a 2-byte big-endian metadata length, a JSON metadata
//! object, and the payload it describes. A single-threaded mio loop
//! decodes requests incrementally, hands them to a `MessageHandler`, and
//! writes the encoded reply back.

pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod runtime;

pub use client::{Client, SearchRequest};
pub use config::{Config, ConnectionMode};
pub use error::{FrameError, Result};
pub use handler::{HandlerError, MessageHandler, SearchHandler};
pub use protocol::{Frame, FrameDecoder, Message, Metadata, Payload, Phase};
pub use runtime::{Server, ShutdownHandle};
