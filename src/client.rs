//! Blocking companion client.
//!
//! Writes one request frame and reads until a full response frame has
//! been decoded, using the same decoder as the server.

use std::io::{self, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use serde_json::json;
use tracing::{debug, trace};

use crate::error::{FrameError, Result};
use crate::protocol::{Frame, FrameDecoder, Message, Payload, DEFAULT_MAX_PAYLOAD_SIZE};

/// Content type used for opaque requests sent by the client binary.
pub const CLIENT_BINARY_CONTENT_TYPE: &str = "binary/custom-client-binary-type";

const READ_CHUNK_SIZE: usize = 4096;

/// Structured `{"action", "value"}` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub action: String,
    pub value: String,
}

impl SearchRequest {
    pub fn new(action: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            value: value.into(),
        }
    }

    pub fn search(value: impl Into<String>) -> Self {
        Self::new("search", value)
    }

    pub fn to_payload(&self) -> Payload {
        Payload::json(&json!({ "action": self.action, "value": self.value }))
    }
}

/// One TCP connection to a framewire server.
pub struct Client {
    stream: TcpStream,
    peer: SocketAddr,
    decoder: FrameDecoder,
}

impl Client {
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        debug!(peer = %peer, "Connected");

        Ok(Self {
            stream,
            peer,
            decoder: FrameDecoder::new(DEFAULT_MAX_PAYLOAD_SIZE),
        })
    }

    /// Bound each blocking read; `None` waits forever.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.stream.set_read_timeout(timeout)?;
        Ok(())
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Send `payload` and wait for the response frame.
    pub fn request(&mut self, payload: &Payload) -> Result<Frame> {
        self.exchange(payload).map(|(frame, _)| frame)
    }

    /// Run a `search` and return the `result` field of the reply.
    pub fn search(&mut self, value: &str) -> Result<String> {
        let (_, message) = self.exchange(&SearchRequest::search(value).to_payload())?;
        message
            .str_field("result")
            .map(str::to_owned)
            .ok_or_else(|| FrameError::MalformedPayload("response has no \"result\" string".into()))
    }

    fn exchange(&mut self, payload: &Payload) -> Result<(Frame, Message)> {
        let wire = payload.encode()?;
        self.stream.write_all(&wire)?;
        trace!(peer = %self.peer, bytes = wire.len(), "Sent request");

        loop {
            if self.decoder.advance()? {
                break;
            }
            match self.decoder.read_from(&mut self.stream, READ_CHUNK_SIZE) {
                Ok(0) => return Err(FrameError::PeerClosed),
                Ok(n) => trace!(peer = %self.peer, bytes = n, "Received"),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.decoder
            .take()
            .ok_or_else(|| FrameError::MalformedPayload("decoder lost the ready frame".into()))
    }
}
