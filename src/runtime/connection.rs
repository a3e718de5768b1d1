//! Per-connection state machine.
//!
//! A connection reads until its decoder reports a complete request, then
//! produces exactly one response and drains it. The event loop decides
//! what happens after the drain (close, or recycle in persistent mode).
//!
//! I/O goes through `Read`/`Write` so the state machine can be driven by a
//! socket or by an in-memory stand-in.

use std::any::Any;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};

use bytes::{Buf, BytesMut};
use tracing::{error, trace, warn};

use crate::error::{FrameError, Result};
use crate::handler::{error_payload, HandlerError, MessageHandler};
use crate::protocol::{FrameDecoder, Message, Phase};

/// Outcome of one non-blocking read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// No bytes available right now.
    WouldBlock,
    /// Bytes were buffered but the request is not complete yet.
    NeedData,
    /// A complete request is decoded and waiting for a response.
    RequestReady,
}

/// Outcome of one non-blocking write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The socket accepted nothing this time.
    WouldBlock,
    /// Some bytes were sent, more remain.
    Partial(usize),
    /// The send buffer is empty and the response is complete.
    Drained,
}

/// A single client connection: receive decoder plus send buffer.
#[derive(Debug)]
pub struct Connection {
    peer: SocketAddr,
    decoder: FrameDecoder,
    send_buf: BytesMut,
    response_created: bool,
    read_chunk_size: usize,
    completed: u64,
}

impl Connection {
    /// Create a connection in the initial `AwaitingFixedHeader` phase.
    pub fn new(peer: SocketAddr, read_chunk_size: usize, max_payload_size: usize) -> Self {
        Self {
            peer,
            decoder: FrameDecoder::new(max_payload_size),
            send_buf: BytesMut::new(),
            response_created: false,
            read_chunk_size: read_chunk_size.max(1),
            completed: 0,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn phase(&self) -> Phase {
        self.decoder.phase()
    }

    /// The decoded request, once ready.
    pub fn request(&self) -> Option<&Message> {
        self.decoder.message()
    }

    pub fn response_created(&self) -> bool {
        self.response_created
    }

    /// Response bytes not yet accepted by the socket.
    pub fn pending_send(&self) -> &[u8] {
        &self.send_buf
    }

    /// Number of request/response cycles fully written.
    pub fn completed_cycles(&self) -> u64 {
        self.completed
    }

    /// Perform one read and advance the decoder.
    ///
    /// A zero-length read means the peer closed and yields `PeerClosed`.
    /// Interrupted reads are retried.
    pub fn receive<R: Read>(&mut self, reader: &mut R) -> Result<ReadOutcome> {
        loop {
            match self.decoder.read_from(reader, self.read_chunk_size) {
                Ok(0) => return Err(FrameError::PeerClosed),
                Ok(n) => {
                    trace!(peer = %self.peer, bytes = n, "Received");
                    break;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadOutcome::WouldBlock)
                }
                Err(e) => return Err(e.into()),
            }
        }

        if self.decoder.advance()? {
            Ok(ReadOutcome::RequestReady)
        } else {
            Ok(ReadOutcome::NeedData)
        }
    }

    /// Invoke the handler for the ready request and queue the encoded reply.
    ///
    /// Does nothing unless a request is ready and no response was produced
    /// for it yet. Returns `true` if the handler ran. A handler that returns
    /// an error or panics is answered with an error-result payload.
    pub fn respond<H: MessageHandler + ?Sized>(&mut self, handler: &mut H) -> Result<bool> {
        if self.response_created {
            return Ok(false);
        }
        let Some(request) = self.decoder.message() else {
            return Ok(false);
        };

        let payload = match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(request))) {
            Ok(Ok(payload)) => payload,
            Ok(Err(e)) => {
                warn!(peer = %self.peer, error = %e, "Handler failed");
                error_payload(&e)
            }
            Err(cause) => {
                let e = HandlerError::new(format!("handler panicked: {}", panic_message(&*cause)));
                error!(peer = %self.peer, error = %e, "Handler panicked");
                error_payload(&e)
            }
        };
        let wire = payload
            .encode()
            .map_err(|e| FrameError::HandlerFailure(e.to_string()))?;

        self.send_buf.extend_from_slice(&wire);
        self.response_created = true;
        Ok(true)
    }

    /// Perform one write from the front of the send buffer.
    ///
    /// Unsent bytes stay queued for the next call.
    pub fn send<W: Write>(&mut self, writer: &mut W) -> Result<WriteOutcome> {
        if self.send_buf.is_empty() {
            return Ok(if self.response_created {
                WriteOutcome::Drained
            } else {
                WriteOutcome::WouldBlock
            });
        }

        let n = loop {
            match writer.write(&self.send_buf) {
                Ok(0) => {
                    return Err(FrameError::Transport(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "write returned 0",
                    )));
                }
                Ok(n) => break n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(WriteOutcome::WouldBlock)
                }
                Err(e) => return Err(e.into()),
            }
        };

        self.send_buf.advance(n);
        trace!(peer = %self.peer, bytes = n, remaining = self.send_buf.len(), "Sent");

        if self.send_buf.is_empty() {
            self.completed += 1;
            Ok(WriteOutcome::Drained)
        } else {
            Ok(WriteOutcome::Partial(n))
        }
    }

    /// Start a new cycle after the response drained.
    ///
    /// Bytes the peer already pipelined are decoded immediately; returns
    /// `true` if they form another complete request.
    pub fn recycle(&mut self) -> Result<bool> {
        self.decoder.reset();
        self.response_created = false;
        self.decoder.advance()
    }
}

fn panic_message<'a>(cause: &'a (dyn Any + Send + 'static)) -> &'a str {
    if let Some(msg) = cause.downcast_ref::<&'static str>() {
        *msg
    } else if let Some(msg) = cause.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::SearchHandler;
    use crate::protocol::{decode_frame, encode, Payload, BINARY_ENCODING};
    use bytes::Bytes;
    use serde_json::json;
    use std::collections::VecDeque;

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn search_request(value: &str) -> Vec<u8> {
        Payload::json(&json!({"action": "search", "value": value}))
            .encode()
            .unwrap()
            .to_vec()
    }

    /// Reader handing out pre-scripted chunks, then `WouldBlock`.
    struct ScriptedReader {
        chunks: VecDeque<Vec<u8>>,
        eof: bool,
    }

    impl ScriptedReader {
        fn new(chunks: Vec<Vec<u8>>, eof: bool) -> Self {
            Self {
                chunks: chunks.into(),
                eof,
            }
        }
    }

    impl Read for ScriptedReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.chunks.pop_front() {
                Some(chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        self.chunks.push_front(chunk[n..].to_vec());
                    }
                    Ok(n)
                }
                None if self.eof => Ok(0),
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }
    }

    /// Writer accepting at most `limit` bytes per call and blocking on
    /// every other call.
    struct ThrottledWriter {
        limit: usize,
        written: Vec<u8>,
        block_next: bool,
    }

    impl Write for ThrottledWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let toggled = !self.block_next;
            if std::mem::replace(&mut self.block_next, toggled) {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.limit);
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_receive_until_ready() {
        let wire = search_request("morpheus");
        let mut conn = Connection::new(peer(), 4096, 1024);
        let mut reader = ScriptedReader::new(vec![wire[..3].to_vec(), wire[3..].to_vec()], false);

        assert_eq!(conn.receive(&mut reader).unwrap(), ReadOutcome::NeedData);
        assert_eq!(conn.phase(), Phase::AwaitingMetadata);
        assert_eq!(conn.receive(&mut reader).unwrap(), ReadOutcome::RequestReady);
        assert_eq!(conn.request().unwrap().str_field("value"), Some("morpheus"));
    }

    #[test]
    fn test_receive_would_block_is_noop() {
        let mut conn = Connection::new(peer(), 4096, 1024);
        let mut reader = ScriptedReader::new(Vec::new(), false);

        for _ in 0..3 {
            assert_eq!(conn.receive(&mut reader).unwrap(), ReadOutcome::WouldBlock);
            assert_eq!(conn.phase(), Phase::AwaitingFixedHeader);
        }
    }

    #[test]
    fn test_small_read_chunks() {
        let wire = search_request("ring");
        let mut conn = Connection::new(peer(), 1, 1024);
        let mut reader = ScriptedReader::new(vec![wire.clone()], false);

        let mut reads = 0;
        while conn.receive(&mut reader).unwrap() == ReadOutcome::NeedData {
            reads += 1;
        }
        assert_eq!(reads, wire.len() - 1);
        assert_eq!(conn.phase(), Phase::RequestReady);
    }

    #[test]
    fn test_peer_closed_before_metadata() {
        let wire = search_request("morpheus");
        let mut conn = Connection::new(peer(), 4096, 1024);
        let mut reader = ScriptedReader::new(vec![wire[..4].to_vec()], true);

        assert_eq!(conn.receive(&mut reader).unwrap(), ReadOutcome::NeedData);
        let err = conn.receive(&mut reader).unwrap_err();
        assert!(err.is_peer_closed());

        let mut calls = 0;
        let mut handler = |_: &Message| {
            calls += 1;
            Ok::<_, HandlerError>(Payload::binary(Bytes::new(), "binary/never"))
        };
        assert!(!conn.respond(&mut handler).unwrap());
        drop(handler);
        assert_eq!(calls, 0);
        assert!(conn.pending_send().is_empty());
    }

    #[test]
    fn test_partial_send_keeps_unsent_bytes() {
        let mut conn = Connection::new(peer(), 4096, 1024);
        let mut reader = ScriptedReader::new(vec![search_request("morpheus")], false);
        assert_eq!(conn.receive(&mut reader).unwrap(), ReadOutcome::RequestReady);

        assert!(conn.respond(&mut SearchHandler::new()).unwrap());
        let expected = conn.pending_send().to_vec();

        let mut writer = ThrottledWriter {
            limit: 7,
            written: Vec::new(),
            block_next: false,
        };
        let mut outcomes = Vec::new();
        loop {
            let outcome = conn.send(&mut writer).unwrap();
            outcomes.push(outcome);
            if outcome == WriteOutcome::Drained {
                break;
            }
            assert_eq!(
                conn.pending_send(),
                &expected[writer.written.len()..],
                "unsent tail must be preserved"
            );
        }

        assert!(outcomes.contains(&WriteOutcome::WouldBlock));
        assert!(outcomes.contains(&WriteOutcome::Partial(7)));
        assert_eq!(writer.written, expected);
        assert_eq!(conn.completed_cycles(), 1);

        let (frame, _) = decode_frame(&writer.written).unwrap().unwrap();
        let message = frame.message().unwrap();
        assert_eq!(
            message.str_field("result"),
            Some("Follow the white rabbit. \u{1f430}")
        );
    }

    #[test]
    fn test_respond_only_once_per_cycle() {
        let mut conn = Connection::new(peer(), 4096, 1024);
        let mut reader = ScriptedReader::new(vec![search_request("ring")], false);
        conn.receive(&mut reader).unwrap();

        let mut handler = SearchHandler::new();
        assert!(conn.respond(&mut handler).unwrap());
        let queued = conn.pending_send().len();
        assert!(!conn.respond(&mut handler).unwrap());
        assert_eq!(conn.pending_send().len(), queued);
    }

    #[test]
    fn test_handler_error_becomes_error_payload() {
        let mut conn = Connection::new(peer(), 4096, 1024);
        let mut reader = ScriptedReader::new(vec![search_request("ring")], false);
        conn.receive(&mut reader).unwrap();

        let mut failing = |_: &Message| Err::<Payload, _>(HandlerError::new("backend unavailable"));
        assert!(conn.respond(&mut failing).unwrap());

        let (frame, _) = decode_frame(conn.pending_send()).unwrap().unwrap();
        assert_eq!(
            frame.message().unwrap().str_field("result"),
            Some("Error: backend unavailable")
        );
    }

    #[test]
    fn test_handler_panic_becomes_error_payload() {
        let mut conn = Connection::new(peer(), 4096, 1024);
        let mut reader = ScriptedReader::new(vec![search_request("boom")], false);
        conn.receive(&mut reader).unwrap();

        let mut exploding = |request: &Message| -> std::result::Result<Payload, HandlerError> {
            panic!("cannot search for {:?}", request.str_field("value"));
        };
        assert!(conn.respond(&mut exploding).unwrap());
        assert!(conn.response_created());

        let (frame, _) = decode_frame(conn.pending_send()).unwrap().unwrap();
        let message = frame.message().unwrap();
        let result = message.as_structured().unwrap()["result"].as_str().unwrap();
        assert_eq!(result, "Error: handler panicked: cannot search for Some(\"boom\")");
    }

    #[test]
    fn test_interrupted_io_is_retried() {
        struct Interrupting<T> {
            inner: T,
            interrupt_next: bool,
        }

        impl<T: Read> Read for Interrupting<T> {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                if std::mem::replace(&mut self.interrupt_next, false) {
                    return Err(io::ErrorKind::Interrupted.into());
                }
                self.inner.read(buf)
            }
        }

        impl<T: Write> Write for Interrupting<T> {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                if std::mem::replace(&mut self.interrupt_next, false) {
                    return Err(io::ErrorKind::Interrupted.into());
                }
                self.inner.write(buf)
            }

            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut conn = Connection::new(peer(), 4096, 1024);
        let mut reader = Interrupting {
            inner: ScriptedReader::new(vec![search_request("ring")], false),
            interrupt_next: true,
        };
        assert_eq!(conn.receive(&mut reader).unwrap(), ReadOutcome::RequestReady);

        conn.respond(&mut SearchHandler::new()).unwrap();
        let mut writer = Interrupting {
            inner: Vec::new(),
            interrupt_next: true,
        };
        assert_eq!(conn.send(&mut writer).unwrap(), WriteOutcome::Drained);
        assert!(decode_frame(&writer.inner).unwrap().is_some());
    }

    #[test]
    fn test_unframeable_reply_is_handler_failure() {
        let mut conn = Connection::new(peer(), 4096, 1024);
        let mut reader = ScriptedReader::new(vec![search_request("ring")], false);
        conn.receive(&mut reader).unwrap();

        let huge_type = "x".repeat(70_000);
        let mut handler =
            move |_: &Message| Ok::<_, HandlerError>(Payload::binary(Bytes::new(), huge_type.clone()));
        assert!(matches!(
            conn.respond(&mut handler),
            Err(FrameError::HandlerFailure(_))
        ));
    }

    #[test]
    fn test_write_zero_is_transport_error() {
        struct Closed;
        impl Write for Closed {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Ok(0)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut conn = Connection::new(peer(), 4096, 1024);
        let mut reader = ScriptedReader::new(vec![search_request("ring")], false);
        conn.receive(&mut reader).unwrap();
        conn.respond(&mut SearchHandler::new()).unwrap();

        assert!(matches!(
            conn.send(&mut Closed),
            Err(FrameError::Transport(e)) if e.kind() == io::ErrorKind::WriteZero
        ));
    }

    #[test]
    fn test_recycle_decodes_pipelined_request() {
        let mut wire = search_request("morpheus");
        wire.extend_from_slice(&encode(b"raw bytes!", "binary/test", BINARY_ENCODING).unwrap());

        let mut conn = Connection::new(peer(), 4096, 1024);
        let mut reader = ScriptedReader::new(vec![wire], false);
        assert_eq!(conn.receive(&mut reader).unwrap(), ReadOutcome::RequestReady);

        let mut handler = SearchHandler::new();
        conn.respond(&mut handler).unwrap();
        let mut sink = Vec::new();
        assert_eq!(conn.send(&mut sink).unwrap(), WriteOutcome::Drained);

        assert!(conn.recycle().unwrap());
        assert!(!conn.response_created());
        assert_eq!(
            conn.request().unwrap().as_opaque().map(|b| &b[..]),
            Some(&b"raw bytes!"[..])
        );

        conn.respond(&mut handler).unwrap();
        assert_eq!(conn.send(&mut sink).unwrap(), WriteOutcome::Drained);
        assert_eq!(conn.completed_cycles(), 2);
        assert!(!conn.recycle().unwrap());
        assert_eq!(conn.phase(), Phase::AwaitingFixedHeader);
    }
}
