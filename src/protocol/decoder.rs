//! Incremental frame decoder.
//!
//! Owns the receive buffer of one connection and walks a frame through
//! four strictly ordered phases:
//! - `AwaitingFixedHeader`: need 2 bytes
//! - `AwaitingMetadata`: need `metadata_length` bytes
//! - `AwaitingPayload`: need `content-length` bytes
//! - `RequestReady`: a decoded message is available
//!
//! Bytes beyond what the current phase needs stay buffered for the next one,
//! so a frame decodes identically however its bytes are chunked.

use std::io::{self, Read};

use bytes::{Buf, BytesMut};

use super::frame::{decode_metadata, Frame, Metadata, FIXED_HEADER_LEN};
use super::message::Message;
use crate::error::{FrameError, Result};

/// Default cap on a single payload (16 MB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Observable decoding phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitingFixedHeader,
    AwaitingMetadata,
    AwaitingPayload,
    RequestReady,
}

#[derive(Debug)]
enum DecodeState {
    AwaitingFixedHeader,
    AwaitingMetadata { len: usize },
    AwaitingPayload { metadata: Metadata },
    RequestReady { frame: Frame, message: Message },
}

/// Receive buffer plus parse progress for one frame at a time.
///
/// After `advance` returns an error the decoder is left at
/// `AwaitingFixedHeader` with an undefined buffer; callers tear the
/// connection down instead of reusing it.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    state: DecodeState,
    max_payload_size: usize,
}

impl FrameDecoder {
    pub fn new(max_payload_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            state: DecodeState::AwaitingFixedHeader,
            max_payload_size,
        }
    }

    /// Append bytes without advancing.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Append bytes and advance as far as they allow.
    ///
    /// Returns `true` once a request is ready.
    pub fn push(&mut self, data: &[u8]) -> Result<bool> {
        self.extend(data);
        self.advance()
    }

    /// Perform one read of at most `max_len` bytes into the buffer.
    ///
    /// Returns the number of bytes read; `0` means the reader hit EOF.
    /// Errors (including `WouldBlock`) are passed through untouched.
    pub fn read_from<R: Read>(&mut self, reader: &mut R, max_len: usize) -> io::Result<usize> {
        let start = self.buffer.len();
        self.buffer.resize(start + max_len, 0);
        let result = reader.read(&mut self.buffer[start..]);
        let n = *result.as_ref().unwrap_or(&0);
        self.buffer.truncate(start + n);
        result
    }

    /// Advance through as many phases as the buffered bytes allow.
    ///
    /// Calling this without new bytes is a no-op. Returns `true` once a
    /// request is ready.
    pub fn advance(&mut self) -> Result<bool> {
        loop {
            let state = std::mem::replace(&mut self.state, DecodeState::AwaitingFixedHeader);
            let (next, progressed) = self.step(state)?;
            self.state = next;

            if matches!(self.state, DecodeState::RequestReady { .. }) {
                return Ok(true);
            }
            if !progressed {
                return Ok(false);
            }
        }
    }

    fn step(&mut self, state: DecodeState) -> Result<(DecodeState, bool)> {
        match state {
            DecodeState::AwaitingFixedHeader => {
                if self.buffer.len() < FIXED_HEADER_LEN {
                    return Ok((state, false));
                }
                let len = usize::from(self.buffer.get_u16());
                Ok((DecodeState::AwaitingMetadata { len }, true))
            }
            DecodeState::AwaitingMetadata { len } => {
                if self.buffer.len() < len {
                    return Ok((DecodeState::AwaitingMetadata { len }, false));
                }
                let raw = self.buffer.split_to(len);
                let metadata = decode_metadata(&raw)?;
                if metadata.content_length > self.max_payload_size {
                    return Err(FrameError::PayloadTooLarge {
                        length: metadata.content_length,
                        max: self.max_payload_size,
                    });
                }
                Ok((DecodeState::AwaitingPayload { metadata }, true))
            }
            DecodeState::AwaitingPayload { metadata } => {
                if self.buffer.len() < metadata.content_length {
                    return Ok((DecodeState::AwaitingPayload { metadata }, false));
                }
                let payload = self.buffer.split_to(metadata.content_length).freeze();
                let frame = Frame { metadata, payload };
                let message = frame.message()?;
                Ok((DecodeState::RequestReady { frame, message }, true))
            }
            ready @ DecodeState::RequestReady { .. } => Ok((ready, false)),
        }
    }

    pub fn phase(&self) -> Phase {
        match self.state {
            DecodeState::AwaitingFixedHeader => Phase::AwaitingFixedHeader,
            DecodeState::AwaitingMetadata { .. } => Phase::AwaitingMetadata,
            DecodeState::AwaitingPayload { .. } => Phase::AwaitingPayload,
            DecodeState::RequestReady { .. } => Phase::RequestReady,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.phase() == Phase::RequestReady
    }

    /// Metadata of the frame in progress, once decoded.
    pub fn metadata(&self) -> Option<&Metadata> {
        match &self.state {
            DecodeState::AwaitingPayload { metadata } => Some(metadata),
            DecodeState::RequestReady { frame, .. } => Some(&frame.metadata),
            _ => None,
        }
    }

    /// The completed frame, if ready.
    pub fn frame(&self) -> Option<&Frame> {
        match &self.state {
            DecodeState::RequestReady { frame, .. } => Some(frame),
            _ => None,
        }
    }

    /// The decoded message, if ready.
    pub fn message(&self) -> Option<&Message> {
        match &self.state {
            DecodeState::RequestReady { message, .. } => Some(message),
            _ => None,
        }
    }

    /// Take the ready frame and start over, keeping any leftover bytes.
    pub fn take(&mut self) -> Option<(Frame, Message)> {
        match std::mem::replace(&mut self.state, DecodeState::AwaitingFixedHeader) {
            DecodeState::RequestReady { frame, message } => Some((frame, message)),
            other => {
                self.state = other;
                None
            }
        }
    }

    /// Return to `AwaitingFixedHeader`, keeping any leftover bytes.
    pub fn reset(&mut self) {
        self.state = DecodeState::AwaitingFixedHeader;
    }

    /// Bytes buffered but not yet consumed by a phase.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD_SIZE)
    }
}
