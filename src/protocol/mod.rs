//! Wire protocol: frame codec, incremental decoder, and message bodies.
//!
//! Pure byte transforms; socket I/O lives in `runtime`.

pub mod decoder;
pub mod frame;
pub mod message;

pub use decoder::{FrameDecoder, Phase, DEFAULT_MAX_PAYLOAD_SIZE};
pub use frame::{
    decode_frame, decode_metadata, encode, parse_header_map, Frame, Metadata,
    BINARY_ENCODING, FIXED_HEADER_LEN, JSON_CONTENT_TYPE, REQUIRED_KEYS, UTF8_ENCODING,
};
pub use message::{Message, Payload};
