//! Fixed-header framing for multiplexed streaming over one duplex connection.
//!
//! Every frame on the wire is a 20-byte header followed by its payload:
//! - 1 byte frame type (Request / Response / Stream / CancelStream / CancelAll)
//! - 2 byte little-endian payload length
//! - 16 byte stream id
//! - 1 byte end flag
//!
//! Frames carry no ordering across ids; frames for one id arrive in the
//! order they were written.

pub mod codec;
pub mod error;
pub mod header;
pub mod id;

pub use codec::{Frame, FrameCodec, FrameConfig, DEFAULT_MAX_FRAME_LENGTH, MAX_FRAME_LENGTH_LIMIT};
pub use error::{FrameError, Result};
pub use header::{decode_header, encode_header, FrameHeader, FrameType, HEADER_SIZE};
pub use id::StreamId;
