use bytes::{BufMut, BytesMut};

use crate::error::{FrameError, Result};
use crate::id::StreamId;

/// Frame header: type (1) + length (2) + id (16) + end (1) = 20 bytes.
pub const HEADER_SIZE: usize = 20;

const TYPE_OFFSET: usize = 0;
const LENGTH_OFFSET: usize = 1;
const ID_OFFSET: usize = 3;
const END_OFFSET: usize = 19;

/// Kind of logical unit a frame belongs to.
///
/// Discriminants are the ASCII tags used by the streaming protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Part of a request envelope.
    Request = b'A',
    /// Part of a response envelope.
    Response = b'B',
    /// Raw bytes of one attachment.
    Stream = b'S',
    /// Ask the peer to stop producing one stream.
    CancelStream = b'C',
    /// Tear down every unit on the connection.
    CancelAll = b'X',
}

impl FrameType {
    /// Wire discriminant.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// True for the two envelope-carrying kinds.
    pub fn is_envelope(self) -> bool {
        matches!(self, Self::Request | Self::Response)
    }
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            b'A' => Ok(Self::Request),
            b'B' => Ok(Self::Response),
            b'S' => Ok(Self::Stream),
            b'C' => Ok(Self::CancelStream),
            b'X' => Ok(Self::CancelAll),
            other => Err(FrameError::UnknownFrameType(other)),
        }
    }
}

/// Decoded fixed-width frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_type: FrameType,
    /// Payload byte count that follows the header.
    pub length: u16,
    pub id: StreamId,
    /// Terminal frame for `id`.
    pub end: bool,
}

/// Encode a header into the wire format.
///
/// ```text
/// ┌──────────┬─────────────┬──────────────┬──────────┐
/// │ Type (1B)│ Length (2B) │ Id (16B)     │ End (1B) │
/// │ A/B/S/C/X│ LE          │ 128-bit      │ 0 / 1    │
/// └──────────┴─────────────┴──────────────┴──────────┘
/// ```
pub fn encode_header(header: &FrameHeader, dst: &mut BytesMut) {
    dst.reserve(HEADER_SIZE);
    dst.put_u8(header.frame_type.as_u8());
    dst.put_u16_le(header.length);
    dst.put_slice(header.id.as_bytes());
    dst.put_u8(u8::from(header.end));
}

/// Decode a header from the first [`HEADER_SIZE`] bytes of `src`.
///
/// Fails only when `src` is too short or the type is unknown; length limits
/// are enforced by [`crate::FrameCodec`].
pub fn decode_header(src: &[u8]) -> Result<FrameHeader> {
    if src.len() < HEADER_SIZE {
        return Err(FrameError::Truncated { len: src.len() });
    }

    let frame_type = FrameType::try_from(src[TYPE_OFFSET])?;
    let length = u16::from_le_bytes([src[LENGTH_OFFSET], src[LENGTH_OFFSET + 1]]);
    let mut id = [0u8; 16];
    id.copy_from_slice(&src[ID_OFFSET..END_OFFSET]);
    let end = src[END_OFFSET] != 0;

    Ok(FrameHeader {
        frame_type,
        length,
        id: StreamId::from_bytes(id),
        end,
    })
}
