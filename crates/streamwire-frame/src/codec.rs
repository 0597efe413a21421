use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::error::{FrameError, Result};
use crate::header::{decode_header, encode_header, FrameHeader, FrameType, HEADER_SIZE};
use crate::id::StreamId;

/// Default maximum payload bytes per frame.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 4096;

/// Hard ceiling imposed by the 2-byte length field.
pub const MAX_FRAME_LENGTH_LIMIT: usize = u16::MAX as usize;

/// One frame: header fields plus payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub id: StreamId,
    /// Terminal frame for `id`.
    pub end: bool,
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(frame_type: FrameType, id: StreamId, end: bool, payload: impl Into<Bytes>) -> Self {
        Self {
            frame_type,
            id,
            end,
            payload: payload.into(),
        }
    }

    /// Empty terminal CancelStream frame for `id`.
    pub fn cancel_stream(id: StreamId) -> Self {
        Self::new(FrameType::CancelStream, id, true, Bytes::new())
    }

    /// Empty CancelAll frame. The id carries no meaning.
    pub fn cancel_all() -> Self {
        Self::new(FrameType::CancelAll, StreamId::from_bytes([0; 16]), true, Bytes::new())
    }

    /// Header describing this frame. Callers must have checked the payload
    /// against the frame length limit.
    pub fn header(&self) -> FrameHeader {
        FrameHeader {
            frame_type: self.frame_type,
            length: self.payload.len().min(MAX_FRAME_LENGTH_LIMIT) as u16,
            id: self.id,
            end: self.end,
        }
    }

    /// The total wire size of this frame (header + payload).
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Configuration for the frame codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload bytes per frame. Default: 4096, capped at 65535.
    pub max_frame_length: usize,
}

impl FrameConfig {
    pub fn new(max_frame_length: usize) -> Self {
        Self { max_frame_length }
    }

    /// Effective limit after applying the length-field ceiling.
    pub fn effective_max(&self) -> usize {
        self.max_frame_length.clamp(1, MAX_FRAME_LENGTH_LIMIT)
    }
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

/// `tokio_util` codec for [`Frame`]s.
///
/// Handles partial reads internally; the decoder only yields complete frames.
#[derive(Debug, Clone, Default)]
pub struct FrameCodec {
    config: FrameConfig,
}

impl FrameCodec {
    pub fn new(config: FrameConfig) -> Self {
        Self { config }
    }

    pub fn max_frame_length(&self) -> usize {
        self.config.effective_max()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < HEADER_SIZE {
            return Ok(None); // Need more data
        }

        let header = decode_header(&src[..HEADER_SIZE])?;
        let payload_len = usize::from(header.length);
        let max = self.max_frame_length();
        if payload_len > max {
            return Err(FrameError::PayloadTooLarge {
                size: payload_len,
                max,
            });
        }

        let total = HEADER_SIZE + payload_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None); // Need more data
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(payload_len).freeze();
        trace!(frame_type = ?header.frame_type, id = %header.id, end = header.end, len = payload_len, "decoded frame");

        Ok(Some(Frame {
            frame_type: header.frame_type,
            id: header.id,
            end: header.end,
            payload,
        }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(FrameError::ConnectionClosed),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let max = self.max_frame_length();
        if frame.payload.len() > max {
            return Err(FrameError::PayloadTooLarge {
                size: frame.payload.len(),
                max,
            });
        }
        dst.reserve(frame.wire_size());
        encode_header(&frame.header(), dst);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}
