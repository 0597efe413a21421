use std::sync::Arc;
use std::time::Duration;

use streamwire_frame::{FrameError, StreamId};

/// Errors surfaced by the streaming protocol.
///
/// Cloneable so that one connection failure can be handed to every waiter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    /// Malformed frame on the wire. Fatal to the connection.
    #[error("frame format error: {0}")]
    Frame(Arc<FrameError>),

    /// Writing to the transport failed. Fatal to the connection.
    #[error("connection write failed: {0}")]
    ConnectionWrite(Arc<std::io::Error>),

    /// Reading from the transport failed. Fatal to the connection.
    #[error("connection read failed: {0}")]
    ConnectionRead(Arc<std::io::Error>),

    /// The connection is no longer live.
    #[error("connection closed")]
    ConnectionClosed,

    /// A response arrived for an id with no pending request.
    #[error("no pending request for response {0}")]
    UnmatchedResponse(StreamId),

    /// No matching response arrived before the deadline.
    #[error("request timed out after {0:?}")]
    RequestTimeout(Duration),

    /// The pending operation was cancelled by connection teardown.
    #[error("operation cancelled")]
    Cancelled,

    /// The content stream was cancelled while being read or written.
    #[error("stream {0} cancelled")]
    StreamCancelled(StreamId),

    /// Append attempted on a stream that has already ended.
    #[error("stream {0} already ended")]
    StreamEnded(StreamId),

    /// An attachment or envelope exceeds its configured ceiling.
    #[error("payload for {id} too large ({size} bytes, max {max})")]
    PayloadTooLarge { id: StreamId, size: u64, max: u64 },

    /// An envelope could not be decoded or did not match its frame kind.
    #[error("malformed envelope: {0}")]
    Envelope(String),
}

impl ProtocolError {
    /// True when the error has torn down (or implies) a dead connection.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Frame(_) | Self::ConnectionWrite(_) | Self::ConnectionRead(_) | Self::ConnectionClosed
        )
    }
}

impl From<FrameError> for ProtocolError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(io) => Self::ConnectionRead(Arc::new(io)),
            FrameError::ConnectionClosed => Self::ConnectionClosed,
            other => Self::Frame(Arc::new(other)),
        }
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        Self::Envelope(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
