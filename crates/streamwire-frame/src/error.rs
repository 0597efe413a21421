/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Fewer bytes than a complete header were supplied.
    #[error("truncated frame header ({len} bytes, need {need})", need = crate::header::HEADER_SIZE)]
    Truncated { len: usize },

    /// The type discriminant is not one of the known frame types.
    #[error("unknown frame type 0x{0:02x}")]
    UnknownFrameType(u8),

    /// The payload exceeds the configured maximum frame length.
    #[error("frame payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,
}

impl FrameError {
    /// True for errors that mean the byte stream itself is malformed.
    pub fn is_format_error(&self) -> bool {
        matches!(
            self,
            Self::Truncated { .. } | Self::UnknownFrameType(_) | Self::PayloadTooLarge { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
