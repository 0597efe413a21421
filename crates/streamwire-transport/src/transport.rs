use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};

/// Default buffer capacity for [`memory_pair`], in bytes.
pub const DEFAULT_MEMORY_CAPACITY: usize = 64 * 1024;

/// A connected, byte-oriented duplex channel.
///
/// `read`/`write` come from tokio's I/O traits. Connectivity is observed the
/// usual way: a read returning 0 bytes or any I/O error means the channel is
/// gone, and the session built on top flips its liveness flag.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Create two connected in-memory endpoints.
///
/// Bytes written to one end are readable from the other. Dropping either end
/// closes the channel for its peer.
pub fn memory_pair(capacity: usize) -> (DuplexStream, DuplexStream) {
    tokio::io::duplex(capacity)
}
