//! Byte-oriented duplex transport abstraction.
//!
//! The protocol layers above only need a channel that moves bytes in both
//! directions. Anything implementing tokio's `AsyncRead + AsyncWrite` is a
//! [`Transport`]; this crate additionally provides Unix domain sockets and an
//! in-memory pair for tests and in-process wiring.
//!
//! This is the lowest layer of streamwire.

pub mod error;
pub mod transport;

#[cfg(unix)]
pub mod uds;

pub use error::{Result, TransportError};
pub use transport::{memory_pair, Transport, DEFAULT_MEMORY_CAPACITY};

#[cfg(unix)]
pub use uds::UnixDomainSocket;
