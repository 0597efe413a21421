//! Multiplexed request/response and content streaming over one duplex
//! connection.
//!
//! # Crate Structure
//!
//! - [`transport`]: byte-oriented duplex transports (UDS, in-memory)
//! - [`frame`]: fixed 20-byte-header frames and their tokio codec
//! - [`protocol`]: connections, requests, responses and content streams
//!   (behind the default `protocol` feature)

/// Re-export transport types.
pub mod transport {
    pub use streamwire_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use streamwire_frame::*;
}

/// Re-export protocol types (requires `protocol` feature).
#[cfg(feature = "protocol")]
pub mod protocol {
    pub use streamwire_protocol::*;
}
