//! Full-duplex request/response and content streaming over one connection.
//!
//! Each side of a [`Connection`] can send requests and answer them.
//! Requests and responses carry a small JSON envelope plus any number of
//! attachments ([`ContentStream`]s). Everything travels as id-tagged frames,
//! so independent exchanges interleave freely on one transport and
//! attachments can be read while they are still arriving.
//!
//! ```no_run
//! use streamwire_protocol::{Connection, ConnectionConfig, Request};
//!
//! # async fn demo(socket: tokio::net::UnixStream) -> streamwire_protocol::Result<()> {
//! let conn = Connection::start(socket, ConnectionConfig::default());
//! let response = conn.send_request(Request::get("/version")).await?;
//! for stream in &response.streams {
//!     let body = stream.reader().read_to_end().await?;
//!     println!("{}", String::from_utf8_lossy(&body));
//! }
//! # Ok(())
//! # }
//! ```

pub mod assembler;
pub mod config;
pub mod connection;
pub mod content;
pub mod disassembler;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod message;
mod receiver;
pub mod request_manager;
pub mod sender;
pub mod state;
pub mod stream_manager;

pub use assembler::{Assembled, Assembler};
pub use config::{
    ConnectionConfig, DEFAULT_MAX_ATTACHMENT_SIZE, DEFAULT_MAX_ENVELOPE_SIZE,
    DEFAULT_REQUEST_TIMEOUT, DEFAULT_RETIRED_WINDOW,
};
pub use connection::Connection;
pub use content::{ContentReader, ContentStream, ContentWriter};
pub use disassembler::Disassembler;
pub use envelope::{
    Envelope, RequestEnvelope, ResponseEnvelope, StreamDescription, UNKNOWN_CONTENT_TYPE,
};
pub use error::{ProtocolError, Result};
pub use handler::{InboundRequest, RequestHandler};
pub use message::{
    Request, Response, STATUS_BAD_REQUEST, STATUS_INTERNAL_ERROR, STATUS_NOT_FOUND,
    STATUS_NOT_IMPLEMENTED, STATUS_OK,
};
pub use request_manager::{PendingResponse, RequestManager};
pub use sender::PayloadSender;
pub use state::ConnectionState;
pub use stream_manager::StreamManager;
pub use streamwire_frame::StreamId;
