use std::fmt;
use std::io;

use streamwire_protocol::ProtocolError;
use streamwire_transport::TransportError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

fn io_code(err: &io::Error) -> i32 {
    match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound => FAILURE,
        _ => INTERNAL,
    }
}

pub fn io_error(context: &str, err: &io::Error) -> CliError {
    CliError::new(io_code(err), format!("{context}: {err}"))
}

/// OS failures map by kind; path problems are transport errors.
pub fn transport_error(context: &str, err: TransportError) -> CliError {
    let code = err.io_error().map_or(TRANSPORT_ERROR, io_code);
    CliError::new(code, format!("{context}: {err}"))
}

pub fn protocol_error(context: &str, err: ProtocolError) -> CliError {
    let code = match &err {
        ProtocolError::RequestTimeout(_) => TIMEOUT,
        ProtocolError::ConnectionWrite(_)
        | ProtocolError::ConnectionRead(_)
        | ProtocolError::ConnectionClosed => TRANSPORT_ERROR,
        ProtocolError::Frame(_)
        | ProtocolError::Envelope(_)
        | ProtocolError::PayloadTooLarge { .. } => DATA_INVALID,
        ProtocolError::Cancelled
        | ProtocolError::StreamCancelled(_)
        | ProtocolError::UnmatchedResponse(_) => FAILURE,
        ProtocolError::StreamEnded(_) => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}
