//! Failures while setting up a byte channel.
//!
//! Once a channel is connected, read and write failures belong to the
//! protocol layer; nothing here describes a live connection.

use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The socket path does not fit in `sockaddr_un`.
    #[error("socket path {path:?} is {len} bytes; this platform allows at most {max}")]
    PathTooLong {
        path: PathBuf,
        len: usize,
        max: usize,
    },

    /// Something other than a socket occupies the path. It is left in place.
    #[error("refusing to replace {path:?}: not a unix socket")]
    NotASocket { path: PathBuf },

    #[error("cannot listen on {path:?}: {source}")]
    Bind { path: PathBuf, source: io::Error },

    /// The listener exists but its permission bits could not be applied.
    #[error("cannot set mode {mode:o} on {path:?}: {source}")]
    Permissions {
        path: PathBuf,
        mode: u32,
        source: io::Error,
    },

    #[error("no streamwire peer reachable at {path:?}: {source}")]
    Connect { path: PathBuf, source: io::Error },

    #[error("accepting a peer failed: {0}")]
    Accept(#[source] io::Error),
}

impl TransportError {
    /// The socket path involved, if the failure concerns one.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::PathTooLong { path, .. }
            | Self::NotASocket { path }
            | Self::Bind { path, .. }
            | Self::Permissions { path, .. }
            | Self::Connect { path, .. } => Some(path),
            Self::Accept(_) => None,
        }
    }

    /// The operating-system error underneath, if any.
    pub fn io_error(&self) -> Option<&io::Error> {
        match self {
            Self::Bind { source, .. }
            | Self::Permissions { source, .. }
            | Self::Connect { source, .. }
            | Self::Accept(source) => Some(source),
            Self::PathTooLong { .. } | Self::NotASocket { .. } => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
