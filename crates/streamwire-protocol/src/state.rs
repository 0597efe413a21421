use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::error::{ProtocolError, Result};

/// Liveness flag shared by every component of one connection.
///
/// Once the token is cancelled the connection never comes back; the first
/// recorded failure explains why.
#[derive(Debug, Clone, Default)]
pub struct ConnectionState {
    token: CancellationToken,
    failure: Arc<Mutex<Option<ProtocolError>>>,
}

impl ConnectionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_live(&self) -> bool {
        !self.token.is_cancelled()
    }

    pub fn ensure_live(&self) -> Result<()> {
        if self.is_live() {
            Ok(())
        } else {
            Err(ProtocolError::ConnectionClosed)
        }
    }

    /// Mark the connection dead because of `err`. Only the first failure is kept.
    pub fn fail(&self, err: ProtocolError) {
        {
            let mut failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
            if failure.is_none() && self.is_live() {
                *failure = Some(err);
            }
        }
        self.token.cancel();
    }

    /// Mark the connection dead without an error (local or remote cancel-all).
    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn failure(&self) -> Option<ProtocolError> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Resolves once the connection is no longer live.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }
}
