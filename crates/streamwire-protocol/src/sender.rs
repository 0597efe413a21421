use std::sync::Arc;
use std::time::Duration;

use futures_util::SinkExt;
use streamwire_frame::{Frame, FrameCodec, FrameConfig, FrameError};
use tokio::io::AsyncWrite;
use tokio::sync::Mutex;
use tokio_util::codec::FramedWrite;
use tracing::{debug, error};

use crate::error::{ProtocolError, Result};
use crate::state::ConnectionState;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Owns write access to the connection.
///
/// Any number of tasks may call [`PayloadSender::send_frame`] concurrently;
/// each frame is written whole under the lock, so frames of different ids
/// interleave only at frame boundaries.
pub struct PayloadSender {
    sink: Mutex<FramedWrite<BoxedWriter, FrameCodec>>,
    state: ConnectionState,
    max_frame_length: usize,
}

impl PayloadSender {
    pub fn new<W>(writer: W, config: FrameConfig, state: ConnectionState) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let max_frame_length = config.effective_max();
        let writer: BoxedWriter = Box::new(writer);
        Self {
            sink: Mutex::new(FramedWrite::new(writer, FrameCodec::new(config))),
            state,
            max_frame_length,
        }
    }

    /// Largest payload one frame may carry.
    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }

    /// Write one frame.
    ///
    /// An I/O failure is a [`ProtocolError::ConnectionWrite`] and marks the
    /// connection dead, which cancels every pending unit. Waiting for the
    /// lock or the write is abandoned as soon as the connection dies.
    pub async fn send_frame(&self, frame: Frame) -> Result<()> {
        self.state.ensure_live()?;

        let (frame_type, id, end, len) = (frame.frame_type, frame.id, frame.end, frame.payload.len());
        let write = async {
            let mut sink = self.sink.lock().await;
            sink.send(frame).await
        };

        let outcome = tokio::select! {
            biased;
            _ = self.state.closed() => return Err(ProtocolError::ConnectionClosed),
            outcome = write => outcome,
        };

        match outcome {
            Ok(()) => {
                debug!(?frame_type, %id, end, len, "frame sent");
                Ok(())
            }
            Err(FrameError::Io(io)) => {
                let err = ProtocolError::ConnectionWrite(Arc::new(io));
                error!(%id, error = %err, "connection write failed");
                self.state.fail(err.clone());
                Err(err)
            }
            Err(FrameError::ConnectionClosed) => {
                self.state.fail(ProtocolError::ConnectionClosed);
                Err(ProtocolError::ConnectionClosed)
            }
            // Encoding failures happen before any byte reaches the wire.
            Err(other) => Err(ProtocolError::from(other)),
        }
    }

    /// Flush and shut down the write half, best effort.
    pub async fn close(&self) {
        let close = async {
            let mut sink = self.sink.lock().await;
            sink.close().await
        };
        match tokio::time::timeout(CLOSE_TIMEOUT, close).await {
            Ok(Ok(())) => debug!("write half closed"),
            Ok(Err(err)) => debug!(error = %err, "write half close failed"),
            Err(_) => debug!("write half close timed out"),
        }
    }
}
