//! Attachment bodies that can be read while they are still being written.
//!
//! A [`ContentStream`] is the shared, cloneable read side; exactly one
//! [`ContentWriter`] appends to it. Each [`ContentReader`] keeps its own
//! cursor, so any number of readers observe the same growing sequence of
//! chunks. The same type backs outbound attachments (the application writes,
//! the disassembler reads) and inbound ones (the receiver writes, the
//! application reads).

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::{Bytes, BytesMut};
use streamwire_frame::StreamId;
use tokio::sync::Notify;

use crate::envelope::{StreamDescription, UNKNOWN_CONTENT_TYPE};
use crate::error::{ProtocolError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Open,
    Ended,
    Cancelled,
    Rejected { size: u64, max: u64 },
}

#[derive(Debug)]
struct State {
    chunks: Vec<Bytes>,
    written: u64,
    status: Status,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Read side of one attachment body.
#[derive(Debug, Clone)]
pub struct ContentStream {
    id: StreamId,
    content_type: Arc<str>,
    length: Option<u64>,
    shared: Arc<Shared>,
}

impl ContentStream {
    /// Create an empty open stream with a fresh id.
    ///
    /// `length` is the declared total when known up front; leave it `None`
    /// for chunked bodies, which end only when the writer calls `end`.
    pub fn channel(content_type: impl Into<String>, length: Option<u64>) -> (ContentWriter, Self) {
        Self::with_id(StreamId::new(), content_type, length)
    }

    pub(crate) fn with_id(
        id: StreamId,
        content_type: impl Into<String>,
        length: Option<u64>,
    ) -> (ContentWriter, Self) {
        let content_type: String = content_type.into();
        let content_type = if content_type.is_empty() {
            UNKNOWN_CONTENT_TYPE.to_string()
        } else {
            content_type
        };
        let stream = Self {
            id,
            content_type: content_type.into(),
            length,
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    chunks: Vec::new(),
                    written: 0,
                    status: Status::Open,
                }),
                notify: Notify::new(),
            }),
        };
        (
            ContentWriter {
                stream: stream.clone(),
            },
            stream,
        )
    }

    /// A complete, already-ended stream holding `body`.
    pub fn from_bytes(content_type: impl Into<String>, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        let (writer, stream) = Self::channel(content_type, Some(body.len() as u64));
        // A fresh stream is open, so neither call can fail.
        let _ = writer.append(body);
        writer.end();
        stream
    }

    /// Rebind to the metadata announced by an envelope, keeping the buffer.
    pub(crate) fn described_by(&self, description: &StreamDescription) -> Self {
        Self {
            id: self.id,
            content_type: description.content_type.as_str().into(),
            length: description.length,
            shared: Arc::clone(&self.shared),
        }
    }

    /// The same body under another id. Outbound attachments are sent under
    /// a fresh id per unit, so a forwarded stream never reuses the id it
    /// arrived with.
    pub(crate) fn rebound(&self, id: StreamId) -> Self {
        Self {
            id,
            content_type: Arc::clone(&self.content_type),
            length: self.length,
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Declared total length, if known.
    pub fn length(&self) -> Option<u64> {
        self.length
    }

    /// Description announced in the owning envelope.
    pub fn description(&self) -> StreamDescription {
        StreamDescription {
            id: self.id,
            content_type: self.content_type.to_string(),
            length: self.length,
        }
    }

    /// New reader positioned at the start of the body.
    pub fn reader(&self) -> ContentReader {
        ContentReader {
            stream: self.clone(),
            next_chunk: 0,
        }
    }

    /// Bytes appended so far.
    pub fn written(&self) -> u64 {
        self.shared.lock().written
    }

    pub fn is_ended(&self) -> bool {
        self.shared.lock().status == Status::Ended
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.lock().status == Status::Cancelled
    }

    /// True once no further bytes can arrive, for any reason.
    pub fn is_terminal(&self) -> bool {
        self.shared.lock().status != Status::Open
    }

    /// Cancel the stream, failing current and future reads.
    ///
    /// Returns `false` (and changes nothing) if the stream already reached a
    /// terminal state, including a normal end.
    pub fn cancel(&self) -> bool {
        self.finish(Status::Cancelled)
    }

    /// Fail the stream for exceeding the attachment ceiling and drop its data.
    pub(crate) fn reject(&self, size: u64, max: u64) -> bool {
        let rejected = self.finish(Status::Rejected { size, max });
        if rejected {
            self.shared.lock().chunks.clear();
        }
        rejected
    }

    fn finish(&self, status: Status) -> bool {
        {
            let mut state = self.shared.lock();
            if state.status != Status::Open {
                return false;
            }
            state.status = status;
        }
        self.shared.notify.notify_waiters();
        true
    }

    fn terminal_error(&self, status: Status) -> Option<ProtocolError> {
        match status {
            Status::Cancelled => Some(ProtocolError::StreamCancelled(self.id)),
            Status::Rejected { size, max } => Some(ProtocolError::PayloadTooLarge {
                id: self.id,
                size,
                max,
            }),
            Status::Open | Status::Ended => None,
        }
    }
}

/// The single write handle of a [`ContentStream`].
///
/// Dropping a writer that never called [`ContentWriter::end`] cancels the
/// stream so readers cannot mistake a truncated body for a complete one.
#[derive(Debug)]
pub struct ContentWriter {
    stream: ContentStream,
}

impl ContentWriter {
    pub fn stream(&self) -> &ContentStream {
        &self.stream
    }

    pub fn id(&self) -> StreamId {
        self.stream.id
    }

    /// Append bytes, waking every reader waiting at the written extent.
    pub fn append(&self, bytes: impl Into<Bytes>) -> Result<()> {
        let bytes = bytes.into();
        {
            let mut state = self.stream.shared.lock();
            match state.status {
                Status::Open => {}
                Status::Ended => return Err(ProtocolError::StreamEnded(self.stream.id)),
                other => {
                    return Err(self
                        .stream
                        .terminal_error(other)
                        .unwrap_or(ProtocolError::StreamCancelled(self.stream.id)))
                }
            }
            if bytes.is_empty() {
                return Ok(());
            }
            state.written += bytes.len() as u64;
            state.chunks.push(bytes);
        }
        self.stream.shared.notify.notify_waiters();
        Ok(())
    }

    /// Mark end-of-data. Idempotent; a no-op on cancelled streams.
    pub fn end(&self) {
        self.stream.finish(Status::Ended);
    }
}

impl Drop for ContentWriter {
    fn drop(&mut self) {
        self.stream.cancel();
    }
}

/// Independent cursor over a [`ContentStream`].
#[derive(Debug)]
pub struct ContentReader {
    stream: ContentStream,
    next_chunk: usize,
}

impl ContentReader {
    pub fn id(&self) -> StreamId {
        self.stream.id
    }

    /// Next chunk of the body.
    ///
    /// Suspends at the written extent until more bytes arrive or the stream
    /// ends. Returns `Ok(None)` at end-of-stream and
    /// [`ProtocolError::StreamCancelled`] once the stream is cancelled.
    pub async fn read(&mut self) -> Result<Option<Bytes>> {
        let shared = Arc::clone(&self.stream.shared);
        loop {
            let notified = shared.notify.notified();
            tokio::pin!(notified);
            // Register before inspecting state so an append between the check
            // and the await still wakes us.
            notified.as_mut().enable();

            if let Some(outcome) = self.try_read() {
                return outcome;
            }
            notified.await;
        }
    }

    /// Non-blocking variant of [`ContentReader::read`]; `None` means "would block".
    pub fn try_read(&mut self) -> Option<Result<Option<Bytes>>> {
        let state = self.stream.shared.lock();
        if let Some(err) = self.stream.terminal_error(state.status) {
            return Some(Err(err));
        }
        if let Some(chunk) = state.chunks.get(self.next_chunk) {
            self.next_chunk += 1;
            return Some(Ok(Some(chunk.clone())));
        }
        if state.status == Status::Ended {
            return Some(Ok(None));
        }
        None
    }

    /// Read until end-of-stream and return the whole body.
    pub async fn read_to_end(&mut self) -> Result<Bytes> {
        let mut body = BytesMut::new();
        while let Some(chunk) = self.read().await? {
            body.extend_from_slice(&chunk);
        }
        Ok(body.freeze())
    }
}
