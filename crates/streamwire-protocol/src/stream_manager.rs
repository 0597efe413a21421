use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use streamwire_frame::{Frame, StreamId};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::content::ContentStream;
use crate::error::Result;
use crate::request_manager::RequestManager;
use crate::sender::PayloadSender;
use crate::state::ConnectionState;

type StreamMap = HashMap<StreamId, ContentStream>;

/// Tracks the content streams currently in flight and owns cancellation at
/// stream and connection granularity.
///
/// Streams we send and streams we receive live in separate maps: an
/// attachment forwarded from one direction to the other is registered twice
/// under two ids, and finishing one side never untracks the other.
pub struct StreamManager {
    outbound: Mutex<StreamMap>,
    inbound: Mutex<StreamMap>,
    /// Inbound ids abandoned locally; the read loop drops their buffers.
    discarded_tx: mpsc::UnboundedSender<StreamId>,
    discarded_rx: Mutex<Option<mpsc::UnboundedReceiver<StreamId>>>,
    sender: Arc<PayloadSender>,
    requests: Arc<RequestManager>,
    state: ConnectionState,
}

fn lock(map: &Mutex<StreamMap>) -> MutexGuard<'_, StreamMap> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

impl StreamManager {
    pub fn new(
        sender: Arc<PayloadSender>,
        requests: Arc<RequestManager>,
        state: ConnectionState,
    ) -> Self {
        let (discarded_tx, discarded_rx) = mpsc::unbounded_channel();
        Self {
            outbound: Mutex::new(HashMap::new()),
            inbound: Mutex::new(HashMap::new()),
            discarded_tx,
            discarded_rx: Mutex::new(Some(discarded_rx)),
            sender,
            requests,
            state,
        }
    }

    /// Start tracking an attachment we are about to send. Streams
    /// registered after teardown are cancelled on the spot.
    pub fn track_outbound(&self, stream: &ContentStream) {
        if !self.state.is_live() {
            stream.cancel();
            return;
        }
        lock(&self.outbound).insert(stream.id(), stream.clone());
    }

    /// Start tracking an attachment the peer is sending us.
    pub fn track_inbound(&self, stream: &ContentStream) {
        if !self.state.is_live() {
            stream.cancel();
            return;
        }
        lock(&self.inbound).insert(stream.id(), stream.clone());
    }

    pub fn untrack_outbound(&self, id: StreamId) -> Option<ContentStream> {
        lock(&self.outbound).remove(&id)
    }

    pub fn untrack_inbound(&self, id: StreamId) -> Option<ContentStream> {
        lock(&self.inbound).remove(&id)
    }

    /// Whether outbound stream `id` should keep streaming.
    pub fn is_sending(&self, id: StreamId) -> bool {
        lock(&self.outbound).contains_key(&id)
    }

    pub fn is_receiving(&self, id: StreamId) -> bool {
        lock(&self.inbound).contains_key(&id)
    }

    pub fn active_count(&self) -> usize {
        lock(&self.outbound).len() + lock(&self.inbound).len()
    }

    /// Hand the discarded-id feed to the read loop. Yields `Some` once.
    pub(crate) fn take_discarded(&self) -> Option<mpsc::UnboundedReceiver<StreamId>> {
        self.discarded_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn discard_inbound(&self, stream: &ContentStream) -> bool {
        let cancelled = stream.cancel();
        // The receiver is gone only after teardown, when nothing is buffered.
        let _ = self.discarded_tx.send(stream.id());
        cancelled
    }

    /// Cancel stream `id` locally and ask the peer to stop it.
    ///
    /// Returns whether a tracked, still-open local stream was cancelled. The
    /// CancelStream frame is sent either way.
    pub async fn cancel_stream(&self, id: StreamId) -> Result<bool> {
        let cancelled = if let Some(stream) = self.untrack_inbound(id) {
            self.discard_inbound(&stream)
        } else {
            self.untrack_outbound(id)
                .map(|stream| stream.cancel())
                .unwrap_or(false)
        };
        self.sender.send_frame(Frame::cancel_stream(id)).await?;
        debug!(%id, cancelled, "stream cancel sent");
        Ok(cancelled)
    }

    /// Handle a CancelStream frame from the peer.
    ///
    /// For a stream we send, the peer stopped reading; for a stream we
    /// receive, the peer stopped producing. Ids that are unknown, already
    /// ended, or retired are ignored.
    pub fn on_remote_cancel(&self, id: StreamId) -> bool {
        let cancelled = if let Some(stream) = self.untrack_outbound(id) {
            stream.cancel()
        } else if let Some(stream) = self.untrack_inbound(id) {
            self.discard_inbound(&stream)
        } else {
            false
        };
        debug!(%id, cancelled, "peer cancelled stream");
        cancelled
    }

    /// Tear down everything: fail pending requests, cancel every tracked
    /// stream, and mark the connection unusable. Idempotent.
    pub fn cancel_all(&self) {
        let requests = self.requests.cancel_all();
        let mut drained: Vec<ContentStream> = lock(&self.outbound).drain().map(|(_, s)| s).collect();
        drained.extend(lock(&self.inbound).drain().map(|(_, s)| s));
        let streams = drained.iter().filter(|stream| stream.cancel()).count();
        self.state.close();
        if requests > 0 || streams > 0 {
            info!(requests, streams, "cancelled all in-flight units");
        }
    }
}
