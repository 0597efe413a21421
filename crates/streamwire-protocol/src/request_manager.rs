use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use streamwire_frame::StreamId;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{ProtocolError, Result};
use crate::message::Response;

struct PendingRequest {
    created_at: Instant,
    tx: oneshot::Sender<Result<Response>>,
}

/// Correlates outbound requests with the responses that answer them.
///
/// An entry exists exactly while its request is pending; completing, timing
/// out, or cancelling removes it, after which a late response for the same id
/// is unmatched.
#[derive(Default)]
pub struct RequestManager {
    pending: Mutex<HashMap<StreamId, PendingRequest>>,
}

impl RequestManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<StreamId, PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `id` as pending. Must happen before the request's first frame
    /// is written so a fast response always finds its entry.
    pub fn register(&self, id: StreamId) -> PendingResponse {
        let (tx, rx) = oneshot::channel();
        let previous = self.lock().insert(
            id,
            PendingRequest {
                created_at: Instant::now(),
                tx,
            },
        );
        if previous.is_some() {
            warn!(%id, "replaced pending request with duplicate id");
        }
        PendingResponse { id, rx }
    }

    /// Complete the pending request `id` with `response`.
    pub fn resolve_response(&self, id: StreamId, response: Response) -> Result<()> {
        self.complete(id, Ok(response))
    }

    /// Complete the pending request `id` with an error.
    pub fn fail(&self, id: StreamId, err: ProtocolError) -> Result<()> {
        self.complete(id, Err(err))
    }

    fn complete(&self, id: StreamId, outcome: Result<Response>) -> Result<()> {
        let Some(entry) = self.lock().remove(&id) else {
            return Err(ProtocolError::UnmatchedResponse(id));
        };
        let elapsed = entry.created_at.elapsed();
        if entry.tx.send(outcome).is_err() {
            // The waiter gave up between our lookup and now.
            debug!(%id, ?elapsed, "response arrived after waiter left");
        } else {
            debug!(%id, ?elapsed, "request completed");
        }
        Ok(())
    }

    /// Drop the entry for `id` without completing it.
    pub fn remove(&self, id: StreamId) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Fail every pending request with [`ProtocolError::Cancelled`].
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<(StreamId, PendingRequest)> = self.lock().drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            let _ = entry.tx.send(Err(ProtocolError::Cancelled));
            debug!(%id, "pending request cancelled");
        }
        count
    }

    pub fn is_pending(&self, id: StreamId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }
}

/// Resolves to the response for one registered request.
#[must_use = "a pending response does nothing unless awaited"]
pub struct PendingResponse {
    id: StreamId,
    rx: oneshot::Receiver<Result<Response>>,
}

impl PendingResponse {
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Await the response for at most `timeout`.
    ///
    /// On expiry the entry is removed from `manager` and the call fails with
    /// [`ProtocolError::RequestTimeout`].
    pub async fn wait(self, manager: &RequestManager, timeout: Duration) -> Result<Response> {
        let id = self.id;
        match tokio::time::timeout(timeout, self).await {
            Ok(outcome) => outcome,
            Err(_) => {
                manager.remove(id);
                warn!(%id, ?timeout, "request timed out");
                Err(ProtocolError::RequestTimeout(timeout))
            }
        }
    }
}

impl Future for PendingResponse {
    type Output = Result<Response>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(ProtocolError::Cancelled)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn response_resolves_pending_request() {
        let manager = RequestManager::new();
        let id = StreamId::new();
        let pending = manager.register(id);

        manager.resolve_response(id, Response::new(204)).unwrap();
        let response = pending.await.unwrap();
        assert_eq!(response.status_code, 204);
        assert!(!manager.is_pending(id));
    }

    #[tokio::test]
    async fn response_racing_ahead_of_wait_is_kept() {
        let manager = RequestManager::new();
        let id = StreamId::new();
        let pending = manager.register(id);
        manager.resolve_response(id, Response::ok()).unwrap();

        let response = pending
            .wait(&manager, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(response.status_code, 200);
    }

    #[test]
    fn unknown_id_is_unmatched() {
        let manager = RequestManager::new();
        let id = StreamId::new();
        let err = manager.resolve_response(id, Response::ok()).unwrap_err();
        assert!(matches!(err, ProtocolError::UnmatchedResponse(got) if got == id));
    }

    #[tokio::test]
    async fn second_resolution_is_unmatched() {
        let manager = RequestManager::new();
        let id = StreamId::new();
        let _pending = manager.register(id);
        manager.resolve_response(id, Response::ok()).unwrap();
        assert!(manager.resolve_response(id, Response::ok()).is_err());
    }

    #[tokio::test]
    async fn timeout_removes_entry() {
        let manager = RequestManager::new();
        let id = StreamId::new();
        let pending = manager.register(id);

        let err = pending
            .wait(&manager, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::RequestTimeout(_)));
        assert_eq!(manager.pending_count(), 0);
        assert!(matches!(
            manager.resolve_response(id, Response::ok()),
            Err(ProtocolError::UnmatchedResponse(_))
        ));
    }

    #[tokio::test]
    async fn cancel_all_fails_every_waiter() {
        let manager = RequestManager::new();
        let waiters: Vec<PendingResponse> =
            (0..5).map(|_| manager.register(StreamId::new())).collect();

        assert_eq!(manager.cancel_all(), 5);
        for waiter in waiters {
            assert!(matches!(waiter.await, Err(ProtocolError::Cancelled)));
        }
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn fail_delivers_error() {
        let manager = RequestManager::new();
        let id = StreamId::new();
        let pending = manager.register(id);
        manager
            .fail(id, ProtocolError::Envelope("bad json".into()))
            .unwrap();
        assert!(matches!(pending.await, Err(ProtocolError::Envelope(_))));
    }
}
