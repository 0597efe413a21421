use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use streamwire_frame::{Frame, StreamId};
use streamwire_transport::Transport;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ConnectionConfig;
use crate::disassembler::Disassembler;
use crate::error::{ProtocolError, Result};
use crate::handler::RequestHandler;
use crate::message::{Request, Response};
use crate::receiver;
use crate::request_manager::RequestManager;
use crate::sender::PayloadSender;
use crate::state::ConnectionState;
use crate::stream_manager::StreamManager;

/// How long a local `cancel_all` waits to notify the peer before tearing
/// down anyway.
const CANCEL_ALL_NOTIFY_TIMEOUT: Duration = Duration::from_millis(250);

/// Everything one connection shares between its handle, its read loop and
/// the tasks they spawn.
pub(crate) struct Session {
    pub(crate) config: ConnectionConfig,
    pub(crate) state: ConnectionState,
    pub(crate) sender: Arc<PayloadSender>,
    pub(crate) requests: Arc<RequestManager>,
    pub(crate) streams: StreamManager,
    /// Cancelled by the read loop once teardown has fully run.
    pub(crate) finished: CancellationToken,
    /// Inbound units the read loop is still reassembling.
    pub(crate) reassembling: AtomicUsize,
    handler: RwLock<Option<Arc<dyn RequestHandler>>>,
}

impl Session {
    pub(crate) fn handler(&self) -> Option<Arc<dyn RequestHandler>> {
        self.handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Send `response` under the id of the request it answers.
    pub(crate) async fn respond(&self, id: StreamId, response: Response) {
        let status = response.status_code;
        match Disassembler::response(id, response)
            .disassemble(&self.sender, &self.streams)
            .await
        {
            Ok(()) => debug!(%id, status, "response sent"),
            Err(err) => debug!(%id, status, error = %err, "response not delivered"),
        }
    }
}

/// One multiplexed, full-duplex connection to a peer.
///
/// Either side may send requests and answer them. Cloning yields another
/// handle to the same connection. The connection lives until either side
/// cancels everything, the transport fails, or the peer hangs up.
#[derive(Clone)]
pub struct Connection {
    session: Arc<Session>,
}

impl Connection {
    /// Start a connection over `transport` with no request handler.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start<T: Transport>(transport: T, config: ConnectionConfig) -> Self {
        let (reader, writer) = tokio::io::split(transport);
        Self::spawn(reader, writer, config, None)
    }

    /// Start a connection that answers inbound requests with `handler` from
    /// its very first frame.
    pub fn start_with_handler<T, H>(transport: T, config: ConnectionConfig, handler: H) -> Self
    where
        T: Transport,
        H: RequestHandler,
    {
        let (reader, writer) = tokio::io::split(transport);
        let handler: Arc<dyn RequestHandler> = Arc::new(handler);
        Self::spawn(reader, writer, config, Some(handler))
    }

    /// Start a connection over separately owned read and write halves.
    pub fn from_halves<R, W>(reader: R, writer: W, config: ConnectionConfig) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::spawn(reader, writer, config, None)
    }

    fn spawn<R, W>(
        reader: R,
        writer: W,
        config: ConnectionConfig,
        handler: Option<Arc<dyn RequestHandler>>,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let state = ConnectionState::new();
        let sender = Arc::new(PayloadSender::new(writer, config.frame_config(), state.clone()));
        let requests = Arc::new(RequestManager::new());
        let streams = StreamManager::new(Arc::clone(&sender), Arc::clone(&requests), state.clone());

        info!(
            max_frame_length = config.chunk_size(),
            request_timeout = ?config.request_timeout,
            "connection started"
        );

        let session = Arc::new(Session {
            config,
            state,
            sender,
            requests,
            streams,
            finished: CancellationToken::new(),
            reassembling: AtomicUsize::new(0),
            handler: RwLock::new(handler),
        });
        tokio::spawn(receiver::run(reader, Arc::clone(&session)));
        Self { session }
    }

    /// Install (or replace) the handler for inbound requests. Requests that
    /// arrive while no handler is installed are answered with 501.
    pub fn register_request_handler<H: RequestHandler>(&self, handler: H) {
        let handler: Arc<dyn RequestHandler> = Arc::new(handler);
        *self
            .session
            .handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    /// Send `request` and wait for its response, using the configured
    /// request timeout.
    pub async fn send_request(&self, request: Request) -> Result<Response> {
        self.send_request_with_timeout(request, self.session.config.request_timeout)
            .await
    }

    /// Send `request` and wait at most `timeout` for the matching response.
    ///
    /// The deadline covers the whole exchange, including streaming of the
    /// request's attachments. Response attachments may still be arriving
    /// when this returns.
    pub async fn send_request_with_timeout(
        &self,
        request: Request,
        timeout: Duration,
    ) -> Result<Response> {
        self.session.state.ensure_live()?;
        let id = StreamId::new();
        let pending = self.session.requests.register(id);
        debug!(%id, verb = %request.verb, path = %request.path, "sending request");

        let session = Arc::clone(&self.session);
        tokio::spawn(async move {
            let sent = Disassembler::request(id, request)
                .disassemble(&session.sender, &session.streams)
                .await;
            if let Err(err) = sent {
                debug!(%id, error = %err, "request not delivered");
                // Already settled if teardown got there first.
                let _ = session.requests.fail(id, err);
            }
        });

        pending.wait(&self.session.requests, timeout).await
    }

    /// Cancel stream `id` locally and tell the peer to stop producing it.
    ///
    /// Returns whether a tracked local stream was cancelled.
    pub async fn cancel_stream(&self, id: StreamId) -> Result<bool> {
        self.session.streams.cancel_stream(id).await
    }

    /// Notify the peer, then fail every pending request with
    /// [`ProtocolError::Cancelled`], cancel every tracked stream and close
    /// the connection. Idempotent.
    pub async fn cancel_all(&self) {
        if self.session.state.is_live() {
            let notify = self.session.sender.send_frame(Frame::cancel_all());
            match tokio::time::timeout(CANCEL_ALL_NOTIFY_TIMEOUT, notify).await {
                Ok(Ok(())) => debug!("cancel-all sent"),
                Ok(Err(err)) => debug!(error = %err, "cancel-all not delivered"),
                Err(_) => debug!("cancel-all notify timed out"),
            }
        }
        self.session.streams.cancel_all();
    }

    /// Shut down without notifying the peer; it observes end-of-stream.
    pub async fn close(&self) {
        self.session.streams.cancel_all();
        self.closed().await;
    }

    pub fn is_connected(&self) -> bool {
        self.session.state.is_live()
    }

    /// Resolves once the connection has been torn down and every pending
    /// unit has been cancelled.
    pub async fn closed(&self) {
        self.session.finished.cancelled().await;
    }

    /// Why the connection died, if it died from an error rather than a
    /// cancel-all or close.
    pub fn failure(&self) -> Option<ProtocolError> {
        self.session.state.failure()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.session.config
    }

    pub fn pending_requests(&self) -> usize {
        self.session.requests.pending_count()
    }

    pub fn active_streams(&self) -> usize {
        self.session.streams.active_count()
    }

    /// Inbound envelopes and attachments still holding reassembly state.
    pub fn reassembling(&self) -> usize {
        self.session.reassembling.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("connected", &self.is_connected())
            .field("pending_requests", &self.pending_requests())
            .field("active_streams", &self.active_streams())
            .field("reassembling", &self.reassembling())
            .finish()
    }
}
