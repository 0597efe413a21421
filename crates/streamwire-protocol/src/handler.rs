use std::future::Future;

use futures_util::future::BoxFuture;
use streamwire_frame::StreamId;

use crate::content::ContentStream;
use crate::message::Response;

/// A request received from the peer, handed to the registered handler.
///
/// Attachments may still be arriving when the handler runs; read them
/// through [`ContentStream::reader`].
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub id: StreamId,
    pub verb: String,
    pub path: String,
    pub streams: Vec<ContentStream>,
}

/// Answers inbound requests.
///
/// Implemented for any `Fn(InboundRequest) -> impl Future<Output = Response>`.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, request: InboundRequest) -> BoxFuture<'static, Response>;
}

impl<F, Fut> RequestHandler for F
where
    F: Fn(InboundRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    fn handle(&self, request: InboundRequest) -> BoxFuture<'static, Response> {
        Box::pin(self(request))
    }
}
