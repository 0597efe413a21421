//! The per-connection read loop.
//!
//! One task owns the read half and the [`Assembler`]. It hands finished
//! units to the request manager or the registered handler, and when the
//! connection dies for any reason it runs the teardown cascade.
//!
//! The loop never waits on a slow reader: frames for every id share one
//! socket, so stalling on one attachment would stall them all. Inbound
//! buffering is bounded per attachment by `max_attachment_size` and per
//! envelope by `max_envelope_size`; a reader that wants less should cancel
//! the stream. Beyond that, flow control is the transport's.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures_util::StreamExt;
use streamwire_frame::{Frame, FrameCodec, FrameType, StreamId};
use tokio::io::AsyncRead;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info, warn};

use crate::assembler::{Assembled, Assembler};
use crate::connection::Session;
use crate::envelope::Envelope;
use crate::error::ProtocolError;
use crate::handler::InboundRequest;
use crate::message::{Response, STATUS_BAD_REQUEST, STATUS_NOT_IMPLEMENTED};

pub(crate) async fn run<R>(reader: R, session: Arc<Session>)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut frames = FramedRead::new(reader, FrameCodec::new(session.config.frame_config()));
    let mut assembler = Assembler::new(
        session.config.max_attachment_size,
        session.config.max_envelope_size,
    )
    .with_retired_window(session.config.retired_window);
    let mut discarded = session.streams.take_discarded();

    loop {
        let next = tokio::select! {
            biased;
            _ = session.state.closed() => break,
            Some(id) = next_discarded(&mut discarded) => {
                assembler.discard(id);
                session.reassembling.store(assembler.in_progress(), Ordering::Relaxed);
                continue;
            }
            next = frames.next() => next,
        };

        match next {
            Some(Ok(frame)) => {
                debug!(frame_type = ?frame.frame_type, id = %frame.id, end = frame.end, len = frame.payload.len(), "frame received");
                let event = assembler.on_frame(frame, &session.streams);
                session.reassembling.store(assembler.in_progress(), Ordering::Relaxed);
                if !dispatch(&session, event) {
                    break;
                }
            }
            Some(Err(err)) => {
                let err = ProtocolError::from(err);
                error!(error = %err, "connection read failed");
                session.state.fail(err);
                break;
            }
            None => {
                info!("peer closed the connection");
                session.state.fail(ProtocolError::ConnectionClosed);
                break;
            }
        }
    }

    session.streams.cancel_all();
    // Unclaimed inbound buffers go with the assembler.
    drop(assembler);
    session.reassembling.store(0, Ordering::Relaxed);
    session.sender.close().await;
    session.finished.cancel();
    match session.state.failure() {
        Some(err) => info!(reason = %err, "connection torn down"),
        None => info!("connection closed"),
    }
}

async fn next_discarded(feed: &mut Option<UnboundedReceiver<StreamId>>) -> Option<StreamId> {
    match feed {
        Some(feed) => feed.recv().await,
        None => std::future::pending().await,
    }
}

/// Act on one assembler event. Returns `false` when the loop must stop.
fn dispatch(session: &Arc<Session>, event: Assembled) -> bool {
    match event {
        Assembled::Pending => {}
        Assembled::StreamEnded(id) => debug!(%id, "inbound stream complete"),
        Assembled::Envelope {
            id,
            envelope,
            attachments,
            rejected,
        } => {
            for stream in rejected {
                spawn_cancel(session, stream);
            }
            match envelope {
                Envelope::Request(req) => {
                    let request = InboundRequest {
                        id,
                        verb: req.verb,
                        path: req.path,
                        streams: attachments,
                    };
                    tokio::spawn(answer(Arc::clone(session), request));
                }
                Envelope::Response(resp) => {
                    let ids: Vec<StreamId> = attachments.iter().map(|s| s.id()).collect();
                    let response = Response {
                        status_code: resp.status_code,
                        streams: attachments,
                    };
                    if let Err(err) = session.requests.resolve_response(id, response) {
                        warn!(%id, error = %err, "dropping unmatched response");
                        for stream in ids {
                            spawn_cancel(session, stream);
                        }
                    }
                }
            }
        }
        Assembled::Malformed {
            id,
            frame_type,
            error,
        } => {
            warn!(%id, ?frame_type, %error, "malformed envelope");
            match frame_type {
                FrameType::Request => {
                    let session = Arc::clone(session);
                    tokio::spawn(async move {
                        session.respond(id, Response::new(STATUS_BAD_REQUEST)).await;
                    });
                }
                _ => {
                    if session.requests.fail(id, error).is_err() {
                        debug!(%id, "malformed response had no pending request");
                    }
                }
            }
        }
        Assembled::StreamRejected(id) => spawn_cancel(session, id),
        Assembled::CancelStream(id) => {
            session.streams.on_remote_cancel(id);
        }
        Assembled::CancelAll => {
            info!("peer cancelled all units");
            return false;
        }
    }
    true
}

async fn answer(session: Arc<Session>, request: InboundRequest) {
    let id = request.id;
    let response = match session.handler() {
        Some(handler) => {
            debug!(%id, verb = %request.verb, path = %request.path, "dispatching request");
            handler.handle(request).await
        }
        None => {
            warn!(%id, path = %request.path, "no request handler registered");
            Response::new(STATUS_NOT_IMPLEMENTED)
        }
    };
    session.respond(id, response).await;
}

/// Tell the peer to stop producing `id`. Runs off the read loop so a slow
/// write never stalls inbound processing.
fn spawn_cancel(session: &Arc<Session>, id: StreamId) {
    let session = Arc::clone(session);
    tokio::spawn(async move {
        if let Err(err) = session.streams.cancel_stream(id).await {
            debug!(%id, error = %err, "could not send stream cancel");
        }
    });
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use futures_util::SinkExt;
    use tokio::io::DuplexStream;
    use tokio_util::codec::Framed;

    use super::*;
    use crate::config::ConnectionConfig;
    use crate::connection::Connection;
    use crate::envelope::{RequestEnvelope, ResponseEnvelope, StreamDescription};

    fn connection_with_raw_peer(config: ConnectionConfig) -> (Connection, Framed<DuplexStream, FrameCodec>) {
        let (local, remote) = tokio::io::duplex(1 << 16);
        let peer = Framed::new(remote, FrameCodec::new(config.frame_config()));
        (Connection::start(local, config), peer)
    }

    fn envelope_frame(frame_type: FrameType, id: StreamId, envelope: &Envelope) -> Frame {
        Frame::new(frame_type, id, true, Bytes::from(envelope.to_bytes().unwrap()))
    }

    #[tokio::test]
    async fn request_without_handler_gets_501() {
        let (_conn, mut peer) = connection_with_raw_peer(ConnectionConfig::default());
        let id = StreamId::new();
        let request = Envelope::Request(RequestEnvelope {
            verb: "GET".into(),
            path: "/nothing".into(),
            streams: Vec::new(),
        });
        peer.send(envelope_frame(FrameType::Request, id, &request)).await.unwrap();

        let reply = peer.next().await.unwrap().unwrap();
        assert_eq!(reply.frame_type, FrameType::Response);
        assert_eq!(reply.id, id);
        let Envelope::Response(resp) = Envelope::from_bytes(FrameType::Response, &reply.payload).unwrap() else {
            panic!("expected response");
        };
        assert_eq!(resp.status_code, STATUS_NOT_IMPLEMENTED);
    }

    #[tokio::test]
    async fn malformed_request_gets_400() {
        let (_conn, mut peer) = connection_with_raw_peer(ConnectionConfig::default());
        let id = StreamId::new();
        peer.send(Frame::new(FrameType::Request, id, true, Bytes::from_static(b"[1,2")))
            .await
            .unwrap();

        let reply = peer.next().await.unwrap().unwrap();
        assert_eq!(reply.id, id);
        let Envelope::Response(resp) = Envelope::from_bytes(FrameType::Response, &reply.payload).unwrap() else {
            panic!("expected response");
        };
        assert_eq!(resp.status_code, STATUS_BAD_REQUEST);
    }

    #[tokio::test]
    async fn unmatched_response_is_not_fatal() {
        let (conn, mut peer) = connection_with_raw_peer(ConnectionConfig::default());
        let response = Envelope::Response(ResponseEnvelope {
            status_code: 200,
            streams: Vec::new(),
        });
        peer.send(envelope_frame(FrameType::Response, StreamId::new(), &response))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(conn.is_connected());
    }

    #[tokio::test]
    async fn rejected_attachment_is_cancelled_on_the_wire() {
        let config = ConnectionConfig::default().with_max_attachment_size(4);
        let (conn, mut peer) = connection_with_raw_peer(config);
        let attachment = StreamId::new();

        peer.send(Frame::new(FrameType::Stream, attachment, false, Bytes::from_static(b"too many bytes")))
            .await
            .unwrap();

        let cancel = peer.next().await.unwrap().unwrap();
        assert_eq!(cancel.frame_type, FrameType::CancelStream);
        assert_eq!(cancel.id, attachment);
        assert!(conn.is_connected());
    }

    async fn wait_for_idle_reassembly(conn: &Connection) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while conn.reassembling() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn cancelled_inbound_attachment_releases_reassembly() {
        let (conn, mut peer) = connection_with_raw_peer(ConnectionConfig::default());
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = std::sync::Mutex::new(Some(tx));
        conn.register_request_handler(move |req: InboundRequest| {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(req.streams[0].clone());
            }
            async { Response::ok() }
        });

        let attachment = StreamId::new();
        let request = Envelope::Request(RequestEnvelope {
            verb: "POST".into(),
            path: "/upload".into(),
            streams: vec![StreamDescription {
                id: attachment,
                content_type: "application/octet-stream".into(),
                length: None,
            }],
        });
        peer.send(envelope_frame(FrameType::Request, StreamId::new(), &request))
            .await
            .unwrap();
        peer.send(Frame::new(FrameType::Stream, attachment, false, vec![1u8; 4000]))
            .await
            .unwrap();

        let stream = tokio::time::timeout(Duration::from_secs(1), rx).await.unwrap().unwrap();
        while stream.written() < 4000 {
            tokio::task::yield_now().await;
        }
        assert_eq!(conn.reassembling(), 1);

        assert!(conn.cancel_stream(attachment).await.unwrap());
        wait_for_idle_reassembly(&conn).await;
        assert_eq!(conn.active_streams(), 0);

        // Frames already in flight are dropped without rebuilding state.
        peer.send(Frame::new(FrameType::Stream, attachment, true, vec![2u8; 10]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(conn.reassembling(), 0);
        assert!(conn.is_connected());
    }

    #[tokio::test]
    async fn rejected_inbound_attachment_releases_reassembly() {
        let config = ConnectionConfig::default().with_max_attachment_size(8);
        let (conn, mut peer) = connection_with_raw_peer(config);
        conn.register_request_handler(|_req: InboundRequest| async { Response::ok() });

        let attachment = StreamId::new();
        let request = Envelope::Request(RequestEnvelope {
            verb: "POST".into(),
            path: "/upload".into(),
            streams: vec![StreamDescription {
                id: attachment,
                content_type: "text/plain".into(),
                length: None,
            }],
        });
        peer.send(envelope_frame(FrameType::Request, StreamId::new(), &request))
            .await
            .unwrap();
        peer.send(Frame::new(FrameType::Stream, attachment, false, &b"well over eight"[..]))
            .await
            .unwrap();

        let cancel = loop {
            let frame = peer.next().await.unwrap().unwrap();
            if frame.frame_type == FrameType::CancelStream {
                break frame;
            }
        };
        assert_eq!(cancel.id, attachment);
        wait_for_idle_reassembly(&conn).await;
    }

    #[tokio::test]
    async fn remote_cancel_all_tears_down() {
        let (conn, mut peer) = connection_with_raw_peer(ConnectionConfig::default());
        peer.send(Frame::cancel_all()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), conn.closed())
            .await
            .unwrap();
        assert!(!conn.is_connected());
        assert!(conn.failure().is_none());
    }

    #[tokio::test]
    async fn malformed_header_is_fatal() {
        use tokio::io::AsyncWriteExt;

        let (local, mut remote) = tokio::io::duplex(1024);
        let conn = Connection::start(local, ConnectionConfig::default());
        let mut garbage = vec![b'?'];
        garbage.extend_from_slice(&[0u8; 19]);
        remote.write_all(&garbage).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), conn.closed())
            .await
            .unwrap();
        assert!(matches!(conn.failure(), Some(ProtocolError::Frame(_))));
    }

    #[tokio::test]
    async fn peer_hangup_fails_connection() {
        let (local, remote) = tokio::io::duplex(1024);
        let conn = Connection::start(local, ConnectionConfig::default());
        drop(remote);

        tokio::time::timeout(Duration::from_secs(1), conn.closed())
            .await
            .unwrap();
        assert!(matches!(conn.failure(), Some(ProtocolError::ConnectionClosed)));
    }
}
