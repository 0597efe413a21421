//! Sender-side conversion of logical units into frames.

use bytes::{Bytes, BytesMut};
use futures_util::future::try_join_all;
use streamwire_frame::{Frame, FrameType, StreamId};
use tracing::debug;

use crate::content::ContentStream;
use crate::envelope::Envelope;
use crate::error::{ProtocolError, Result};
use crate::message::{Request, Response};
use crate::sender::PayloadSender;
use crate::stream_manager::StreamManager;

/// One outbound logical unit, tagged by kind.
///
/// Request and Response units produce their envelope frames first and then
/// stream every attachment. Each attachment is bound to a fresh id when the
/// unit is built, so the envelope can announce it before any attachment byte
/// is sent and no id is ever reused on the connection, even when the
/// attachment is a stream that arrived from the peer.
#[derive(Debug)]
pub enum Disassembler {
    Request { id: StreamId, request: Request },
    Response { id: StreamId, response: Response },
    Stream { stream: ContentStream },
}

fn bind_wire_ids(streams: Vec<ContentStream>) -> Vec<ContentStream> {
    streams
        .iter()
        .map(|stream| stream.rebound(StreamId::new()))
        .collect()
}

impl Disassembler {
    pub fn request(id: StreamId, mut request: Request) -> Self {
        request.streams = bind_wire_ids(request.streams);
        Self::Request { id, request }
    }

    pub fn response(id: StreamId, mut response: Response) -> Self {
        response.streams = bind_wire_ids(response.streams);
        Self::Response { id, response }
    }

    pub fn stream(stream: ContentStream) -> Self {
        Self::Stream {
            stream: stream.rebound(StreamId::new()),
        }
    }

    /// Wire id of the unit's first frame.
    pub fn id(&self) -> StreamId {
        match self {
            Self::Request { id, .. } | Self::Response { id, .. } => *id,
            Self::Stream { stream } => stream.id(),
        }
    }

    pub fn frame_type(&self) -> FrameType {
        match self {
            Self::Request { .. } => FrameType::Request,
            Self::Response { .. } => FrameType::Response,
            Self::Stream { .. } => FrameType::Stream,
        }
    }

    /// Wire ids of the attachments, in announcement order.
    pub fn attachment_ids(&self) -> Vec<StreamId> {
        let streams = match self {
            Self::Request { request, .. } => &request.streams,
            Self::Response { response, .. } => &response.streams,
            Self::Stream { .. } => return Vec::new(),
        };
        streams.iter().map(ContentStream::id).collect()
    }

    /// Emit every frame of this unit through `sender`.
    ///
    /// Attachments are streamed concurrently; frames of one id stay in order.
    pub async fn disassemble(self, sender: &PayloadSender, streams: &StreamManager) -> Result<()> {
        let (id, envelope, attachments) = match self {
            Self::Request { id, request } => {
                let envelope = Envelope::Request(request.envelope());
                (id, envelope, request.streams)
            }
            Self::Response { id, response } => {
                let envelope = Envelope::Response(response.envelope());
                (id, envelope, response.streams)
            }
            Self::Stream { stream } => {
                streams.track_outbound(&stream);
                return send_stream(sender, streams, stream).await;
            }
        };

        for stream in &attachments {
            streams.track_outbound(stream);
        }

        let sent = async {
            send_envelope(sender, id, &envelope).await?;
            try_join_all(
                attachments
                    .iter()
                    .cloned()
                    .map(|stream| send_stream(sender, streams, stream)),
            )
            .await
        }
        .await;

        if sent.is_err() {
            for stream in &attachments {
                streams.untrack_outbound(stream.id());
            }
        }
        sent.map(|_| ())
    }
}

async fn send_envelope(sender: &PayloadSender, id: StreamId, envelope: &Envelope) -> Result<()> {
    let payload = Bytes::from(envelope.to_bytes()?);
    let frame_type = envelope.frame_type();
    let chunks = split_payload(payload, sender.max_frame_length());
    let count = chunks.len();

    for (index, chunk) in chunks.into_iter().enumerate() {
        let end = index + 1 == count;
        sender.send_frame(Frame::new(frame_type, id, end, chunk)).await?;
    }
    debug!(%id, ?frame_type, frames = count, "envelope sent");
    Ok(())
}

/// Stream one attachment body, ending with exactly one `end = true` frame.
///
/// The body may still be growing; a full frame is held back until the next
/// read shows whether more data follows, so the terminal flag is never
/// inferred from the declared length. The caller tracks the stream first;
/// once it is no longer tracked (cancelled by the peer or torn down)
/// streaming stops silently. A body cancelled by its local producer while
/// still tracked is reported to the peer with a CancelStream frame.
async fn send_stream(sender: &PayloadSender, streams: &StreamManager, stream: ContentStream) -> Result<()> {
    let id = stream.id();
    let max = sender.max_frame_length();
    let mut reader = stream.reader();
    let mut pending = BytesMut::new();
    let mut frames = 0usize;

    let outcome = async {
        loop {
            match reader.read().await {
                Ok(Some(chunk)) => {
                    pending.extend_from_slice(&chunk);
                    while pending.len() > max {
                        if !streams.is_sending(id) {
                            debug!(%id, frames, "attachment cancelled; stopped streaming");
                            return Ok(());
                        }
                        let payload = pending.split_to(max).freeze();
                        sender
                            .send_frame(Frame::new(FrameType::Stream, id, false, payload))
                            .await?;
                        frames += 1;
                    }
                }
                Ok(None) => {
                    if !streams.is_sending(id) {
                        debug!(%id, frames, "attachment cancelled; stopped streaming");
                        return Ok(());
                    }
                    let payload = pending.split().freeze();
                    sender
                        .send_frame(Frame::new(FrameType::Stream, id, true, payload))
                        .await?;
                    frames += 1;
                    return Ok(());
                }
                Err(ProtocolError::StreamCancelled(_)) => {
                    if streams.untrack_outbound(id).is_some() {
                        sender.send_frame(Frame::cancel_stream(id)).await?;
                        debug!(%id, frames, "attachment abandoned by producer; peer notified");
                    } else {
                        debug!(%id, frames, "attachment cancelled; stopped streaming");
                    }
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        }
    }
    .await;
    streams.untrack_outbound(id);

    if outcome.is_ok() {
        debug!(%id, frames, "attachment sent");
    }
    outcome
}

/// Split `payload` into frame-sized pieces. Always yields at least one piece.
pub(crate) fn split_payload(mut payload: Bytes, max: usize) -> Vec<Bytes> {
    if payload.len() <= max {
        return vec![payload];
    }
    let mut chunks = Vec::with_capacity(payload.len().div_ceil(max));
    while !payload.is_empty() {
        let take = payload.len().min(max);
        chunks.push(payload.split_to(take));
    }
    chunks
}
