//! Receiver-side reconstruction of logical units from frames.
//!
//! The assembler is owned by the connection's single read loop, so its maps
//! need no locking. It never performs I/O: every decision that requires a
//! write (dispatching a request, cancelling a rejected stream) is returned to
//! the caller as an [`Assembled`] event.

use std::collections::{HashMap, HashSet, VecDeque};

use bytes::BytesMut;
use streamwire_frame::{Frame, FrameType, StreamId};
use tracing::{debug, warn};

use crate::config::DEFAULT_RETIRED_WINDOW;
use crate::content::{ContentStream, ContentWriter};
use crate::envelope::{Envelope, StreamDescription, UNKNOWN_CONTENT_TYPE};
use crate::error::ProtocolError;
use crate::stream_manager::StreamManager;

/// Outcome of feeding one frame to the [`Assembler`].
#[derive(Debug)]
pub enum Assembled {
    /// Nothing to dispatch yet.
    Pending,
    /// A Request or Response envelope is complete. Its attachments are
    /// claimed and may still be filling.
    Envelope {
        id: StreamId,
        envelope: Envelope,
        attachments: Vec<ContentStream>,
        /// Attachments refused for size; the peer should stop sending them.
        rejected: Vec<StreamId>,
    },
    /// A Request or Response unit ended but could not be decoded.
    Malformed {
        id: StreamId,
        frame_type: FrameType,
        error: ProtocolError,
    },
    /// An attachment received its terminal frame.
    StreamEnded(StreamId),
    /// An attachment outgrew the ceiling while arriving.
    StreamRejected(StreamId),
    /// The peer cancelled one of our streams.
    CancelStream(StreamId),
    /// The peer tore down the connection.
    CancelAll,
}

struct EnvelopeEntry {
    frame_type: FrameType,
    buf: BytesMut,
    oversized: bool,
}

struct InboundStream {
    writer: ContentWriter,
    claimed: bool,
    ended: bool,
}

/// Finished inbound ids, oldest forgotten first once `capacity` is reached.
struct RetiredIds {
    ids: HashSet<StreamId>,
    order: VecDeque<StreamId>,
    capacity: usize,
}

impl RetiredIds {
    fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn insert(&mut self, id: StreamId) {
        if self.capacity == 0 || !self.ids.insert(id) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn contains(&self, id: &StreamId) -> bool {
        self.ids.contains(id)
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

/// Per-connection reassembly state keyed by id.
pub struct Assembler {
    envelopes: HashMap<StreamId, EnvelopeEntry>,
    streams: HashMap<StreamId, InboundStream>,
    retired: RetiredIds,
    max_attachment_size: u64,
    max_envelope_size: usize,
}

impl Assembler {
    pub fn new(max_attachment_size: u64, max_envelope_size: usize) -> Self {
        Self {
            envelopes: HashMap::new(),
            streams: HashMap::new(),
            retired: RetiredIds::new(DEFAULT_RETIRED_WINDOW),
            max_attachment_size,
            max_envelope_size,
        }
    }

    /// Remember at most `window` finished ids for dropping late frames.
    pub fn with_retired_window(mut self, window: usize) -> Self {
        self.retired = RetiredIds::new(window);
        self
    }

    /// Feed one inbound frame.
    pub fn on_frame(&mut self, frame: Frame, registry: &StreamManager) -> Assembled {
        match frame.frame_type {
            FrameType::CancelAll => Assembled::CancelAll,
            FrameType::CancelStream => Assembled::CancelStream(frame.id),
            _ if self.retired.contains(&frame.id) => {
                debug!(id = %frame.id, frame_type = ?frame.frame_type, "frame for retired id dropped");
                Assembled::Pending
            }
            FrameType::Stream => self.on_stream_frame(frame, registry),
            FrameType::Request | FrameType::Response => self.on_envelope_frame(frame, registry),
        }
    }

    fn on_envelope_frame(&mut self, frame: Frame, registry: &StreamManager) -> Assembled {
        let id = frame.id;
        let entry = self.envelopes.entry(id).or_insert_with(|| EnvelopeEntry {
            frame_type: frame.frame_type,
            buf: BytesMut::new(),
            oversized: false,
        });

        // The first frame fixes the kind of the unit.
        if entry.frame_type != frame.frame_type {
            let first = entry.frame_type;
            self.envelopes.remove(&id);
            self.retired.insert(id);
            return Assembled::Malformed {
                id,
                frame_type: first,
                error: ProtocolError::Envelope(format!(
                    "{:?} frame in a {first:?} unit",
                    frame.frame_type
                )),
            };
        }

        if !entry.oversized {
            if entry.buf.len() + frame.payload.len() > self.max_envelope_size {
                entry.oversized = true;
                entry.buf = BytesMut::new();
            } else {
                entry.buf.extend_from_slice(&frame.payload);
            }
        }

        if !frame.end {
            return Assembled::Pending;
        }

        let Some(entry) = self.envelopes.remove(&id) else {
            return Assembled::Pending;
        };
        self.retired.insert(id);

        if entry.oversized {
            warn!(%id, frame_type = ?entry.frame_type, max = self.max_envelope_size, "oversized envelope dropped");
            return Assembled::Pending;
        }

        match Envelope::from_bytes(entry.frame_type, &entry.buf) {
            Ok(envelope) => {
                let mut rejected = Vec::new();
                let attachments = envelope
                    .streams()
                    .iter()
                    .map(|description| self.claim(description, registry, &mut rejected))
                    .collect();
                debug!(%id, frame_type = ?entry.frame_type, "envelope assembled");
                Assembled::Envelope {
                    id,
                    envelope,
                    attachments,
                    rejected,
                }
            }
            Err(error) => Assembled::Malformed {
                id,
                frame_type: entry.frame_type,
                error,
            },
        }
    }

    /// Bind an announced attachment to its buffer, creating it if no frame
    /// for it has arrived yet.
    fn claim(
        &mut self,
        description: &StreamDescription,
        registry: &StreamManager,
        rejected: &mut Vec<StreamId>,
    ) -> ContentStream {
        let id = description.id;

        if self.retired.contains(&id) {
            warn!(%id, "envelope claims a retired stream");
            let (_writer, stream) = ContentStream::with_id(
                id,
                description.content_type.as_str(),
                description.length,
            );
            // Dropping the writer cancels the stream.
            return stream;
        }

        let declared_too_large = description
            .length
            .filter(|&len| len > self.max_attachment_size);

        let stream = match self.streams.get_mut(&id) {
            Some(entry) => {
                entry.claimed = true;
                entry.writer.stream().described_by(description)
            }
            None => {
                let (writer, stream) = ContentStream::with_id(
                    id,
                    description.content_type.as_str(),
                    description.length,
                );
                registry.track_inbound(&stream);
                self.streams.insert(
                    id,
                    InboundStream {
                        writer,
                        claimed: true,
                        ended: false,
                    },
                );
                stream
            }
        };

        if let Some(size) = declared_too_large {
            if stream.reject(size, self.max_attachment_size) {
                warn!(%id, size, max = self.max_attachment_size, "attachment rejected before buffering");
                registry.untrack_inbound(id);
                rejected.push(id);
            }
        }

        let finished = self.streams.get(&id).is_some_and(|entry| entry.ended);
        if finished || stream.is_terminal() {
            self.retire_stream(id);
        }
        stream
    }

    fn on_stream_frame(&mut self, frame: Frame, registry: &StreamManager) -> Assembled {
        let id = frame.id;
        let entry = self.streams.entry(id).or_insert_with(|| {
            // Arrived before its envelope: buffer until claimed.
            let (writer, stream) = ContentStream::with_id(id, UNKNOWN_CONTENT_TYPE, None);
            registry.track_inbound(&stream);
            InboundStream {
                writer,
                claimed: false,
                ended: false,
            }
        });

        if entry.ended {
            warn!(%id, "frame after end of unclaimed stream dropped");
            return Assembled::Pending;
        }

        let stream = entry.writer.stream().clone();
        let claimed = entry.claimed;

        // Cancelled or rejected here; keep unclaimed ones so the envelope
        // still sees why.
        if stream.is_terminal() {
            debug!(%id, "frame for abandoned stream dropped");
            if claimed {
                registry.untrack_inbound(id);
                self.retire_stream(id);
            } else if frame.end {
                entry.ended = true;
            }
            return Assembled::Pending;
        }

        let size = stream.written() + frame.payload.len() as u64;
        if size > self.max_attachment_size {
            stream.reject(size, self.max_attachment_size);
            warn!(%id, size, max = self.max_attachment_size, "attachment exceeded ceiling");
            registry.untrack_inbound(id);
            if claimed {
                self.retire_stream(id);
            } else if frame.end {
                entry.ended = true;
            }
            return Assembled::StreamRejected(id);
        }

        if let Err(err) = entry.writer.append(frame.payload) {
            debug!(%id, error = %err, "discarding bytes for closed stream");
        }
        if !frame.end {
            return Assembled::Pending;
        }

        entry.writer.end();
        entry.ended = true;
        registry.untrack_inbound(id);
        if claimed {
            self.retire_stream(id);
        }
        Assembled::StreamEnded(id)
    }

    fn retire_stream(&mut self, id: StreamId) {
        self.streams.remove(&id);
        self.retired.insert(id);
    }

    /// Forget inbound stream `id` after it was cancelled locally. Later
    /// frames for it are dropped, and an envelope claiming it gets a
    /// cancelled stream.
    pub fn discard(&mut self, id: StreamId) {
        if self.streams.contains_key(&id) {
            debug!(%id, "inbound stream discarded");
        }
        self.retire_stream(id);
    }

    /// Units still being reassembled (envelopes plus open or unclaimed streams).
    pub fn in_progress(&self) -> usize {
        self.envelopes.len() + self.streams.len()
    }

    /// Finished ids currently remembered.
    pub fn retired_count(&self) -> usize {
        self.retired.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use streamwire_frame::FrameConfig;

    use super::*;
    use crate::envelope::{RequestEnvelope, ResponseEnvelope};
    use crate::request_manager::RequestManager;
    use crate::sender::PayloadSender;
    use crate::state::ConnectionState;

    fn registry() -> (StreamManager, tokio::io::DuplexStream) {
        let (left, right) = tokio::io::duplex(4096);
        let state = ConnectionState::new();
        let sender = Arc::new(PayloadSender::new(left, FrameConfig::default(), state.clone()));
        (
            StreamManager::new(sender, Arc::new(RequestManager::new()), state),
            right,
        )
    }

    fn envelope_bytes(envelope: &Envelope) -> Bytes {
        Bytes::from(envelope.to_bytes().unwrap())
    }

    fn response_with(streams: Vec<StreamDescription>) -> Envelope {
        Envelope::Response(ResponseEnvelope {
            status_code: 200,
            streams,
        })
    }

    fn stream_frame(id: StreamId, end: bool, payload: &'static [u8]) -> Frame {
        Frame::new(FrameType::Stream, id, end, payload)
    }

    #[test]
    fn single_frame_request_dispatches() {
        let (registry, _wire) = registry();
        let mut assembler = Assembler::new(1024, 1024);
        let id = StreamId::new();
        let envelope = Envelope::Request(RequestEnvelope {
            verb: "GET".into(),
            path: "/version".into(),
            streams: Vec::new(),
        });

        let out = assembler.on_frame(
            Frame::new(FrameType::Request, id, true, envelope_bytes(&envelope)),
            &registry,
        );
        match out {
            Assembled::Envelope {
                id: got,
                envelope: got_env,
                attachments,
                rejected,
            } => {
                assert_eq!(got, id);
                assert_eq!(got_env, envelope);
                assert!(attachments.is_empty() && rejected.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(assembler.in_progress(), 0);
    }

    #[test]
    fn split_envelope_waits_for_end() {
        let (registry, _wire) = registry();
        let mut assembler = Assembler::new(1024, 1024);
        let id = StreamId::new();
        let bytes = envelope_bytes(&response_with(Vec::new()));
        let (head, tail) = bytes.split_at(5);

        let first = assembler.on_frame(
            Frame::new(FrameType::Response, id, false, Bytes::copy_from_slice(head)),
            &registry,
        );
        assert!(matches!(first, Assembled::Pending));
        let second = assembler.on_frame(
            Frame::new(FrameType::Response, id, true, Bytes::copy_from_slice(tail)),
            &registry,
        );
        assert!(matches!(second, Assembled::Envelope { .. }));
    }

    #[tokio::test]
    async fn envelope_dispatches_before_attachment_completes() {
        let (registry, _wire) = registry();
        let mut assembler = Assembler::new(1024, 1024);
        let attachment = StreamId::new();
        let env = response_with(vec![StreamDescription {
            id: attachment,
            content_type: "text/plain".into(),
            length: None,
        }]);

        let Assembled::Envelope { attachments, .. } = assembler.on_frame(
            Frame::new(FrameType::Response, StreamId::new(), true, envelope_bytes(&env)),
            &registry,
        ) else {
            panic!("envelope should dispatch");
        };
        let stream = attachments[0].clone();
        assert!(!stream.is_ended());
        assert_eq!(stream.content_type(), "text/plain");

        assembler.on_frame(stream_frame(attachment, false, b"hello "), &registry);
        let ended = assembler.on_frame(stream_frame(attachment, true, b"world"), &registry);
        assert!(matches!(ended, Assembled::StreamEnded(id) if id == attachment));

        let body = stream.reader().read_to_end().await.unwrap();
        assert_eq!(body.as_ref(), b"hello world");
        assert_eq!(assembler.in_progress(), 0);
        assert_eq!(registry.active_count(), 0);
    }

    #[tokio::test]
    async fn stream_frames_before_envelope_are_buffered() {
        let (registry, _wire) = registry();
        let mut assembler = Assembler::new(1024, 1024);
        let attachment = StreamId::new();

        assembler.on_frame(stream_frame(attachment, false, b"early "), &registry);
        assembler.on_frame(stream_frame(attachment, true, b"bird"), &registry);
        assert_eq!(assembler.in_progress(), 1);

        let env = response_with(vec![StreamDescription {
            id: attachment,
            content_type: "text/plain".into(),
            length: Some(10),
        }]);
        let Assembled::Envelope { attachments, .. } = assembler.on_frame(
            Frame::new(FrameType::Response, StreamId::new(), true, envelope_bytes(&env)),
            &registry,
        ) else {
            panic!("envelope should dispatch");
        };

        assert_eq!(attachments[0].content_type(), "text/plain");
        assert_eq!(attachments[0].length(), Some(10));
        let body = attachments[0].reader().read_to_end().await.unwrap();
        assert_eq!(body.as_ref(), b"early bird");
        assert_eq!(assembler.in_progress(), 0);
    }

    #[tokio::test]
    async fn interleaved_ids_reassemble_independently() {
        let (registry, _wire) = registry();
        let mut assembler = Assembler::new(1024, 1024);
        let a = StreamId::new();
        let b = StreamId::new();
        let env = response_with(vec![
            StreamDescription {
                id: a,
                content_type: "text/plain".into(),
                length: None,
            },
            StreamDescription {
                id: b,
                content_type: "text/plain".into(),
                length: None,
            },
        ]);

        assembler.on_frame(stream_frame(b, false, b"B1"), &registry);
        let Assembled::Envelope { attachments, .. } = assembler.on_frame(
            Frame::new(FrameType::Response, StreamId::new(), true, envelope_bytes(&env)),
            &registry,
        ) else {
            panic!("envelope should dispatch");
        };
        assembler.on_frame(stream_frame(a, false, b"A1"), &registry);
        assembler.on_frame(stream_frame(b, false, b"B2"), &registry);
        assembler.on_frame(stream_frame(a, true, b"A2"), &registry);
        assembler.on_frame(stream_frame(b, true, b"B3"), &registry);

        let body_a = attachments[0].reader().read_to_end().await.unwrap();
        let body_b = attachments[1].reader().read_to_end().await.unwrap();
        assert_eq!(body_a.as_ref(), b"A1A2");
        assert_eq!(body_b.as_ref(), b"B1B2B3");
    }

    #[test]
    fn frames_for_retired_ids_are_dropped() {
        let (registry, _wire) = registry();
        let mut assembler = Assembler::new(1024, 1024);
        let id = StreamId::new();
        let bytes = envelope_bytes(&response_with(Vec::new()));

        assembler.on_frame(Frame::new(FrameType::Response, id, true, bytes.clone()), &registry);
        let again = assembler.on_frame(Frame::new(FrameType::Response, id, true, bytes), &registry);
        assert!(matches!(again, Assembled::Pending));
    }

    #[test]
    fn malformed_envelope_is_reported() {
        let (registry, _wire) = registry();
        let mut assembler = Assembler::new(1024, 1024);
        let id = StreamId::new();
        let out = assembler.on_frame(
            Frame::new(FrameType::Request, id, true, Bytes::from_static(b"{oops")),
            &registry,
        );
        assert!(matches!(
            out,
            Assembled::Malformed { frame_type: FrameType::Request, error: ProtocolError::Envelope(_), .. }
        ));
    }

    #[test]
    fn kind_change_mid_unit_is_malformed() {
        let (registry, _wire) = registry();
        let mut assembler = Assembler::new(1024, 1024);
        let id = StreamId::new();
        assembler.on_frame(
            Frame::new(FrameType::Request, id, false, Bytes::from_static(b"{")),
            &registry,
        );
        let out = assembler.on_frame(
            Frame::new(FrameType::Response, id, true, Bytes::from_static(b"}")),
            &registry,
        );
        assert!(matches!(out, Assembled::Malformed { frame_type: FrameType::Request, .. }));
    }

    #[test]
    fn oversized_envelope_is_dropped() {
        let (registry, _wire) = registry();
        let mut assembler = Assembler::new(1024, 8);
        let id = StreamId::new();
        let out = assembler.on_frame(
            Frame::new(FrameType::Response, id, true, envelope_bytes(&response_with(Vec::new()))),
            &registry,
        );
        assert!(matches!(out, Assembled::Pending));
        assert_eq!(assembler.in_progress(), 0);
    }

    #[tokio::test]
    async fn declared_oversized_attachment_is_rejected_up_front() {
        let (registry, _wire) = registry();
        let mut assembler = Assembler::new(16, 1024);
        let attachment = StreamId::new();
        let env = response_with(vec![StreamDescription {
            id: attachment,
            content_type: "application/octet-stream".into(),
            length: Some(1_000),
        }]);

        let Assembled::Envelope {
            attachments,
            rejected,
            ..
        } = assembler.on_frame(
            Frame::new(FrameType::Response, StreamId::new(), true, envelope_bytes(&env)),
            &registry,
        )
        else {
            panic!("envelope should dispatch");
        };
        assert_eq!(rejected, vec![attachment]);

        assembler.on_frame(stream_frame(attachment, false, b"ignored"), &registry);
        assert_eq!(attachments[0].written(), 0);
        assert_eq!(assembler.in_progress(), 0);
        let err = attachments[0].reader().read().await.unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::PayloadTooLarge { size: 1_000, max: 16, .. }
        ));
    }

    #[test]
    fn growing_attachment_is_rejected_at_ceiling() {
        let (registry, _wire) = registry();
        let mut assembler = Assembler::new(8, 1024);
        let attachment = StreamId::new();

        let first = assembler.on_frame(stream_frame(attachment, false, b"12345"), &registry);
        assert!(matches!(first, Assembled::Pending));
        let second = assembler.on_frame(stream_frame(attachment, false, b"67890"), &registry);
        assert!(matches!(second, Assembled::StreamRejected(id) if id == attachment));
    }

    #[test]
    fn control_frames_pass_through() {
        let (registry, _wire) = registry();
        let mut assembler = Assembler::new(8, 8);
        let id = StreamId::new();
        assert!(matches!(
            assembler.on_frame(Frame::cancel_stream(id), &registry),
            Assembled::CancelStream(got) if got == id
        ));
        assert!(matches!(
            assembler.on_frame(Frame::cancel_all(), &registry),
            Assembled::CancelAll
        ));
    }

    fn claim_one(assembler: &mut Assembler, registry: &StreamManager, attachment: StreamId) -> ContentStream {
        let env = response_with(vec![StreamDescription {
            id: attachment,
            content_type: "application/octet-stream".into(),
            length: None,
        }]);
        let Assembled::Envelope { mut attachments, .. } = assembler.on_frame(
            Frame::new(FrameType::Response, StreamId::new(), true, envelope_bytes(&env)),
            registry,
        ) else {
            panic!("envelope should dispatch");
        };
        attachments.remove(0)
    }

    #[test]
    fn retired_ids_stay_within_window() {
        let (registry, _wire) = registry();
        let mut assembler = Assembler::new(1024, 1024).with_retired_window(64);
        let bytes = envelope_bytes(&response_with(Vec::new()));

        let mut last = StreamId::new();
        for _ in 0..10_000 {
            last = StreamId::new();
            assembler.on_frame(Frame::new(FrameType::Response, last, true, bytes.clone()), &registry);
        }
        assert_eq!(assembler.in_progress(), 0);
        assert_eq!(assembler.retired_count(), 64);

        // Recent ids are still recognised.
        let again = assembler.on_frame(Frame::new(FrameType::Response, last, true, bytes), &registry);
        assert!(matches!(again, Assembled::Pending));
    }

    #[tokio::test]
    async fn local_cancel_releases_buffered_stream() {
        let (registry, _wire) = registry();
        let mut discarded = registry.take_discarded().unwrap();
        let mut assembler = Assembler::new(1 << 20, 1024);
        let attachment = StreamId::new();
        let stream = claim_one(&mut assembler, &registry, attachment);

        assembler.on_frame(Frame::new(FrameType::Stream, attachment, false, vec![7u8; 4000]), &registry);
        assert_eq!(assembler.in_progress(), 1);

        assert!(registry.cancel_stream(attachment).await.unwrap());
        assembler.discard(discarded.try_recv().unwrap());
        assert_eq!(assembler.in_progress(), 0);
        assert_eq!(registry.active_count(), 0);

        let late = assembler.on_frame(stream_frame(attachment, true, b"tail"), &registry);
        assert!(matches!(late, Assembled::Pending));
        assert_eq!(assembler.in_progress(), 0);
        assert!(stream.reader().read().await.is_err());
    }

    #[test]
    fn rejected_claimed_stream_is_released() {
        let (registry, _wire) = registry();
        let mut assembler = Assembler::new(8, 1024);
        let attachment = StreamId::new();
        let _stream = claim_one(&mut assembler, &registry, attachment);

        let out = assembler.on_frame(stream_frame(attachment, false, b"0123456789"), &registry);
        assert!(matches!(out, Assembled::StreamRejected(id) if id == attachment));
        assert_eq!(assembler.in_progress(), 0);
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn stream_cancelled_by_reader_is_released_on_next_frame() {
        let (registry, _wire) = registry();
        let mut assembler = Assembler::new(1024, 1024);
        let attachment = StreamId::new();
        let stream = claim_one(&mut assembler, &registry, attachment);
        assembler.on_frame(stream_frame(attachment, false, b"first"), &registry);

        assert!(stream.cancel());
        let out = assembler.on_frame(stream_frame(attachment, false, b"second"), &registry);
        assert!(matches!(out, Assembled::Pending));
        assert_eq!(assembler.in_progress(), 0);
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn discarded_unclaimed_stream_is_claimed_cancelled() {
        let (registry, _wire) = registry();
        let mut assembler = Assembler::new(1024, 1024);
        let attachment = StreamId::new();
        assembler.on_frame(stream_frame(attachment, false, b"early"), &registry);

        assembler.discard(attachment);
        assert_eq!(assembler.in_progress(), 0);
        let stream = claim_one(&mut assembler, &registry, attachment);
        assert!(stream.is_cancelled());
    }
}
