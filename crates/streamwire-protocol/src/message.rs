use bytes::Bytes;

use crate::content::ContentStream;
use crate::envelope::{RequestEnvelope, ResponseEnvelope};

pub const STATUS_OK: u16 = 200;
pub const STATUS_BAD_REQUEST: u16 = 400;
pub const STATUS_NOT_FOUND: u16 = 404;
pub const STATUS_INTERNAL_ERROR: u16 = 500;
pub const STATUS_NOT_IMPLEMENTED: u16 = 501;

/// An outbound request: verb, path and zero or more attachments.
#[derive(Debug, Clone)]
pub struct Request {
    pub verb: String,
    pub path: String,
    pub streams: Vec<ContentStream>,
}

impl Request {
    pub fn new(verb: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            verb: verb.into(),
            path: path.into(),
            streams: Vec::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new("GET", path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new("POST", path)
    }

    /// Attach an existing stream (possibly still being written).
    pub fn with_stream(mut self, stream: ContentStream) -> Self {
        self.streams.push(stream);
        self
    }

    /// Attach a complete in-memory body.
    pub fn with_body(self, content_type: impl Into<String>, body: impl Into<Bytes>) -> Self {
        self.with_stream(ContentStream::from_bytes(content_type, body))
    }

    pub(crate) fn envelope(&self) -> RequestEnvelope {
        RequestEnvelope {
            verb: self.verb.clone(),
            path: self.path.clone(),
            streams: self.streams.iter().map(ContentStream::description).collect(),
        }
    }
}

/// A response: status code and zero or more attachments.
#[derive(Debug, Clone)]
pub struct Response {
    pub status_code: u16,
    pub streams: Vec<ContentStream>,
}

impl Response {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            streams: Vec::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(STATUS_OK)
    }

    pub fn with_stream(mut self, stream: ContentStream) -> Self {
        self.streams.push(stream);
        self
    }

    pub fn with_body(self, content_type: impl Into<String>, body: impl Into<Bytes>) -> Self {
        self.with_stream(ContentStream::from_bytes(content_type, body))
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub(crate) fn envelope(&self) -> ResponseEnvelope {
        ResponseEnvelope {
            status_code: self.status_code,
            streams: self.streams.iter().map(ContentStream::description).collect(),
        }
    }
}
