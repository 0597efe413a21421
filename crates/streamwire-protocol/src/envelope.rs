//! Structured metadata carried by Request and Response frames.
//!
//! Wire shape (JSON): `{verb?, path?, statusCode?, streams: [{id, contentType, length?}]}`.

use serde::{Deserialize, Serialize};
use streamwire_frame::{FrameType, StreamId};

use crate::error::{ProtocolError, Result};

/// Content type recorded when an attachment declares none.
pub const UNKNOWN_CONTENT_TYPE: &str = "unknown";

fn unknown_content_type() -> String {
    UNKNOWN_CONTENT_TYPE.to_string()
}

/// Announces one attachment of a request or response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamDescription {
    pub id: StreamId,
    #[serde(default = "unknown_content_type")]
    pub content_type: String,
    /// Total body length; absent when unknown (chunked).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    pub verb: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub streams: Vec<StreamDescription>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub streams: Vec<StreamDescription>,
}

/// Either envelope kind, tagged by the frame type it travels under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    Request(RequestEnvelope),
    Response(ResponseEnvelope),
}

impl Envelope {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Self::Request(_) => FrameType::Request,
            Self::Response(_) => FrameType::Response,
        }
    }

    pub fn streams(&self) -> &[StreamDescription] {
        match self {
            Self::Request(req) => &req.streams,
            Self::Response(resp) => &resp.streams,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let bytes = match self {
            Self::Request(req) => serde_json::to_vec(req)?,
            Self::Response(resp) => serde_json::to_vec(resp)?,
        };
        Ok(bytes)
    }

    /// Decode the reassembled payload of a Request or Response unit.
    pub fn from_bytes(frame_type: FrameType, payload: &[u8]) -> Result<Self> {
        match frame_type {
            FrameType::Request => Ok(Self::Request(serde_json::from_slice(payload)?)),
            FrameType::Response => Ok(Self::Response(serde_json::from_slice(payload)?)),
            other => Err(ProtocolError::Envelope(format!(
                "{other:?} frames do not carry an envelope"
            ))),
        }
    }
}
