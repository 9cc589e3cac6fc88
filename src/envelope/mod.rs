//! Envelope codec - the outer wire structure.
//!
//! Every frame on the connection is one [`Envelope`]:
//! ```text
//! Envelope
//! ├── header
//! │   ├── request_id   optional UUID (absent on server pushes)
//! │   └── timestamp    RFC 3339 instant
//! └── content          AnyPayload { type_tag, bytes }
//! ```
//! The whole envelope is MessagePack (`rmp-serde`, named fields). The codec
//! never inspects payload bytes; see [`payload`] for tag-driven resolution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{RequestId, Result};

pub mod payload;

pub use payload::{try_unpack_as, AnyPayload, Candidate, Payload};

/// Envelope header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    pub timestamp: DateTime<Utc>,
}

impl Header {
    /// Header for a correlated request.
    pub fn request(id: RequestId) -> Self {
        Self {
            request_id: Some(id),
            timestamp: Utc::now(),
        }
    }

    /// Header with no correlation id (fire-and-forget or server push).
    pub fn push() -> Self {
        Self {
            request_id: None,
            timestamp: Utc::now(),
        }
    }
}

/// Header plus type-erased content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub header: Header,
    pub content: AnyPayload,
}

impl Envelope {
    pub fn new(header: Header, content: AnyPayload) -> Self {
        Self { header, content }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Parse an envelope. Any failure is reported as `MalformedEnvelope`.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(bytes).map_err(|e| crate::Error::malformed_envelope(e.to_string()))
    }
}

/// Pack `content` under `type_tag`, wrap it with `header`, serialize.
pub fn encode<T: Serialize + ?Sized>(content: &T, type_tag: &str, header: Header) -> Result<Vec<u8>> {
    Envelope::new(header, AnyPayload::pack_as(content, type_tag)?).encode()
}

/// Parse the outer envelope.
pub fn decode(bytes: &[u8]) -> Result<Envelope> {
    Envelope::decode(bytes)
}
