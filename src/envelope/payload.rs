//! Type-erased payloads and candidate-list resolution.
//!
//! A payload travels as `(type_tag, bytes)`. The receiver resolves it against
//! a closed, explicitly registered list of `(tag, decode)` candidates; the
//! first candidate whose tag matches and whose decode succeeds wins.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{Error, Result};

/// A concrete message schema with a fully-qualified type tag.
pub trait Payload: Serialize + DeserializeOwned + Send + 'static {
    /// Schema name carried on the wire, e.g. `"qmq.WebGetRequest"`.
    const TYPE_TAG: &'static str;
}

/// Encoded payload plus the tag needed to decode it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnyPayload {
    pub type_tag: String,
    /// Encoded as MessagePack `bin`.
    pub bytes: Bytes,
}

impl AnyPayload {
    /// Pack a typed payload under its own tag.
    pub fn pack<P: Payload>(content: &P) -> Result<Self> {
        Self::pack_as(content, P::TYPE_TAG)
    }

    /// Pack any serializable value under an explicit tag.
    pub fn pack_as<T: Serialize + ?Sized>(content: &T, type_tag: impl Into<String>) -> Result<Self> {
        Ok(Self {
            type_tag: type_tag.into(),
            bytes: Bytes::from(rmp_serde::to_vec_named(content)?),
        })
    }

    pub fn is<P: Payload>(&self) -> bool {
        self.type_tag == P::TYPE_TAG
    }

    /// Decode as `P`, refusing payloads tagged with another schema.
    pub fn unpack<P: Payload>(&self) -> Result<P> {
        if !self.is::<P>() {
            return Err(Error::unexpected_payload(P::TYPE_TAG, &self.type_tag));
        }
        Ok(rmp_serde::from_slice(&self.bytes)?)
    }
}

type DecodeFn<T> = Box<dyn Fn(&[u8]) -> Result<T> + Send + Sync>;

/// One `(tag, decode)` entry in a candidate list.
pub struct Candidate<T> {
    tag: String,
    decode: DecodeFn<T>,
}

impl<T> Candidate<T> {
    /// Candidate with a hand-written decoder.
    pub fn new(
        tag: impl Into<String>,
        decode: impl Fn(&[u8]) -> Result<T> + Send + Sync + 'static,
    ) -> Self {
        Self {
            tag: tag.into(),
            decode: Box::new(decode),
        }
    }

    /// Candidate for payload `P`, mapped into the sum type `T` by `wrap`.
    pub fn of<P: Payload>(wrap: impl Fn(P) -> T + Send + Sync + 'static) -> Self {
        Self::new(P::TYPE_TAG, move |bytes| {
            let decoded: P = rmp_serde::from_slice(bytes)?;
            Ok(wrap(decoded))
        })
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    fn probe(&self, payload: &AnyPayload) -> Option<T> {
        if payload.type_tag != self.tag {
            return None;
        }
        match (self.decode)(&payload.bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::trace!(type_tag = %self.tag, error = %e, "candidate decode failed");
                None
            }
        }
    }
}

impl<P: Payload> Candidate<P> {
    /// Candidate that decodes `P` as itself.
    pub fn exact() -> Self {
        Self::of(|p: P| p)
    }
}

impl<T> fmt::Debug for Candidate<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Candidate").field("tag", &self.tag).finish()
    }
}

/// Resolve `payload` against `candidates` in priority order.
///
/// Returns the decoded value and the tag of the candidate that matched, or
/// `None` when no candidate accepts the payload.
pub fn try_unpack_as<'c, T>(
    payload: &AnyPayload,
    candidates: &'c [Candidate<T>],
) -> Option<(T, &'c str)> {
    candidates
        .iter()
        .find_map(|candidate| candidate.probe(payload).map(|v| (v, candidate.tag())))
}
