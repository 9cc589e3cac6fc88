//! Client error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation. Decode and
//! routing failures are recovered inside the client; only the variants tied to
//! a single in-flight request ever reach a caller.

use thiserror::Error;

use super::RequestId;

/// Client result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the protocol client.
#[derive(Error, Debug)]
pub enum Error {
    /// Outer envelope bytes could not be parsed (corrupt or version-mismatched peer).
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// A response referenced a request id that is not pending.
    #[error("unknown response id: {0}")]
    UnknownResponseId(RequestId),

    /// A request id collided with a live pending entry.
    #[error("duplicate request id: {0}")]
    DuplicateRequestId(RequestId),

    /// A pending request outlived the configured timeout.
    #[error("request timeout: {0}")]
    RequestTimeout(String),

    /// Not connected, connection lost, or client shut down.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Payload did not match the expected type tag or failed to decode.
    #[error("unexpected payload: expected {expected}, got {actual}")]
    UnexpectedPayload { expected: String, actual: String },

    /// Raised by a notification listener.
    #[error("listener error: {0}")]
    Listener(String),

    /// Invalid configuration.
    #[error("config error: {0}")]
    Config(String),

    /// MessagePack encoding errors.
    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding errors.
    #[error("decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// JSON errors (config files).
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable error code for logs and callers that branch on error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Error::MalformedEnvelope(_) => "MALFORMED_ENVELOPE",
            Error::UnknownResponseId(_) => "UNKNOWN_RESPONSE_ID",
            Error::DuplicateRequestId(_) => "DUPLICATE_REQUEST_ID",
            Error::RequestTimeout(_) => "REQUEST_TIMEOUT",
            Error::ConnectionClosed(_) => "CONNECTION_CLOSED",
            Error::UnexpectedPayload { .. } => "UNEXPECTED_PAYLOAD",
            Error::Listener(_) => "LISTENER",
            Error::Config(_) => "CONFIG",
            Error::Encode(_) | Error::Decode(_) | Error::Serialization(_) => "SERIALIZATION",
            Error::Io(_) => "IO",
        }
    }
}

// Convenience constructors
impl Error {
    pub fn malformed_envelope(msg: impl Into<String>) -> Self {
        Self::MalformedEnvelope(msg.into())
    }

    pub fn request_timeout(msg: impl Into<String>) -> Self {
        Self::RequestTimeout(msg.into())
    }

    pub fn connection_closed(msg: impl Into<String>) -> Self {
        Self::ConnectionClosed(msg.into())
    }

    pub fn unexpected_payload(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::UnexpectedPayload {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub fn listener(msg: impl Into<String>) -> Self {
        Self::Listener(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
