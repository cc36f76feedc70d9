//! Typed errors for envelope encoding and decoding.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unsupported protocol version: expected {expected}, got {got}")]
    VersionMismatch { expected: u32, got: u32 },

    #[error("response is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("response rejected by strict decode: {0}")]
    StrictDecode(#[source] serde_json::Error),

    #[error("response has status=error but no error message")]
    EmptyError,

    #[error("plugin stdout was empty")]
    EmptyStdout,

    #[error("event `{event_type}` is only valid for the handle command")]
    EventOutsideHandle { event_type: String },

    #[error("failed to encode request: {0}")]
    Encode(#[source] serde_json::Error),
}
