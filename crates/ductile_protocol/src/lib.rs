//! Plugin Envelope Protocol v1
//!
//! Wire format for Orchestrator <-> Plugin communication.
//! One request on stdin, one response on stdout, both single-line JSON
//! terminated by a newline. Stderr is free-form diagnostic text.
//!
//! # Envelope shapes
//!
//! Request (orchestrator -> plugin):
//! ```text
//! {"protocol":1,"job_id":"...","command":"handle","config":{...},
//!  "state":{...},"context":{...},"workspace_dir":"...","event":{...},
//!  "deadline_at":"2026-01-02T03:04:05.000000006Z"}
//! ```
//!
//! Response (plugin -> orchestrator):
//! ```text
//! {"status":"ok","events":[...],"state_updates":{...},"logs":[...]}
//! ```
//!
//! Decoding is strict by default: unknown fields, a missing or invalid
//! `status`, and `status=error` without an error message are all rejected.
//! A lenient decode path exists for diagnostics so the operator can see
//! what a misbehaving plugin actually wrote to stdout.

pub mod envelope;
pub mod error;
pub mod event;
pub mod types;

pub use envelope::{
    decode_request, decode_response, decode_response_lenient, encode_request, LenientDecode,
    Request, Response,
};
pub use error::{ProtocolError, Result};
pub use event::{EmittedEvent, StampedEvent};
pub use types::{Command, LogEntry, LogLevel, ResponseStatus};

/// Envelope protocol version. The only version this orchestrator speaks.
pub const PROTOCOL_VERSION: u32 = 1;
