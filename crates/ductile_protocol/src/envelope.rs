//! Request/response envelopes and the strict + lenient codec.

use crate::error::{ProtocolError, Result};
use crate::event::{EmittedEvent, StampedEvent};
use crate::types::{Command, LogEntry, ResponseStatus};
use crate::PROTOCOL_VERSION;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Request envelope, orchestrator -> plugin stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol: u32,
    pub job_id: String,
    pub command: Command,
    pub config: Map<String, Value>,
    pub state: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<StampedEvent>,
    pub deadline_at: DateTime<Utc>,
}

impl Request {
    /// Validate cross-field rules that serde cannot express.
    ///
    /// An `event` is only meaningful for `handle`; any other command with
    /// an event attached is a bug in the caller, not the plugin.
    pub fn validate(&self) -> Result<()> {
        if self.protocol != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: self.protocol,
            });
        }
        if let Some(event) = &self.event {
            if self.command != Command::Handle {
                return Err(ProtocolError::EventOutsideHandle {
                    event_type: event.event_type.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Response envelope, plugin stdout -> orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Response {
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<EmittedEvent>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub state_updates: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<LogEntry>,
}

impl Response {
    /// Whether a failed job should be retried. Plugins opt out explicitly.
    pub fn should_retry(&self) -> bool {
        self.retry.unwrap_or(true)
    }

    pub fn is_error(&self) -> bool {
        self.status == ResponseStatus::Error
    }

    fn validate(&self) -> Result<()> {
        if self.status == ResponseStatus::Error
            && self.error.as_deref().unwrap_or("").trim().is_empty()
        {
            return Err(ProtocolError::EmptyError);
        }
        Ok(())
    }
}

/// Outcome of the lenient decode path.
///
/// Used when strict decode has already failed: the operator gets either a
/// best-effort parse or the raw stdout bytes with a description of what
/// was wrong with them.
#[derive(Debug, Clone)]
pub enum LenientDecode {
    /// Parsed despite strict rejection (e.g. unknown fields present).
    Parsed(Response),
    /// Not a response at all. Raw bytes preserved for the operator.
    Garbage { raw: Vec<u8>, error: String },
}

/// Encode a request as single-line JSON terminated by a newline.
pub fn encode_request(request: &Request) -> Result<Vec<u8>> {
    request.validate()?;
    let mut line = serde_json::to_vec(request).map_err(ProtocolError::Encode)?;
    line.push(b'\n');
    Ok(line)
}

/// Strictly decode a request envelope (used by test plugins and fixtures).
pub fn decode_request(bytes: &[u8]) -> Result<Request> {
    let request: Request =
        serde_json::from_slice(bytes).map_err(ProtocolError::StrictDecode)?;
    request.validate()?;
    Ok(request)
}

/// Strictly decode a response envelope.
///
/// Rejects unknown fields, a missing or invalid `status`, and
/// `status=error` with an empty error message.
pub fn decode_response(bytes: &[u8]) -> Result<Response> {
    let trimmed = trim_ascii(bytes);
    if trimmed.is_empty() {
        return Err(ProtocolError::EmptyStdout);
    }
    let response: Response =
        serde_json::from_slice(trimmed).map_err(ProtocolError::StrictDecode)?;
    response.validate()?;
    Ok(response)
}

/// Lenient sibling of [`decode_response`], for diagnostics only.
///
/// Unknown fields are tolerated; everything else that strict decode
/// enforces (valid JSON, valid status, error message on error) still
/// applies. Never use the result to drive state mutation decisions
/// without the strict decode having been attempted first.
pub fn decode_response_lenient(bytes: &[u8]) -> LenientDecode {
    // Identical field set, minus deny_unknown_fields.
    #[derive(Deserialize)]
    struct Loose {
        status: ResponseStatus,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        retry: Option<bool>,
        #[serde(default)]
        events: Vec<EmittedEvent>,
        #[serde(default)]
        state_updates: Map<String, Value>,
        #[serde(default)]
        logs: Vec<LogEntry>,
    }

    let trimmed = trim_ascii(bytes);
    if trimmed.is_empty() {
        return LenientDecode::Garbage {
            raw: bytes.to_vec(),
            error: ProtocolError::EmptyStdout.to_string(),
        };
    }

    // Events may also carry junk fields when the plugin is sloppy, so the
    // lenient pass reparses them from raw values instead of EmittedEvent.
    let value: Value = match serde_json::from_slice(trimmed) {
        Ok(v) => v,
        Err(e) => {
            return LenientDecode::Garbage {
                raw: bytes.to_vec(),
                error: ProtocolError::InvalidJson(e).to_string(),
            }
        }
    };

    let loose: Loose = match serde_json::from_value(sanitize_events(value)) {
        Ok(l) => l,
        Err(e) => {
            return LenientDecode::Garbage {
                raw: bytes.to_vec(),
                error: ProtocolError::StrictDecode(e).to_string(),
            }
        }
    };

    let response = Response {
        status: loose.status,
        error: loose.error,
        retry: loose.retry,
        events: loose.events,
        state_updates: loose.state_updates,
        logs: loose.logs,
    };

    if let Err(e) = response.validate() {
        return LenientDecode::Garbage {
            raw: bytes.to_vec(),
            error: e.to_string(),
        };
    }

    LenientDecode::Parsed(response)
}

/// Strip unknown keys from event objects so the loose parse accepts them.
fn sanitize_events(mut value: Value) -> Value {
    const EVENT_KEYS: [&str; 4] = ["type", "payload", "dedupe_key", "event_id"];

    if let Some(events) = value.get_mut("events").and_then(Value::as_array_mut) {
        for event in events {
            if let Some(obj) = event.as_object_mut() {
                obj.retain(|k, _| EVENT_KEYS.contains(&k.as_str()));
            }
        }
    }
    value
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|i| i + 1)
        .unwrap_or(start);
    &bytes[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(command: Command) -> Request {
        Request {
            protocol: PROTOCOL_VERSION,
            job_id: "job-1".into(),
            command,
            config: Map::new(),
            state: Map::new(),
            context: None,
            workspace_dir: None,
            event: None,
            deadline_at: Utc::now(),
        }
    }

    #[test]
    fn encode_emits_one_newline_terminated_line() {
        let bytes = encode_request(&request(Command::Poll)).unwrap();
        assert_eq!(bytes.last(), Some(&b'\n'));
        assert_eq!(bytes.iter().filter(|&&b| b == b'\n').count(), 1);
    }

    #[test]
    fn encode_rejects_event_outside_handle() {
        let mut req = request(Command::Poll);
        req.event = Some(StampedEvent::stamp(
            EmittedEvent {
                event_type: "x".into(),
                payload: Map::new(),
                dedupe_key: None,
                event_id: None,
            },
            "p",
            Utc::now(),
        ));
        assert!(matches!(
            encode_request(&req),
            Err(ProtocolError::EventOutsideHandle { .. })
        ));
    }

    #[test]
    fn decode_request_rejects_wrong_protocol() {
        let mut req = request(Command::Health);
        req.protocol = 2;
        let bytes = serde_json::to_vec(&req).unwrap();
        assert!(matches!(
            decode_request(&bytes),
            Err(ProtocolError::VersionMismatch { expected: 1, got: 2 })
        ));
    }

    #[test]
    fn strict_decode_accepts_minimal_ok() {
        let resp = decode_response(br#"{"status":"ok"}"#).unwrap();
        assert_eq!(resp.status, ResponseStatus::Ok);
        assert!(resp.should_retry());
        assert!(resp.events.is_empty());
    }

    #[test]
    fn strict_decode_rejects_unknown_fields() {
        let err = decode_response(br#"{"status":"ok","unexpected":1}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::StrictDecode(_)));
    }

    #[test]
    fn strict_decode_rejects_missing_status() {
        assert!(decode_response(br#"{"events":[]}"#).is_err());
    }

    #[test]
    fn strict_decode_rejects_error_without_message() {
        let err = decode_response(br#"{"status":"error"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::EmptyError));
        let err = decode_response(br#"{"status":"error","error":"  "}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::EmptyError));
    }

    #[test]
    fn strict_decode_rejects_empty_stdout() {
        assert!(matches!(
            decode_response(b"  \n"),
            Err(ProtocolError::EmptyStdout)
        ));
    }

    #[test]
    fn lenient_decode_parses_despite_unknown_fields() {
        match decode_response_lenient(br#"{"status":"ok","unexpected":1}"#) {
            LenientDecode::Parsed(resp) => assert_eq!(resp.status, ResponseStatus::Ok),
            LenientDecode::Garbage { .. } => panic!("lenient decode should tolerate extras"),
        }
    }

    #[test]
    fn lenient_decode_returns_raw_bytes_for_garbage() {
        let raw = b"Traceback (most recent call last):";
        match decode_response_lenient(raw) {
            LenientDecode::Garbage { raw: got, error } => {
                assert_eq!(got, raw.to_vec());
                assert!(error.contains("not valid JSON"));
            }
            LenientDecode::Parsed(_) => panic!("a traceback is not a response"),
        }
    }

    #[test]
    fn response_retry_defaults_true_and_honors_false() {
        let resp =
            decode_response(br#"{"status":"error","error":"boom","retry":false}"#).unwrap();
        assert!(!resp.should_retry());
    }

    #[test]
    fn request_round_trips_with_event() {
        let mut req = request(Command::Handle);
        req.event = Some(StampedEvent::stamp(
            EmittedEvent {
                event_type: "test.triggered".into(),
                payload: json!({"origin_user": "matt"}).as_object().cloned().unwrap(),
                dedupe_key: None,
                event_id: Some("stable-id".into()),
            },
            "trigger",
            Utc::now(),
        ));
        req.workspace_dir = Some("/tmp/ws/job-1".into());
        let bytes = encode_request(&req).unwrap();
        let decoded = decode_request(&bytes[..bytes.len() - 1]).unwrap();
        assert_eq!(decoded, req);
    }
}
