//! Identifier newtypes shared across the orchestrator.
//!
//! Job and context ids are minted here as UUIDs, and values read back
//! from our own storage are trusted as-is. Event identity is looser by
//! design: a plugin may pin its own id (a dedupe key, an upstream
//! message id), and the orchestrator adopts it verbatim because a
//! stable caller-chosen value is exactly what keeps child enqueue
//! idempotent across parent retries. Only when the plugin supplies
//! nothing does an event get a minted UUID.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Rejected operator input for an id that must be UUID-shaped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {label}: {reason}")]
pub struct IdParseError {
    label: &'static str,
    reason: String,
}

fn ensure_uuid(label: &'static str, value: &str) -> Result<(), IdParseError> {
    match Uuid::parse_str(value) {
        Ok(_) => Ok(()),
        Err(e) => Err(IdParseError {
            label,
            reason: e.to_string(),
        }),
    }
}

/// Identifier of one job row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Mint a fresh id for a new queue row.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Rehydrate an id read back from our own storage.
    ///
    /// Not validated: the queue only ever writes what [`JobId::new`]
    /// minted, so a bad value here means the database was edited by
    /// hand.
    pub fn from_string(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Parse operator input (CLI arguments), enforcing UUID shape.
    pub fn parse(value: &str) -> Result<Self, IdParseError> {
        ensure_uuid("job id", value)?;
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for JobId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Identifier of one row in the event-context ledger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventContextId(String);

impl EventContextId {
    /// Mint a fresh id for a new ledger row.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Rehydrate an id read back from our own storage (see
    /// [`JobId::from_string`] for the trust argument).
    pub fn from_string(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Parse operator input, enforcing UUID shape.
    pub fn parse(value: &str) -> Result<Self, IdParseError> {
        ensure_uuid("event context id", value)?;
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for EventContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EventContextId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Identity of a plugin-emitted event.
///
/// Opaque on purpose. Whatever the plugin pinned (explicit id, dedupe
/// key, payload id) is adopted verbatim; there is no UUID requirement
/// and no parse path, because the value's only job is to be stable
/// across re-executions of the same parent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    /// Adopt a plugin-supplied identity verbatim.
    pub fn from_string(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Mint an identity for an event whose plugin supplied none.
    /// Such events are unique per emission, so parent retries will
    /// produce fresh children for them.
    pub fn generated() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::generated()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
