//! Typed store errors.
//!
//! The dispatcher is the only component that translates these into
//! job-level fail/retry decisions; everything else passes them upward.

use thiserror::Error;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("event context not found: {0}")]
    EventContextNotFound(String),

    #[error("origin anchor `{key}` is immutable once set by the lineage root")]
    OriginAnchorImmutable { key: String },

    #[error("serialized {what} is {size} bytes, exceeding the {max} byte cap")]
    TooLarge {
        what: &'static str,
        size: usize,
        max: usize,
    },

    #[error("stored {what} for `{owner}` is not a JSON object")]
    CorruptJson { what: &'static str, owner: String },

    #[error("plugin name must not be empty")]
    EmptyPluginName,
}

impl StoreError {
    /// Whether the failure is transient from the caller's point of view.
    ///
    /// Only raw database errors qualify; every semantic rejection here is
    /// deterministic and would fail again on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Database(_))
    }
}
