//! Durable state for Ductile: the job queue, per-plugin state, and the
//! event-context ledger.
//!
//! All three stores share one SQLite pool (see `ductile_db`) and keep
//! their transactions short - nothing here is ever held open across a
//! plugin subprocess invocation.

pub mod context;
pub mod error;
pub mod models;
pub mod plugin_state;
pub mod queue;

pub use context::ContextStore;
pub use error::{StoreError, StoreResult};
pub use models::{EnqueueRequest, EventContext, JobRecord, JobStatus, RetryPolicy};
pub use plugin_state::PluginStateStore;
pub use queue::{JobQueue, QueueStore};

/// Upper bound for a serialized plugin-state or context-baggage object.
pub const MAX_JSON_BYTES: usize = 1024 * 1024;
