//! SQLite control plane for Ductile.
//!
//! One orchestrator process owns one database file. Everything durable -
//! the job queue, the event-context ledger, per-plugin state - lives in
//! three tables created idempotently on first open. WAL mode keeps readers
//! off the writer's back; the busy timeout absorbs writer contention from
//! the worker pool.

pub mod lock;
pub mod pool;
pub mod schema;

pub use lock::{InstanceLock, LockError};
pub use pool::{now_rfc3339, open_pool, DbError};
pub use schema::init_schema;
