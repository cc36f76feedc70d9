//! Sentinel - Control Plane for Ductile
//!
//! Composes the durable stores, the plugin registry, the router, and the
//! plugin runner into a worker pool that drains the job queue. One hop
//! per job: claim, snapshot state and baggage, hand the plugin its
//! envelope, apply the response, route the emitted events into child
//! jobs.

pub mod config;
pub mod dispatcher;
pub mod pool;
pub mod registry;
pub mod router;
pub mod sentinel;

pub use config::OrchestratorConfig;
pub use dispatcher::Dispatcher;
pub use pool::WorkerPool;
pub use registry::{PluginHandle, PluginManifest, PluginRegistry, RegistryError};
pub use router::{MatchedStep, Pipeline, Router, RouterError, Step};
pub use sentinel::Sentinel;
