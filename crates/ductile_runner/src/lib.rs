//! Plugin subprocess execution.
//!
//! One invocation, one child process: the encoded request goes down
//! stdin, one JSON response comes back on stdout, stderr is captured as
//! diagnostic text. The runner enforces the absolute deadline from the
//! envelope (SIGTERM, short grace, SIGKILL) and classifies every way a
//! plugin can misbehave so the dispatcher only has to make one
//! fail/retry decision.

pub mod cancel;
pub mod runner;

pub use cancel::CancellationToken;
pub use runner::{PluginRunner, RunnerError};
