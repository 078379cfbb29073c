//! Pausable – a durable, pausable step interpreter
//!
//! This crate runs ordered sequences of blocks for long-running workflow
//! instances:
//! - Blocks execute through a pluggable remote executor with timeouts and retries
//! - Designated blocks durably suspend the run until an external resume
//! - Concurrent resumes are serialized so exactly one succeeds per pause
//! - Lifecycle events fan out to observers through a per-instance event bus
//! - Every run is journaled and replayed deterministically after a restart

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Interpreter runtime: event bus, pause gate, state machine, and host
pub mod runtime;

// Re-export key types for convenience
pub use runtime::{RuntimeConfig, Worker};

/// Current version of the crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
