//! Interpreter runtime and public API
//!
//! This module wires the subsystems together: the per-instance event bus and
//! pause gate, the block interpreter and its lifecycle notifier, the adapter
//! and journal that make runs durable, and the worker that hosts instances.

use std::path::PathBuf;
use std::time::Duration;
use serde::{Deserialize, Serialize};

// Submodules
pub mod adapter;
pub mod error;
pub mod event;
pub mod gate;
pub mod instance;
pub mod interpreter;
pub mod journal;
pub mod notifier;
pub mod storage;
pub mod worker;

/// Default budget for a single pause (15 days)
pub const DEFAULT_PAUSE_TIMEOUT: Duration = Duration::from_secs(15 * 24 * 60 * 60);

/// Configuration for the interpreter runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Root directory for runtime storage (default: .pausable/)
    pub root: PathBuf,

    /// Keep instance journals on disk so runs survive restarts
    pub durable: bool,

    /// How long an instance may stay paused before it fails
    pub pause_timeout: Duration,

    /// Timeouts and retry policies of remote calls
    pub adapter: AdapterOptions,

    /// Enable debug tracing
    pub debug: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".pausable"),
            durable: true,
            pause_timeout: DEFAULT_PAUSE_TIMEOUT,
            adapter: AdapterOptions::default(),
            debug: false,
        }
    }
}

// Re-export commonly used types
pub use adapter::{Adapter, AdapterOptions, RetryPolicy, StepExecutor, StepOptions, WaitOutcome};
pub use error::{ErrorKind, ErrorSummary, InterpreterError, Result, StepError, WorkerError};
pub use event::{EventBus, EventKind, InterpreterEvent, Subscription};
pub use gate::PauseGate;
pub use instance::{
    BlockId, BlockResult, InstanceId, InstanceStatus, ResumeAck, RunOutcome, RunParameters,
    WorkflowDefinition,
};
pub use interpreter::Interpreter;
pub use notifier::LifecycleNotifier;
pub use worker::{InstanceHandle, Worker};
