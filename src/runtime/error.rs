//! Error types for the pausable interpreter
//!
//! Domain errors use thiserror. `ErrorKind` is the closed classification
//! surfaced to whoever owns an instance; `ErrorSummary` is its serializable
//! form, carried by the ended notification and the run outcome.

use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

use super::instance::{BlockId, InstanceId};

/// Closed classification of interpreter failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Malformed resume payload
    Validation,
    /// Resume requested while the instance is not paused
    Precondition,
    /// A pause exceeded its wait budget
    Timeout,
    /// External cancellation
    Canceled,
    /// The definition could not be fetched
    DefinitionUnavailable,
    /// A block failed remotely
    BlockExecution,
    /// The journal could not be read, written, or replayed
    Journal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Validation => "validation",
            Self::Precondition => "precondition",
            Self::Timeout => "timeout",
            Self::Canceled => "canceled",
            Self::DefinitionUnavailable => "definition-unavailable",
            Self::BlockExecution => "block-execution",
            Self::Journal => "journal",
        };
        f.write_str(label)
    }
}

/// Top-level interpreter error
#[derive(Debug, Error)]
pub enum InterpreterError {
    /// Resume payload did not satisfy the resume contract
    #[error("failed to resume instance '{instance_id}': {detail}")]
    Validation {
        /// Instance the resume targeted
        instance_id: InstanceId,
        /// What was wrong with the payload
        detail: String,
    },

    /// Resume is not allowed in the current state
    #[error("cannot resume instance '{instance_id}': {detail}")]
    Precondition {
        /// Instance the resume targeted
        instance_id: InstanceId,
        /// The violated precondition
        detail: String,
    },

    /// The instance stayed paused longer than its wait budget
    #[error("instance '{instance_id}' was paused and did not receive a continuation within {timeout:?}")]
    PausedTooLong {
        /// Instance that timed out
        instance_id: InstanceId,
        /// The configured pause budget
        timeout: Duration,
    },

    /// The run was canceled externally
    #[error("instance '{instance_id}' was canceled")]
    Canceled {
        /// Instance that was canceled
        instance_id: InstanceId,
    },

    /// Fetching the definition failed after retries
    #[error("definition for instance '{instance_id}' is unavailable: {source}")]
    DefinitionUnavailable {
        /// Instance whose definition was requested
        instance_id: InstanceId,
        /// Final remote failure
        #[source]
        source: StepError,
    },

    /// A block failed after retries
    #[error("block {block} of instance '{instance_id}' failed: {source}")]
    BlockExecution {
        /// Instance running the block
        instance_id: InstanceId,
        /// Failing block
        block: BlockId,
        /// Final remote failure
        #[source]
        source: StepError,
    },

    /// Journal failure (I/O, corruption, or nondeterministic replay)
    #[error("journal error: {0}")]
    Journal(#[from] JournalError),
}

impl InterpreterError {
    /// Classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Precondition { .. } => ErrorKind::Precondition,
            Self::PausedTooLong { .. } => ErrorKind::Timeout,
            Self::Canceled { .. } => ErrorKind::Canceled,
            Self::DefinitionUnavailable { .. } => ErrorKind::DefinitionUnavailable,
            Self::BlockExecution { .. } => ErrorKind::BlockExecution,
            Self::Journal(_) => ErrorKind::Journal,
        }
    }
}

/// Convenience result alias for interpreter operations
pub type Result<T> = std::result::Result<T, InterpreterError>;

/// Failure of a remote step call
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StepError {
    /// The executor reported a failure
    #[error("{message}")]
    Failed {
        /// Failure description from the executor
        message: String,
        /// Whether the adapter may retry the call
        retryable: bool,
    },

    /// A single attempt exceeded its start-to-close timeout
    #[error("attempt timed out after {timeout:?}")]
    TimedOut {
        /// The per-attempt timeout
        timeout: Duration,
    },

    /// The call was abandoned because the run was canceled
    #[error("call canceled")]
    Canceled,

    /// The retry policy ran out of attempts
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        /// Number of attempts made
        attempts: u32,
        /// Failure of the final attempt
        last: Box<StepError>,
    },
}

impl StepError {
    /// A failure the adapter may retry
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure that must not be retried
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            retryable: false,
        }
    }

    /// Whether another attempt could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Failed { retryable, .. } => *retryable,
            Self::TimedOut { .. } => true,
            Self::Canceled | Self::Exhausted { .. } => false,
        }
    }

    /// Whether this failure stems from cancellation
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

/// Aggregated failure of one publish fan-out
#[derive(Debug, Error)]
#[error("{} subscriber(s) failed handling {kind} event: {}", .failures.len(), .failures.join("; "))]
pub struct PublishError {
    /// Event kind being published
    pub kind: super::event::EventKind,
    /// One message per failed subscriber
    pub failures: Vec<String>,
}

/// Journal-specific errors
#[derive(Debug, Error)]
pub enum JournalError {
    /// Replayed history does not match what the run asked for
    #[error("nondeterministic replay at entry {position}: expected {expected}, found {found}")]
    Nondeterminism {
        /// Index of the mismatching entry
        position: usize,
        /// What the run requested
        expected: String,
        /// What the history holds
        found: String,
    },

    /// Attempted to append before the recorded history was consumed
    #[error("journal is still replaying ({remaining} recorded entries left)")]
    Replaying {
        /// Recorded entries not yet consumed
        remaining: usize,
    },

    /// Attempted to append after the run was finished and the journal released
    #[error("journal is closed")]
    Closed,

    /// Corrupted record
    #[error("corrupted record at offset {offset}: {detail}")]
    Corrupted {
        /// Byte offset where corruption was found
        offset: u64,
        /// Description of the corruption
        detail: String,
    },

    /// Encoding error
    #[error("entry encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Convenience result alias for journal operations
pub type JournalResult<T> = std::result::Result<T, JournalError>;

/// Errors surfaced by the worker host
#[derive(Debug, Error)]
pub enum WorkerError {
    /// An instance with this id is already known
    #[error("instance '{0}' already exists")]
    AlreadyExists(InstanceId),

    /// No instance with this id is known
    #[error("instance '{0}' not found")]
    NotFound(InstanceId),

    /// The instance task ended without reporting an outcome
    #[error("instance '{0}' stopped without an outcome")]
    Aborted(InstanceId),

    /// Storage could not be read or written
    #[error(transparent)]
    Storage(#[from] anyhow::Error),

    /// The instance's journal could not be opened
    #[error("journal error: {0}")]
    Journal(#[from] JournalError),

    /// Interpreter-level failure (e.g. a rejected resume)
    #[error(transparent)]
    Interpreter(#[from] InterpreterError),
}

/// Serializable summary of a terminal error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSummary {
    /// Error classification
    pub kind: ErrorKind,
    /// Human-readable message
    pub message: String,
    /// Source chain, outermost first
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

impl ErrorSummary {
    /// Summarize an interpreter error
    pub fn from_error(error: &InterpreterError) -> Self {
        let mut chain = Vec::new();
        let mut source = StdError::source(error);
        while let Some(cause) = source {
            chain.push(cause.to_string());
            source = StdError::source(cause);
        }

        Self {
            kind: error.kind(),
            message: error.to_string(),
            trace: (!chain.is_empty()).then(|| chain.join("\ncaused by: ")),
        }
    }

    /// Returns true if the run ended through cancellation
    pub fn is_canceled(&self) -> bool {
        self.kind == ErrorKind::Canceled
    }
}

impl fmt::Display for ErrorSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}
