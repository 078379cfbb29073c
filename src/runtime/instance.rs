//! Instance identifiers, definitions, and lifecycle records
//!
//! Defines the data model shared by every subsystem: who an instance is,
//! what it runs (the block definition), where it is in its lifecycle, and
//! how it ended.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

use super::error::ErrorSummary;

/// Unique identifier for an interpreter instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    /// Create a new InstanceId from a string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Create a new random InstanceId
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identifier of one block in an interpreted sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct BlockId(pub u64);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for BlockId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Result value produced by a remote block execution
pub type BlockResult = Value;

/// Definition fetched once when an instance starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Opaque definition document returned by the definition service
    #[serde(default)]
    pub definition: Value,
    /// Blocks in execution order
    pub blocks: Vec<BlockId>,
    /// Blocks whose completion suspends the run
    #[serde(default)]
    pub pauses: BTreeSet<BlockId>,
}

impl WorkflowDefinition {
    /// Build a definition from block and pause-point ids
    pub fn new(
        blocks: impl IntoIterator<Item = u64>,
        pauses: impl IntoIterator<Item = u64>,
    ) -> Self {
        Self {
            definition: Value::Null,
            blocks: blocks.into_iter().map(BlockId).collect(),
            pauses: pauses.into_iter().map(BlockId).collect(),
        }
    }

    /// Attach the opaque definition document
    pub fn with_document(mut self, definition: Value) -> Self {
        self.definition = definition;
        self
    }

    /// Returns true if the block is a pause-point
    pub fn is_pause_point(&self, block: BlockId) -> bool {
        self.pauses.contains(&block)
    }
}

/// Parameters supplied when a run is requested
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunParameters {
    /// Identifier of the instance to start
    pub instance_id: InstanceId,
    /// Optional caller-supplied input
    #[serde(default)]
    pub input: Option<Value>,
}

impl RunParameters {
    /// Parameters for the given instance with no input
    pub fn new(instance_id: InstanceId) -> Self {
        Self {
            instance_id,
            input: None,
        }
    }

    /// Attach caller input
    pub fn with_input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }
}

/// Lifecycle state of an interpreter instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceStatus {
    /// Fetching the definition
    Initializing,
    /// Executing blocks
    Running,
    /// Flipping into the paused state and announcing it
    Pausing,
    /// Suspended until an external resume
    AwaitingResume,
    /// Finished successfully
    Completed,
    /// Finished with a terminal error
    Failed,
}

impl InstanceStatus {
    /// Returns true for `Completed` and `Failed`
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Pausing => "pausing",
            Self::AwaitingResume => "awaiting-resume",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Acknowledgment returned by a successful resume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeAck {
    /// Always `"resumed"`
    pub message: String,
}

impl ResumeAck {
    /// The standard acknowledgment
    pub fn resumed() -> Self {
        Self {
            message: "resumed".to_string(),
        }
    }
}

/// Terminal outcome of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum RunOutcome {
    /// The queue drained
    Completed {
        /// Block results keyed by block id
        result: Value,
    },
    /// The run failed
    Failed {
        /// Summary of the terminal error
        error: ErrorSummary,
    },
}

impl RunOutcome {
    /// Returns the result value of a completed run
    pub fn result(&self) -> Option<&Value> {
        match self {
            Self::Completed { result } => Some(result),
            Self::Failed { .. } => None,
        }
    }

    /// Returns the error summary of a failed run
    pub fn error(&self) -> Option<&ErrorSummary> {
        match self {
            Self::Completed { .. } => None,
            Self::Failed { error } => Some(error),
        }
    }

    /// Status corresponding to this outcome
    pub fn status(&self) -> InstanceStatus {
        match self {
            Self::Completed { .. } => InstanceStatus::Completed,
            Self::Failed { .. } => InstanceStatus::Failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_definition_pause_points() {
        let definition = WorkflowDefinition::new([1, 2, 3], [2]);
        assert!(!definition.is_pause_point(BlockId(1)));
        assert!(definition.is_pause_point(BlockId(2)));
        assert_eq!(definition.blocks, vec![BlockId(1), BlockId(2), BlockId(3)]);
    }

    #[test]
    fn test_definition_deserializes_wire_shape() {
        let definition: WorkflowDefinition = serde_json::from_value(json!({
            "definition": {"id": "wf", "prop1": "prop1"},
            "blocks": [1, 2, 3],
            "pauses": [1, 2],
        }))
        .unwrap();

        assert_eq!(definition.blocks.len(), 3);
        assert!(definition.is_pause_point(BlockId(1)));
        assert_eq!(definition.definition["prop1"], "prop1");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(InstanceStatus::Completed.is_terminal());
        assert!(InstanceStatus::Failed.is_terminal());
        assert!(!InstanceStatus::AwaitingResume.is_terminal());
        assert_eq!(InstanceStatus::AwaitingResume.to_string(), "awaiting-resume");
    }

    #[test]
    fn test_resume_ack_shape() {
        let ack = serde_json::to_value(ResumeAck::resumed()).unwrap();
        assert_eq!(ack, json!({"message": "resumed"}));
    }
}
