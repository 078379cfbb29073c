//! Block interpreter state machine
//!
//! One [`Interpreter`] drives one instance: it fetches the definition, walks
//! the block queue, executes each block through the adapter, and at every
//! pause-point suspends on the [`PauseGate`] until an external resume
//! arrives. Resumes reach the interpreter from other tasks; the gate is the
//! only state they share with the run loop.

use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::adapter::Adapter;
use super::error::{ErrorSummary, InterpreterError, Result};
use super::event::EventBus;
use super::gate::{PauseGate, validate_resume};
use super::instance::{BlockId, InstanceId, InstanceStatus, ResumeAck, RunOutcome};
use super::notifier::LifecycleNotifier;

/// Run loop and caller-facing surface of one instance
pub struct Interpreter {
    instance_id: InstanceId,
    adapter: Arc<Adapter>,
    bus: Arc<EventBus>,
    gate: PauseGate,
    pause_timeout: Duration,
    status: watch::Sender<InstanceStatus>,
}

impl Interpreter {
    /// Create an interpreter in the `Initializing` state.
    ///
    /// The event bus and pause gate are created here and live exactly as
    /// long as the interpreter.
    pub fn new(adapter: Arc<Adapter>, pause_timeout: Duration) -> Self {
        let bus = Arc::new(EventBus::new());
        let gate = PauseGate::new(bus.clone(), adapter.clone());
        let (status, _) = watch::channel(InstanceStatus::Initializing);
        Self {
            instance_id: adapter.instance_id().clone(),
            adapter,
            bus,
            gate,
            pause_timeout,
            status,
        }
    }

    /// Instance this interpreter runs
    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    /// Event bus of this instance
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Adapter of this instance
    pub fn adapter(&self) -> &Arc<Adapter> {
        &self.adapter
    }

    /// Whether the run loop is suspended at a pause-point. Never fails.
    pub fn is_paused(&self) -> bool {
        self.gate.is_paused()
    }

    /// Current lifecycle state
    pub fn status(&self) -> InstanceStatus {
        *self.status.borrow()
    }

    /// Receiver observing lifecycle transitions
    pub fn watch_status(&self) -> watch::Receiver<InstanceStatus> {
        self.status.subscribe()
    }

    /// Resume a paused instance.
    ///
    /// The request is validated here and again inside the gate lock; a
    /// rejected request leaves the instance untouched.
    pub async fn resume(&self, payload: Option<Value>) -> Result<ResumeAck> {
        validate_resume(&self.instance_id, self.is_paused(), payload.as_ref())?;
        self.gate.resume(payload).await
    }

    /// Run the instance to its terminal state.
    ///
    /// Records the run request, wraps the block loop in the lifecycle
    /// notifier, and records the terminal outcome. Both success and failure
    /// are returned as a [`RunOutcome`].
    pub async fn execute(&self, input: Option<Value>) -> RunOutcome {
        tracing::info!(instance_id = %self.instance_id, "instance starting");
        let outcome = match self.adapter.mark_started(input) {
            Ok(()) => {
                let notifier = LifecycleNotifier::new(self.adapter.clone());
                notifier.observe(&self.bus, self.run()).await
            }
            Err(e) => Err(InterpreterError::from(e)),
        };

        let outcome = match outcome {
            Ok(result) => RunOutcome::Completed { result },
            Err(error) => {
                tracing::warn!(instance_id = %self.instance_id, kind = %error.kind(), %error, "instance failed");
                RunOutcome::Failed {
                    error: ErrorSummary::from_error(&error),
                }
            }
        };

        if let Err(e) = self.adapter.mark_finished(&outcome) {
            tracing::error!(instance_id = %self.instance_id, error = %e, "failed to record terminal outcome");
        }
        self.adapter.journal().close();
        self.status.send_replace(outcome.status());
        tracing::info!(instance_id = %self.instance_id, status = %outcome.status(), "instance finished");
        outcome
    }

    /// The block loop, without lifecycle notifications
    async fn run(&self) -> Result<Value> {
        self.transition(InstanceStatus::Initializing);
        let definition = self
            .adapter
            .fetch_definition()
            .await
            .map_err(|source| {
                if source.is_canceled() {
                    return self.canceled();
                }
                InterpreterError::DefinitionUnavailable {
                    instance_id: self.instance_id.clone(),
                    source,
                }
            })?;

        let mut remaining: VecDeque<BlockId> = definition.blocks.iter().copied().collect();
        let mut results = Map::new();
        tracing::debug!(
            instance_id = %self.instance_id,
            blocks = remaining.len(),
            pauses = definition.pauses.len(),
            "definition loaded"
        );

        self.transition(InstanceStatus::Running);
        while let Some(block) = remaining.pop_front() {
            let output = self
                .adapter
                .execute_block(block)
                .await
                .map_err(|source| {
                    if source.is_canceled() {
                        return self.canceled();
                    }
                    InterpreterError::BlockExecution {
                        instance_id: self.instance_id.clone(),
                        block,
                        source,
                    }
                })?;
            tracing::debug!(instance_id = %self.instance_id, %block, "block executed");
            results.insert(block.to_string(), output);

            if definition.is_pause_point(block) {
                self.transition(InstanceStatus::Pausing);
                self.gate.pause(Some(Value::from(block.0))).await?;

                self.transition(InstanceStatus::AwaitingResume);
                self.gate.wait_until_resumed(self.pause_timeout).await?;
                self.transition(InstanceStatus::Running);
            }
        }

        Ok(Value::Object(results))
    }

    fn transition(&self, next: InstanceStatus) {
        let previous = self.status.send_replace(next);
        if previous != next {
            tracing::debug!(instance_id = %self.instance_id, from = %previous, to = %next, "transition");
        }
    }

    fn canceled(&self) -> InterpreterError {
        InterpreterError::Canceled {
            instance_id: self.instance_id.clone(),
        }
    }
}

impl std::fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interpreter")
            .field("instance_id", &self.instance_id)
            .field("status", &self.status())
            .field("paused", &self.is_paused())
            .finish()
    }
}
