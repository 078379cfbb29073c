//! Pause/resume protocol for one instance
//!
//! The gate serializes `pause` and `resume` behind one async mutex so the
//! check-then-write of the paused flag and the matching event publish happen
//! as a unit. The flag itself lives in a watch channel: queries read a
//! snapshot without locking, and the run loop waits on it without holding
//! the mutex.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::adapter::{Adapter, WaitOutcome};
use super::error::{InterpreterError, Result};
use super::event::{EventBus, InterpreterEvent};
use super::instance::{InstanceId, ResumeAck};

/// Check a resume request against the current state.
///
/// The instance must be paused and the payload must be a JSON object.
/// Used both at the caller boundary and again inside the gate lock.
pub fn validate_resume(
    instance_id: &InstanceId,
    is_paused: bool,
    payload: Option<&Value>,
) -> Result<()> {
    if !is_paused {
        return Err(InterpreterError::Precondition {
            instance_id: instance_id.clone(),
            detail: "the instance is not paused".to_string(),
        });
    }

    match payload {
        Some(Value::Object(_)) => Ok(()),
        None => Err(InterpreterError::Validation {
            instance_id: instance_id.clone(),
            detail: "a resume payload is required".to_string(),
        }),
        Some(other) => Err(InterpreterError::Validation {
            instance_id: instance_id.clone(),
            detail: format!("resume payload must be a JSON object, got {}", value_kind(other)),
        }),
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Mutual exclusion and condition wait guarding the paused flag
pub struct PauseGate {
    instance_id: InstanceId,
    lock: tokio::sync::Mutex<()>,
    paused: watch::Sender<bool>,
    paused_at: Mutex<Option<DateTime<Utc>>>,
    bus: Arc<EventBus>,
    adapter: Arc<Adapter>,
}

impl PauseGate {
    /// Create an open (not paused) gate
    pub fn new(bus: Arc<EventBus>, adapter: Arc<Adapter>) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            instance_id: adapter.instance_id().clone(),
            lock: tokio::sync::Mutex::new(()),
            paused,
            paused_at: Mutex::new(None),
            bus,
            adapter,
        }
    }

    /// Current paused flag; never blocks
    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Receiver observing the paused flag
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.paused.subscribe()
    }

    /// Flip into the paused state and announce it.
    ///
    /// On replay the recorded pause is recognised and the event is not
    /// published again.
    pub async fn pause(&self, payload: Option<Value>) -> Result<()> {
        let _guard = self.lock.lock().await;

        let mark = self.adapter.mark_paused(payload.clone())?;
        self.paused.send_replace(true);
        *self.paused_at.lock() = Some(mark.at);

        if mark.replayed {
            tracing::debug!(instance_id = %self.instance_id, "pause replayed from history");
            return Ok(());
        }

        tracing::info!(instance_id = %self.instance_id, "instance paused");
        let event = InterpreterEvent::Paused {
            instance_id: self.instance_id.clone(),
            payload,
        };
        if let Err(e) = self.bus.publish(event, self.adapter.cancellation()).await {
            tracing::warn!(instance_id = %self.instance_id, error = %e, "paused event delivery failed");
        }
        Ok(())
    }

    /// Accept an external resume.
    ///
    /// Fails with `Precondition` unless the instance is paused and live, and
    /// with `Validation` unless the payload is a JSON object. A rejected
    /// resume changes nothing.
    pub async fn resume(&self, payload: Option<Value>) -> Result<ResumeAck> {
        let _guard = self.lock.lock().await;

        if self.adapter.is_replaying() {
            return Err(InterpreterError::Precondition {
                instance_id: self.instance_id.clone(),
                detail: "the instance is replaying its history".to_string(),
            });
        }
        validate_resume(&self.instance_id, self.is_paused(), payload.as_ref())?;

        self.adapter.mark_resumed(payload.clone())?;
        self.paused.send_replace(false);
        *self.paused_at.lock() = None;

        tracing::info!(instance_id = %self.instance_id, "instance resumed");
        let event = InterpreterEvent::Resumed {
            instance_id: self.instance_id.clone(),
            payload,
        };
        if let Err(e) = self.bus.publish(event, self.adapter.cancellation()).await {
            tracing::warn!(instance_id = %self.instance_id, error = %e, "resumed event delivery failed");
        }
        Ok(ResumeAck::resumed())
    }

    /// Suspend until resumed, timed out, or canceled. Holds no lock while waiting.
    ///
    /// The budget is measured from the recorded pause time, so a wait
    /// re-entered after a restart does not start over.
    pub async fn wait_until_resumed(&self, timeout: Duration) -> Result<()> {
        if self.adapter.replayed_resume().is_some() {
            let _guard = self.lock.lock().await;
            self.clear();
            tracing::debug!(instance_id = %self.instance_id, "resume replayed from history");
            return Ok(());
        }

        let remaining = match *self.paused_at.lock() {
            Some(at) => {
                let elapsed = (Utc::now() - at).to_std().unwrap_or_default();
                timeout.saturating_sub(elapsed)
            }
            None => timeout,
        };

        tracing::debug!(instance_id = %self.instance_id, ?remaining, "awaiting resume");
        match self
            .adapter
            .durable_wait(self.watch(), |paused| !*paused, remaining)
            .await
        {
            WaitOutcome::Satisfied => {
                // The resume that cleared the flag still holds the lock until
                // its event has been delivered
                let _guard = self.lock.lock().await;
                Ok(())
            }
            WaitOutcome::TimedOut => {
                let _guard = self.lock.lock().await;
                if !self.is_paused() {
                    return Ok(());
                }
                self.clear();
                Err(InterpreterError::PausedTooLong {
                    instance_id: self.instance_id.clone(),
                    timeout,
                })
            }
            WaitOutcome::Canceled => {
                let _guard = self.lock.lock().await;
                self.clear();
                Err(InterpreterError::Canceled {
                    instance_id: self.instance_id.clone(),
                })
            }
        }
    }

    fn clear(&self) {
        self.paused.send_replace(false);
        *self.paused_at.lock() = None;
    }
}

impl std::fmt::Debug for PauseGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PauseGate")
            .field("instance_id", &self.instance_id)
            .field("paused", &self.is_paused())
            .finish()
    }
}
