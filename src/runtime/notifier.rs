//! Lifecycle notifications for one run
//!
//! The notifier wraps a run without being part of it: paused and resumed
//! bus events are forwarded to the executor's notification endpoints, and
//! the run itself is bracketed by a started notification and exactly one
//! ended notification, whatever way the run exits.

use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

use super::adapter::Adapter;
use super::error::{ErrorSummary, InterpreterError, Result};
use super::event::{EventBus, EventKind, Subscription};

/// Forwards lifecycle events of one instance to its executor
pub struct LifecycleNotifier {
    adapter: Arc<Adapter>,
}

/// Releases bus subscriptions when dropped
struct SubscriptionGuard<'a> {
    bus: &'a EventBus,
    subscriptions: Vec<Subscription>,
}

impl Drop for SubscriptionGuard<'_> {
    fn drop(&mut self) {
        for subscription in &self.subscriptions {
            self.bus.unsubscribe(subscription);
        }
    }
}

impl LifecycleNotifier {
    /// Create a notifier for the adapter's instance
    pub fn new(adapter: Arc<Adapter>) -> Self {
        Self { adapter }
    }

    /// Run `run` with lifecycle notifications around it.
    ///
    /// The started notification completes (or exhausts its retry budget)
    /// before `run` is polled. Subscriptions are released and the ended
    /// notification is sent on every exit path; the run's own result is
    /// returned unchanged.
    pub async fn observe<F>(&self, bus: &EventBus, run: F) -> Result<Value>
    where
        F: Future<Output = Result<Value>>,
    {
        let instance_id = self.adapter.instance_id().clone();
        let guard = SubscriptionGuard {
            bus,
            subscriptions: vec![self.forward(bus, EventKind::Paused), self.forward(bus, EventKind::Resumed)],
        };

        let outcome = match self.adapter.notify_started().await {
            Err(e) if e.is_canceled() => Err(InterpreterError::Canceled { instance_id: instance_id.clone() }),
            Err(e) => {
                tracing::warn!(%instance_id, error = %e, "started notification failed");
                run.await
            }
            Ok(()) => run.await,
        };

        drop(guard);

        let (result, error) = match &outcome {
            Ok(value) => (Some(value.clone()), None),
            Err(e) => (None, Some(ErrorSummary::from_error(e))),
        };
        if let Err(e) = self.adapter.notify_ended(result, error).await {
            tracing::warn!(%instance_id, error = %e, "ended notification failed");
        }

        outcome
    }

    /// Subscribe a forwarding callback for one event kind.
    ///
    /// Delivery failures are logged and swallowed so they never fail the
    /// publish that triggered them.
    fn forward(&self, bus: &EventBus, kind: EventKind) -> Subscription {
        let adapter = self.adapter.clone();
        bus.subscribe(kind, move |event, _cancellation| {
            let adapter = adapter.clone();
            async move {
                let payload = event.payload().cloned();
                let delivered = match kind {
                    EventKind::Paused => adapter.notify_paused(payload).await,
                    EventKind::Resumed => adapter.notify_resumed(payload).await,
                };
                if let Err(e) = delivered {
                    tracing::warn!(instance_id = %event.instance_id(), %kind, error = %e, "lifecycle notification failed");
                }
                Ok(())
            }
        })
    }
}

impl std::fmt::Debug for LifecycleNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleNotifier")
            .field("instance_id", self.adapter.instance_id())
            .finish()
    }
}
