//! Per-instance lifecycle event bus
//!
//! Subscribers register a callback for one [`EventKind`]. Publishing invokes
//! every callback registered for the event's kind and waits for all of them
//! to settle before returning. A failing subscriber never prevents its
//! siblings from running; failures are aggregated into one [`PublishError`].

use futures::future::{BoxFuture, FutureExt, join_all};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

use super::error::PublishError;
use super::instance::InstanceId;

/// Subscription ids are unique across buses, so a handle from one bus is a
/// no-op on another
static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(0);

/// Kind of lifecycle event, used as the subscription key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    /// The instance paused
    Paused,
    /// The instance resumed
    Resumed,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Paused => f.write_str("paused"),
            Self::Resumed => f.write_str("resumed"),
        }
    }
}

/// Lifecycle event published on the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum InterpreterEvent {
    /// The instance has paused
    Paused {
        /// Instance that paused
        instance_id: InstanceId,
        /// Payload attached by the pause-point
        payload: Option<Value>,
    },
    /// The instance has resumed
    Resumed {
        /// Instance that resumed
        instance_id: InstanceId,
        /// Payload supplied by the resume caller
        payload: Option<Value>,
    },
}

impl InterpreterEvent {
    /// Kind of this event
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Paused { .. } => EventKind::Paused,
            Self::Resumed { .. } => EventKind::Resumed,
        }
    }

    /// Instance the event belongs to
    pub fn instance_id(&self) -> &InstanceId {
        match self {
            Self::Paused { instance_id, .. } | Self::Resumed { instance_id, .. } => instance_id,
        }
    }

    /// Payload carried by the event
    pub fn payload(&self) -> Option<&Value> {
        match self {
            Self::Paused { payload, .. } | Self::Resumed { payload, .. } => payload.as_ref(),
        }
    }
}

/// Future returned by a subscriber callback
pub type EventFuture = BoxFuture<'static, anyhow::Result<()>>;

type Callback = Arc<dyn Fn(InterpreterEvent, CancellationToken) -> EventFuture + Send + Sync>;

/// Handle identifying one registered callback
///
/// Returned by [`EventBus::subscribe`]; pass it to [`EventBus::unsubscribe`]
/// to release the callback.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    id: u64,
    kind: EventKind,
}

impl Subscription {
    /// Event kind this subscription listens to
    pub fn kind(&self) -> EventKind {
        self.kind
    }
}

/// In-process publish/subscribe hub scoped to one interpreter instance
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<HashMap<EventKind, Vec<(u64, Callback)>>>,
}

impl EventBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for one event kind.
    ///
    /// The callback itself is invoked while the subscriber table is locked
    /// for reading, so its synchronous part must not touch the bus; the
    /// returned future runs after the lock is released.
    pub fn subscribe<F, Fut>(&self, kind: EventKind, callback: F) -> Subscription
    where
        F: Fn(InterpreterEvent, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed);
        let callback: Callback = Arc::new(move |event, token| callback(event, token).boxed());

        self.subscribers
            .write()
            .entry(kind)
            .or_default()
            .push((id, callback));

        tracing::trace!(subscription = id, %kind, "subscribed");
        Subscription { id, kind }
    }

    /// Release a subscription. Unknown or already released handles are ignored.
    pub fn unsubscribe(&self, subscription: &Subscription) {
        let mut subscribers = self.subscribers.write();
        if let Some(list) = subscribers.get_mut(&subscription.kind) {
            list.retain(|(id, _)| *id != subscription.id);
            if list.is_empty() {
                subscribers.remove(&subscription.kind);
            }
        }
    }

    /// Number of callbacks currently registered for a kind
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subscribers.read().get(&kind).map_or(0, Vec::len)
    }

    /// Deliver an event to every subscriber of its kind and wait for all of them.
    pub async fn publish(
        &self,
        event: InterpreterEvent,
        cancellation: &CancellationToken,
    ) -> Result<(), PublishError> {
        let kind = event.kind();

        let pending: Vec<EventFuture> = {
            let subscribers = self.subscribers.read();
            match subscribers.get(&kind) {
                Some(list) => list
                    .iter()
                    .map(|(_, callback)| callback(event.clone(), cancellation.clone()))
                    .collect(),
                None => return Ok(()),
            }
        };

        tracing::debug!(%kind, instance_id = %event.instance_id(), subscribers = pending.len(), "publishing event");

        let failures: Vec<String> = join_all(pending)
            .await
            .into_iter()
            .filter_map(|outcome| outcome.err().map(|e| format!("{e:#}")))
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(PublishError { kind, failures })
        }
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let subscribers = self.subscribers.read();
        f.debug_struct("EventBus")
            .field("paused", &subscribers.get(&EventKind::Paused).map_or(0, Vec::len))
            .field("resumed", &subscribers.get(&EventKind::Resumed).map_or(0, Vec::len))
            .finish()
    }
}
