//! Lightweight event bus for orchestration lifecycle events.
//!
//! The core publishes job, batch, task and approval events through this
//! abstraction; any transport fan-out (websocket, SSE, ...) subscribes at the
//! edge. Delivery is fire-and-forget from the publisher's point of view.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::warn;

/// Kinds of lifecycle events emitted by the orchestration core.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    JobCreated,
    JobStarted,
    JobCompleted,
    JobPaused,
    JobResumed,
    JobStopped,
    JobError,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    BatchStarted,
    BatchProgress,
    BatchCompleted,
    BatchCancelled,
    ApprovalRequested,
    AutoApproved,
    ApprovalResolved,
    ApprovalTimeout,
}

/// Envelope carried on the bus: a kind tag, an opaque JSON payload and a
/// publication timestamp.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PilotEvent {
    pub kind: EventKind,
    pub payload: Value,
    pub at: DateTime<Utc>,
}

impl PilotEvent {
    pub fn new(kind: EventKind, payload: Value) -> Self {
        Self {
            kind,
            payload,
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Error, Clone)]
pub enum BusError {
    #[error("publish failed: {0}")]
    Publish(String),
}

/// Trait implemented by payload types that can be carried on the bus.
pub trait Event: Clone + Send + Sync + std::fmt::Debug + 'static {}

impl<T> Event for T where T: Clone + Send + Sync + std::fmt::Debug + 'static {}

#[async_trait]
pub trait EventBus<E>: Send + Sync
where
    E: Event,
{
    async fn publish(&self, event: E) -> Result<(), BusError>;
    fn subscribe(&self) -> broadcast::Receiver<E>;
}

/// Simple in-memory bus suitable for unit tests and single-process use.
pub struct InMemoryBus<E>
where
    E: Event,
{
    sender: broadcast::Sender<E>,
}

impl<E> InMemoryBus<E>
where
    E: Event,
{
    pub fn new(capacity: usize) -> Arc<Self> {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Arc::new(Self { sender })
    }
}

#[async_trait]
impl<E> EventBus<E> for InMemoryBus<E>
where
    E: Event,
{
    async fn publish(&self, event: E) -> Result<(), BusError> {
        // A bus with no subscribers is not an error for fire-and-forget
        // lifecycle events.
        let _ = self.sender.send(event);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }
}

/// Publish a lifecycle event, logging delivery failure instead of
/// propagating it. Callers never branch on bus health.
pub async fn emit(bus: &dyn EventBus<PilotEvent>, kind: EventKind, payload: Value) {
    let event = PilotEvent::new(kind, payload);
    if let Err(err) = bus.publish(event).await {
        warn!(target: "event-bus", ?kind, error = %err, "event delivery failed");
    }
}
