//! Handler registration surface.
//!
//! Handlers are registered once at engine construction time and read on
//! every poll; the registry is shared with every worker of the process.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::broker::Broker;
use crate::task::TaskId;

/// Opaque failure returned by a handler; the cause is persisted verbatim.
#[derive(Debug, Clone)]
pub struct HandlerFailure {
    pub cause: Value,
}

impl HandlerFailure {
    pub fn new(cause: impl Into<Value>) -> Self {
        Self {
            cause: cause.into(),
        }
    }
}

impl From<String> for HandlerFailure {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for HandlerFailure {
    fn from(message: &str) -> Self {
        Self::new(message.to_string())
    }
}

pub type HandlerFuture = BoxFuture<'static, std::result::Result<Value, HandlerFailure>>;

/// Boxed task handler, as stored in the registry.
pub type TaskHandler = Arc<dyn Fn(TaskContext, HandlerBag) -> HandlerFuture + Send + Sync>;

pub type HandlerRegistry = Arc<DashMap<String, TaskHandler>>;

/// What a handler sees of its task while processing it.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub id: TaskId,
    pub name: String,
    pub payload: Value,
    pub queued_at: DateTime<Utc>,
    pub worker_id: String,
}

/// Capabilities handed to every handler invocation.
#[derive(Clone)]
pub struct HandlerBag {
    /// Number of times the task was tried before this call (0 on the first
    /// invocation).
    pub attempts_made: u32,
    /// Enqueue further work through the shared broker.
    pub enqueue: Broker,
    /// Heartbeat for long-running tasks; resets the execution deadline.
    pub beat: Beat,
}

/// Heartbeat handle. For tasks without an execution timeout this is a no-op.
#[derive(Debug, Clone)]
pub struct Beat {
    tx: Option<mpsc::UnboundedSender<()>>,
}

impl Beat {
    pub(crate) fn noop() -> Self {
        Self { tx: None }
    }

    pub(crate) fn new(tx: mpsc::UnboundedSender<()>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Reset the execution deadline. Beating after the deadline already
    /// fired has no effect.
    pub fn beat(&self) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(());
        }
    }
}
