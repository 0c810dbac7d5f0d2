//! Task entity, lifecycle states, and the per-name policy schema consumed by
//! every other component.
//!
//! A task is in exactly one state at a time. The state is a true sum type so
//! that illegal combinations (an assigned task without a worker id, a done
//! task without an output) are unrepresentable.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Result, WorkflowError};
use crate::rate_limit::RateLimitingRule;

pub type TaskId = String;

/// Lifecycle state with per-state payload.
///
/// `waiting`/`delayed` are assignable, `assigned`/`processing` are owned by a
/// worker, `done`/`failed` are terminal (modulo the retry cycle which pushes
/// a failed task back to `waiting` or `delayed`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum TaskState {
    /// Admitted, eligible for assignment.
    Waiting,
    /// Admitted, eligible only once `now >= process_at`.
    Delayed { process_at: DateTime<Utc> },
    /// Selected by the scheduler, not yet picked up.
    Assigned { worker_id: String },
    /// A worker has started the handler.
    Processing { worker_id: String },
    /// Terminal success.
    Done { output: Value },
    /// Terminal failure (no further retry scheduled).
    Failed { error: Value },
}

impl TaskState {
    /// Lowercase state label, as recorded in the transition log.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Delayed { .. } => "delayed",
            Self::Assigned { .. } => "assigned",
            Self::Processing { .. } => "processing",
            Self::Done { .. } => "done",
            Self::Failed { .. } => "failed",
        }
    }

    /// Check if a scheduler may hand this task to a worker.
    pub fn is_assignable(&self) -> bool {
        matches!(self, Self::Waiting | Self::Delayed { .. })
    }

    /// Check if a worker currently owns this task.
    pub fn worker_id(&self) -> Option<&str> {
        match self {
            Self::Assigned { worker_id } | Self::Processing { worker_id } => Some(worker_id),
            _ => None,
        }
    }
}

/// One unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    /// References a [`TaskDefinition`] by name.
    pub name: String,
    /// Opaque payload handed to the handler.
    pub input: Value,
    pub queued_at: DateTime<Utc>,
    #[serde(flatten)]
    pub state: TaskState,
}

impl Task {
    /// Same task identity, different state.
    pub fn with_state(&self, state: TaskState) -> Self {
        Self {
            id: self.id.clone(),
            name: self.name.clone(),
            input: self.input.clone(),
            queued_at: self.queued_at,
            state,
        }
    }
}

/// Static, process-wide policy bundle keyed by task name. Immutable for the
/// process lifetime.
#[derive(Debug, Clone, Default)]
pub struct TaskDefinition {
    /// Token-bucket admission scoped by a derived key.
    pub rate_limit: Option<RateLimitPolicy>,
    /// Execution timeout behavior.
    pub time_to_live: Option<TimeToLivePolicy>,
    /// Ceiling on simultaneously assigned + processing tasks of this name.
    pub concurrency: Option<ConcurrencyPolicy>,
    /// Enqueue backpressure.
    pub high_water: Option<HighWaterPolicy>,
    /// Retry-on-failure behavior.
    pub retry: Option<RetryPolicy>,
}

#[derive(Clone)]
pub struct RateLimitPolicy {
    pub rules: Vec<RateLimitingRule>,
    /// Sets the group of tasks concerned by the rate limit. Distinct task
    /// names returning the same key share one bucket set.
    pub get_rate_limiting_key: fn() -> String,
}

impl std::fmt::Debug for RateLimitPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitPolicy")
            .field("rules", &self.rules)
            .field("key", &(self.get_rate_limiting_key)())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct TimeToLivePolicy {
    /// What to do when the handler outlives its execution deadline.
    pub task_execution_timeout: Option<TaskExecutionTimeout>,
}

#[derive(Debug, Clone)]
pub struct TaskExecutionTimeout {
    pub policy: TimeoutPolicy,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutPolicy {
    /// Persist the failure, then requeue immediately (no backoff).
    Retry,
    /// Persist the failure and stop there.
    Abort,
}

#[derive(Debug, Clone, Copy)]
pub struct ConcurrencyPolicy {
    /// Maximum tasks of this name picked by workers at a given time.
    /// Unset or `<= 0` means unlimited.
    pub maximum_concurrent: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct HighWaterPolicy {
    /// Maximum tasks of this name in the queue, including tasks being
    /// processed. Further enqueues are refused. `0` disables the policy.
    pub maximum_in_queue: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum number of retries before the task is left failed.
    /// `None` retries forever.
    pub maximum_retries: Option<u32>,
    /// Custom backoff; defaults to [`default_retry_delay`].
    pub get_retry_delay: Option<fn(u32) -> Duration>,
}

/// Task map handed to the engine at construction.
pub type TaskMap = HashMap<String, TaskDefinition>;

/// Resolve the definition for a task name. A missing name is a fatal
/// configuration error, never an admission rejection.
pub fn lookup_definition<'a>(name: &str, task_map: &'a TaskMap) -> Result<&'a TaskDefinition> {
    task_map
        .get(name)
        .ok_or_else(|| WorkflowError::UnknownTask(name.to_string()))
}

/// Default exponential backoff: `2^attempts * 1000ms`.
pub fn default_retry_delay(attempts_made: u32) -> Duration {
    Duration::from_millis(2u64.saturating_pow(attempts_made).saturating_mul(1000))
}

/// Outcome of running a handler under the timeout middleware. The timeout
/// marker stays distinguishable from anything a handler can produce.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionError {
    /// The execution deadline fired before the handler resolved.
    Timeout,
    /// The handler itself failed, with an opaque cause.
    Handler(Value),
}

impl ExecutionError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

/// Persisted error value for a task whose name has no registered handler.
pub fn missing_handler_error() -> Value {
    json!({ "kind": "workflowError", "reason": "missingHandler" })
}

/// Persisted error value for a handler failure.
pub fn handler_exception_error(cause: Value) -> Value {
    json!({ "kind": "workflowError", "reason": "handlerException", "cause": cause })
}

/// Persisted error value for an execution timeout, echoing the configured
/// policy so observers can tell retry from abort.
pub fn execution_timeout_error(timeout: Option<&TaskExecutionTimeout>) -> Value {
    let policy = timeout.map(|t| t.policy);
    let config = timeout.map(|t| {
        json!({
            "policy": t.policy,
            "taskTimeout": t.timeout.as_millis() as u64,
        })
    });

    json!({
        "kind": "workflowError",
        "reason": "taskExecutionTimeout",
        "taskExecutionTimeout": config,
        "policy": policy,
    })
}
