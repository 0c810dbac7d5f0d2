//! Failure handling for a task whose handler errored or timed out.
//!
//! Every branch persists a `failed` record first (the event log keeps the
//! full failure history), then optionally requeues the task according to
//! the definition's timeout or retry policy.

use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use crate::error::Result;
use crate::storage::Storage;
use crate::task::{
    default_retry_delay, execution_timeout_error, handler_exception_error, ExecutionError, Task,
    TaskDefinition, TaskState, TimeoutPolicy,
};

pub struct WorkerErrorMiddleware {
    storage: Arc<dyn Storage>,
}

impl WorkerErrorMiddleware {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Persist the failure and, depending on policy, requeue the task.
    pub async fn handle(
        &self,
        task: &Task,
        definition: &TaskDefinition,
        attempts_made: u32,
        err: ExecutionError,
    ) -> Result<()> {
        match err {
            ExecutionError::Timeout => self.handle_timeout(task, definition).await,
            ExecutionError::Handler(cause) => {
                self.handle_handler_exception(task, definition, attempts_made, cause)
                    .await
            }
        }
    }

    async fn handle_timeout(&self, task: &Task, definition: &TaskDefinition) -> Result<()> {
        debug!(task_id = %task.id, name = %task.name, "task timed out");

        let timeout = definition
            .time_to_live
            .as_ref()
            .and_then(|ttl| ttl.task_execution_timeout.as_ref());
        let policy = timeout.map(|t| t.policy);

        let mut next_states = vec![task.with_state(TaskState::Failed {
            error: execution_timeout_error(timeout),
        })];

        // retry means immediate requeue, no backoff
        if policy == Some(TimeoutPolicy::Retry) {
            next_states.push(task.with_state(TaskState::Waiting));
        }

        self.storage.update_tasks_state(&next_states).await?;

        Ok(())
    }

    async fn handle_handler_exception(
        &self,
        task: &Task,
        definition: &TaskDefinition,
        attempts_made: u32,
        cause: serde_json::Value,
    ) -> Result<()> {
        debug!(task_id = %task.id, name = %task.name, "task failed");

        self.storage
            .update_tasks_state(&[task.with_state(TaskState::Failed {
                error: handler_exception_error(cause),
            })])
            .await?;

        let Some(retry) = definition.retry else {
            return Ok(());
        };

        let retries_left = retry
            .maximum_retries
            .map(|maximum| attempts_made < maximum)
            .unwrap_or(true);

        if !retries_left {
            return Ok(());
        }

        let delay_fn = retry.get_retry_delay.unwrap_or(default_retry_delay);
        let delay = delay_fn(attempts_made);

        self.storage
            .update_tasks_state(&[task.with_state(TaskState::Delayed {
                process_at: Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64),
            })])
            .await?;

        Ok(())
    }
}
