//! Worker polling and execution loop.
//!
//! Each worker polls for tasks assigned to its id, executes them strictly
//! in order, and persists the outcome of every step before moving on. A
//! batch aborts on the first failed task so the error path always runs
//! against fresh storage state.

pub mod handler;
pub mod timeout;

mod error_middleware;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::Broker;
use crate::config::MIN_STOP_MAX_WAIT;
use crate::error::{Result, WorkflowError};
use crate::events::{EventPublisher, WorkflowEvent};
use crate::storage::Storage;
use crate::task::{lookup_definition, missing_handler_error, Task, TaskMap, TaskState};

pub use error_middleware::WorkerErrorMiddleware;
pub use handler::{
    Beat, HandlerBag, HandlerFailure, HandlerFuture, HandlerRegistry, TaskContext, TaskHandler,
};
pub use timeout::with_execution_timeout;

pub fn generate_worker_id(instance_name: &str, index: usize) -> String {
    format!("{instance_name}_workers_{index}")
}

#[derive(Debug, Clone, Default)]
pub struct StopOptions {
    /// Upper bound on how long to wait for an in-flight batch to drain.
    /// Must be greater than [`MIN_STOP_MAX_WAIT`].
    pub max_wait: Option<Duration>,
}

#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

struct WorkerInner {
    id: String,
    storage: Arc<dyn Storage>,
    events: EventPublisher,
    handlers: HandlerRegistry,
    task_map: Arc<TaskMap>,
    broker: Broker,
    error_middleware: WorkerErrorMiddleware,
    poll_interval: Duration,
    stop_poll_interval: Duration,
    default_stop_max_wait: Duration,
    shutdown: Notify,
    is_working: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        storage: Arc<dyn Storage>,
        events: EventPublisher,
        handlers: HandlerRegistry,
        task_map: Arc<TaskMap>,
        broker: Broker,
        poll_interval: Duration,
        stop_poll_interval: Duration,
        default_stop_max_wait: Duration,
    ) -> Self {
        let error_middleware = WorkerErrorMiddleware::new(Arc::clone(&storage));

        Self {
            inner: Arc::new(WorkerInner {
                id,
                storage,
                events,
                handlers,
                task_map,
                broker,
                error_middleware,
                poll_interval,
                stop_poll_interval,
                default_stop_max_wait,
                shutdown: Notify::new(),
                is_working: AtomicBool::new(false),
                handle: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Register this worker's liveness lock and begin polling.
    pub async fn start(&self) -> Result<()> {
        info!(worker_id = %self.inner.id, "starting worker polling");

        self.inner
            .storage
            .register_workers(&[self.inner.id.clone()])
            .await?;

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            loop {
                if let Err(e) = inner.poll_cycle().await {
                    error!(worker_id = %inner.id, error = %e, "worker poll cycle failed");
                }

                tokio::select! {
                    _ = tokio::time::sleep(inner.poll_interval) => {}
                    _ = inner.shutdown.notified() => break,
                }
            }
        });

        *self.inner.handle.lock() = Some(handle);

        Ok(())
    }

    /// Stop polling. If a batch is in flight, wait for it to drain up to
    /// `max_wait`; on expiry the worker is reported stuck while its handler
    /// keeps running.
    pub async fn stop(&self, options: StopOptions) -> Result<()> {
        let max_wait = options
            .max_wait
            .unwrap_or(self.inner.default_stop_max_wait);

        if max_wait <= MIN_STOP_MAX_WAIT {
            return Err(WorkflowError::Configuration(format!(
                "stop max_wait must be greater than {}ms",
                MIN_STOP_MAX_WAIT.as_millis()
            )));
        }

        self.inner.shutdown.notify_one();

        if self.inner.is_working.load(Ordering::SeqCst) {
            let drained = tokio::time::timeout(max_wait, async {
                loop {
                    tokio::time::sleep(self.inner.stop_poll_interval).await;
                    if !self.inner.is_working.load(Ordering::SeqCst) {
                        break;
                    }
                }
            })
            .await;

            if drained.is_err() {
                warn!(
                    worker_id = %self.inner.id,
                    "stop timed out waiting for the current batch"
                );
                return Err(WorkflowError::WorkerStopTimeout(self.inner.id.clone()));
            }
        }

        let handle = self.inner.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        Ok(())
    }
}

/// Batch outcome for a single task.
enum TaskOutcome {
    Completed,
    Aborted,
}

impl WorkerInner {
    async fn poll_cycle(&self) -> Result<()> {
        self.storage
            .refresh_workers_locks(&[self.id.clone()])
            .await?;

        let batch = self.storage.get_assigned_tasks(Some(&self.id)).await?;
        if batch.is_empty() {
            return Ok(());
        }

        self.is_working.store(true, Ordering::SeqCst);

        // snapshot attempts before this batch writes its own processing
        // transitions
        let task_ids: Vec<_> = batch.iter().map(|task| task.id.clone()).collect();
        let attempts = self.storage.get_tasks_attempts(&task_ids).await?;

        for task in &batch {
            let attempts_made = attempts.get(&task.id).copied().unwrap_or(0);

            match self.execute_task(task, attempts_made).await? {
                TaskOutcome::Completed => {}
                // leave is_working set: the aborted batch never drained
                TaskOutcome::Aborted => return Ok(()),
            }
        }

        self.is_working.store(false, Ordering::SeqCst);

        Ok(())
    }

    async fn execute_task(&self, task: &Task, attempts_made: u32) -> Result<TaskOutcome> {
        let definition = lookup_definition(&task.name, &self.task_map)?;

        let Some(handler) = self.handlers.get(&task.name).map(|h| h.value().clone()) else {
            warn!(worker_id = %self.id, name = %task.name, "no handler registered");

            let error = missing_handler_error();
            self.storage
                .update_tasks_state(&[task.with_state(TaskState::Failed {
                    error: error.clone(),
                })])
                .await?;
            self.events.publish(WorkflowEvent::TaskFailed {
                task_id: task.id.clone(),
                name: task.name.clone(),
                error,
            });

            return Ok(TaskOutcome::Completed);
        };

        let processing = task.with_state(TaskState::Processing {
            worker_id: self.id.clone(),
        });
        self.storage.update_tasks_state(&[processing.clone()]).await?;

        debug!(worker_id = %self.id, task_id = %task.id, name = %task.name, "processing task");

        let context = TaskContext {
            id: task.id.clone(),
            name: task.name.clone(),
            payload: task.input.clone(),
            queued_at: task.queued_at,
            worker_id: self.id.clone(),
        };

        let result = with_execution_timeout(definition, &task.name, |beat| {
            let bag = HandlerBag {
                attempts_made,
                enqueue: self.broker.clone(),
                beat,
            };
            handler(context, bag)
        })
        .await;

        match result {
            Ok(output) => {
                self.storage
                    .update_tasks_state(&[task.with_state(TaskState::Done {
                        output: output.clone(),
                    })])
                    .await?;
                self.events.publish(WorkflowEvent::TaskDone {
                    task_id: task.id.clone(),
                    name: task.name.clone(),
                    output,
                });

                Ok(TaskOutcome::Completed)
            }
            Err(execution_error) => {
                self.error_middleware
                    .handle(&processing, definition, attempts_made, execution_error)
                    .await?;

                Ok(TaskOutcome::Aborted)
            }
        }
    }
}
