//! Admission control.
//!
//! The broker is the only entry point for new work. Admission rejection is
//! silent backpressure, not an error: a refused enqueue returns `Ok(None)`
//! and has no side effect.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::events::{EventPublisher, WorkflowEvent};
use crate::storage::Storage;
use crate::task::{lookup_definition, Task, TaskId, TaskMap, TaskState};

#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Delay execution until this instant (`delayed` instead of `waiting`).
    pub process_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct Broker {
    storage: Arc<dyn Storage>,
    events: EventPublisher,
    task_map: Arc<TaskMap>,
}

impl Broker {
    pub fn new(storage: Arc<dyn Storage>, events: EventPublisher, task_map: Arc<TaskMap>) -> Self {
        Self {
            storage,
            events,
            task_map,
        }
    }

    /// Admit one task. Returns the fresh task id, or `None` when the name's
    /// high-water policy refused the enqueue.
    pub async fn enqueue(
        &self,
        name: &str,
        input: Value,
        options: EnqueueOptions,
    ) -> Result<Option<TaskId>> {
        let definition = lookup_definition(name, &self.task_map)?;

        // a zero ceiling disables the policy rather than refusing everything
        let high_water = definition
            .high_water
            .filter(|policy| policy.maximum_in_queue > 0);

        let Some(high_water) = high_water else {
            let task_id = self.process_enqueue(name, input, options).await?;
            return Ok(Some(task_id));
        };

        let (assigned, available, processing) = tokio::join!(
            self.storage.get_assigned_tasks(None),
            self.storage.get_available_tasks(),
            self.storage.get_processing_tasks(),
        );
        let (assigned, available, processing) = (assigned?, available?, processing?);

        let count = count_tasks_named(name, [&assigned, &available, &processing]);

        if count >= high_water.maximum_in_queue {
            debug!(name, count, "refusing task, queue is at high water");
            return Ok(None);
        }

        let task_id = self.process_enqueue(name, input, options).await?;

        self.events.publish(WorkflowEvent::TaskEnqueued {
            task_id: task_id.clone(),
        });

        Ok(Some(task_id))
    }

    async fn process_enqueue(
        &self,
        name: &str,
        input: Value,
        options: EnqueueOptions,
    ) -> Result<TaskId> {
        let task_id = Uuid::new_v4().to_string();

        let state = match options.process_at {
            Some(process_at) => TaskState::Delayed { process_at },
            None => TaskState::Waiting,
        };

        self.storage
            .add_tasks(&[Task {
                id: task_id.clone(),
                name: name.to_string(),
                input,
                queued_at: Utc::now(),
                state,
            }])
            .await?;

        Ok(task_id)
    }
}

/// Occurrences of `name` across the assigned, available, and processing
/// sets. This is the quantity the high-water ceiling applies to.
fn count_tasks_named(name: &str, sets: [&Vec<Task>; 3]) -> usize {
    sets.into_iter()
        .flatten()
        .filter(|task| task.name == name)
        .count()
}
