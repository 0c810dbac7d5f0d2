//! Typed lifecycle event stream.
//!
//! Every component publishes into a single broadcast channel; the flow
//! dispatcher and any external observer subscribe to it. Publishing never
//! fails: an event with no subscribers is simply dropped.

use serde_json::Value;
use tokio::sync::broadcast;

use crate::task::TaskId;

/// The fixed set of events emitted by the engine.
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    /// A master scheduler's TTL expired and it was resigned.
    DeadLeader,
    /// A scheduler attempted to take leadership. Emitted on every attempt,
    /// whether or not the compare-and-set succeeded.
    NewLeader { scheduler_id: String },
    /// A task passed admission and was persisted.
    TaskEnqueued { task_id: TaskId },
    /// The leader scheduler assigned a task to a worker.
    TaskAssigned { task_id: TaskId },
    /// A handler finished successfully and the terminal state was persisted.
    TaskDone {
        task_id: TaskId,
        name: String,
        output: Value,
    },
    /// A task reached the failed state.
    TaskFailed {
        task_id: TaskId,
        name: String,
        error: Value,
    },
}

/// Broadcast publisher for [`WorkflowEvent`]s.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<WorkflowEvent>,
}

impl EventPublisher {
    /// Create a new publisher with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event. A send error only means there are currently no
    /// subscribers, which is acceptable.
    pub fn publish(&self, event: WorkflowEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_without_subscribers_is_a_no_op() {
        let publisher = EventPublisher::new(16);
        publisher.publish(WorkflowEvent::DeadLeader);
    }

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let publisher = EventPublisher::new(16);
        let mut rx = publisher.subscribe();

        publisher.publish(WorkflowEvent::NewLeader {
            scheduler_id: "host_1_scheduler".to_string(),
        });

        match rx.recv().await.unwrap() {
            WorkflowEvent::NewLeader { scheduler_id } => {
                assert_eq!(scheduler_id, "host_1_scheduler");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
