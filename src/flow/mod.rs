//! Flow orchestration.
//!
//! A flow is a named, persisted grouping of tasks with completion
//! callbacks. The factory owns one dispatcher task that listens to the
//! engine event stream and fans completions out to the callbacks
//! registered on each flow's controller.

pub mod callback_map;
pub mod controller;

mod dispatch;

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, warn};
use uuid::Uuid;

use crate::broker::Broker;
use crate::error::Result;
use crate::events::{EventPublisher, WorkflowEvent};
use crate::storage::{FlowRecord, Storage};

pub use callback_map::{CallbackKind, CallbackMap, FlowCallback};
pub use controller::{FlowController, FlowEnqueueOptions, Group};

/// Creates flows and runs the completion dispatcher.
pub struct FlowFactory {
    storage: Arc<dyn Storage>,
    broker: Broker,
    callback_map: CallbackMap,
    shutdown: Arc<Notify>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl FlowFactory {
    /// Build the factory and start its dispatcher on the given event
    /// stream.
    pub fn new(storage: Arc<dyn Storage>, events: &EventPublisher, broker: Broker) -> Self {
        let callback_map = CallbackMap::new();
        let shutdown = Arc::new(Notify::new());

        let mut rx = events.subscribe();
        let dispatcher_storage = Arc::clone(&storage);
        let dispatcher_callbacks = callback_map.clone();
        let dispatcher_shutdown = Arc::clone(&shutdown);

        let dispatcher = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    event = rx.recv() => event,
                    _ = dispatcher_shutdown.notified() => break,
                };

                match event {
                    Ok(WorkflowEvent::TaskDone {
                        task_id,
                        name,
                        output,
                    }) => {
                        if let Err(e) = dispatch::handle_task_done(
                            &dispatcher_storage,
                            &dispatcher_callbacks,
                            &task_id,
                            &name,
                            &output,
                        )
                        .await
                        {
                            error!(task_id = %task_id, error = %e, "flow dispatch failed");
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "flow dispatcher lagged behind the event stream");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        Self {
            storage,
            broker,
            callback_map,
            shutdown,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    /// Mint a new flow instance with a fresh id. Nothing is persisted until
    /// [`Flow::start`].
    pub fn create_flow(&self, name: &str) -> Flow {
        let flow_id = Uuid::new_v4().to_string();
        let controller = FlowController::new(
            flow_id.clone(),
            name.to_string(),
            self.callback_map.clone(),
            self.broker.clone(),
            Arc::clone(&self.storage),
        );

        Flow {
            id: flow_id,
            name: name.to_string(),
            controller,
            storage: Arc::clone(&self.storage),
        }
    }

    /// Stop the dispatcher. Already-registered callbacks stop firing.
    pub async fn stop(&self) {
        self.shutdown.notify_one();
        let dispatcher = self.dispatcher.lock().take();
        if let Some(dispatcher) = dispatcher {
            let _ = dispatcher.await;
        }
    }
}

/// One flow instance, ready to be started.
pub struct Flow {
    id: String,
    name: String,
    controller: FlowController,
    storage: Arc<dyn Storage>,
}

impl Flow {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Persist the flow record, then run the describe closure with this
    /// flow's controller. The closure registers callbacks and enqueues the
    /// flow's tasks.
    pub async fn start<F, Fut>(&self, input: Value, describe: F) -> Result<()>
    where
        F: FnOnce(FlowController, Value) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        self.storage
            .add_flows(&[FlowRecord {
                id: self.id.clone(),
                name: self.name.clone(),
                input: input.clone(),
            }])
            .await?;

        describe(self.controller.clone(), input).await
    }

    pub fn controller(&self) -> FlowController {
        self.controller.clone()
    }
}
