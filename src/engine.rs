//! Engine facade.
//!
//! Wires the broker, scheduler, workers, and flow factory together over a
//! single storage adapter and event stream. One engine per process is the
//! expected shape; its instance name feeds every worker and scheduler id
//! so liveness locks are traceable back to the host.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::info;

use crate::broker::{Broker, EnqueueOptions};
use crate::config::{EngineConfig, MIN_STOP_MAX_WAIT};
use crate::error::{Result, WorkflowError};
use crate::events::{EventPublisher, WorkflowEvent};
use crate::flow::{Flow, FlowFactory};
use crate::leadership::LeadershipEngine;
use crate::scheduler::{Scheduler, SharedWorkerIds};
use crate::storage::Storage;
use crate::task::{TaskId, TaskMap};
use crate::worker::{
    generate_worker_id, HandlerBag, HandlerFailure, HandlerRegistry, StopOptions, TaskContext,
    Worker,
};

/// `<hostname>_<pid>_<name>`, the prefix of every worker and scheduler id
/// minted by this engine.
fn instance_name(name: &str) -> String {
    let hostname = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("HOST"))
        .unwrap_or_else(|_| "localhost".to_string());
    format!("{hostname}_{}_{name}", std::process::id())
}

pub struct WorkflowEngine {
    instance_name: String,
    config: EngineConfig,
    storage: Arc<dyn Storage>,
    task_map: Arc<TaskMap>,
    events: EventPublisher,
    handlers: HandlerRegistry,
    broker: Broker,
    scheduler: Scheduler,
    worker_ids: SharedWorkerIds,
    workers: Mutex<Vec<Worker>>,
    flows: FlowFactory,
}

impl WorkflowEngine {
    pub async fn new(
        name: &str,
        storage: Arc<dyn Storage>,
        task_map: TaskMap,
        config: EngineConfig,
    ) -> Result<Self> {
        let instance_name = instance_name(name);
        let task_map = Arc::new(task_map);
        let events = EventPublisher::new(config.event_channel_capacity);
        let handlers: HandlerRegistry = Arc::new(DashMap::new());
        let broker = Broker::new(Arc::clone(&storage), events.clone(), Arc::clone(&task_map));
        let leadership = LeadershipEngine::new(Arc::clone(&storage), events.clone());
        let worker_ids: SharedWorkerIds = Arc::new(RwLock::new(Vec::new()));

        let scheduler = Scheduler::new(
            &instance_name,
            Arc::clone(&storage),
            Arc::clone(&task_map),
            leadership,
            events.clone(),
            Arc::clone(&worker_ids),
            config.scheduler_poll_interval,
        )
        .await?;

        let flows = FlowFactory::new(Arc::clone(&storage), &events, broker.clone());

        info!(instance = %instance_name, "engine initialized");

        Ok(Self {
            instance_name,
            config,
            storage,
            task_map,
            events,
            handlers,
            broker,
            scheduler,
            worker_ids,
            workers: Mutex::new(Vec::new()),
            flows,
        })
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    /// Register the handler for a task name, replacing any previous one.
    pub fn register_handler<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(TaskContext, HandlerBag) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, HandlerFailure>> + Send + 'static,
    {
        self.handlers.insert(
            name.to_string(),
            Arc::new(move |context, bag| handler(context, bag).boxed()),
        );
    }

    /// Enqueue a task by name. `None` means the high-water policy refused
    /// it.
    pub async fn enqueue(&self, name: &str, input: Value) -> Result<Option<TaskId>> {
        self.broker.enqueue(name, input, EnqueueOptions::default()).await
    }

    /// Enqueue a task whose execution is delayed until `process_at`.
    pub async fn enqueue_at(
        &self,
        name: &str,
        input: Value,
        process_at: DateTime<Utc>,
    ) -> Result<Option<TaskId>> {
        self.broker
            .enqueue(
                name,
                input,
                EnqueueOptions {
                    process_at: Some(process_at),
                },
            )
            .await
    }

    pub fn create_flow(&self, name: &str) -> Flow {
        self.flows.create_flow(name)
    }

    /// Start the scheduler poll loop. Workers are started separately with
    /// [`WorkflowEngine::start_worker`].
    pub async fn start(&self) -> Result<()> {
        self.scheduler.start().await
    }

    /// Spin up one more worker and make it visible to the scheduler's
    /// round-robin.
    pub async fn start_worker(&self) -> Result<Worker> {
        let index = self.workers.lock().len() + 1;
        let worker_id = generate_worker_id(&self.instance_name, index);

        let worker = Worker::new(
            worker_id.clone(),
            Arc::clone(&self.storage),
            self.events.clone(),
            Arc::clone(&self.handlers),
            Arc::clone(&self.task_map),
            self.broker.clone(),
            self.config.worker_poll_interval,
            self.config.stop_poll_interval,
            self.config.stop_max_wait,
        );

        worker.start().await?;

        self.worker_ids.write().push(worker_id);
        self.workers.lock().push(worker.clone());

        Ok(worker)
    }

    /// Stop every worker, the scheduler, the flow dispatcher, then the
    /// storage adapter. A worker that fails to drain does not block the
    /// rest of the shutdown; its error is surfaced once everything else is
    /// down.
    pub async fn stop(&self, options: StopOptions) -> Result<()> {
        let max_wait = options.max_wait.unwrap_or(self.config.stop_max_wait);
        if max_wait <= MIN_STOP_MAX_WAIT {
            return Err(WorkflowError::Configuration(format!(
                "stop max_wait must be greater than {}ms",
                MIN_STOP_MAX_WAIT.as_millis()
            )));
        }

        let workers: Vec<Worker> = self.workers.lock().clone();
        let worker_results = futures::future::join_all(
            workers.iter().map(|worker| worker.stop(options.clone())),
        )
        .await;

        self.scheduler.stop().await?;
        self.flows.stop().await;
        self.storage.stop().await?;

        for result in worker_results {
            result?;
        }

        info!(instance = %self.instance_name, "engine stopped");

        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }
}
