//! Leader-only assignment loop.
//!
//! Every scheduler instance polls on a fixed interval, but only the one
//! holding master status runs the assignment pipeline: reclaim tasks owned
//! by dead workers, run candidates through the concurrency and rate-limit
//! passes, and hand survivors to registered workers round-robin.

pub mod middleware;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::events::{EventPublisher, WorkflowEvent};
use crate::leadership::LeadershipEngine;
use crate::rate_limit::{RateLimiter, SaveBucketsFn};
use crate::storage::Storage;
use crate::task::{Task, TaskMap, TaskState};

use middleware::{concurrency_pass, rate_limit_pass, rules_by_key_from_task_map};

/// Worker ids visible to the scheduler for round-robin assignment. The
/// engine appends to this list as workers start.
pub type SharedWorkerIds = Arc<RwLock<Vec<String>>>;

pub fn generate_scheduler_id(instance_name: &str) -> String {
    format!("{instance_name}_scheduler")
}

pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct SchedulerInner {
    id: String,
    storage: Arc<dyn Storage>,
    task_map: Arc<TaskMap>,
    leadership: LeadershipEngine,
    events: EventPublisher,
    workers: SharedWorkerIds,
    rate_limiter: RateLimiter,
    poll_interval: Duration,
    shutdown: Notify,
    round_robin: AtomicUsize,
    is_leader: AtomicBool,
}

impl Scheduler {
    /// Build a scheduler for this instance. Reads the persisted bucket map
    /// so the rate limiter resumes from whatever state the previous leader
    /// saved.
    pub async fn new(
        instance_name: &str,
        storage: Arc<dyn Storage>,
        task_map: Arc<TaskMap>,
        leadership: LeadershipEngine,
        events: EventPublisher,
        workers: SharedWorkerIds,
        poll_interval: Duration,
    ) -> Result<Self> {
        let save_storage = Arc::clone(&storage);
        let on_save_buckets: SaveBucketsFn = Arc::new(move |buckets| {
            let storage = Arc::clone(&save_storage);
            async move { storage.set_rate_limiting(buckets).await }.boxed()
        });

        let rate_limiter = RateLimiter::new(
            rules_by_key_from_task_map(&task_map),
            on_save_buckets,
            storage.get_rate_limiting().await?,
        );

        Ok(Self {
            inner: Arc::new(SchedulerInner {
                id: generate_scheduler_id(instance_name),
                storage,
                task_map,
                leadership,
                events,
                workers,
                rate_limiter,
                poll_interval,
                shutdown: Notify::new(),
                round_robin: AtomicUsize::new(0),
                is_leader: AtomicBool::new(false),
            }),
            handle: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Register this scheduler and begin polling.
    pub async fn start(&self) -> Result<()> {
        info!(scheduler_id = %self.inner.id, "starting scheduler polling");

        self.inner
            .storage
            .register_schedulers(&[self.inner.id.clone()])
            .await?;

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            loop {
                if let Err(e) = inner.poll_cycle().await {
                    error!(scheduler_id = %inner.id, error = %e, "scheduler poll cycle failed");
                }

                tokio::select! {
                    _ = tokio::time::sleep(inner.poll_interval) => {}
                    _ = inner.shutdown.notified() => break,
                }
            }
        });

        *self.handle.lock() = Some(handle);

        Ok(())
    }

    /// Cancel the polling loop and deregister. Another leader is elected on
    /// the next dead-leader sweep once this scheduler's TTL expires.
    pub async fn stop(&self) -> Result<()> {
        self.inner.shutdown.notify_one();

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        self.inner
            .storage
            .unregister_schedulers(&[self.inner.id.clone()])
            .await?;

        Ok(())
    }
}

impl SchedulerInner {
    async fn poll_cycle(&self) -> Result<()> {
        let is_leader_now = self.leadership.try_to_take_leadership(&self.id).await?;
        let was_leader = self.is_leader.swap(is_leader_now, Ordering::SeqCst);

        if is_leader_now && !was_leader {
            info!(scheduler_id = %self.id, "scheduler got leadership");
        }

        if !is_leader_now {
            return Ok(());
        }

        self.storage.clean_outdated_tasks().await?;

        let (available, processing, assigned) = tokio::join!(
            self.storage.get_available_tasks(),
            self.storage.get_processing_tasks(),
            self.storage.get_assigned_tasks(None),
        );
        let (available, processing, assigned) = (available?, processing?, assigned?);

        let batch = concurrency_pass(available, &processing, &assigned, &self.task_map)?;
        let batch = rate_limit_pass(batch, &self.task_map, &self.rate_limiter, Utc::now()).await?;

        if batch.accepted.is_empty() {
            return Ok(());
        }

        let worker_ids = self.workers.read().clone();
        if worker_ids.is_empty() {
            warn!(
                scheduler_id = %self.id,
                accepted = batch.accepted.len(),
                "no workers registered, leaving tasks available"
            );
            return Ok(());
        }

        let next_assigned: Vec<Task> = batch
            .accepted
            .iter()
            .map(|task| {
                task.with_state(TaskState::Assigned {
                    worker_id: self.next_worker_id(&worker_ids),
                })
            })
            .collect();

        debug!(
            scheduler_id = %self.id,
            count = next_assigned.len(),
            "assigning tasks to workers"
        );

        self.storage.update_tasks_state(&next_assigned).await?;

        for task in &next_assigned {
            self.events.publish(WorkflowEvent::TaskAssigned {
                task_id: task.id.clone(),
            });
        }

        Ok(())
    }

    fn next_worker_id(&self, worker_ids: &[String]) -> String {
        let index = self.round_robin.fetch_add(1, Ordering::SeqCst);
        worker_ids[index % worker_ids.len()].clone()
    }
}
