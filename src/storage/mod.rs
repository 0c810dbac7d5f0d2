//! Storage contract implemented by the persistence collaborator.
//!
//! The core never talks to a database directly; every cross-process
//! coordination point (task table, liveness locks, master election, bucket
//! map, flow/group links) goes through this trait. Every method must be
//! safely callable from concurrent processes. Storage errors are never
//! swallowed by the core.

pub mod memory;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StorageResult;
use crate::rate_limit::BucketMap;
use crate::task::{Task, TaskId};

pub use memory::MemoryStorage;

/// A persisted flow instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRecord {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// Resolved flow identity for a task lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowRef {
    pub id: String,
    pub name: String,
}

/// Task membership in a flow.
#[derive(Debug, Clone)]
pub struct FlowTaskLink {
    pub flow_id: String,
    pub task_id: TaskId,
}

/// Task membership in a fan-in group within a flow.
#[derive(Debug, Clone)]
pub struct GroupTaskLink {
    pub flow_id: String,
    pub task_id: TaskId,
    pub group_id: String,
}

/// Completion marker input for `mark_flow_tasks_as_done`.
#[derive(Debug, Clone)]
pub struct FlowTaskDone {
    pub flow_id: String,
    pub task_id: TaskId,
    pub group_id: Option<String>,
}

/// Remaining/total task counts for a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupProgress {
    pub left: usize,
    pub total: usize,
}

#[async_trait]
pub trait Storage: Send + Sync {
    /// Shutdown hook for the adapter (close pools, flush, ...).
    async fn stop(&self) -> StorageResult<()>;

    /// Persist new tasks, appending one immutable event-log entry each.
    async fn add_tasks(&self, tasks: &[Task]) -> StorageResult<()>;

    /// Apply state transitions in order, appending one event-log entry each.
    async fn update_tasks_state(&self, tasks: &[Task]) -> StorageResult<()>;

    /// Tasks in `processing`.
    async fn get_processing_tasks(&self) -> StorageResult<Vec<Task>>;

    /// Tasks eligible for assignment: `waiting`, or `delayed` whose
    /// `process_at` is due. Oldest `queued_at` first.
    async fn get_available_tasks(&self) -> StorageResult<Vec<Task>>;

    /// Tasks in `assigned`, optionally restricted to one worker.
    async fn get_assigned_tasks(&self, worker_id: Option<&str>) -> StorageResult<Vec<Task>>;

    /// Revert tasks owned by TTL-expired workers back to an assignable
    /// state, clearing worker ownership.
    async fn clean_outdated_tasks(&self) -> StorageResult<()>;

    /// Count of `processing` transitions per task id, derived from the
    /// event log.
    async fn get_tasks_attempts(&self, task_ids: &[TaskId])
        -> StorageResult<HashMap<TaskId, u32>>;

    async fn register_workers(&self, worker_ids: &[String]) -> StorageResult<()>;
    async fn refresh_workers_locks(&self, worker_ids: &[String]) -> StorageResult<()>;

    async fn register_schedulers(&self, scheduler_ids: &[String]) -> StorageResult<()>;
    async fn refresh_schedulers_locks(&self, scheduler_ids: &[String]) -> StorageResult<()>;
    async fn unregister_schedulers(&self, scheduler_ids: &[String]) -> StorageResult<()>;

    /// Resign any master scheduler whose TTL has expired. Returns the number
    /// of leaders resigned.
    async fn resign_dead_leaders(&self) -> StorageResult<u64>;

    /// Exclusive compare-and-set of master status onto this scheduler id.
    /// At most one id holds master status at any instant; the call returns
    /// `true` when this id is (or already was) the holder.
    async fn try_to_set_master_scheduler(&self, scheduler_id: &str) -> StorageResult<bool>;

    /// Full rate-limiting bucket map.
    async fn get_rate_limiting(&self) -> StorageResult<BucketMap>;
    async fn set_rate_limiting(&self, buckets: BucketMap) -> StorageResult<()>;

    async fn add_flows(&self, flows: &[FlowRecord]) -> StorageResult<()>;
    async fn assign_task_ids_to_flows(&self, links: &[FlowTaskLink]) -> StorageResult<()>;
    async fn assign_task_ids_to_groups(&self, links: &[GroupTaskLink]) -> StorageResult<()>;
    async fn get_flows_by_task_ids(&self, task_ids: &[TaskId]) -> StorageResult<Vec<FlowRef>>;

    /// Group membership per task id; `None` for tasks enqueued outside any
    /// group.
    async fn get_group_ids_by_task_ids(
        &self,
        task_ids: &[TaskId],
    ) -> StorageResult<HashMap<TaskId, Option<String>>>;

    /// Mark flow tasks done; returns updated `{left, total}` per affected
    /// group.
    async fn mark_flow_tasks_as_done(
        &self,
        tasks: &[FlowTaskDone],
    ) -> StorageResult<HashMap<String, GroupProgress>>;

    /// Outputs of every done task in each group. Order is storage-defined.
    async fn get_all_tasks_outputs_by_group_ids(
        &self,
        group_ids: &[String],
    ) -> StorageResult<HashMap<String, Vec<Value>>>;

    async fn stop_flows(&self, flow_ids: &[String]) -> StorageResult<()>;
}
