//! Per-flow handle given to the describe closure.
//!
//! The controller scopes enqueues and callback registration to one flow
//! instance: every task enqueued through it is linked to the flow (and
//! optionally to a fan-in group) before the describe closure continues.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::broker::{Broker, EnqueueOptions};
use crate::error::{Result, WorkflowError};
use crate::storage::{FlowTaskLink, GroupTaskLink, Storage};
use crate::task::TaskId;

use super::callback_map::{CallbackKind, CallbackMap, FlowCallback};

use std::sync::Arc;

/// A fan-in group within one flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub id: String,
}

#[derive(Debug, Clone, Default)]
pub struct FlowEnqueueOptions {
    pub process_at: Option<DateTime<Utc>>,
    /// Membership in a fan-in group created by [`FlowController::create_group`].
    pub group: Option<Group>,
}

#[derive(Clone)]
pub struct FlowController {
    flow_id: String,
    flow_name: String,
    callback_map: CallbackMap,
    broker: Broker,
    storage: Arc<dyn Storage>,
}

impl FlowController {
    pub(super) fn new(
        flow_id: String,
        flow_name: String,
        callback_map: CallbackMap,
        broker: Broker,
        storage: Arc<dyn Storage>,
    ) -> Self {
        Self {
            flow_id,
            flow_name,
            callback_map,
            broker,
            storage,
        }
    }

    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    pub fn flow_name(&self) -> &str {
        &self.flow_name
    }

    /// Enqueue a task as part of this flow. Unlike a plain broker enqueue,
    /// a high-water refusal here is an error: a flow with silently missing
    /// tasks could never complete its groups.
    pub async fn enqueue(
        &self,
        name: &str,
        input: Value,
        options: FlowEnqueueOptions,
    ) -> Result<TaskId> {
        let task_id = self
            .broker
            .enqueue(
                name,
                input,
                EnqueueOptions {
                    process_at: options.process_at,
                },
            )
            .await?
            .ok_or_else(|| WorkflowError::EnqueueRefused(name.to_string()))?;

        self.storage
            .assign_task_ids_to_flows(&[FlowTaskLink {
                flow_id: self.flow_id.clone(),
                task_id: task_id.clone(),
            }])
            .await?;

        if let Some(group) = options.group {
            self.storage
                .assign_task_ids_to_groups(&[GroupTaskLink {
                    flow_id: self.flow_id.clone(),
                    task_id: task_id.clone(),
                    group_id: group.id,
                }])
                .await?;
        }

        debug!(flow_id = %self.flow_id, name, task_id = %task_id, "flow task enqueued");

        Ok(task_id)
    }

    /// Mint a new fan-in group. Tasks enqueued with this group fire the
    /// group callbacks once every member is done.
    pub fn create_group(&self) -> Group {
        Group {
            id: Uuid::new_v4().to_string(),
        }
    }

    /// Run `callback` each time a task named `name` in this flow completes.
    pub fn on_task_done(&self, name: &str, callback: FlowCallback) -> String {
        self.callback_map.add(
            &self.flow_name,
            &self.flow_id,
            CallbackKind::Task,
            name,
            callback,
        )
    }

    /// Run `callback` with the collected outputs once every task named
    /// `name` in its group is done.
    pub fn on_group_task_done(&self, name: &str, callback: FlowCallback) -> String {
        self.callback_map.add(
            &self.flow_name,
            &self.flow_id,
            CallbackKind::Group,
            name,
            callback,
        )
    }

    /// Mark this flow stopped in storage. Pending tasks keep running; only
    /// the flow record is closed.
    pub async fn stop(&self) -> Result<()> {
        self.storage.stop_flows(&[self.flow_id.clone()]).await?;
        Ok(())
    }
}
