//! Completion fan-out.
//!
//! Translates a `TaskDone` event into flow callbacks: task callbacks fire
//! with the single output, and once the task's group has no members left
//! the group callbacks fire with every collected output. A group whose
//! progress counter is missing is treated as already complete.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::error::Result;
use crate::storage::{FlowTaskDone, Storage};
use crate::task::TaskId;

use super::callback_map::{CallbackKind, CallbackMap};

pub(super) async fn handle_task_done(
    storage: &Arc<dyn Storage>,
    callback_map: &CallbackMap,
    task_id: &TaskId,
    task_name: &str,
    output: &Value,
) -> Result<()> {
    let flows = storage
        .get_flows_by_task_ids(std::slice::from_ref(task_id))
        .await?;

    // tasks enqueued outside any flow have no callbacks to fire
    let Some(flow) = flows.into_iter().next() else {
        return Ok(());
    };

    let task_keys = callback_map.get_keys(&flow.name, &flow.id, CallbackKind::Task, task_name);
    for callback in callback_map.get_callbacks(&task_keys) {
        callback(output.clone());
    }

    let group_ids = storage
        .get_group_ids_by_task_ids(std::slice::from_ref(task_id))
        .await?;
    let group_id = group_ids.get(task_id).cloned().flatten();

    let progress = storage
        .mark_flow_tasks_as_done(&[FlowTaskDone {
            flow_id: flow.id.clone(),
            task_id: task_id.clone(),
            group_id: group_id.clone(),
        }])
        .await?;

    let Some(group_id) = group_id else {
        return Ok(());
    };

    let complete = progress
        .get(&group_id)
        .map(|counters| counters.left == 0)
        .unwrap_or(true);

    if !complete {
        return Ok(());
    }

    debug!(flow_id = %flow.id, group_id = %group_id, "group complete, firing callbacks");

    let mut outputs = storage
        .get_all_tasks_outputs_by_group_ids(std::slice::from_ref(&group_id))
        .await?;
    let outputs = outputs.remove(&group_id).unwrap_or_default();

    let group_keys = callback_map.get_keys(&flow.name, &flow.id, CallbackKind::Group, task_name);
    for callback in callback_map.get_callbacks(&group_keys) {
        callback(Value::Array(outputs.clone()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FlowRecord, FlowTaskLink, GroupTaskLink, MemoryStorage};
    use crate::task::{Task, TaskState};
    use chrono::Utc;
    use parking_lot::Mutex;
    use serde_json::json;

    fn done_task(id: &str, name: &str, output: Value) -> Task {
        Task {
            id: id.to_string(),
            name: name.to_string(),
            input: json!(null),
            queued_at: Utc::now(),
            state: TaskState::Done { output },
        }
    }

    async fn flow_with_group(
        storage: &Arc<dyn Storage>,
        flow_id: &str,
        group_id: &str,
        task_ids: &[&str],
    ) {
        storage
            .add_flows(&[FlowRecord {
                id: flow_id.to_string(),
                name: "etl".to_string(),
                input: json!(null),
            }])
            .await
            .unwrap();

        for task_id in task_ids {
            storage
                .assign_task_ids_to_flows(&[FlowTaskLink {
                    flow_id: flow_id.to_string(),
                    task_id: task_id.to_string(),
                }])
                .await
                .unwrap();
            storage
                .assign_task_ids_to_groups(&[GroupTaskLink {
                    flow_id: flow_id.to_string(),
                    task_id: task_id.to_string(),
                    group_id: group_id.to_string(),
                }])
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn task_outside_any_flow_is_ignored() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let callback_map = CallbackMap::new();

        handle_task_done(
            &storage,
            &callback_map,
            &"t-1".to_string(),
            "loose",
            &json!(1),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn group_callbacks_fire_once_with_all_outputs() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let callback_map = CallbackMap::new();

        flow_with_group(&storage, "f-1", "g-1", &["t-1", "t-2"]).await;

        let fired: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&fired);
        callback_map.add(
            "etl",
            "f-1",
            CallbackKind::Group,
            "extract",
            Arc::new(move |outputs| sink.lock().push(outputs)),
        );

        for (task_id, output) in [("t-1", json!(10)), ("t-2", json!(20))] {
            storage
                .add_tasks(&[done_task(task_id, "extract", output.clone())])
                .await
                .unwrap();
            handle_task_done(
                &storage,
                &callback_map,
                &task_id.to_string(),
                "extract",
                &output,
            )
            .await
            .unwrap();
        }

        let fired = fired.lock();
        assert_eq!(fired.len(), 1);
        let outputs = fired[0].as_array().unwrap();
        assert_eq!(outputs.len(), 2);
        assert!(outputs.contains(&json!(10)));
        assert!(outputs.contains(&json!(20)));
    }

    #[tokio::test]
    async fn task_callbacks_fire_for_every_completion() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let callback_map = CallbackMap::new();

        storage
            .add_flows(&[FlowRecord {
                id: "f-1".to_string(),
                name: "etl".to_string(),
                input: json!(null),
            }])
            .await
            .unwrap();
        for task_id in ["t-1", "t-2"] {
            storage
                .assign_task_ids_to_flows(&[FlowTaskLink {
                    flow_id: "f-1".to_string(),
                    task_id: task_id.to_string(),
                }])
                .await
                .unwrap();
        }

        let fired: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&fired);
        callback_map.add(
            "etl",
            "f-1",
            CallbackKind::Task,
            "extract",
            Arc::new(move |output| sink.lock().push(output)),
        );

        for (task_id, output) in [("t-1", json!(1)), ("t-2", json!(2))] {
            handle_task_done(
                &storage,
                &callback_map,
                &task_id.to_string(),
                "extract",
                &output,
            )
            .await
            .unwrap();
        }

        assert_eq!(*fired.lock(), vec![json!(1), json!(2)]);
    }
}
