//! Flow and group orchestration over a running engine.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use taskflow_core::config::EngineConfig;
use taskflow_core::engine::WorkflowEngine;
use taskflow_core::flow::FlowEnqueueOptions;
use taskflow_core::storage::MemoryStorage;
use taskflow_core::task::{TaskDefinition, TaskMap};
use taskflow_core::worker::StopOptions;

fn fast_config() -> EngineConfig {
    EngineConfig {
        scheduler_poll_interval: Duration::from_millis(20),
        worker_poll_interval: Duration::from_millis(20),
        ..Default::default()
    }
}

#[tokio::test]
async fn group_callbacks_fire_once_with_every_member_output() {
    let mut task_map = TaskMap::new();
    task_map.insert("square".to_string(), TaskDefinition::default());
    let engine = WorkflowEngine::new(
        "fan-in-test",
        Arc::new(MemoryStorage::new()),
        task_map,
        fast_config(),
    )
    .await
    .unwrap();

    engine.register_handler("square", |context, _bag| async move {
        let n = context.payload.as_i64().unwrap_or(0);
        Ok(json!(n * n))
    });

    engine.start().await.unwrap();
    engine.start_worker().await.unwrap();

    let fired: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();

    let flow = engine.create_flow("squares");
    let sink = Arc::clone(&fired);
    flow.start(json!([2, 3, 4]), |controller, input| async move {
        controller.on_group_task_done(
            "square",
            Arc::new(move |outputs| {
                sink.lock().push(outputs.clone());
                let _ = done_tx.send(outputs);
            }),
        );

        let group = controller.create_group();
        for n in input.as_array().cloned().unwrap_or_default() {
            controller
                .enqueue(
                    "square",
                    n,
                    FlowEnqueueOptions {
                        group: Some(group.clone()),
                        ..Default::default()
                    },
                )
                .await?;
        }
        Ok(())
    })
    .await
    .unwrap();

    let outputs = tokio::time::timeout(Duration::from_secs(10), done_rx.recv())
        .await
        .expect("group should complete")
        .unwrap();

    let outputs = outputs.as_array().unwrap().clone();
    assert_eq!(outputs.len(), 3);
    for expected in [json!(4), json!(9), json!(16)] {
        assert!(outputs.contains(&expected));
    }

    // give any spurious extra firing a chance to land
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fired.lock().len(), 1);

    engine.stop(StopOptions::default()).await.unwrap();
}

#[tokio::test]
async fn task_callbacks_see_each_completion_in_the_flow() {
    let mut task_map = TaskMap::new();
    task_map.insert("echo".to_string(), TaskDefinition::default());
    let engine = WorkflowEngine::new(
        "callback-test",
        Arc::new(MemoryStorage::new()),
        task_map,
        fast_config(),
    )
    .await
    .unwrap();

    engine.register_handler("echo", |context, _bag| async move { Ok(context.payload) });

    engine.start().await.unwrap();
    engine.start_worker().await.unwrap();

    let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();

    let flow = engine.create_flow("echoes");
    flow.start(json!(null), |controller, _input| async move {
        controller.on_task_done(
            "echo",
            Arc::new(move |output| {
                let _ = done_tx.send(output);
            }),
        );
        controller
            .enqueue("echo", json!("a"), FlowEnqueueOptions::default())
            .await?;
        controller
            .enqueue("echo", json!("b"), FlowEnqueueOptions::default())
            .await?;
        Ok(())
    })
    .await
    .unwrap();

    let mut seen = Vec::new();
    for _ in 0..2 {
        let output = tokio::time::timeout(Duration::from_secs(10), done_rx.recv())
            .await
            .expect("task callback should fire")
            .unwrap();
        seen.push(output);
    }

    assert!(seen.contains(&json!("a")));
    assert!(seen.contains(&json!("b")));

    engine.stop(StopOptions::default()).await.unwrap();
}

#[tokio::test]
async fn tasks_outside_the_flow_do_not_trigger_its_callbacks() {
    let mut task_map = TaskMap::new();
    task_map.insert("echo".to_string(), TaskDefinition::default());
    let engine = WorkflowEngine::new(
        "isolation-test",
        Arc::new(MemoryStorage::new()),
        task_map,
        fast_config(),
    )
    .await
    .unwrap();

    engine.register_handler("echo", |context, _bag| async move { Ok(context.payload) });

    engine.start().await.unwrap();
    engine.start_worker().await.unwrap();

    let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();

    let flow = engine.create_flow("quiet");
    flow.start(json!(null), |controller, _input| async move {
        controller.on_task_done(
            "echo",
            Arc::new(move |output| {
                let _ = done_tx.send(output);
            }),
        );
        controller
            .enqueue("echo", json!("inside"), FlowEnqueueOptions::default())
            .await?;
        Ok(())
    })
    .await
    .unwrap();

    // a plain enqueue of the same name, outside the flow
    engine.enqueue("echo", json!("outside")).await.unwrap();

    let first = tokio::time::timeout(Duration::from_secs(10), done_rx.recv())
        .await
        .expect("flow task should complete")
        .unwrap();
    assert_eq!(first, json!("inside"));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(done_rx.try_recv().is_err());

    engine.stop(StopOptions::default()).await.unwrap();
}
