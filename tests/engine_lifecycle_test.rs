//! End-to-end engine tests over the in-memory storage adapter.
//!
//! Each test runs a full engine (scheduler, workers, broker) with short
//! poll intervals and drives it purely through the public API, asserting
//! on the event stream and on storage state.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use taskflow_core::config::EngineConfig;
use taskflow_core::engine::WorkflowEngine;
use taskflow_core::storage::MemoryStorage;
use taskflow_core::task::{
    HighWaterPolicy, RetryPolicy, TaskDefinition, TaskExecutionTimeout, TaskMap, TimeToLivePolicy,
    TimeoutPolicy,
};
use taskflow_core::worker::StopOptions;
use taskflow_core::{Storage, WorkflowError, WorkflowEvent};

fn fast_config() -> EngineConfig {
    EngineConfig {
        scheduler_poll_interval: Duration::from_millis(20),
        worker_poll_interval: Duration::from_millis(20),
        stop_poll_interval: Duration::from_millis(50),
        ..Default::default()
    }
}

async fn engine_with(name: &str, task_map: TaskMap) -> WorkflowEngine {
    WorkflowEngine::new(name, Arc::new(MemoryStorage::new()), task_map, fast_config())
        .await
        .expect("engine should initialize")
}

fn quick_retry_delay(_attempts_made: u32) -> Duration {
    Duration::from_millis(10)
}

#[tokio::test]
async fn task_retries_until_the_handler_succeeds() {
    let mut task_map = TaskMap::new();
    task_map.insert(
        "flaky".to_string(),
        TaskDefinition {
            retry: Some(RetryPolicy {
                maximum_retries: Some(5),
                get_retry_delay: Some(quick_retry_delay),
            }),
            ..Default::default()
        },
    );

    let engine = engine_with("retry-test", task_map).await;

    let attempts_seen = Arc::new(AtomicU32::new(0));
    let attempts_in_handler = Arc::clone(&attempts_seen);
    engine.register_handler("flaky", move |_context, bag| {
        let attempts_seen = Arc::clone(&attempts_in_handler);
        async move {
            attempts_seen.store(bag.attempts_made, Ordering::SeqCst);
            if bag.attempts_made < 3 {
                Err("not yet".into())
            } else {
                Ok(json!("finally"))
            }
        }
    });

    let mut rx = engine.subscribe();
    engine.start().await.unwrap();
    engine.start_worker().await.unwrap();

    let task_id = engine
        .enqueue("flaky", json!(null))
        .await
        .unwrap()
        .expect("should be admitted");

    let output = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let WorkflowEvent::TaskDone {
                task_id: done_id,
                output,
                ..
            } = rx.recv().await.unwrap()
            {
                if done_id == task_id {
                    break output;
                }
            }
        }
    })
    .await
    .expect("task should eventually succeed");

    assert_eq!(output, json!("finally"));
    assert_eq!(attempts_seen.load(Ordering::SeqCst), 3);

    engine.stop(StopOptions::default()).await.unwrap();
}

#[tokio::test]
async fn high_water_refuses_enqueues_while_the_queue_is_full() {
    let mut task_map = TaskMap::new();
    task_map.insert(
        "bounded".to_string(),
        TaskDefinition {
            high_water: Some(HighWaterPolicy { maximum_in_queue: 2 }),
            ..Default::default()
        },
    );

    // no scheduler or worker started, so admitted tasks stay queued
    let engine = engine_with("high-water-test", task_map).await;

    assert!(engine.enqueue("bounded", json!(1)).await.unwrap().is_some());
    assert!(engine.enqueue("bounded", json!(2)).await.unwrap().is_some());
    assert!(engine.enqueue("bounded", json!(3)).await.unwrap().is_none());
}

#[tokio::test]
async fn delayed_task_completes_after_its_due_time() {
    let mut task_map = TaskMap::new();
    task_map.insert("later".to_string(), TaskDefinition::default());

    let engine = engine_with("delay-test", task_map).await;
    engine.register_handler("later", |_context, _bag| async { Ok(json!("ran")) });

    let mut rx = engine.subscribe();
    engine.start().await.unwrap();
    engine.start_worker().await.unwrap();

    let process_at = chrono::Utc::now() + chrono::Duration::milliseconds(100);
    let task_id = engine
        .enqueue_at("later", json!(null), process_at)
        .await
        .unwrap()
        .expect("should be admitted");

    let done_at = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let WorkflowEvent::TaskDone {
                task_id: done_id, ..
            } = rx.recv().await.unwrap()
            {
                if done_id == task_id {
                    break chrono::Utc::now();
                }
            }
        }
    })
    .await
    .expect("delayed task should eventually run");

    assert!(done_at >= process_at);

    engine.stop(StopOptions::default()).await.unwrap();
}

#[tokio::test]
async fn timed_out_task_with_retry_policy_runs_again() {
    let mut task_map = TaskMap::new();
    task_map.insert(
        "slow-then-fast".to_string(),
        TaskDefinition {
            time_to_live: Some(TimeToLivePolicy {
                task_execution_timeout: Some(TaskExecutionTimeout {
                    policy: TimeoutPolicy::Retry,
                    timeout: Duration::from_millis(100),
                }),
            }),
            ..Default::default()
        },
    );

    let engine = engine_with("timeout-test", task_map).await;

    engine.register_handler("slow-then-fast", |_context, bag| async move {
        // first try blows through the deadline, the retry finishes in time
        if bag.attempts_made == 0 {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        Ok(json!("done"))
    });

    let mut rx = engine.subscribe();
    engine.start().await.unwrap();
    engine.start_worker().await.unwrap();

    let task_id = engine
        .enqueue("slow-then-fast", json!(null))
        .await
        .unwrap()
        .expect("should be admitted");

    let output = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let WorkflowEvent::TaskDone {
                task_id: done_id,
                output,
                ..
            } = rx.recv().await.unwrap()
            {
                if done_id == task_id {
                    break output;
                }
            }
        }
    })
    .await
    .expect("retried task should succeed");

    assert_eq!(output, json!("done"));
}

#[tokio::test]
async fn stopping_a_stuck_worker_reports_a_timeout() {
    let mut task_map = TaskMap::new();
    task_map.insert("stuck".to_string(), TaskDefinition::default());

    let storage = Arc::new(MemoryStorage::new());
    let engine = WorkflowEngine::new(
        "stuck-test",
        Arc::clone(&storage) as Arc<dyn taskflow_core::Storage>,
        task_map,
        fast_config(),
    )
    .await
    .unwrap();

    engine.register_handler("stuck", |_context, _bag| async {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(json!(null))
    });

    engine.start().await.unwrap();
    engine.start_worker().await.unwrap();

    engine
        .enqueue("stuck", json!(null))
        .await
        .unwrap()
        .expect("should be admitted");

    // wait until the handler is actually running
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if !storage.get_processing_tasks().await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("task should reach processing");

    let err = engine
        .stop(StopOptions {
            max_wait: Some(Duration::from_millis(600)),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::WorkerStopTimeout(_)));

    // the stuck worker did not block the rest of the shutdown: the
    // scheduler is down and no longer assigns freshly enqueued work
    engine
        .enqueue("stuck", json!(null))
        .await
        .unwrap()
        .expect("should be admitted");
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(storage.get_available_tasks().await.unwrap().len(), 1);
}

#[tokio::test]
async fn stop_rejects_an_unusable_max_wait() {
    let task_map = TaskMap::new();
    let engine = engine_with("stop-validation-test", task_map).await;

    engine.start_worker().await.unwrap();

    let err = engine
        .stop(StopOptions {
            max_wait: Some(Duration::from_millis(500)),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::Configuration(_)));
}
