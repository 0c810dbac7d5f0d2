#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Taskflow Core
//!
//! Distributed task queue and workflow engine over a pluggable storage
//! adapter.
//!
//! ## Overview
//!
//! Taskflow coordinates many processes around a shared storage backend:
//! tasks are admitted through a broker, assigned to workers by a single
//! elected scheduler, executed under timeout and retry policies, and
//! optionally orchestrated into flows with fan-in groups and completion
//! callbacks. Every state change is persisted before the engine acts on
//! it, so any process can crash and be replaced without losing work.
//!
//! ## Key Features
//!
//! - **Event-sourced task lifecycle**: every transition is an immutable
//!   event-log entry; attempts are derived, never counted in place
//! - **Leader election**: one scheduler assigns at a time, with TTL-based
//!   liveness locks and automatic resignation of dead leaders
//! - **Admission control**: per-name high-water backpressure, concurrency
//!   ceilings, and persistent token-bucket rate limiting
//! - **Resilient workers**: execution timeouts with heartbeat extension,
//!   exponential-backoff retries, and reclamation of tasks owned by dead
//!   workers
//! - **Flow orchestration**: group fan-in with collected outputs and
//!   in-process completion callbacks
//!
//! ## Module Organization
//!
//! - [`engine`] - Process-level facade wiring everything together
//! - [`task`] - Task model, state machine, and per-name policies
//! - [`broker`] - Enqueue admission control
//! - [`scheduler`] - Leader-only assignment loop and its middleware passes
//! - [`worker`] - Poll/execute loop, timeout and error middleware
//! - [`leadership`] - Master scheduler election
//! - [`rate_limit`] - Token-bucket rule chains
//! - [`flow`] - Flow and group orchestration
//! - [`storage`] - Storage contract and the in-memory adapter
//! - [`events`] - Typed lifecycle event stream
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use taskflow_core::config::EngineConfig;
//! use taskflow_core::engine::WorkflowEngine;
//! use taskflow_core::storage::MemoryStorage;
//! use taskflow_core::task::{TaskDefinition, TaskMap};
//!
//! # async fn example() -> taskflow_core::error::Result<()> {
//! let mut task_map = TaskMap::new();
//! task_map.insert("send-email".to_string(), TaskDefinition::default());
//!
//! let engine = WorkflowEngine::new(
//!     "mailer",
//!     Arc::new(MemoryStorage::new()),
//!     task_map,
//!     EngineConfig::default(),
//! )
//! .await?;
//!
//! engine.register_handler("send-email", |context, _bag| async move {
//!     Ok(context.payload)
//! });
//!
//! engine.start().await?;
//! engine.start_worker().await?;
//! engine.enqueue("send-email", json!({"to": "ops@example.com"})).await?;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod flow;
pub mod leadership;
pub mod logging;
pub mod rate_limit;
pub mod scheduler;
pub mod storage;
pub mod task;
pub mod worker;

pub use broker::{Broker, EnqueueOptions};
pub use config::EngineConfig;
pub use engine::WorkflowEngine;
pub use error::{Result, StorageError, WorkflowError};
pub use events::{EventPublisher, WorkflowEvent};
pub use flow::{Flow, FlowController, FlowEnqueueOptions, Group};
pub use storage::{MemoryStorage, Storage};
pub use task::{Task, TaskDefinition, TaskId, TaskMap, TaskState};
pub use worker::{HandlerBag, HandlerFailure, StopOptions, TaskContext, Worker};
