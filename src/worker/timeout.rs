//! Execution-timeout middleware.
//!
//! Races the handler against a resettable deadline. The handler runs in its
//! own spawned task, so expiry only resolves the race: the handler is never
//! cancelled and keeps running to completion in the background.

use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::task::{ExecutionError, TaskDefinition};

use super::handler::{Beat, HandlerFuture};

/// Run a handler under the task's execution-timeout policy, if any.
///
/// The handler receives a [`Beat`] that resets the deadline; without a
/// configured timeout the beat is a no-op.
pub async fn with_execution_timeout<F>(
    definition: &TaskDefinition,
    task_name: &str,
    run_handler: F,
) -> Result<serde_json::Value, ExecutionError>
where
    F: FnOnce(Beat) -> HandlerFuture,
{
    let timeout = definition
        .time_to_live
        .as_ref()
        .and_then(|ttl| ttl.task_execution_timeout.as_ref());

    let Some(timeout) = timeout else {
        return run_handler(Beat::noop())
            .await
            .map_err(|failure| ExecutionError::Handler(failure.cause));
    };

    let delay = timeout.timeout;
    let (beat_tx, mut beat_rx) = mpsc::unbounded_channel();
    let mut handler = tokio::spawn(run_handler(Beat::new(beat_tx)));

    let deadline = tokio::time::sleep(delay);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            joined = &mut handler => {
                return match joined {
                    Ok(result) => result.map_err(|failure| ExecutionError::Handler(failure.cause)),
                    Err(join_error) => {
                        Err(ExecutionError::Handler(json!(join_error.to_string())))
                    }
                };
            }
            Some(()) = beat_rx.recv() => {
                debug!(task_name, "resetting execution timeout");
                deadline.as_mut().reset(Instant::now() + delay);
            }
            () = &mut deadline => {
                // the handler task is left running; its result is discarded
                return Err(ExecutionError::Timeout);
            }
        }
    }
}
