use std::time::Duration;

use crate::error::{Result, WorkflowError};

/// Minimum accepted value for `StopOptions::max_wait`. The drain loop checks
/// `is_working` every 500ms, so anything at or below this can never observe
/// a completed batch.
pub const MIN_STOP_MAX_WAIT: Duration = Duration::from_millis(550);

/// Engine-wide tuning knobs shared by the scheduler and workers.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Interval between scheduler poll cycles.
    pub scheduler_poll_interval: Duration,
    /// Interval between worker poll cycles.
    pub worker_poll_interval: Duration,
    /// Default for `StopOptions::max_wait` when stopping a working worker.
    pub stop_max_wait: Duration,
    /// How often the stop call re-checks a draining worker.
    pub stop_poll_interval: Duration,
    /// Capacity of the broadcast event channel.
    pub event_channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scheduler_poll_interval: Duration::from_secs(5),
            worker_poll_interval: Duration::from_secs(5),
            stop_max_wait: Duration::from_secs(5),
            stop_poll_interval: Duration::from_millis(500),
            event_channel_capacity: 1000,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(interval) = std::env::var("TASKFLOW_SCHEDULER_POLL_INTERVAL_MS") {
            config.scheduler_poll_interval = Duration::from_millis(parse_ms(
                "TASKFLOW_SCHEDULER_POLL_INTERVAL_MS",
                &interval,
            )?);
        }

        if let Ok(interval) = std::env::var("TASKFLOW_WORKER_POLL_INTERVAL_MS") {
            config.worker_poll_interval =
                Duration::from_millis(parse_ms("TASKFLOW_WORKER_POLL_INTERVAL_MS", &interval)?);
        }

        if let Ok(max_wait) = std::env::var("TASKFLOW_STOP_MAX_WAIT_MS") {
            config.stop_max_wait =
                Duration::from_millis(parse_ms("TASKFLOW_STOP_MAX_WAIT_MS", &max_wait)?);
        }

        if let Ok(capacity) = std::env::var("TASKFLOW_EVENT_CHANNEL_CAPACITY") {
            config.event_channel_capacity = capacity.parse().map_err(|e| {
                WorkflowError::Configuration(format!("invalid event_channel_capacity: {e}"))
            })?;
        }

        Ok(config)
    }
}

fn parse_ms(name: &str, value: &str) -> Result<u64> {
    value
        .parse()
        .map_err(|e| WorkflowError::Configuration(format!("invalid {name}: {e}")))
}
