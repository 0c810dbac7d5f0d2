//! Assignment pipeline passes.
//!
//! Candidates flow through the concurrency pass then the rate-limit pass;
//! rejection is never a drop, the task simply stays available for a later
//! cycle.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::rate_limit::{RateLimiter, RateLimitingRule};
use crate::task::{lookup_definition, Task, TaskMap};

/// Candidate split produced by each pass.
#[derive(Debug, Default)]
pub struct AdmissionBatch {
    pub accepted: Vec<Task>,
    pub rejected: Vec<Task>,
}

/// Per task name, count existing assigned + processing occurrences; accept a
/// candidate while the name's `maximum_concurrent` ceiling is not reached,
/// incrementing the running count on acceptance. Unset or `<= 0` means
/// unlimited.
pub fn concurrency_pass(
    candidates: Vec<Task>,
    processing: &[Task],
    assigned: &[Task],
    task_map: &TaskMap,
) -> Result<AdmissionBatch> {
    let mut count_per_name: HashMap<String, i64> = HashMap::new();

    for task in processing.iter().chain(assigned) {
        *count_per_name.entry(task.name.clone()).or_default() += 1;
    }

    let mut batch = AdmissionBatch::default();

    for task in candidates {
        let definition = lookup_definition(&task.name, task_map)?;
        let maximum = definition
            .concurrency
            .map(|policy| policy.maximum_concurrent)
            .unwrap_or(-1);
        let count = count_per_name.entry(task.name.clone()).or_default();

        if maximum <= 0 || *count < maximum {
            *count += 1;
            batch.accepted.push(task);
        } else {
            batch.rejected.push(task);
        }
    }

    Ok(batch)
}

/// For each accepted candidate with a rate-limit policy, spend one token for
/// its derived key; denial moves the task to the rejected set.
pub async fn rate_limit_pass(
    batch: AdmissionBatch,
    task_map: &TaskMap,
    rate_limiter: &RateLimiter,
    now: DateTime<Utc>,
) -> Result<AdmissionBatch> {
    let mut next = AdmissionBatch {
        accepted: Vec::with_capacity(batch.accepted.len()),
        rejected: batch.rejected,
    };

    for task in batch.accepted {
        let definition = lookup_definition(&task.name, task_map)?;

        let Some(rate_limit) = &definition.rate_limit else {
            next.accepted.push(task);
            continue;
        };

        let key = (rate_limit.get_rate_limiting_key)();

        if rate_limiter.spend_amount(&key, 1, now).await? {
            next.accepted.push(task);
        } else {
            next.rejected.push(task);
        }
    }

    Ok(next)
}

/// Collect the rule sets declared in the task map, keyed by their derived
/// rate-limiting key.
pub fn rules_by_key_from_task_map(task_map: &TaskMap) -> HashMap<String, Vec<RateLimitingRule>> {
    let mut rules_by_key = HashMap::new();

    for definition in task_map.values() {
        if let Some(rate_limit) = &definition.rate_limit {
            let key = (rate_limit.get_rate_limiting_key)();
            rules_by_key.insert(key, rate_limit.rules.clone());
        }
    }

    rules_by_key
}
