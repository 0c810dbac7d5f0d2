//! Token-bucket rate limiter.
//!
//! One bucket per (rate-limiting key, rule id), lazily seeded from the rule
//! set on first use. The bucket cache is private to this process; the full
//! map is pushed through the injected save callback after every successful
//! mutation, and cross-process consistency is only whatever the storage
//! upsert provides.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, StorageResult, WorkflowError};

/// One tier of a rate limit. Rules attached to the same key are evaluated in
/// declared order and must all pass for a spend to succeed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitingRule {
    /// Unique name of the rule within its key.
    pub id: String,
    /// Initial amount of tasks allowed to be executed; also the refill cap.
    pub initial_amount: i64,
    /// How often the current amount should be increased.
    pub restore_every: std::time::Duration,
    /// How much the current amount is increased per elapsed interval.
    pub amount_restored: i64,
}

/// Per-rule token state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bucket {
    pub amount: i64,
    pub interval_start: DateTime<Utc>,
}

/// Full bucket state, keyed by rate-limiting key then rule id.
pub type BucketMap = HashMap<String, HashMap<String, Bucket>>;

/// Persistence callback invoked with the full bucket map after a mutation.
pub type SaveBucketsFn = Arc<dyn Fn(BucketMap) -> BoxFuture<'static, StorageResult<()>> + Send + Sync>;

pub struct RateLimiter {
    rules_by_key: HashMap<String, Vec<RateLimitingRule>>,
    buckets_by_key: Mutex<BucketMap>,
    on_save_buckets: SaveBucketsFn,
}

impl RateLimiter {
    pub fn new(
        rules_by_key: HashMap<String, Vec<RateLimitingRule>>,
        on_save_buckets: SaveBucketsFn,
        initial_buckets_by_key: BucketMap,
    ) -> Self {
        Self {
            rules_by_key,
            buckets_by_key: Mutex::new(initial_buckets_by_key),
            on_save_buckets,
        }
    }

    /// Try to spend `amount` tokens for `key` at instant `now`.
    ///
    /// Rules are walked in declared order; a rule that would go negative
    /// rejects the whole spend and nothing is persisted for that call.
    /// Refills and decrements applied to rules walked before the failing one
    /// keep their in-memory effect; the next successful spend persists them.
    pub async fn spend_amount(&self, key: &str, amount: i64, now: DateTime<Utc>) -> Result<bool> {
        let rules = self.rules_by_key.get(key).ok_or_else(|| {
            WorkflowError::Configuration(format!(
                "expected rate limiting rules to be defined for key {key}"
            ))
        })?;

        if let Some(snapshot) = self.seed_buckets(key, rules, now) {
            (self.on_save_buckets)(snapshot).await?;
        }

        debug!(key, amount, "trying to spend rate limit amount");

        let snapshot = {
            let mut buckets_by_key = self.buckets_by_key.lock();
            let scoped = buckets_by_key.get_mut(key).ok_or_else(|| {
                WorkflowError::Configuration(format!("rate limiting buckets missing for key {key}"))
            })?;

            if !walk_rules(scoped, rules, key, amount, now)? {
                return Ok(false);
            }

            buckets_by_key.clone()
        };

        (self.on_save_buckets)(snapshot).await?;

        Ok(true)
    }

    /// Lazily create the bucket set for a new key, seeded at each rule's
    /// `initial_amount`. Returns a snapshot to persist when seeding happened.
    fn seed_buckets(
        &self,
        key: &str,
        rules: &[RateLimitingRule],
        now: DateTime<Utc>,
    ) -> Option<BucketMap> {
        let mut buckets_by_key = self.buckets_by_key.lock();

        if buckets_by_key.contains_key(key) {
            return None;
        }

        let seeded = rules
            .iter()
            .map(|rule| {
                (
                    rule.id.clone(),
                    Bucket {
                        amount: rule.initial_amount,
                        interval_start: now,
                    },
                )
            })
            .collect();

        buckets_by_key.insert(key.to_string(), seeded);

        Some(buckets_by_key.clone())
    }
}

fn walk_rules(
    scoped: &mut HashMap<String, Bucket>,
    rules: &[RateLimitingRule],
    key: &str,
    amount: i64,
    now: DateTime<Utc>,
) -> Result<bool> {
    for rule in rules {
        let bucket = scoped.get_mut(&rule.id).ok_or_else(|| {
            WorkflowError::Configuration(format!(
                "rate limiting bucket missing for key {key} rule {}",
                rule.id
            ))
        })?;

        let restore_every_ms = rule.restore_every.as_millis() as i64;
        let elapsed_ms = (now - bucket.interval_start).num_milliseconds();

        if restore_every_ms > 0 && elapsed_ms > restore_every_ms {
            let intervals_passed = elapsed_ms / restore_every_ms;

            debug!(
                key,
                rule = %rule.id,
                intervals_passed,
                amount_restored = rule.amount_restored,
                "restoring rate limit amount"
            );

            bucket.amount = (bucket.amount + rule.amount_restored * intervals_passed)
                .min(rule.initial_amount);
            bucket.interval_start = now;
        }

        let next_amount = bucket.amount - amount;

        if next_amount < 0 {
            debug!(
                key,
                rule = %rule.id,
                requested = amount,
                available = bucket.amount,
                "rate limiting blocking spend"
            );
            return Ok(false);
        }

        bucket.amount = next_amount;
    }

    Ok(true)
}
