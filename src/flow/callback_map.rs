//! In-process callback registry for flows.
//!
//! Callbacks are keyed by their target (flow name, flow id, kind, task or
//! group name) plus a monotonic counter, so registering twice for the same
//! target yields two distinct entries fired in registration order.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackKind {
    Task,
    Group,
}

impl CallbackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallbackKind::Task => "task",
            CallbackKind::Group => "group",
        }
    }
}

/// Callback fired with the task output (task kind) or the collected group
/// outputs (group kind).
pub type FlowCallback = Arc<dyn Fn(Value) + Send + Sync>;

#[derive(Default)]
struct CallbackMapInner {
    callbacks: HashMap<String, FlowCallback>,
    keys_by_target: HashMap<String, Vec<String>>,
    counter: u64,
}

/// Shared registry of flow callbacks, safe to use from the dispatcher task
/// and from flow construction concurrently.
#[derive(Clone, Default)]
pub struct CallbackMap {
    inner: Arc<Mutex<CallbackMapInner>>,
}

impl CallbackMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn target_key(flow_name: &str, flow_id: &str, kind: CallbackKind, name: &str) -> String {
        [flow_name, flow_id, kind.as_str(), name].join("-")
    }

    /// Register a callback; returns its unique key.
    pub fn add(
        &self,
        flow_name: &str,
        flow_id: &str,
        kind: CallbackKind,
        name: &str,
        callback: FlowCallback,
    ) -> String {
        let target = Self::target_key(flow_name, flow_id, kind, name);

        let mut inner = self.inner.lock();
        inner.counter += 1;
        let key = format!("{target}-{}", inner.counter);

        inner.callbacks.insert(key.clone(), callback);
        inner
            .keys_by_target
            .entry(target)
            .or_default()
            .push(key.clone());

        key
    }

    /// Keys registered for a target, in registration order.
    pub fn get_keys(
        &self,
        flow_name: &str,
        flow_id: &str,
        kind: CallbackKind,
        name: &str,
    ) -> Vec<String> {
        let target = Self::target_key(flow_name, flow_id, kind, name);
        self.inner
            .lock()
            .keys_by_target
            .get(&target)
            .cloned()
            .unwrap_or_default()
    }

    /// Resolve keys to callbacks, skipping any that were removed.
    pub fn get_callbacks(&self, keys: &[String]) -> Vec<FlowCallback> {
        let inner = self.inner.lock();
        keys.iter()
            .filter_map(|key| inner.callbacks.get(key).cloned())
            .collect()
    }

    pub fn remove(&self, key: &str) {
        self.inner.lock().callbacks.remove(key);
    }
}
