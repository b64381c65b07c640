//! Built-in event handlers.
//!
//! Each handler owns its own store and typed configuration and plugs into the
//! dispatcher through the `EventHandler` contract. Registration order and
//! priorities are wired by the pipeline builder.

pub mod audit;
pub mod baseline;
pub mod resource;
pub mod self_monitor;
pub mod task_state;

/// Lightweight accessor over a JSON config patch, shared by the handlers'
/// `update_config` implementations.
pub(crate) struct ConfigPatch<'a> {
    value: &'a serde_json::Value,
}

impl<'a> ConfigPatch<'a> {
    pub(crate) fn new(value: &'a serde_json::Value) -> Self {
        Self { value }
    }

    pub(crate) fn f64(&self, key: &str) -> Option<f64> {
        self.value.get(key).and_then(serde_json::Value::as_f64)
    }

    pub(crate) fn u32(&self, key: &str) -> Option<u32> {
        self.value
            .get(key)
            .and_then(serde_json::Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
    }

    pub(crate) fn u64(&self, key: &str) -> Option<u64> {
        self.value.get(key).and_then(serde_json::Value::as_u64)
    }
}
