//! Durable audit trail for dispatched events.
//!
//! Registered at low priority under every well-known type so it runs after
//! the reactive handlers and persists whatever reached dispatch. Storage
//! failures are reported through the result and isolated by the dispatcher.

use crate::store::EventStore;
use async_trait::async_trait;
use std::sync::Arc;
use vigil_kernel::{EventHandler, EventOutbox, MonitorEvent, MonitorResult, event_types};

pub struct AuditLogHandler {
    store: Arc<dyn EventStore>,
}

impl AuditLogHandler {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EventHandler for AuditLogHandler {
    fn name(&self) -> &str {
        "audit_log"
    }

    fn priority(&self) -> u8 {
        10
    }

    fn handled_types(&self) -> Vec<String> {
        vec![
            event_types::BASELINE_DEVIATION.to_string(),
            event_types::RESOURCE_LIMIT.to_string(),
            event_types::RESOURCE_USAGE.to_string(),
            event_types::TASK_STATE.to_string(),
            event_types::TASK_EXECUTION.to_string(),
            event_types::PLUGIN_ERROR.to_string(),
        ]
    }

    async fn handle(&self, event: &MonitorEvent, _outbox: &EventOutbox) -> MonitorResult<bool> {
        self.store.insert(event.clone()).await?;
        Ok(true)
    }

    async fn status(&self) -> serde_json::Value {
        serde_json::json!({
            "persisted_events": self.store.count().await.unwrap_or(0),
        })
    }
}
