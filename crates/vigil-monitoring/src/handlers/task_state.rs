//! State tracking for long-running, resumable tasks.
//!
//! The host signals `task started` / `task ended` around any monitored unit
//! of work and may push progress in between. Every transition emits a
//! `task_state` event whether or not the storage write succeeded — observers
//! must see the transition even when the record does not stick.

use crate::handlers::ConfigPatch;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use vigil_kernel::{
    Clock, EventHandler, EventOutbox, MonitorEvent, MonitorResult, event_types,
};

/// Lifecycle status of a tracked task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Active,
    Completed,
    Failed,
}

/// One tracked task. `state` is a schema-tagged map rather than an opaque
/// blob so consumers never deserialize blind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStateRecord {
    pub task_id: String,
    pub state: HashMap<String, serde_json::Value>,
    /// Percent complete, clamped to `[0, 100]`.
    pub progress: u8,
    pub status: TaskStatus,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

/// Storage for task state records, unique on `task_id`.
#[async_trait]
pub trait TaskStateStore: Send + Sync {
    async fn get(&self, task_id: &str) -> MonitorResult<Option<TaskStateRecord>>;

    /// Insert or replace; last writer wins.
    async fn put(&self, record: TaskStateRecord) -> MonitorResult<()>;

    /// Delete non-active records with `updated_at_ms` older than the cutoff.
    /// Active records survive regardless of age.
    async fn purge_inactive_older_than(&self, cutoff_ms: u64) -> MonitorResult<usize>;

    async fn count(&self) -> MonitorResult<usize>;
}

/// In-memory [`TaskStateStore`].
#[derive(Default)]
pub struct MemoryTaskStateStore {
    records: RwLock<HashMap<String, TaskStateRecord>>,
}

impl MemoryTaskStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStateStore for MemoryTaskStateStore {
    async fn get(&self, task_id: &str) -> MonitorResult<Option<TaskStateRecord>> {
        Ok(self.records.read().await.get(task_id).cloned())
    }

    async fn put(&self, record: TaskStateRecord) -> MonitorResult<()> {
        self.records
            .write()
            .await
            .insert(record.task_id.clone(), record);
        Ok(())
    }

    async fn purge_inactive_older_than(&self, cutoff_ms: u64) -> MonitorResult<usize> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, r| r.status == TaskStatus::Active || r.updated_at_ms >= cutoff_ms);
        Ok(before - records.len())
    }

    async fn count(&self) -> MonitorResult<usize> {
        Ok(self.records.read().await.len())
    }
}

/// Task state manager configuration.
#[derive(Debug, Clone)]
pub struct TaskStateConfig {
    /// Non-active records older than this are purged. Default 24 hours.
    pub ttl: Duration,
}

impl Default for TaskStateConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 3600),
        }
    }
}

impl TaskStateConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

/// Tracks progress and lifecycle of long-running tasks.
pub struct TaskStateManager {
    store: Arc<dyn TaskStateStore>,
    clock: Arc<dyn Clock>,
    config: RwLock<TaskStateConfig>,
}

impl TaskStateManager {
    pub fn new(
        store: Arc<dyn TaskStateStore>,
        clock: Arc<dyn Clock>,
        config: TaskStateConfig,
    ) -> Self {
        Self {
            store,
            clock,
            config: RwLock::new(config),
        }
    }

    /// Write `record` and emit the transition event. The event goes out even
    /// when the write fails; the returned flag says whether the write stuck.
    async fn write_and_emit(
        &self,
        record: TaskStateRecord,
        transition: &str,
        outbox: &EventOutbox,
    ) -> bool {
        let stored = match self.store.put(record.clone()).await {
            Ok(()) => true,
            Err(e) => {
                warn!(task_id = %record.task_id, error = %e, "task state write failed");
                false
            }
        };

        outbox.emit(
            MonitorEvent::new(event_types::TASK_STATE, "task_state", self.clock.as_ref())
                .with_context(record.task_id.clone())
                .with_message(format!("task {transition}"))
                .with_data("transition", transition)
                .with_data("status", record.status)
                .with_data("progress", record.progress)
                .with_data("stored", stored),
        );
        stored
    }

    /// Record a task start. Prior `progress` and state entries survive a
    /// restart so resumable tasks pick up where they left off.
    pub async fn task_started(
        &self,
        task_id: &str,
        args: serde_json::Value,
        outbox: &EventOutbox,
    ) -> bool {
        let now = self.clock.now_millis();
        let prior = self.store.get(task_id).await.unwrap_or_else(|e| {
            warn!(task_id, error = %e, "prior task state unavailable, starting fresh");
            None
        });

        let (mut state, progress, created_at) = match prior {
            Some(p) => (p.state, p.progress, p.created_at_ms),
            None => (HashMap::new(), 0, now),
        };
        state.insert("args".to_string(), args);
        state.insert("started_at_ms".to_string(), serde_json::json!(now));

        debug!(task_id, progress, "task started");
        self.write_and_emit(
            TaskStateRecord {
                task_id: task_id.to_string(),
                state,
                progress,
                status: TaskStatus::Active,
                created_at_ms: created_at,
                updated_at_ms: now,
            },
            "started",
            outbox,
        )
        .await
    }

    /// Record a task end. Success forces `progress` to 100.
    pub async fn task_ended(&self, task_id: &str, success: bool, outbox: &EventOutbox) -> bool {
        let now = self.clock.now_millis();
        let prior = self.store.get(task_id).await.unwrap_or(None);
        let (state, progress, created_at) = match prior {
            Some(p) => (p.state, p.progress, p.created_at_ms),
            None => (HashMap::new(), 0, now),
        };

        let status = if success { TaskStatus::Completed } else { TaskStatus::Failed };
        self.write_and_emit(
            TaskStateRecord {
                task_id: task_id.to_string(),
                state,
                progress: if success { 100 } else { progress },
                status,
                created_at_ms: created_at,
                updated_at_ms: now,
            },
            if success { "completed" } else { "failed" },
            outbox,
        )
        .await
    }

    /// Explicit state push from a running task.
    pub async fn update_progress(
        &self,
        task_id: &str,
        progress: u8,
        state_patch: serde_json::Value,
        outbox: &EventOutbox,
    ) -> bool {
        let now = self.clock.now_millis();
        let prior = self.store.get(task_id).await.unwrap_or(None);
        let (mut state, status, created_at) = match prior {
            Some(p) => (p.state, p.status, p.created_at_ms),
            None => (HashMap::new(), TaskStatus::Active, now),
        };
        if let serde_json::Value::Object(patch) = state_patch {
            for (key, value) in patch {
                state.insert(key, value);
            }
        }

        self.write_and_emit(
            TaskStateRecord {
                task_id: task_id.to_string(),
                state,
                progress: progress.min(100),
                status,
                created_at_ms: created_at,
                updated_at_ms: now,
            },
            "progress",
            outbox,
        )
        .await
    }

    pub async fn get(&self, task_id: &str) -> MonitorResult<Option<TaskStateRecord>> {
        self.store.get(task_id).await
    }

    /// Drop non-active records past the TTL. Active records never expire.
    pub async fn cleanup(&self) -> MonitorResult<usize> {
        let ttl = self.config.read().await.ttl;
        let cutoff = self.clock.now_millis().saturating_sub(ttl.as_millis() as u64);
        let purged = self.store.purge_inactive_older_than(cutoff).await?;
        if purged > 0 {
            info!(purged, "expired task state records purged");
        }
        Ok(purged)
    }
}

#[async_trait]
impl EventHandler for TaskStateManager {
    fn name(&self) -> &str {
        "task_state"
    }

    fn priority(&self) -> u8 {
        40
    }

    fn handled_types(&self) -> Vec<String> {
        vec![event_types::TASK_EXECUTION.to_string()]
    }

    fn can_handle(&self, event: &MonitorEvent) -> bool {
        !event.context.is_empty()
    }

    /// Close the tracked record when the self-monitor reports the task done.
    async fn handle(&self, event: &MonitorEvent, outbox: &EventOutbox) -> MonitorResult<bool> {
        let success = event
            .data
            .get("success")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(true);
        self.task_ended(&event.context, success, outbox).await;
        Ok(true)
    }

    async fn status(&self) -> serde_json::Value {
        serde_json::json!({
            "tracked_tasks": self.store.count().await.unwrap_or(0),
        })
    }

    async fn config(&self) -> serde_json::Value {
        let config = self.config.read().await;
        serde_json::json!({ "ttl_secs": config.ttl.as_secs() })
    }

    async fn update_config(&self, patch: serde_json::Value) -> MonitorResult<()> {
        let patch = ConfigPatch::new(&patch);
        if let Some(secs) = patch.u64("ttl_secs") {
            self.config.write().await.ttl = Duration::from_secs(secs.max(60));
        }
        Ok(())
    }
}
