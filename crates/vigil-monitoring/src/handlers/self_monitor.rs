//! The system's own telemetry.
//!
//! Wraps monitored units of work: [`SelfMonitor::begin`] snapshots wall-clock
//! time and process memory, [`SelfMonitor::finish`] computes duration and
//! memory delta, persists a run record, and emits a `task_execution` event.
//! Internal errors from any component are recorded independently as
//! `plugin_error` events.

use crate::handlers::ConfigPatch;
use crate::probe::SystemProbe;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};
use vigil_kernel::{
    Clock, EventHandler, EventOutbox, EventPriority, MonitorEvent, MonitorResult, event_types,
};

/// Outcome of one monitored run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failure,
}

/// A persisted record of one monitored unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRunRecord {
    pub task_name: String,
    pub started_at_ms: u64,
    pub completed_at_ms: u64,
    pub duration_ms: u64,
    pub status: RunStatus,
    pub error_message: Option<String>,
    /// Process memory delta over the run, in bytes. Negative when memory was
    /// released during the run.
    pub memory_delta_bytes: i64,
}

/// Storage for task-run records.
#[async_trait]
pub trait TaskRunStore: Send + Sync {
    async fn insert(&self, record: TaskRunRecord) -> MonitorResult<()>;
    async fn all(&self) -> MonitorResult<Vec<TaskRunRecord>>;
    async fn purge_older_than(&self, cutoff_ms: u64) -> MonitorResult<usize>;
}

/// In-memory [`TaskRunStore`].
#[derive(Default)]
pub struct MemoryTaskRunStore {
    records: RwLock<Vec<TaskRunRecord>>,
}

impl MemoryTaskRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskRunStore for MemoryTaskRunStore {
    async fn insert(&self, record: TaskRunRecord) -> MonitorResult<()> {
        self.records.write().await.push(record);
        Ok(())
    }

    async fn all(&self) -> MonitorResult<Vec<TaskRunRecord>> {
        Ok(self.records.read().await.clone())
    }

    async fn purge_older_than(&self, cutoff_ms: u64) -> MonitorResult<usize> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|r| r.completed_at_ms >= cutoff_ms);
        Ok(before - records.len())
    }
}

/// Self-monitor configuration.
#[derive(Debug, Clone)]
pub struct SelfMonitorConfig {
    /// Run records older than this are purged. Default 7 days.
    pub retention: Duration,
}

impl Default for SelfMonitorConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

impl SelfMonitorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }
}

/// An open measurement over one monitored run. Created by
/// [`SelfMonitor::begin`], consumed by [`SelfMonitor::finish`].
#[derive(Debug, Clone)]
pub struct TaskSpan {
    task_name: String,
    started_at_ms: u64,
    start_memory: u64,
}

impl TaskSpan {
    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    pub fn started_at_ms(&self) -> u64 {
        self.started_at_ms
    }

    /// Process memory at span open, for callers that also do their own
    /// delta accounting.
    pub fn start_memory(&self) -> u64 {
        self.start_memory
    }
}

/// Aggregate view over retained run records.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunSummary {
    pub total_runs: usize,
    pub failures: usize,
    /// Fraction of successful runs, 1.0 when there are none.
    pub success_rate: f64,
    pub avg_duration_ms: f64,
}

/// Records execution outcomes and internal errors.
pub struct SelfMonitor {
    store: Arc<dyn TaskRunStore>,
    probe: Arc<dyn SystemProbe>,
    clock: Arc<dyn Clock>,
    config: RwLock<SelfMonitorConfig>,
    /// `plugin_error` events observed through dispatch.
    error_incidents: AtomicU64,
}

impl SelfMonitor {
    pub fn new(
        store: Arc<dyn TaskRunStore>,
        probe: Arc<dyn SystemProbe>,
        clock: Arc<dyn Clock>,
        config: SelfMonitorConfig,
    ) -> Self {
        Self {
            store,
            probe,
            clock,
            config: RwLock::new(config),
            error_incidents: AtomicU64::new(0),
        }
    }

    /// Open a measurement span around a unit of work.
    pub fn begin(&self, task_name: impl Into<String>) -> TaskSpan {
        TaskSpan {
            task_name: task_name.into(),
            started_at_ms: self.clock.now_millis(),
            start_memory: self.probe.memory_used(),
        }
    }

    /// Close a span: persist the run record and emit `task_execution`,
    /// high priority on failure. The event fires even when the record fails
    /// to persist.
    pub async fn finish(
        &self,
        span: TaskSpan,
        error: Option<&str>,
        outbox: &EventOutbox,
    ) -> TaskRunRecord {
        let now = self.clock.now_millis();
        let record = TaskRunRecord {
            task_name: span.task_name,
            started_at_ms: span.started_at_ms,
            completed_at_ms: now,
            duration_ms: now.saturating_sub(span.started_at_ms),
            status: if error.is_some() { RunStatus::Failure } else { RunStatus::Success },
            error_message: error.map(str::to_string),
            memory_delta_bytes: self.probe.memory_used() as i64 - span.start_memory as i64,
        };

        if let Err(e) = self.store.insert(record.clone()).await {
            warn!(task_name = %record.task_name, error = %e, "task run record not persisted");
        }

        let priority = match record.status {
            RunStatus::Failure => EventPriority::High,
            RunStatus::Success => EventPriority::Normal,
        };
        let mut event =
            MonitorEvent::new(event_types::TASK_EXECUTION, "self_monitor", self.clock.as_ref())
                .with_priority(priority)
                .with_context(record.task_name.clone())
                .with_message(format!("task run {:?}", record.status).to_lowercase())
                .with_data("success", record.status == RunStatus::Success)
                .with_data("duration_ms", record.duration_ms)
                .with_data("memory_delta_bytes", record.memory_delta_bytes);
        if let Some(message) = &record.error_message {
            event = event.with_data("error", message.clone());
        }
        outbox.emit(event);
        record
    }

    /// Record an internal error from any component as a high-priority
    /// `plugin_error` event.
    pub fn record_error(&self, component: &str, message: &str, outbox: &EventOutbox) {
        warn!(component, message, "internal error recorded");
        outbox.emit(
            MonitorEvent::new(event_types::PLUGIN_ERROR, "self_monitor", self.clock.as_ref())
                .with_priority(EventPriority::High)
                .with_context(component)
                .with_message(message),
        );
    }

    /// Aggregate status over retained run records.
    pub async fn summary(&self) -> MonitorResult<RunSummary> {
        let records = self.store.all().await?;
        if records.is_empty() {
            return Ok(RunSummary {
                success_rate: 1.0,
                ..Default::default()
            });
        }
        let failures = records.iter().filter(|r| r.status == RunStatus::Failure).count();
        let total_duration: u64 = records.iter().map(|r| r.duration_ms).sum();
        Ok(RunSummary {
            total_runs: records.len(),
            failures,
            success_rate: (records.len() - failures) as f64 / records.len() as f64,
            avg_duration_ms: total_duration as f64 / records.len() as f64,
        })
    }

    /// Drop run records past the retention window.
    pub async fn cleanup(&self) -> MonitorResult<usize> {
        let retention = self.config.read().await.retention;
        let cutoff = self.clock.now_millis().saturating_sub(retention.as_millis() as u64);
        let purged = self.store.purge_older_than(cutoff).await?;
        if purged > 0 {
            info!(purged, "expired task run records purged");
        }
        Ok(purged)
    }
}

#[async_trait]
impl EventHandler for SelfMonitor {
    fn name(&self) -> &str {
        "self_monitor"
    }

    fn priority(&self) -> u8 {
        30
    }

    fn handled_types(&self) -> Vec<String> {
        vec![event_types::PLUGIN_ERROR.to_string()]
    }

    /// Count error incidents flowing through dispatch, wherever they came
    /// from.
    async fn handle(&self, _event: &MonitorEvent, _outbox: &EventOutbox) -> MonitorResult<bool> {
        self.error_incidents.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    async fn status(&self) -> serde_json::Value {
        let summary = self.summary().await.unwrap_or_default();
        serde_json::json!({
            "total_runs": summary.total_runs,
            "failures": summary.failures,
            "success_rate": summary.success_rate,
            "avg_duration_ms": summary.avg_duration_ms,
            "error_incidents": self.error_incidents.load(Ordering::Relaxed),
        })
    }

    async fn config(&self) -> serde_json::Value {
        let config = self.config.read().await;
        serde_json::json!({ "retention_secs": config.retention.as_secs() })
    }

    async fn update_config(&self, patch: serde_json::Value) -> MonitorResult<()> {
        let patch = ConfigPatch::new(&patch);
        if let Some(secs) = patch.u64("retention_secs") {
            self.config.write().await.retention = Duration::from_secs(secs.max(3600));
        }
        Ok(())
    }
}
