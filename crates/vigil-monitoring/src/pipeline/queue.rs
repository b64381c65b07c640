//! Durable capture queue.
//!
//! The queue is the only true asynchrony in the system: capture-time cost is
//! one insert, enrichment cost is paid later by the processor tick. The
//! status machine is Pending → Processing → {Processed, Failed}; backward
//! transitions are storage errors, and the purge API structurally cannot
//! touch live rows.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use vigil_kernel::{MonitorError, MonitorResult};

/// Queue row status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Processing,
    Processed,
    Failed,
}

/// One captured record awaiting enrichment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: u64,
    pub feature: String,
    pub hook: String,
    pub payload: serde_json::Value,
    pub status: QueueStatus,
    /// Error detail, set when `status == Failed`.
    pub error: Option<String>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

/// Row counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub processing: usize,
    pub processed: usize,
    pub failed: usize,
}

/// Storage seam for the capture queue.
///
/// Status is advanced exclusively through this interface; `claim_batch` is
/// the atomic Pending → Processing step, `mark_*` the terminal steps.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert a Pending row; returns its id.
    async fn enqueue(
        &self,
        feature: &str,
        hook: &str,
        payload: serde_json::Value,
        now_ms: u64,
    ) -> MonitorResult<u64>;

    /// Atomically claim up to `limit` Pending rows (oldest first), advancing
    /// them to Processing.
    async fn claim_batch(&self, limit: usize, now_ms: u64) -> MonitorResult<Vec<QueueItem>>;

    /// Processing → Processed. Any other starting status is an error.
    async fn mark_processed(&self, id: u64, now_ms: u64) -> MonitorResult<()>;

    /// Processing → Failed with error detail. Any other starting status is an
    /// error.
    async fn mark_failed(&self, id: u64, error: &str, now_ms: u64) -> MonitorResult<()>;

    /// Delete Processed rows older than `processed_cutoff_ms` and Failed rows
    /// older than `failed_cutoff_ms`. Pending and Processing rows are never
    /// deleted regardless of age. Returns the count removed.
    async fn purge_finished(
        &self,
        processed_cutoff_ms: u64,
        failed_cutoff_ms: u64,
    ) -> MonitorResult<usize>;

    async fn counts(&self) -> MonitorResult<QueueCounts>;
}

/// In-memory [`QueueStore`] enforcing the status machine.
#[derive(Default)]
pub struct MemoryQueueStore {
    rows: RwLock<BTreeMap<u64, QueueItem>>,
    next_id: AtomicU64,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct row lookup, for tests and diagnostics.
    pub async fn get(&self, id: u64) -> Option<QueueItem> {
        self.rows.read().await.get(&id).cloned()
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn enqueue(
        &self,
        feature: &str,
        hook: &str,
        payload: serde_json::Value,
        now_ms: u64,
    ) -> MonitorResult<u64> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut rows = self.rows.write().await;
        rows.insert(
            id,
            QueueItem {
                id,
                feature: feature.to_string(),
                hook: hook.to_string(),
                payload,
                status: QueueStatus::Pending,
                error: None,
                created_at_ms: now_ms,
                updated_at_ms: now_ms,
            },
        );
        Ok(id)
    }

    async fn claim_batch(&self, limit: usize, now_ms: u64) -> MonitorResult<Vec<QueueItem>> {
        let mut rows = self.rows.write().await;
        let mut claimed = Vec::new();
        // BTreeMap iteration order is id order, and ids are monotonic, so
        // "oldest first" falls out of the key order.
        for row in rows.values_mut() {
            if claimed.len() >= limit {
                break;
            }
            if row.status == QueueStatus::Pending {
                row.status = QueueStatus::Processing;
                row.updated_at_ms = now_ms;
                claimed.push(row.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_processed(&self, id: u64, now_ms: u64) -> MonitorResult<()> {
        let mut rows = self.rows.write().await;
        let row = rows
            .get_mut(&id)
            .ok_or_else(|| MonitorError::Storage(format!("queue row {id} not found")))?;
        if row.status != QueueStatus::Processing {
            return Err(MonitorError::Storage(format!(
                "queue row {id} cannot move to processed from {:?}",
                row.status
            )));
        }
        row.status = QueueStatus::Processed;
        row.updated_at_ms = now_ms;
        Ok(())
    }

    async fn mark_failed(&self, id: u64, error: &str, now_ms: u64) -> MonitorResult<()> {
        let mut rows = self.rows.write().await;
        let row = rows
            .get_mut(&id)
            .ok_or_else(|| MonitorError::Storage(format!("queue row {id} not found")))?;
        if row.status != QueueStatus::Processing {
            return Err(MonitorError::Storage(format!(
                "queue row {id} cannot move to failed from {:?}",
                row.status
            )));
        }
        row.status = QueueStatus::Failed;
        row.error = Some(error.to_string());
        row.updated_at_ms = now_ms;
        Ok(())
    }

    async fn purge_finished(
        &self,
        processed_cutoff_ms: u64,
        failed_cutoff_ms: u64,
    ) -> MonitorResult<usize> {
        let mut rows = self.rows.write().await;
        let before = rows.len();
        rows.retain(|_, row| match row.status {
            QueueStatus::Pending | QueueStatus::Processing => true,
            QueueStatus::Processed => row.updated_at_ms >= processed_cutoff_ms,
            QueueStatus::Failed => row.updated_at_ms >= failed_cutoff_ms,
        });
        Ok(before - rows.len())
    }

    async fn counts(&self) -> MonitorResult<QueueCounts> {
        let rows = self.rows.read().await;
        let mut counts = QueueCounts::default();
        for row in rows.values() {
            match row.status {
                QueueStatus::Pending => counts.pending += 1,
                QueueStatus::Processing => counts.processing += 1,
                QueueStatus::Processed => counts.processed += 1,
                QueueStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }
}
