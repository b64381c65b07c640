//! Batch processor for the capture queue.
//!
//! Invoked by a periodic tick, the processor claims a bounded batch of
//! Pending rows, enriches each into a [`MonitorEvent`], persists it to the
//! durable event store, and advances the row to Processed or Failed. A
//! row-level failure marks that row Failed with the error detail and the
//! batch continues — one bad record never stalls the queue.

use crate::pipeline::queue::{QueueItem, QueueStore};
use crate::store::EventStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vigil_kernel::{Clock, EventOutbox, EventPriority, MonitorEvent, MonitorResult};

/// Tag mixed into deterministic event ids derived from queue row ids, so
/// re-processing a redelivered row upserts the same event instead of
/// duplicating it.
const EVENT_ID_TAG: u64 = 0x7669_6769_6c00_0001;

/// Processor configuration.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Rows claimed per tick. Default 50.
    pub batch_size: usize,
    /// Processed rows older than this are purged. Default 30 days.
    pub processed_retention: Duration,
    /// Failed rows older than this are purged. Default 14 days.
    pub failed_retention: Duration,
    /// Persisted events older than this are purged. Default 90 days.
    pub event_retention: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            processed_retention: Duration::from_secs(30 * 24 * 3600),
            failed_retention: Duration::from_secs(14 * 24 * 3600),
            event_retention: Duration::from_secs(90 * 24 * 3600),
        }
    }
}

impl ProcessorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_processed_retention(mut self, retention: Duration) -> Self {
        self.processed_retention = retention;
        self
    }

    pub fn with_failed_retention(mut self, retention: Duration) -> Self {
        self.failed_retention = retention;
        self
    }

    pub fn with_event_retention(mut self, retention: Duration) -> Self {
        self.event_retention = retention;
        self
    }
}

/// Summary of one processing pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorReport {
    pub claimed: usize,
    pub processed: usize,
    pub failed: usize,
}

/// Summary of one cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub queue_rows_purged: usize,
    pub events_purged: usize,
    pub compaction_recommended: bool,
}

/// Dequeues, enriches, and persists captured records.
pub struct EventProcessor {
    queue: Arc<dyn QueueStore>,
    events: Arc<dyn EventStore>,
    clock: Arc<dyn Clock>,
    config: ProcessorConfig,
}

impl EventProcessor {
    pub fn new(
        queue: Arc<dyn QueueStore>,
        events: Arc<dyn EventStore>,
        clock: Arc<dyn Clock>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            queue,
            events,
            clock,
            config,
        }
    }

    /// Enrich one queue row into its persisted event form.
    fn enrich(&self, item: &QueueItem) -> MonitorEvent {
        let mut event = MonitorEvent::new(
            format!("{}.{}", item.feature, item.hook),
            item.payload
                .get("source")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("capture"),
            self.clock.as_ref(),
        )
        .with_id(Uuid::from_u64_pair(EVENT_ID_TAG, item.id))
        .with_priority(EventPriority::Normal)
        .with_context(item.feature.clone())
        .with_message(format!("captured {}/{}", item.feature, item.hook));

        if let Some(captured_at) = item.payload.get("captured_at").and_then(|v| v.as_u64()) {
            event = event.with_timestamp(captured_at);
        }
        if let Some(data) = item.payload.get("data") {
            event = event.with_data("data", data.clone());
        }
        event
            .with_data("feature", item.feature.clone())
            .with_data("hook", item.hook.clone())
            .with_data("queue_id", item.id)
    }

    /// Process one bounded batch. Every successfully persisted event is also
    /// queued on `outbox` so the caller can route it through dispatch. Never
    /// returns an error for row-level failures; those are recorded on the
    /// rows and in the report.
    pub async fn run_once(&self, outbox: &EventOutbox) -> MonitorResult<ProcessorReport> {
        let now = self.clock.now_millis();
        let batch = self.queue.claim_batch(self.config.batch_size, now).await?;
        let mut report = ProcessorReport {
            claimed: batch.len(),
            ..Default::default()
        };

        // Row status updates are best-effort: a failing update is logged and
        // the loop continues, otherwise one bad row would leave the rest of
        // the claimed batch parked in Processing forever.
        for item in batch {
            let event = self.enrich(&item);
            match self.events.insert(event.clone()).await {
                Ok(()) => {
                    if let Err(e) = self.queue.mark_processed(item.id, self.clock.now_millis()).await
                    {
                        warn!(queue_id = item.id, error = %e, "processed row status update failed");
                    }
                    outbox.emit(event);
                    report.processed += 1;
                }
                Err(e) => {
                    warn!(queue_id = item.id, error = %e, "enrichment failed, marking row failed");
                    if let Err(mark_err) = self
                        .queue
                        .mark_failed(item.id, &e.to_string(), self.clock.now_millis())
                        .await
                    {
                        warn!(queue_id = item.id, error = %mark_err, "failed row status update failed");
                    }
                    report.failed += 1;
                }
            }
        }

        if report.claimed > 0 {
            debug!(
                claimed = report.claimed,
                processed = report.processed,
                failed = report.failed,
                "processor pass complete"
            );
        }
        Ok(report)
    }

    /// Apply queue and event retention, then report whether the event store
    /// wants compaction afterward.
    pub async fn cleanup(&self) -> MonitorResult<CleanupReport> {
        let now = self.clock.now_millis();
        let processed_cutoff = now.saturating_sub(self.config.processed_retention.as_millis() as u64);
        let failed_cutoff = now.saturating_sub(self.config.failed_retention.as_millis() as u64);
        let event_cutoff = now.saturating_sub(self.config.event_retention.as_millis() as u64);

        let purged = self.queue.purge_finished(processed_cutoff, failed_cutoff).await?;
        let events_purged = self.events.purge_older_than(event_cutoff).await?;
        let compaction = self.events.compaction_recommended().await;
        if purged > 0 || events_purged > 0 {
            info!(purged, events_purged, compaction, "retention applied");
        }
        Ok(CleanupReport {
            queue_rows_purged: purged,
            events_purged,
            compaction_recommended: compaction,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::queue::{MemoryQueueStore, QueueStatus};
    use crate::store::MemoryEventStore;
    use async_trait::async_trait;
    use serde_json::json;
    use vigil_kernel::{ManualClock, MonitorError};

    fn processor(
        queue: Arc<MemoryQueueStore>,
        events: Arc<dyn EventStore>,
        clock: Arc<ManualClock>,
    ) -> EventProcessor {
        EventProcessor::new(queue, events, clock, ProcessorConfig::new().with_batch_size(10))
    }

    #[tokio::test]
    async fn processes_a_pending_row_end_to_end() {
        let queue = Arc::new(MemoryQueueStore::new());
        let events = Arc::new(MemoryEventStore::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let id = queue
            .enqueue(
                "core",
                "init",
                json!({"data": {"x": 1}, "captured_at": 900, "source": "host"}),
                900,
            )
            .await
            .unwrap();

        let outbox = EventOutbox::new();
        let report = processor(queue.clone(), events.clone(), clock)
            .run_once(&outbox)
            .await
            .unwrap();
        assert_eq!(report, ProcessorReport { claimed: 1, processed: 1, failed: 0 });
        // The persisted event is also offered up for dispatch.
        assert_eq!(outbox.len(), 1);

        let row = queue.get(id).await.unwrap();
        assert_eq!(row.status, QueueStatus::Processed);

        let stored = events.by_type("core.init").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].timestamp_ms, 900);
        assert_eq!(stored[0].source, "host");
        assert_eq!(stored[0].context, "core");
        assert_eq!(stored[0].data["data"]["x"], 1);
    }

    #[tokio::test]
    async fn reprocessing_the_same_row_is_idempotent() {
        let queue = Arc::new(MemoryQueueStore::new());
        let events = Arc::new(MemoryEventStore::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let item = QueueItem {
            id: 7,
            feature: "core".into(),
            hook: "init".into(),
            payload: json!({}),
            status: QueueStatus::Pending,
            error: None,
            created_at_ms: 0,
            updated_at_ms: 0,
        };
        let p = processor(queue, events.clone(), clock);

        // Enriching the same row twice produces the same event id, so the
        // second persist upserts rather than duplicates.
        events.insert(p.enrich(&item)).await.unwrap();
        events.insert(p.enrich(&item)).await.unwrap();
        assert_eq!(events.count().await.unwrap(), 1);
    }

    /// Store that rejects events whose hook marks them poisoned.
    struct RejectingStore {
        inner: MemoryEventStore,
    }

    #[async_trait]
    impl EventStore for RejectingStore {
        async fn insert(&self, event: MonitorEvent) -> MonitorResult<()> {
            if event.event_type.ends_with(".poison") {
                return Err(MonitorError::Storage("poisoned record".into()));
            }
            self.inner.insert(event).await
        }
        async fn count(&self) -> MonitorResult<usize> {
            self.inner.count().await
        }
        async fn by_type(&self, event_type: &str) -> MonitorResult<Vec<MonitorEvent>> {
            self.inner.by_type(event_type).await
        }
        async fn purge_older_than(&self, cutoff_ms: u64) -> MonitorResult<usize> {
            self.inner.purge_older_than(cutoff_ms).await
        }
    }

    #[tokio::test]
    async fn row_level_failure_does_not_abort_the_batch() {
        let queue = Arc::new(MemoryQueueStore::new());
        let events = Arc::new(RejectingStore { inner: MemoryEventStore::new() });
        let clock = Arc::new(ManualClock::new(1_000));

        let good = queue.enqueue("core", "init", json!({}), 1).await.unwrap();
        let bad = queue.enqueue("core", "poison", json!({}), 2).await.unwrap();
        let also_good = queue.enqueue("core", "save", json!({}), 3).await.unwrap();

        let outbox = EventOutbox::new();
        let report = processor(queue.clone(), events, clock)
            .run_once(&outbox)
            .await
            .unwrap();
        assert_eq!(report, ProcessorReport { claimed: 3, processed: 2, failed: 1 });
        assert_eq!(outbox.len(), 2);

        assert_eq!(queue.get(good).await.unwrap().status, QueueStatus::Processed);
        assert_eq!(queue.get(also_good).await.unwrap().status, QueueStatus::Processed);
        let failed_row = queue.get(bad).await.unwrap();
        assert_eq!(failed_row.status, QueueStatus::Failed);
        assert!(failed_row.error.as_deref().unwrap().contains("poisoned"));
    }

    #[tokio::test]
    async fn cleanup_purges_by_retention_and_spares_live_rows() {
        let queue = Arc::new(MemoryQueueStore::new());
        let events = Arc::new(MemoryEventStore::new());
        let day_ms: u64 = 24 * 3600 * 1000;
        let clock = Arc::new(ManualClock::new(40 * day_ms));

        // One row processed 35 days ago, one failed 35 days ago, one pending.
        let old_processed = queue.enqueue("core", "a", json!({}), 0).await.unwrap();
        let old_failed = queue.enqueue("core", "b", json!({}), 0).await.unwrap();
        queue.enqueue("core", "c", json!({}), 0).await.unwrap();
        queue.claim_batch(2, 5 * day_ms).await.unwrap();
        queue.mark_processed(old_processed, 5 * day_ms).await.unwrap();
        queue.mark_failed(old_failed, "x", 5 * day_ms).await.unwrap();

        let p = processor(queue.clone(), events, clock);
        let report = p.cleanup().await.unwrap();
        // 35 days exceeds both the 30-day processed and 14-day failed windows.
        assert_eq!(report.queue_rows_purged, 2);
        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.pending, 1);
    }

    #[tokio::test]
    async fn cleanup_applies_event_retention() {
        let queue = Arc::new(MemoryQueueStore::new());
        let events = Arc::new(MemoryEventStore::new());
        let day_ms: u64 = 24 * 3600 * 1000;
        let clock = Arc::new(ManualClock::new(100 * day_ms));

        // One event from 95 days ago, one from 5 days ago.
        events
            .insert(MonitorEvent::new("core.init", "test", &ManualClock::new(5 * day_ms)))
            .await
            .unwrap();
        events
            .insert(MonitorEvent::new("core.init", "test", &ManualClock::new(95 * day_ms)))
            .await
            .unwrap();

        let p = processor(queue, events.clone(), clock);
        let report = p.cleanup().await.unwrap();
        // The 90-day default window keeps only the recent event resident.
        assert_eq!(report.events_purged, 1);
        assert_eq!(events.count().await.unwrap(), 1);

        // A second pass finds nothing left to purge.
        let report = p.cleanup().await.unwrap();
        assert_eq!(report.events_purged, 0);
        assert_eq!(events.count().await.unwrap(), 1);
    }

    /// Queue whose status updates fail for one poisoned row id.
    struct StickyQueue {
        inner: MemoryQueueStore,
        stuck_id: u64,
    }

    #[async_trait]
    impl QueueStore for StickyQueue {
        async fn enqueue(
            &self,
            feature: &str,
            hook: &str,
            payload: serde_json::Value,
            now_ms: u64,
        ) -> MonitorResult<u64> {
            self.inner.enqueue(feature, hook, payload, now_ms).await
        }
        async fn claim_batch(&self, limit: usize, now_ms: u64) -> MonitorResult<Vec<QueueItem>> {
            self.inner.claim_batch(limit, now_ms).await
        }
        async fn mark_processed(&self, id: u64, now_ms: u64) -> MonitorResult<()> {
            if id == self.stuck_id {
                return Err(MonitorError::Storage("row update rejected".into()));
            }
            self.inner.mark_processed(id, now_ms).await
        }
        async fn mark_failed(&self, id: u64, error: &str, now_ms: u64) -> MonitorResult<()> {
            self.inner.mark_failed(id, error, now_ms).await
        }
        async fn purge_finished(
            &self,
            processed_cutoff_ms: u64,
            failed_cutoff_ms: u64,
        ) -> MonitorResult<usize> {
            self.inner.purge_finished(processed_cutoff_ms, failed_cutoff_ms).await
        }
        async fn counts(&self) -> MonitorResult<crate::pipeline::queue::QueueCounts> {
            self.inner.counts().await
        }
    }

    #[tokio::test]
    async fn mark_failure_does_not_orphan_the_rest_of_the_batch() {
        let events = Arc::new(MemoryEventStore::new());
        let clock = Arc::new(ManualClock::new(1_000));

        // Ids are monotonic from zero, so the middle row's id is known.
        let queue = Arc::new(StickyQueue { inner: MemoryQueueStore::new(), stuck_id: 1 });
        let a = queue.enqueue("core", "a", json!({}), 1).await.unwrap();
        let b = queue.enqueue("core", "b", json!({}), 2).await.unwrap();
        let c = queue.enqueue("core", "c", json!({}), 3).await.unwrap();
        assert_eq!(b, 1);

        let outbox = EventOutbox::new();
        let p = EventProcessor::new(
            queue.clone(),
            events.clone(),
            clock,
            ProcessorConfig::new().with_batch_size(10),
        );
        let report = p.run_once(&outbox).await.unwrap();

        // Every event persisted; the sticky row stays Processing but the rows
        // after it still advanced.
        assert_eq!(report.claimed, 3);
        assert_eq!(report.processed, 3);
        assert_eq!(events.count().await.unwrap(), 3);
        assert_eq!(queue.inner.get(a).await.unwrap().status, QueueStatus::Processed);
        assert_eq!(queue.inner.get(b).await.unwrap().status, QueueStatus::Processing);
        assert_eq!(queue.inner.get(c).await.unwrap().status, QueueStatus::Processed);
    }
}
