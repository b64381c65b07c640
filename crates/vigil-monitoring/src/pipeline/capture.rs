//! Capture entry point.
//!
//! Host instrumentation points call [`DataCapture::capture`] with a feature
//! name, a hook name, and a raw payload. The capture stage sanitizes the
//! payload, consults the sampler, wraps what survives with ambient context,
//! and writes it to the queue as a Pending row. That one insert is the entire
//! capture-time cost; enrichment happens on the processor tick.

use crate::pipeline::filter::DataFilter;
use crate::pipeline::queue::QueueStore;
use crate::pipeline::sampling::SamplingManager;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;
use vigil_kernel::{Clock, MonitorResult};

/// What happened to one capture call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// Retained and queued under the given row id.
    Queued(u64),
    /// Dropped by the sampling decision.
    Sampled,
}

/// Builds sanitized, queued records from host-supplied data.
pub struct DataCapture {
    filter: DataFilter,
    sampler: SamplingManager,
    queue: Arc<dyn QueueStore>,
    clock: Arc<dyn Clock>,
    /// Label identifying this host/process in queued payloads.
    source: String,
}

impl DataCapture {
    pub fn new(
        filter: DataFilter,
        sampler: SamplingManager,
        queue: Arc<dyn QueueStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            filter,
            sampler,
            queue,
            clock,
            source: "vigil".to_string(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Capture one occurrence from a host instrumentation point.
    pub async fn capture(
        &self,
        feature: &str,
        hook: &str,
        data: serde_json::Value,
    ) -> MonitorResult<CaptureOutcome> {
        if !self.sampler.should_retain(feature) {
            debug!(feature, hook, "capture dropped by sampling");
            return Ok(CaptureOutcome::Sampled);
        }

        let now = self.clock.now_millis();
        let payload = json!({
            "data": self.filter.sanitize(data),
            "captured_at": now,
            "source": self.source,
        });

        let id = self.queue.enqueue(feature, hook, payload, now).await?;
        debug!(feature, hook, id, "capture queued");
        Ok(CaptureOutcome::Queued(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::filter::REDACTED;
    use crate::pipeline::queue::{MemoryQueueStore, QueueStatus};
    use crate::pipeline::sampling::SamplingConfig;
    use serde_json::json;
    use vigil_kernel::ManualClock;

    fn capture_at_rate(rate: f64, queue: Arc<MemoryQueueStore>) -> DataCapture {
        DataCapture::new(
            DataFilter::default(),
            SamplingManager::new(SamplingConfig::new().with_base_rate(rate)),
            queue,
            Arc::new(ManualClock::new(1_000)),
        )
    }

    #[tokio::test]
    async fn full_sampling_yields_exactly_one_pending_row() {
        let queue = Arc::new(MemoryQueueStore::new());
        let capture = capture_at_rate(1.0, queue.clone());

        let outcome = capture.capture("core", "init", json!({"x": 1})).await.unwrap();
        let CaptureOutcome::Queued(id) = outcome else {
            panic!("expected a queued outcome, got {outcome:?}");
        };

        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.pending, 1);
        let row = queue.get(id).await.unwrap();
        assert_eq!(row.feature, "core");
        assert_eq!(row.hook, "init");
        assert_eq!(row.status, QueueStatus::Pending);
        assert_eq!(row.payload["data"]["x"], 1);
        assert_eq!(row.payload["captured_at"], 1_000);
    }

    #[tokio::test]
    async fn zero_sampling_queues_nothing() {
        let queue = Arc::new(MemoryQueueStore::new());
        let capture = capture_at_rate(0.0, queue.clone());

        let outcome = capture.capture("core", "init", json!({})).await.unwrap();
        assert_eq!(outcome, CaptureOutcome::Sampled);
        assert_eq!(queue.counts().await.unwrap(), Default::default());
    }

    #[tokio::test]
    async fn payloads_are_sanitized_before_queueing() {
        let queue = Arc::new(MemoryQueueStore::new());
        let capture = capture_at_rate(1.0, queue.clone());

        let outcome = capture
            .capture("auth", "login", json!({"user": "alice", "password": "hunter2"}))
            .await
            .unwrap();
        let CaptureOutcome::Queued(id) = outcome else {
            panic!("expected a queued outcome");
        };
        let row = queue.get(id).await.unwrap();
        assert_eq!(row.payload["data"]["password"], REDACTED);
        assert_eq!(row.payload["data"]["user"], "alice");
    }
}
