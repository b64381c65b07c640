//! Durable event storage seam.
//!
//! The processor writes enriched events here; the audit handler writes
//! dispatched alerts. Inserts are upserts keyed by event id, which is what
//! makes re-processing after a crash idempotent (at-least-once delivery from
//! the queue, exactly-one row per event id in storage).

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;
use vigil_kernel::{MonitorEvent, MonitorResult};

/// Storage for enriched, persisted events.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Upsert by `event.id`.
    async fn insert(&self, event: MonitorEvent) -> MonitorResult<()>;

    /// Total rows currently stored.
    async fn count(&self) -> MonitorResult<usize>;

    /// Rows of the given type, newest first.
    async fn by_type(&self, event_type: &str) -> MonitorResult<Vec<MonitorEvent>>;

    /// Remove rows with `timestamp_ms` older than the cutoff; returns the
    /// count removed.
    async fn purge_older_than(&self, cutoff_ms: u64) -> MonitorResult<usize>;

    /// Whether the backend would benefit from compaction after a purge.
    /// Advisory only; the processor logs the recommendation.
    async fn compaction_recommended(&self) -> bool {
        false
    }
}

/// In-memory [`EventStore`].
#[derive(Default)]
pub struct MemoryEventStore {
    events: RwLock<HashMap<Uuid, MonitorEvent>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn insert(&self, event: MonitorEvent) -> MonitorResult<()> {
        let mut events = self.events.write().await;
        events.insert(event.id, event);
        Ok(())
    }

    async fn count(&self) -> MonitorResult<usize> {
        Ok(self.events.read().await.len())
    }

    async fn by_type(&self, event_type: &str) -> MonitorResult<Vec<MonitorEvent>> {
        let events = self.events.read().await;
        let mut matched: Vec<MonitorEvent> = events
            .values()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.timestamp_ms.cmp(&a.timestamp_ms));
        Ok(matched)
    }

    async fn purge_older_than(&self, cutoff_ms: u64) -> MonitorResult<usize> {
        let mut events = self.events.write().await;
        let before = events.len();
        events.retain(|_, e| e.timestamp_ms >= cutoff_ms);
        Ok(before - events.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use vigil_kernel::ManualClock;

    fn event_at(event_type: &str, ts: u64) -> MonitorEvent {
        MonitorEvent::new(event_type, "test", &ManualClock::new(ts))
    }

    #[tokio::test]
    async fn insert_is_an_upsert_by_id() {
        let store = MemoryEventStore::new();
        let event = event_at("a", 10);
        store.insert(event.clone()).await.unwrap();
        store.insert(event.clone()).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn by_type_returns_newest_first() {
        let store = Arc::new(MemoryEventStore::new());
        store.insert(event_at("a", 10)).await.unwrap();
        store.insert(event_at("a", 30)).await.unwrap();
        store.insert(event_at("b", 20)).await.unwrap();

        let rows = store.by_type("a").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].timestamp_ms, 30);
    }

    #[tokio::test]
    async fn purge_respects_the_cutoff() {
        let store = MemoryEventStore::new();
        store.insert(event_at("a", 10)).await.unwrap();
        store.insert(event_at("a", 100)).await.unwrap();

        assert_eq!(store.purge_older_than(50).await.unwrap(), 1);
        assert_eq!(store.count().await.unwrap(), 1);
    }
}
