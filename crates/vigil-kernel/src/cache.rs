//! Read-through key/group cache with TTL.
//!
//! Components use this to avoid redundant storage reads. The cache is
//! deliberately forgiving: a failing backing store or a value that will not
//! serialize degrades to a logged miss or a skipped write, never an error
//! surfaced to the caller.

use crate::clock::Clock;
use crate::error::MonitorResult;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// One cached value, keyed by (key, group).
#[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub group: String,
    /// JSON-serialized value.
    pub data: String,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
}

/// Backing store for [`QueryCache`]. Implementations may be in-memory,
/// file-backed, or database-backed; the cache front never assumes more than
/// upsert semantics keyed by (key, group).
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str, group: &str) -> MonitorResult<Option<CacheEntry>>;
    /// Upsert keyed by (entry.key, entry.group).
    async fn put(&self, entry: CacheEntry) -> MonitorResult<()>;
    /// Returns whether an entry existed.
    async fn delete(&self, key: &str, group: &str) -> MonitorResult<bool>;
    /// Returns the number of entries removed.
    async fn delete_group(&self, group: &str) -> MonitorResult<usize>;
    /// Remove every entry with `expires_at_ms <= now_ms`; returns the count.
    async fn purge_expired(&self, now_ms: u64) -> MonitorResult<usize>;
}

/// In-memory [`CacheStore`] used by default and in tests.
#[derive(Default)]
pub struct MemoryCacheStore {
    entries: RwLock<HashMap<(String, String), CacheEntry>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str, group: &str) -> MonitorResult<Option<CacheEntry>> {
        let entries = self.entries.read().await;
        Ok(entries.get(&(key.to_string(), group.to_string())).cloned())
    }

    async fn put(&self, entry: CacheEntry) -> MonitorResult<()> {
        let mut entries = self.entries.write().await;
        entries.insert((entry.key.clone(), entry.group.clone()), entry);
        Ok(())
    }

    async fn delete(&self, key: &str, group: &str) -> MonitorResult<bool> {
        let mut entries = self.entries.write().await;
        Ok(entries
            .remove(&(key.to_string(), group.to_string()))
            .is_some())
    }

    async fn delete_group(&self, group: &str) -> MonitorResult<usize> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|(_, g), _| g != group);
        Ok(before - entries.len())
    }

    async fn purge_expired(&self, now_ms: u64) -> MonitorResult<usize> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.expires_at_ms > now_ms);
        Ok(before - entries.len())
    }
}

/// The read-through cache front.
pub struct QueryCache {
    store: Arc<dyn CacheStore>,
    clock: Arc<dyn Clock>,
    default_ttl: Duration,
}

impl QueryCache {
    pub fn new(store: Arc<dyn CacheStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            default_ttl: Duration::from_secs(300),
        }
    }

    /// TTL applied by [`set_default`](Self::set_default).
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Fetch a cached value. Never returns an entry past its expiry, even if
    /// the backing store hands one back; store failures degrade to a miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &str, group: &str) -> Option<T> {
        let entry = match self.store.get(key, group).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return None,
            Err(e) => {
                warn!(key, group, error = %e, "cache store unavailable on get");
                return None;
            }
        };
        if entry.expires_at_ms <= self.clock.now_millis() {
            debug!(key, group, "cache entry expired");
            return None;
        }
        match serde_json::from_str(&entry.data) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, group, error = %e, "cached payload failed to deserialize");
                None
            }
        }
    }

    /// Serialize and upsert a value with the given TTL. Returns `false` (and
    /// skips the write) on serialization or store failure.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, group: &str, ttl: Duration) -> bool {
        let data = match serde_json::to_string(value) {
            Ok(data) => data,
            Err(e) => {
                warn!(key, group, error = %e, "value failed to serialize, cache write skipped");
                return false;
            }
        };
        let now = self.clock.now_millis();
        let entry = CacheEntry {
            key: key.to_string(),
            group: group.to_string(),
            data,
            created_at_ms: now,
            expires_at_ms: now.saturating_add(ttl.as_millis() as u64),
        };
        match self.store.put(entry).await {
            Ok(()) => true,
            Err(e) => {
                warn!(key, group, error = %e, "cache store unavailable on set");
                false
            }
        }
    }

    /// [`set`](Self::set) with the configured default TTL.
    pub async fn set_default<T: Serialize>(&self, key: &str, value: &T, group: &str) -> bool {
        self.set(key, value, group, self.default_ttl).await
    }

    /// Remove one entry. Returns whether it existed.
    pub async fn delete(&self, key: &str, group: &str) -> bool {
        match self.store.delete(key, group).await {
            Ok(existed) => existed,
            Err(e) => {
                warn!(key, group, error = %e, "cache store unavailable on delete");
                false
            }
        }
    }

    /// Remove every entry in `group`. Returns the count removed.
    pub async fn delete_group(&self, group: &str) -> usize {
        match self.store.delete_group(group).await {
            Ok(count) => count,
            Err(e) => {
                warn!(group, error = %e, "cache store unavailable on delete_group");
                0
            }
        }
    }

    /// Purge everything past expiry. Returns the count removed.
    pub async fn cleanup_expired(&self) -> usize {
        match self.store.purge_expired(self.clock.now_millis()).await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "cache store unavailable on cleanup");
                0
            }
        }
    }
}
