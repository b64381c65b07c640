//! The event value object routed through the dispatch system.

use crate::clock::Clock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Well-known event type names emitted by the built-in handlers.
///
/// Free-form types are equally valid; these constants exist so emitters and
/// subscribers agree on spelling.
pub mod event_types {
    /// A metric moved beyond its rolling baseline by more than the threshold.
    pub const BASELINE_DEVIATION: &str = "baseline_deviation";
    /// A resource budget was (or is about to be) breached.
    pub const RESOURCE_LIMIT: &str = "resource_limit";
    /// A report of resources consumed or reclaimed.
    pub const RESOURCE_USAGE: &str = "resource_usage";
    /// A long-running task changed state or progress.
    pub const TASK_STATE: &str = "task_state";
    /// A monitored unit of work finished (successfully or not).
    pub const TASK_EXECUTION: &str = "task_execution";
    /// An internal error recorded by the self-monitor.
    pub const PLUGIN_ERROR: &str = "plugin_error";
}

/// Event priority. Orders fan-out and lets high-priority categories bypass
/// sampling.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum EventPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// An immutable record describing something that happened.
///
/// Constructed by any component, dispatched exactly once through the
/// [`EventDispatcher`](crate::dispatch::EventDispatcher), consumed by zero or
/// more handlers, and never mutated after creation — dispatch takes ownership
/// and handlers only ever see `&MonitorEvent`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorEvent {
    /// Unique id, assigned at construction.
    pub id: Uuid,
    /// Routing key consulted by the dispatcher.
    pub event_type: String,
    pub priority: EventPriority,
    /// The component that emitted the event.
    pub source: String,
    /// Logical scope the event belongs to (e.g. a scheduler name).
    pub context: String,
    /// Human-readable description.
    pub message: String,
    /// Structured payload. JSON values keep the payload schema-tagged instead
    /// of an opaque serialized blob.
    pub data: HashMap<String, serde_json::Value>,
    /// When the underlying occurrence happened (epoch millis).
    pub timestamp_ms: u64,
    /// When this event object was constructed (epoch millis).
    pub created_at_ms: u64,
}

impl MonitorEvent {
    /// Create an event stamped by `clock`. `timestamp_ms` defaults to the
    /// creation instant and can be overridden for deferred enrichment.
    pub fn new(event_type: impl Into<String>, source: impl Into<String>, clock: &dyn Clock) -> Self {
        let now = clock.now_millis();
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            priority: EventPriority::Normal,
            source: source.into(),
            context: String::new(),
            message: String::new(),
            data: HashMap::new(),
            timestamp_ms: now,
            created_at_ms: now,
        }
    }

    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp_ms: u64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    /// Replace the event id. Used by the processor to derive a deterministic
    /// id from the queue row so re-enrichment stays idempotent.
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    /// Attach one payload entry. Values that fail to serialize are skipped —
    /// a lossy payload beats a lost event.
    pub fn with_data(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.data.insert(key.into(), v);
        }
        self
    }

    /// Fetch a payload entry as an `f64`, accepting any JSON number.
    pub fn data_f64(&self, key: &str) -> Option<f64> {
        self.data.get(key).and_then(serde_json::Value::as_f64)
    }

    /// Fetch a payload entry as a string slice.
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(serde_json::Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn builder_populates_all_fields() {
        let clock = ManualClock::new(5_000);
        let event = MonitorEvent::new("task_execution", "self_monitor", &clock)
            .with_priority(EventPriority::High)
            .with_context("scheduler")
            .with_message("nightly sync finished")
            .with_data("duration_ms", 1234_u64);

        assert_eq!(event.event_type, "task_execution");
        assert_eq!(event.source, "self_monitor");
        assert_eq!(event.priority, EventPriority::High);
        assert_eq!(event.context, "scheduler");
        assert_eq!(event.timestamp_ms, 5_000);
        assert_eq!(event.created_at_ms, 5_000);
        assert_eq!(event.data_f64("duration_ms"), Some(1234.0));
    }

    #[test]
    fn priority_ordering_is_low_to_critical() {
        assert!(EventPriority::Low < EventPriority::Normal);
        assert!(EventPriority::Normal < EventPriority::High);
        assert!(EventPriority::High < EventPriority::Critical);
    }

    #[test]
    fn event_round_trips_through_json() {
        let clock = ManualClock::new(1_000);
        let event = MonitorEvent::new("baseline_deviation", "baseline", &clock)
            .with_context("scheduler")
            .with_data("metric", "duration")
            .with_data("value", 100.0);

        let json = serde_json::to_string(&event).unwrap();
        let back: MonitorEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, back);
    }

    #[test]
    fn unique_ids_per_construction() {
        let clock = ManualClock::new(0);
        let a = MonitorEvent::new("t", "s", &clock);
        let b = MonitorEvent::new("t", "s", &clock);
        assert_ne!(a.id, b.id);
    }
}
