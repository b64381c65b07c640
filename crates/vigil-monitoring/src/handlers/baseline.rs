//! Rolling statistical baselines with deviation alerts.
//!
//! Maintains one exponentially-weighted moving average per (context, metric)
//! pair. The weight of a new sample is `1 / min(samples + 1, max_samples)`,
//! so early on the average behaves like a plain mean and, once the sample cap
//! is reached, newer samples keep a fixed influence — a bounded-memory
//! approximation of the true average. Extrema are running and never reset.

use crate::handlers::ConfigPatch;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use vigil_kernel::{
    Clock, EventHandler, EventOutbox, EventPriority, MonitorEvent, MonitorResult, event_types,
};

/// Baseline configuration. Out-of-range values are clamped, never rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineConfig {
    /// Relative deviation that triggers an alert, clamped to `[0.05, 0.5]`.
    /// Default 0.2.
    pub deviation_threshold: f64,
    /// Samples required before deviations are flagged, clamped to `[3, 50]`.
    /// Default 5.
    pub min_samples: u32,
    /// Cap on the effective sample count (bounds the recency window), clamped
    /// to `[10, 1000]`. Default 100.
    pub max_samples: u32,
    /// Event types this handler subscribes to.
    pub handled_types: Vec<String>,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            deviation_threshold: 0.2,
            min_samples: 5,
            max_samples: 100,
            handled_types: vec![
                "metric".to_string(),
                event_types::TASK_EXECUTION.to_string(),
                event_types::RESOURCE_USAGE.to_string(),
            ],
        }
    }
}

impl BaselineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deviation_threshold(mut self, threshold: f64) -> Self {
        self.deviation_threshold = threshold.clamp(0.05, 0.5);
        self
    }

    pub fn with_min_samples(mut self, min_samples: u32) -> Self {
        self.min_samples = min_samples.clamp(3, 50);
        self
    }

    pub fn with_max_samples(mut self, max_samples: u32) -> Self {
        self.max_samples = max_samples.clamp(10, 1000);
        self
    }

    pub fn with_handled_type(mut self, event_type: impl Into<String>) -> Self {
        self.handled_types.push(event_type.into());
        self
    }
}

/// The rolling expectation for one (context, metric) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineRecord {
    pub context: String,
    pub metric: String,
    pub avg_value: f64,
    pub min_value: f64,
    pub max_value: f64,
    pub samples: u32,
    pub last_updated_ms: u64,
}

/// Storage seam for baseline records, unique per (context, metric).
#[async_trait]
pub trait BaselineStore: Send + Sync {
    async fn load(&self, context: &str, metric: &str) -> MonitorResult<Option<BaselineRecord>>;
    /// Upsert keyed by (record.context, record.metric).
    async fn save(&self, record: BaselineRecord) -> MonitorResult<()>;
    async fn all(&self) -> MonitorResult<Vec<BaselineRecord>>;
}

/// In-memory [`BaselineStore`].
#[derive(Default)]
pub struct MemoryBaselineStore {
    records: RwLock<HashMap<(String, String), BaselineRecord>>,
}

impl MemoryBaselineStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BaselineStore for MemoryBaselineStore {
    async fn load(&self, context: &str, metric: &str) -> MonitorResult<Option<BaselineRecord>> {
        let records = self.records.read().await;
        Ok(records
            .get(&(context.to_string(), metric.to_string()))
            .cloned())
    }

    async fn save(&self, record: BaselineRecord) -> MonitorResult<()> {
        let mut records = self.records.write().await;
        records.insert((record.context.clone(), record.metric.clone()), record);
        Ok(())
    }

    async fn all(&self) -> MonitorResult<Vec<BaselineRecord>> {
        Ok(self.records.read().await.values().cloned().collect())
    }
}

/// Outcome of one observation, for direct callers.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub record: BaselineRecord,
    /// Relative deviation of the observed value from the updated average.
    pub deviation: f64,
    /// Whether a `baseline_deviation` event was emitted.
    pub flagged: bool,
}

/// Handler maintaining baselines and flagging deviations.
pub struct BaselineHandler {
    /// Fixed at construction: registration happens once, so the type list
    /// never needs to race config updates.
    handled_types: Vec<String>,
    config: RwLock<BaselineConfig>,
    store: Arc<dyn BaselineStore>,
    clock: Arc<dyn Clock>,
}

impl BaselineHandler {
    pub fn new(config: BaselineConfig, store: Arc<dyn BaselineStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            handled_types: config.handled_types.clone(),
            config: RwLock::new(config),
            store,
            clock,
        }
    }

    /// Fold one observed value into the baseline for (context, metric) and
    /// emit a `baseline_deviation` event if it lands outside the threshold.
    pub async fn observe(
        &self,
        context: &str,
        metric: &str,
        value: f64,
        outbox: &EventOutbox,
    ) -> MonitorResult<Observation> {
        let config = self.config.read().await.clone();
        let now = self.clock.now_millis();

        let record = match self.store.load(context, metric).await? {
            None => BaselineRecord {
                context: context.to_string(),
                metric: metric.to_string(),
                avg_value: value,
                min_value: value,
                max_value: value,
                samples: 1,
                last_updated_ms: now,
            },
            Some(mut record) => {
                let effective = record.samples.saturating_add(1).min(config.max_samples);
                let weight = 1.0 / f64::from(effective);
                record.avg_value = record.avg_value * (1.0 - weight) + value * weight;
                record.min_value = record.min_value.min(value);
                record.max_value = record.max_value.max(value);
                record.samples = effective;
                record.last_updated_ms = now;
                record
            }
        };

        let deviation = if value == 0.0 && record.avg_value == 0.0 {
            0.0
        } else if record.avg_value == 0.0 {
            1.0
        } else {
            (value - record.avg_value) / record.avg_value
        };

        let flagged =
            record.samples >= config.min_samples && deviation.abs() > config.deviation_threshold;
        if flagged {
            info!(
                context,
                metric,
                value,
                baseline = record.avg_value,
                deviation,
                "metric deviates from baseline"
            );
            outbox.emit(
                MonitorEvent::new(event_types::BASELINE_DEVIATION, "baseline", self.clock.as_ref())
                    .with_priority(EventPriority::High)
                    .with_context(context)
                    .with_message(format!("{metric} deviates {:.1}% from baseline", deviation * 100.0))
                    .with_data("metric", metric)
                    .with_data("value", value)
                    .with_data("baseline", record.avg_value)
                    .with_data("deviation", deviation),
            );
        }

        self.store.save(record.clone()).await?;
        Ok(Observation {
            record,
            deviation,
            flagged,
        })
    }
}

#[async_trait]
impl EventHandler for BaselineHandler {
    fn name(&self) -> &str {
        "baseline"
    }

    fn priority(&self) -> u8 {
        60
    }

    fn handled_types(&self) -> Vec<String> {
        self.handled_types.clone()
    }

    fn can_handle(&self, event: &MonitorEvent) -> bool {
        event.data_str("metric").is_some() && event.data_f64("value").is_some()
    }

    async fn handle(&self, event: &MonitorEvent, outbox: &EventOutbox) -> MonitorResult<bool> {
        // `can_handle` vouched for these keys; a racing emitter still gets a
        // graceful no-op rather than a panic.
        let (Some(metric), Some(value)) = (event.data_str("metric"), event.data_f64("value"))
        else {
            debug!(event_type = %event.event_type, "event carries no numeric metric, ignoring");
            return Ok(false);
        };
        let metric = metric.to_string();
        let observation = self.observe(&event.context, &metric, value, outbox).await?;
        Ok(observation.flagged)
    }

    async fn status(&self) -> serde_json::Value {
        let baselines = self.store.all().await.unwrap_or_default();
        serde_json::json!({
            "tracked_metrics": baselines.len(),
            "baselines": baselines,
        })
    }

    async fn config(&self) -> serde_json::Value {
        serde_json::to_value(&*self.config.read().await).unwrap_or_default()
    }

    async fn update_config(&self, patch: serde_json::Value) -> MonitorResult<()> {
        let patch = ConfigPatch::new(&patch);
        let mut config = self.config.write().await;
        if let Some(threshold) = patch.f64("deviation_threshold") {
            config.deviation_threshold = threshold.clamp(0.05, 0.5);
        }
        if let Some(min_samples) = patch.u32("min_samples") {
            config.min_samples = min_samples.clamp(3, 50);
        }
        if let Some(max_samples) = patch.u32("max_samples") {
            config.max_samples = max_samples.clamp(10, 1000);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_kernel::ManualClock;

    fn handler_with(config: BaselineConfig) -> BaselineHandler {
        BaselineHandler::new(
            config,
            Arc::new(MemoryBaselineStore::new()),
            Arc::new(ManualClock::new(1_000)),
        )
    }

    #[tokio::test]
    async fn first_observation_seeds_the_record() {
        let handler = handler_with(BaselineConfig::new());
        let outbox = EventOutbox::new();
        let obs = handler.observe("scheduler", "duration", 10.0, &outbox).await.unwrap();

        assert_eq!(obs.record.avg_value, 10.0);
        assert_eq!(obs.record.min_value, 10.0);
        assert_eq!(obs.record.max_value, 10.0);
        assert_eq!(obs.record.samples, 1);
        assert!(!obs.flagged);
    }

    #[tokio::test]
    async fn identical_values_converge_to_that_value() {
        let handler = handler_with(BaselineConfig::new());
        let outbox = EventOutbox::new();
        let mut last = None;
        for _ in 0..20 {
            last = Some(handler.observe("ctx", "m", 42.0, &outbox).await.unwrap());
        }
        let obs = last.unwrap();
        assert!((obs.record.avg_value - 42.0).abs() < 1e-9);
        assert_eq!(obs.deviation, 0.0);
        assert!(outbox.is_empty());
    }

    #[tokio::test]
    async fn no_deviation_flagged_below_min_samples() {
        let handler = handler_with(BaselineConfig::new().with_min_samples(5));
        let outbox = EventOutbox::new();

        // Wildly varying values, but only 4 samples.
        for value in [10.0, 500.0, 1.0, 900.0] {
            let obs = handler.observe("ctx", "m", value, &outbox).await.unwrap();
            assert!(!obs.flagged, "flagged at {} samples", obs.record.samples);
        }
        assert!(outbox.is_empty());
    }

    #[tokio::test]
    async fn sharp_outlier_after_convergence_triggers_deviation() {
        // Five converged durations of 10 followed by a 10x outlier.
        let handler = handler_with(
            BaselineConfig::new()
                .with_min_samples(5)
                .with_deviation_threshold(0.2),
        );
        let outbox = EventOutbox::new();

        for _ in 0..5 {
            let obs = handler.observe("scheduler", "duration", 10.0, &outbox).await.unwrap();
            assert!(!obs.flagged);
        }
        assert!(outbox.is_empty());

        let obs = handler.observe("scheduler", "duration", 100.0, &outbox).await.unwrap();
        assert!(obs.flagged);
        assert!(obs.deviation > 0.2);

        let emitted = outbox.drain();
        assert_eq!(emitted.len(), 1);
        let event = &emitted[0];
        assert_eq!(event.event_type, event_types::BASELINE_DEVIATION);
        assert_eq!(event.priority, EventPriority::High);
        assert_eq!(event.context, "scheduler");
        assert_eq!(event.data_str("metric"), Some("duration"));
        assert_eq!(event.data_f64("value"), Some(100.0));
    }

    #[tokio::test]
    async fn extrema_are_running_and_never_reset() {
        let handler = handler_with(BaselineConfig::new());
        let outbox = EventOutbox::new();
        for value in [10.0, 3.0, 50.0, 20.0] {
            handler.observe("ctx", "m", value, &outbox).await.unwrap();
        }
        let record = handler.store.load("ctx", "m").await.unwrap().unwrap();
        assert_eq!(record.min_value, 3.0);
        assert_eq!(record.max_value, 50.0);
    }

    #[tokio::test]
    async fn zero_average_special_cases() {
        let handler = handler_with(BaselineConfig::new());
        let outbox = EventOutbox::new();

        // All-zero history: deviation of another zero is 0, never a
        // divide-by-zero.
        for _ in 0..6 {
            let obs = handler.observe("ctx", "zeros", 0.0, &outbox).await.unwrap();
            assert_eq!(obs.deviation, 0.0);
            assert!(!obs.flagged);
        }
        assert!(outbox.is_empty());
    }

    #[tokio::test]
    async fn zero_average_recurrence_stays_finite() {
        // Values summing to an exactly-zero average: +5 then -5 with weight
        // 1/2 gives avg 0; the next nonzero value must not divide by zero.
        let handler = handler_with(BaselineConfig::new());
        let outbox = EventOutbox::new();
        handler.observe("ctx", "m", 5.0, &outbox).await.unwrap();
        let obs = handler.observe("ctx", "m", -5.0, &outbox).await.unwrap();
        assert_eq!(obs.record.avg_value, 0.0);

        let obs = handler.observe("ctx", "m", 0.0, &outbox).await.unwrap();
        assert_eq!(obs.deviation, 0.0);

        let obs = handler.observe("ctx", "m", 3.0, &outbox).await.unwrap();
        // Updated average is nonzero here, so the pin applies only when the
        // recurrence itself lands on zero; assert the formula stayed finite.
        assert!(obs.deviation.is_finite());
    }

    #[tokio::test]
    async fn samples_cap_bounds_the_weight() {
        let handler = handler_with(BaselineConfig::new().with_max_samples(10));
        let outbox = EventOutbox::new();
        for _ in 0..50 {
            handler.observe("ctx", "m", 5.0, &outbox).await.unwrap();
        }
        let record = handler.store.load("ctx", "m").await.unwrap().unwrap();
        assert_eq!(record.samples, 10);
    }

    #[tokio::test]
    async fn config_setters_clamp_to_documented_ranges() {
        let config = BaselineConfig::new()
            .with_deviation_threshold(0.9)
            .with_min_samples(1)
            .with_max_samples(5);
        assert_eq!(config.deviation_threshold, 0.5);
        assert_eq!(config.min_samples, 3);
        assert_eq!(config.max_samples, 10);

        let config = BaselineConfig::new()
            .with_deviation_threshold(0.001)
            .with_min_samples(500)
            .with_max_samples(100_000);
        assert_eq!(config.deviation_threshold, 0.05);
        assert_eq!(config.min_samples, 50);
        assert_eq!(config.max_samples, 1000);
    }

    #[tokio::test]
    async fn handle_ignores_events_without_numeric_metrics() {
        let handler = handler_with(BaselineConfig::new());
        let outbox = EventOutbox::new();
        let clock = ManualClock::new(0);

        let event = MonitorEvent::new("metric", "test", &clock);
        assert!(!handler.can_handle(&event));
        assert!(!handler.handle(&event, &outbox).await.unwrap());

        let event = MonitorEvent::new("metric", "test", &clock)
            .with_context("ctx")
            .with_data("metric", "duration")
            .with_data("value", 12.5);
        assert!(handler.can_handle(&event));
        handler.handle(&event, &outbox).await.unwrap();
        let record = handler.store.load("ctx", "duration").await.unwrap().unwrap();
        assert_eq!(record.avg_value, 12.5);
    }

    #[tokio::test]
    async fn custom_handled_types_survive_construction() {
        let handler = handler_with(BaselineConfig::new().with_handled_type("query_timing"));
        let types = handler.handled_types();
        assert!(types.contains(&"query_timing".to_string()));
        assert!(types.contains(&"metric".to_string()));

        // A concurrent config write cannot make the list fall back to the
        // defaults.
        let _write_guard = handler.config.write().await;
        assert!(handler.handled_types().contains(&"query_timing".to_string()));
    }

    #[tokio::test]
    async fn update_config_clamps_patched_values() {
        let handler = handler_with(BaselineConfig::new());
        handler
            .update_config(serde_json::json!({
                "deviation_threshold": 0.9,
                "min_samples": 100,
            }))
            .await
            .unwrap();
        let config = handler.config.read().await;
        assert_eq!(config.deviation_threshold, 0.5);
        assert_eq!(config.min_samples, 50);
    }
}
