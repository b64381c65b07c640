//! Resource budgets and soft preemption.
//!
//! Tasks are classified into tiers, each with a memory and wall-clock budget.
//! The runtime offers no true cancellation, so enforcement is cooperative:
//! long-running batch work MUST call [`ResourceManager::should_continue`] at
//! a bounded interval and stop when it returns `false`. Exceeding a budget
//! changes nothing until the next poll observes it — that is the contract,
//! not a gap.

use crate::handlers::ConfigPatch;
use crate::pipeline::sampling::PressureSource;
use crate::probe::SystemProbe;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use vigil_kernel::{
    Clock, EventHandler, EventOutbox, EventPriority, MonitorEvent, MonitorResult, event_types,
};

/// Sentinel returned by [`ResourceManager::cpu_load_ratio`] when the platform
/// exposes no load average.
pub const LOAD_UNAVAILABLE: f64 = -1.0;

/// Passes each reclaim runs for. Mirrors the fixed collection cycles of
/// runtimes that expose a collector; here reclaimers drop caches instead.
const RECLAIM_PASSES: usize = 3;

/// Task tier, keyed off the task name by the classifier lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskTier {
    /// Short, must-complete work (locks, state transitions).
    Critical,
    /// Everything unclassified.
    Standard,
    /// Bulk batch work (imports, scans, rebuilds).
    Intensive,
    /// Report generation and exports.
    Report,
}

/// Per-tier ceiling on memory and wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierBudget {
    pub memory_mb: u64,
    pub time_sec: u64,
}

impl TierBudget {
    pub const fn new(memory_mb: u64, time_sec: u64) -> Self {
        Self { memory_mb, time_sec }
    }
}

/// Resource manager configuration. The budget table and classifier lists are
/// overridable; unlisted task names fall back to [`TaskTier::Standard`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub budgets: HashMap<TaskTier, TierBudget>,
    /// Task names (substring match) classified as Critical.
    pub critical_tasks: Vec<String>,
    /// Task names (substring match) classified as Intensive.
    pub intensive_tasks: Vec<String>,
    /// Task names (substring match) classified as Report.
    pub report_tasks: Vec<String>,
    /// Task names that force a reclaim pass regardless of memory pressure.
    pub force_reclaim_tasks: Vec<String>,
    /// Ceiling on storage queries per budgeted unit of work. Default 100.
    pub query_ceiling: u32,
    /// Memory-used fraction above which reclaim triggers. Default 0.8.
    pub reclaim_threshold: f64,
    /// CPU load ratio above which a `resource_limit` event fires. Default 0.7.
    pub cpu_load_threshold: f64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        let mut budgets = HashMap::new();
        budgets.insert(TaskTier::Critical, TierBudget::new(64, 30));
        budgets.insert(TaskTier::Standard, TierBudget::new(128, 120));
        budgets.insert(TaskTier::Intensive, TierBudget::new(512, 600));
        budgets.insert(TaskTier::Report, TierBudget::new(256, 300));
        Self {
            budgets,
            critical_tasks: vec!["lock".to_string(), "state_transition".to_string()],
            intensive_tasks: vec![
                "import".to_string(),
                "rebuild".to_string(),
                "full_scan".to_string(),
            ],
            report_tasks: vec!["report".to_string(), "export".to_string()],
            force_reclaim_tasks: Vec::new(),
            query_ceiling: 100,
            reclaim_threshold: 0.8,
            cpu_load_threshold: 0.7,
        }
    }
}

impl ResourceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_budget(mut self, tier: TaskTier, budget: TierBudget) -> Self {
        self.budgets.insert(tier, budget);
        self
    }

    pub fn with_query_ceiling(mut self, ceiling: u32) -> Self {
        self.query_ceiling = ceiling.max(1);
        self
    }

    pub fn with_reclaim_threshold(mut self, threshold: f64) -> Self {
        self.reclaim_threshold = threshold.clamp(0.1, 1.0);
        self
    }

    pub fn with_cpu_load_threshold(mut self, threshold: f64) -> Self {
        self.cpu_load_threshold = threshold.max(0.0);
        self
    }

    pub fn with_force_reclaim_task(mut self, task: impl Into<String>) -> Self {
        self.force_reclaim_tasks.push(task.into());
        self
    }
}

/// A hook that can release memory on demand (dropping caches, shrinking
/// buffers). Registered with the resource manager and run during reclaim.
#[async_trait]
pub trait MemoryReclaimer: Send + Sync {
    fn name(&self) -> &str;

    /// Release what can be released; returns an estimate of bytes freed.
    async fn reclaim(&self) -> u64;
}

/// Tracks memory/CPU, enforces per-tier budgets, and triggers reclaim.
pub struct ResourceManager {
    config: RwLock<ResourceConfig>,
    probe: Arc<dyn SystemProbe>,
    clock: Arc<dyn Clock>,
    reclaimers: RwLock<Vec<Arc<dyn MemoryReclaimer>>>,
}

impl ResourceManager {
    pub fn new(config: ResourceConfig, probe: Arc<dyn SystemProbe>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config: RwLock::new(config),
            probe,
            clock,
            reclaimers: RwLock::new(Vec::new()),
        }
    }

    /// Register a reclaim hook.
    pub async fn add_reclaimer(&self, reclaimer: Arc<dyn MemoryReclaimer>) {
        self.reclaimers.write().await.push(reclaimer);
    }

    /// Classify a task name into its tier via the configured lookup lists.
    pub async fn classify(&self, task_name: &str) -> TaskTier {
        let config = self.config.read().await;
        let matches = |list: &[String]| list.iter().any(|needle| task_name.contains(needle.as_str()));
        if matches(&config.critical_tasks) {
            TaskTier::Critical
        } else if matches(&config.intensive_tasks) {
            TaskTier::Intensive
        } else if matches(&config.report_tasks) {
            TaskTier::Report
        } else {
            TaskTier::Standard
        }
    }

    /// The budget in force for a tier.
    pub async fn budget(&self, tier: TaskTier) -> TierBudget {
        let config = self.config.read().await;
        config
            .budgets
            .get(&tier)
            .copied()
            .unwrap_or(TierBudget::new(128, 120))
    }

    /// Pure budget check over already-measured values. `should_continue` is
    /// the polling wrapper; this is the testable core.
    pub async fn within_budget(
        &self,
        tier: TaskTier,
        elapsed: Duration,
        memory_delta: u64,
        queries_so_far: u32,
    ) -> bool {
        let budget = self.budget(tier).await;
        let query_ceiling = self.config.read().await.query_ceiling;
        if elapsed.as_secs() > budget.time_sec {
            return false;
        }
        if memory_delta > budget.memory_mb * 1024 * 1024 {
            return false;
        }
        if queries_so_far > query_ceiling {
            return false;
        }
        true
    }

    /// Soft-preemption poll. Returns `false` once the elapsed time, memory
    /// delta, or query count exceeds the tier's budget; the caller must stop.
    ///
    /// This is the only cancellation mechanism: callers of long-running batch
    /// work MUST poll at a bounded interval.
    pub async fn should_continue(
        &self,
        tier: TaskTier,
        start_time: Instant,
        start_memory: u64,
        queries_so_far: u32,
    ) -> bool {
        let memory_delta = self.probe.memory_used().saturating_sub(start_memory);
        let ok = self
            .within_budget(tier, start_time.elapsed(), memory_delta, queries_so_far)
            .await;
        if !ok {
            debug!(?tier, queries_so_far, memory_delta, "budget exceeded, caller must stop");
        }
        ok
    }

    /// Pre-flight check: does the tier's memory budget fit in what is left on
    /// the platform? Emits a `resource_limit` event when it does not.
    pub async fn check_before_task(&self, task_name: &str, outbox: &EventOutbox) -> bool {
        let tier = self.classify(task_name).await;
        let budget = self.budget(tier).await;
        let used = self.probe.memory_used();
        let limit = self.probe.memory_limit();
        let available = limit.saturating_sub(used);

        if available < budget.memory_mb * 1024 * 1024 {
            warn!(task_name, ?tier, available, "insufficient memory for task budget");
            outbox.emit(
                MonitorEvent::new(event_types::RESOURCE_LIMIT, "resource_manager", self.clock.as_ref())
                    .with_priority(EventPriority::High)
                    .with_context(task_name)
                    .with_message("insufficient memory for task budget")
                    .with_data("tier", tier)
                    .with_data("available_bytes", available)
                    .with_data("budget_mb", budget.memory_mb),
            );
            return false;
        }
        true
    }

    /// Post-task accounting: emits a `resource_usage` event with the memory
    /// delta since `start_memory`.
    pub async fn record_after_task(&self, task_name: &str, start_memory: u64, outbox: &EventOutbox) {
        let used = self.probe.memory_used();
        let delta = used as i64 - start_memory as i64;
        outbox.emit(
            MonitorEvent::new(event_types::RESOURCE_USAGE, "resource_manager", self.clock.as_ref())
                .with_context(task_name)
                .with_message("task resource usage")
                .with_data("memory_delta_bytes", delta)
                .with_data("memory_used_bytes", used),
        );
    }

    /// Fraction of platform memory currently used, in `[0, 1]`.
    pub fn memory_fraction(&self) -> f64 {
        let limit = self.probe.memory_limit();
        if limit == 0 {
            return 0.0;
        }
        self.probe.memory_used() as f64 / limit as f64
    }

    /// Run reclaim hooks if forced for this task or if memory usage exceeds
    /// the reclaim threshold. Returns the estimated bytes freed and emits a
    /// `resource_usage` event when anything ran.
    pub async fn maybe_reclaim(&self, task_name: &str, outbox: &EventOutbox) -> u64 {
        let (forced, threshold) = {
            let config = self.config.read().await;
            (
                config
                    .force_reclaim_tasks
                    .iter()
                    .any(|needle| task_name.contains(needle.as_str())),
                config.reclaim_threshold,
            )
        };
        if !forced && self.memory_fraction() <= threshold {
            return 0;
        }

        let reclaimers = self.reclaimers.read().await.clone();
        let mut freed = 0u64;
        for _ in 0..RECLAIM_PASSES {
            for reclaimer in &reclaimers {
                let pass = reclaimer.reclaim().await;
                if pass > 0 {
                    debug!(reclaimer = reclaimer.name(), bytes = pass, "reclaim pass");
                }
                freed = freed.saturating_add(pass);
            }
        }

        info!(task_name, forced, freed, "memory reclaim complete");
        outbox.emit(
            MonitorEvent::new(event_types::RESOURCE_USAGE, "resource_manager", self.clock.as_ref())
                .with_context(task_name)
                .with_message("memory reclaimed")
                .with_data("freed_bytes", freed)
                .with_data("forced", forced),
        );
        freed
    }

    /// CPU load as a fraction of available cores. Deliberately unclamped:
    /// heavily loaded multi-core systems report values above 1.0 and those
    /// flow into the threshold comparison as-is. [`LOAD_UNAVAILABLE`] when
    /// the platform exposes no load average or no core count.
    pub fn cpu_load_ratio(&self) -> f64 {
        let cores = self.probe.cpu_count();
        if cores == 0 {
            return LOAD_UNAVAILABLE;
        }
        match self.probe.load_average() {
            Some(load) => load / cores as f64,
            None => LOAD_UNAVAILABLE,
        }
    }

    /// Emit a high-priority `resource_limit` event when CPU load exceeds the
    /// threshold. Returns the observed ratio.
    pub async fn check_cpu_pressure(&self, outbox: &EventOutbox) -> f64 {
        let ratio = self.cpu_load_ratio();
        let threshold = self.config.read().await.cpu_load_threshold;
        if ratio >= 0.0 && ratio > threshold {
            warn!(ratio, threshold, "CPU load over threshold");
            outbox.emit(
                MonitorEvent::new(event_types::RESOURCE_LIMIT, "resource_manager", self.clock.as_ref())
                    .with_priority(EventPriority::High)
                    .with_message("CPU load over threshold")
                    .with_data("load_ratio", ratio)
                    .with_data("threshold", threshold),
            );
        }
        ratio
    }
}

impl PressureSource for ResourceManager {
    fn pressure(&self) -> f64 {
        self.memory_fraction()
    }
}

#[async_trait]
impl EventHandler for ResourceManager {
    fn name(&self) -> &str {
        "resource_manager"
    }

    fn priority(&self) -> u8 {
        70
    }

    fn handled_types(&self) -> Vec<String> {
        vec![event_types::TASK_EXECUTION.to_string()]
    }

    /// After any monitored task finishes, check CPU pressure and reclaim if
    /// memory crossed the threshold.
    async fn handle(&self, event: &MonitorEvent, outbox: &EventOutbox) -> MonitorResult<bool> {
        self.check_cpu_pressure(outbox).await;
        self.maybe_reclaim(&event.context, outbox).await;
        Ok(true)
    }

    async fn status(&self) -> serde_json::Value {
        serde_json::json!({
            "memory_used_bytes": self.probe.memory_used(),
            "memory_limit_bytes": self.probe.memory_limit(),
            "memory_fraction": self.memory_fraction(),
            "cpu_load_ratio": self.cpu_load_ratio(),
            "reclaimers": self.reclaimers.read().await.len(),
        })
    }

    async fn config(&self) -> serde_json::Value {
        serde_json::to_value(&*self.config.read().await).unwrap_or_default()
    }

    async fn update_config(&self, patch: serde_json::Value) -> MonitorResult<()> {
        let patch = ConfigPatch::new(&patch);
        let mut config = self.config.write().await;
        if let Some(threshold) = patch.f64("reclaim_threshold") {
            config.reclaim_threshold = threshold.clamp(0.1, 1.0);
        }
        if let Some(threshold) = patch.f64("cpu_load_threshold") {
            config.cpu_load_threshold = threshold.max(0.0);
        }
        if let Some(ceiling) = patch.u32("query_ceiling") {
            config.query_ceiling = ceiling.max(1);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::FixedProbe;
    use std::sync::atomic::{AtomicU64, Ordering};
    use vigil_kernel::ManualClock;

    const MB: u64 = 1024 * 1024;

    fn manager_with_probe(probe: FixedProbe) -> ResourceManager {
        ResourceManager::new(
            ResourceConfig::default(),
            Arc::new(probe),
            Arc::new(ManualClock::new(1_000)),
        )
    }

    #[tokio::test]
    async fn classifier_matches_substrings_with_standard_fallback() {
        let manager = manager_with_probe(FixedProbe::new(0, 1024 * MB));
        assert_eq!(manager.classify("daily_report_build").await, TaskTier::Report);
        assert_eq!(manager.classify("catalog_import").await, TaskTier::Intensive);
        assert_eq!(manager.classify("lock_refresh").await, TaskTier::Critical);
        assert_eq!(manager.classify("misc_sync").await, TaskTier::Standard);
    }

    #[tokio::test]
    async fn time_budget_alone_forces_a_stop() {
        let manager = manager_with_probe(FixedProbe::new(0, 1024 * MB));
        // Standard tier: 120 s. Any memory/query values within budget.
        assert!(
            !manager
                .within_budget(TaskTier::Standard, Duration::from_secs(121), 0, 0)
                .await
        );
        assert!(
            manager
                .within_budget(TaskTier::Standard, Duration::from_secs(119), 0, 0)
                .await
        );
    }

    #[tokio::test]
    async fn memory_budget_alone_forces_a_stop() {
        let manager = manager_with_probe(FixedProbe::new(0, 1024 * MB));
        // Standard tier: 128 MB.
        assert!(
            !manager
                .within_budget(TaskTier::Standard, Duration::ZERO, 129 * MB, 0)
                .await
        );
        assert!(
            manager
                .within_budget(TaskTier::Standard, Duration::ZERO, 127 * MB, 0)
                .await
        );
    }

    #[tokio::test]
    async fn query_ceiling_alone_forces_a_stop() {
        let manager = manager_with_probe(FixedProbe::new(0, 1024 * MB));
        assert!(
            !manager
                .within_budget(TaskTier::Standard, Duration::ZERO, 0, 101)
                .await
        );
        assert!(
            manager
                .within_budget(TaskTier::Standard, Duration::ZERO, 0, 100)
                .await
        );
    }

    #[tokio::test]
    async fn should_continue_measures_memory_through_the_probe() {
        let probe = FixedProbe::new(10 * MB, 1024 * MB);
        let manager = manager_with_probe(probe);
        let start = Instant::now();

        assert!(manager.should_continue(TaskTier::Standard, start, 10 * MB, 0).await);

        // Memory grows past the 128 MB standard budget.
        let probe = FixedProbe::new(10 * MB + 200 * MB, 1024 * MB);
        let manager = manager_with_probe(probe);
        assert!(!manager.should_continue(TaskTier::Standard, start, 10 * MB, 0).await);
    }

    #[tokio::test]
    async fn preflight_emits_resource_limit_when_memory_is_short() {
        // 1000 MB platform with 930 MB used leaves 70 MB: Intensive (512 MB)
        // cannot fit.
        let manager = manager_with_probe(FixedProbe::new(930 * MB, 1000 * MB));
        let outbox = EventOutbox::new();
        assert!(!manager.check_before_task("catalog_import", &outbox).await);

        let events = outbox.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, event_types::RESOURCE_LIMIT);
        assert_eq!(events[0].priority, EventPriority::High);

        // The 64 MB critical budget still fits in the remaining 70 MB.
        let outbox = EventOutbox::new();
        assert!(manager.check_before_task("lock_refresh", &outbox).await);
        assert!(outbox.is_empty());
    }

    #[tokio::test]
    async fn cpu_ratio_is_unclamped_and_sentinel_when_unavailable() {
        let manager = manager_with_probe(FixedProbe::new(0, MB).with_load(6.0, 4));
        assert_eq!(manager.cpu_load_ratio(), 1.5);

        let manager = manager_with_probe(FixedProbe::new(0, MB));
        assert_eq!(manager.cpu_load_ratio(), LOAD_UNAVAILABLE);
    }

    #[tokio::test]
    async fn cpu_pressure_over_threshold_emits_high_priority_limit() {
        let manager = manager_with_probe(FixedProbe::new(0, MB).with_load(3.2, 4));
        let outbox = EventOutbox::new();
        let ratio = manager.check_cpu_pressure(&outbox).await;
        assert!((ratio - 0.8).abs() < 1e-9);

        let events = outbox.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, event_types::RESOURCE_LIMIT);
        assert_eq!(events[0].priority, EventPriority::High);

        // Unavailable load is "no opinion", never an alert.
        let manager = manager_with_probe(FixedProbe::new(0, MB));
        let outbox = EventOutbox::new();
        manager.check_cpu_pressure(&outbox).await;
        assert!(outbox.is_empty());
    }

    struct CountingReclaimer {
        calls: AtomicU64,
    }

    #[async_trait]
    impl MemoryReclaimer for CountingReclaimer {
        fn name(&self) -> &str {
            "counting"
        }
        async fn reclaim(&self) -> u64 {
            self.calls.fetch_add(1, Ordering::SeqCst);
            MB
        }
    }

    #[tokio::test]
    async fn reclaim_runs_fixed_passes_when_over_threshold() {
        // 90% memory used exceeds the 0.8 default threshold.
        let manager = manager_with_probe(FixedProbe::new(900 * MB, 1000 * MB));
        let reclaimer = Arc::new(CountingReclaimer { calls: AtomicU64::new(0) });
        manager.add_reclaimer(reclaimer.clone()).await;

        let outbox = EventOutbox::new();
        let freed = manager.maybe_reclaim("misc_sync", &outbox).await;
        assert_eq!(reclaimer.calls.load(Ordering::SeqCst), 3);
        assert_eq!(freed, 3 * MB);

        let events = outbox.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, event_types::RESOURCE_USAGE);
        assert_eq!(events[0].data_f64("freed_bytes"), Some((3 * MB) as f64));
    }

    #[tokio::test]
    async fn reclaim_skipped_below_threshold_unless_forced() {
        let config = ResourceConfig::new().with_force_reclaim_task("nightly_rebuild");
        let manager = ResourceManager::new(
            config,
            Arc::new(FixedProbe::new(100 * MB, 1000 * MB)),
            Arc::new(ManualClock::new(0)),
        );
        let reclaimer = Arc::new(CountingReclaimer { calls: AtomicU64::new(0) });
        manager.add_reclaimer(reclaimer.clone()).await;

        let outbox = EventOutbox::new();
        assert_eq!(manager.maybe_reclaim("misc_sync", &outbox).await, 0);
        assert_eq!(reclaimer.calls.load(Ordering::SeqCst), 0);
        assert!(outbox.is_empty());

        manager.maybe_reclaim("nightly_rebuild", &outbox).await;
        assert_eq!(reclaimer.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn pressure_source_reports_memory_fraction() {
        let manager = manager_with_probe(FixedProbe::new(750 * MB, 1000 * MB));
        assert!((PressureSource::pressure(&manager) - 0.75).abs() < 1e-9);
    }
}
