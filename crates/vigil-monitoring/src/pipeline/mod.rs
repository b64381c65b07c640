//! The assembled monitoring pipeline.
//!
//! [`PipelineBuilder`] wires the capture path, the batch processor, the
//! built-in handlers, and the query cache around one dispatcher, with
//! in-memory stores and the real system clock/probe as defaults. The host
//! bootstrap builds one [`MonitoringPipeline`], calls
//! [`capture`](MonitoringPipeline::capture) from its instrumentation points,
//! surrounds monitored work with [`task_started`](MonitoringPipeline::task_started)
//! / [`task_ended`](MonitoringPipeline::task_ended), and arranges for
//! [`tick`](MonitoringPipeline::tick) to run periodically.

pub mod capture;
pub mod filter;
pub mod processor;
pub mod queue;
pub mod sampling;

use crate::handlers::audit::AuditLogHandler;
use crate::handlers::baseline::{BaselineConfig, BaselineHandler, BaselineStore, MemoryBaselineStore};
use crate::handlers::resource::{ResourceConfig, ResourceManager};
use crate::handlers::self_monitor::{
    MemoryTaskRunStore, SelfMonitor, SelfMonitorConfig, TaskRunRecord, TaskRunStore, TaskSpan,
};
use crate::handlers::task_state::{
    MemoryTaskStateStore, TaskStateConfig, TaskStateManager, TaskStateStore,
};
use crate::pipeline::capture::{CaptureOutcome, DataCapture};
use crate::pipeline::filter::{DataFilter, FilterConfig};
use crate::pipeline::processor::{CleanupReport, EventProcessor, ProcessorConfig, ProcessorReport};
use crate::pipeline::queue::{MemoryQueueStore, QueueStore};
use crate::pipeline::sampling::{SamplingConfig, SamplingManager};
use crate::probe::{SysinfoProbe, SystemProbe};
use crate::store::{EventStore, MemoryEventStore};
use std::sync::Arc;
use tracing::warn;
use vigil_kernel::{
    CacheStore, Clock, DispatchReport, EventDispatcher, EventOutbox, MemoryCacheStore,
    MonitorEvent, MonitorResult, QueryCache, SystemClock, flush_outbox,
};

/// Summary of one periodic tick.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub processor: ProcessorReport,
    pub cleanup: CleanupReport,
    pub task_states_purged: usize,
    pub task_runs_purged: usize,
    pub cache_entries_purged: usize,
    /// Fan-out of the events enriched during this tick.
    pub dispatch: DispatchReport,
}

/// Builder over the pipeline's stores, configs, and seams.
pub struct PipelineBuilder {
    queue: Arc<dyn QueueStore>,
    events: Arc<dyn EventStore>,
    baselines: Arc<dyn BaselineStore>,
    task_states: Arc<dyn TaskStateStore>,
    task_runs: Arc<dyn TaskRunStore>,
    cache_store: Arc<dyn CacheStore>,
    probe: Arc<dyn SystemProbe>,
    clock: Arc<dyn Clock>,
    filter: FilterConfig,
    sampling: SamplingConfig,
    processor: ProcessorConfig,
    baseline: BaselineConfig,
    resource: ResourceConfig,
    task_state: TaskStateConfig,
    self_monitor: SelfMonitorConfig,
    source: String,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            queue: Arc::new(MemoryQueueStore::new()),
            events: Arc::new(MemoryEventStore::new()),
            baselines: Arc::new(MemoryBaselineStore::new()),
            task_states: Arc::new(MemoryTaskStateStore::new()),
            task_runs: Arc::new(MemoryTaskRunStore::new()),
            cache_store: Arc::new(MemoryCacheStore::new()),
            probe: Arc::new(SysinfoProbe::new()),
            clock: Arc::new(SystemClock),
            filter: FilterConfig::default(),
            sampling: SamplingConfig::default(),
            processor: ProcessorConfig::default(),
            baseline: BaselineConfig::default(),
            resource: ResourceConfig::default(),
            task_state: TaskStateConfig::default(),
            self_monitor: SelfMonitorConfig::default(),
            source: "vigil".to_string(),
        }
    }

    pub fn with_queue_store(mut self, store: Arc<dyn QueueStore>) -> Self {
        self.queue = store;
        self
    }

    pub fn with_event_store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.events = store;
        self
    }

    pub fn with_baseline_store(mut self, store: Arc<dyn BaselineStore>) -> Self {
        self.baselines = store;
        self
    }

    pub fn with_task_state_store(mut self, store: Arc<dyn TaskStateStore>) -> Self {
        self.task_states = store;
        self
    }

    pub fn with_task_run_store(mut self, store: Arc<dyn TaskRunStore>) -> Self {
        self.task_runs = store;
        self
    }

    pub fn with_cache_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.cache_store = store;
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn SystemProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_filter_config(mut self, config: FilterConfig) -> Self {
        self.filter = config;
        self
    }

    pub fn with_sampling_config(mut self, config: SamplingConfig) -> Self {
        self.sampling = config;
        self
    }

    pub fn with_processor_config(mut self, config: ProcessorConfig) -> Self {
        self.processor = config;
        self
    }

    pub fn with_baseline_config(mut self, config: BaselineConfig) -> Self {
        self.baseline = config;
        self
    }

    pub fn with_resource_config(mut self, config: ResourceConfig) -> Self {
        self.resource = config;
        self
    }

    pub fn with_task_state_config(mut self, config: TaskStateConfig) -> Self {
        self.task_state = config;
        self
    }

    pub fn with_self_monitor_config(mut self, config: SelfMonitorConfig) -> Self {
        self.self_monitor = config;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Assemble the pipeline and register the built-in handlers.
    pub async fn build(self) -> MonitoringPipeline {
        let dispatcher = Arc::new(EventDispatcher::new());

        let resource = Arc::new(ResourceManager::new(
            self.resource,
            self.probe.clone(),
            self.clock.clone(),
        ));
        let baseline = Arc::new(BaselineHandler::new(
            self.baseline,
            self.baselines,
            self.clock.clone(),
        ));
        let task_state = Arc::new(TaskStateManager::new(
            self.task_states,
            self.clock.clone(),
            self.task_state,
        ));
        let self_monitor = Arc::new(SelfMonitor::new(
            self.task_runs,
            self.probe.clone(),
            self.clock.clone(),
            self.self_monitor,
        ));
        let audit = Arc::new(AuditLogHandler::new(self.events.clone()));

        dispatcher.register(resource.clone()).await;
        dispatcher.register(baseline.clone()).await;
        dispatcher.register(task_state.clone()).await;
        dispatcher.register(self_monitor.clone()).await;
        dispatcher.register(audit).await;

        let sampler = SamplingManager::new(self.sampling).with_pressure_source(resource.clone());
        let capture = DataCapture::new(
            DataFilter::new(self.filter),
            sampler,
            self.queue.clone(),
            self.clock.clone(),
        )
        .with_source(self.source);

        let processor = EventProcessor::new(
            self.queue,
            self.events,
            self.clock.clone(),
            self.processor,
        );

        let cache = QueryCache::new(self.cache_store, self.clock.clone());

        MonitoringPipeline {
            dispatcher,
            capture,
            processor,
            baseline,
            resource,
            task_state,
            self_monitor,
            cache,
        }
    }
}

/// The assembled system: one dispatcher, the capture path, the processor,
/// and the built-in handlers.
pub struct MonitoringPipeline {
    dispatcher: Arc<EventDispatcher>,
    capture: DataCapture,
    processor: EventProcessor,
    baseline: Arc<BaselineHandler>,
    resource: Arc<ResourceManager>,
    task_state: Arc<TaskStateManager>,
    self_monitor: Arc<SelfMonitor>,
    cache: QueryCache,
}

impl MonitoringPipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    /// Capture one occurrence from a host instrumentation point.
    pub async fn capture(
        &self,
        feature: &str,
        hook: &str,
        data: serde_json::Value,
    ) -> MonitorResult<CaptureOutcome> {
        self.capture.capture(feature, hook, data).await
    }

    /// Dispatch an event directly, bypassing the queue.
    pub async fn emit(&self, event: MonitorEvent) -> DispatchReport {
        self.dispatcher.dispatch(event).await
    }

    /// One periodic tick: process a queue batch, dispatch what it enriched,
    /// then run every cleanup routine. Storage failures degrade to a logged
    /// empty report for the affected stage.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();
        let outbox = EventOutbox::new();

        match self.processor.run_once(&outbox).await {
            Ok(processed) => report.processor = processed,
            Err(e) => warn!(error = %e, "processor pass skipped"),
        }
        report.dispatch = flush_outbox(&self.dispatcher, &outbox).await;

        match self.processor.cleanup().await {
            Ok(cleanup) => report.cleanup = cleanup,
            Err(e) => warn!(error = %e, "queue cleanup skipped"),
        }
        match self.task_state.cleanup().await {
            Ok(purged) => report.task_states_purged = purged,
            Err(e) => warn!(error = %e, "task state cleanup skipped"),
        }
        match self.self_monitor.cleanup().await {
            Ok(purged) => report.task_runs_purged = purged,
            Err(e) => warn!(error = %e, "task run cleanup skipped"),
        }
        report.cache_entries_purged = self.cache.cleanup_expired().await;

        report
    }

    /// Signal a task start: pre-flight resource check, state record, and a
    /// measurement span for the matching [`task_ended`](Self::task_ended).
    pub async fn task_started(&self, task_id: &str, args: serde_json::Value) -> TaskSpan {
        let outbox = EventOutbox::new();
        self.resource.check_before_task(task_id, &outbox).await;
        self.task_state.task_started(task_id, args, &outbox).await;
        let span = self.self_monitor.begin(task_id);
        flush_outbox(&self.dispatcher, &outbox).await;
        span
    }

    /// Signal a task end. Closes the measurement span, records resource
    /// usage, and lets the `task_execution` fan-out close the state record.
    pub async fn task_ended(&self, span: TaskSpan, error: Option<&str>) -> TaskRunRecord {
        let outbox = EventOutbox::new();
        let start_memory = span.start_memory();
        let record = self.self_monitor.finish(span, error, &outbox).await;
        self.resource
            .record_after_task(&record.task_name, start_memory, &outbox)
            .await;
        flush_outbox(&self.dispatcher, &outbox).await;
        record
    }

    /// Push progress from inside a running task.
    pub async fn update_progress(
        &self,
        task_id: &str,
        progress: u8,
        state_patch: serde_json::Value,
    ) -> bool {
        let outbox = EventOutbox::new();
        let stored = self
            .task_state
            .update_progress(task_id, progress, state_patch, &outbox)
            .await;
        flush_outbox(&self.dispatcher, &outbox).await;
        stored
    }

    /// Record an internal error from any component.
    pub async fn record_error(&self, component: &str, message: &str) {
        let outbox = EventOutbox::new();
        self.self_monitor.record_error(component, message, &outbox);
        flush_outbox(&self.dispatcher, &outbox).await;
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    pub fn baseline(&self) -> &Arc<BaselineHandler> {
        &self.baseline
    }

    pub fn resource(&self) -> &Arc<ResourceManager> {
        &self.resource
    }

    pub fn task_state(&self) -> &Arc<TaskStateManager> {
        &self.task_state
    }

    pub fn self_monitor(&self) -> &Arc<SelfMonitor> {
        &self.self_monitor
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }
}
