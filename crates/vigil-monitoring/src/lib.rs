//! Vigil Monitoring - the capture pipeline and built-in handlers.
//!
//! This crate implements the moving parts on top of the `vigil-kernel`
//! contracts:
//!
//! - **Capture → Filter → Sampling → Queue → Processor**: host
//!   instrumentation calls [`MonitoringPipeline::capture`]; sanitized,
//!   sampled records land in a durable queue and are enriched into events on
//!   the next [`MonitoringPipeline::tick`].
//! - **Handlers**: rolling statistical baselines with deviation alerts,
//!   per-tier resource budgets with a soft-preemption poll, resumable task
//!   state tracking, and self-monitoring of task runs and plugin errors.
//!
//! Everything persists through swappable store traits; the in-memory
//! implementations are the defaults and the test fixtures.

pub mod handlers;
pub mod pipeline;
pub mod probe;
pub mod store;

pub use handlers::audit::AuditLogHandler;
pub use handlers::baseline::{
    BaselineConfig, BaselineHandler, BaselineRecord, BaselineStore, MemoryBaselineStore,
    Observation,
};
pub use handlers::resource::{
    LOAD_UNAVAILABLE, MemoryReclaimer, ResourceConfig, ResourceManager, TaskTier, TierBudget,
};
pub use handlers::self_monitor::{
    MemoryTaskRunStore, RunStatus, RunSummary, SelfMonitor, SelfMonitorConfig, TaskRunRecord,
    TaskRunStore, TaskSpan,
};
pub use handlers::task_state::{
    MemoryTaskStateStore, TaskStateConfig, TaskStateManager, TaskStateRecord, TaskStateStore,
    TaskStatus,
};
pub use pipeline::capture::{CaptureOutcome, DataCapture};
pub use pipeline::filter::{DataFilter, FilterConfig};
pub use pipeline::processor::{CleanupReport, EventProcessor, ProcessorConfig, ProcessorReport};
pub use pipeline::queue::{MemoryQueueStore, QueueCounts, QueueItem, QueueStatus, QueueStore};
pub use pipeline::sampling::{PressureSource, SamplingConfig, SamplingManager};
pub use pipeline::{MonitoringPipeline, PipelineBuilder, TickReport};
pub use probe::{FixedProbe, SysinfoProbe, SystemProbe};
pub use store::{EventStore, MemoryEventStore};
