//! Vigil Kernel - core contracts for the in-process monitoring pipeline.
//!
//! This crate defines the value types and seams everything else plugs into:
//! - [`MonitorEvent`] — the immutable record routed through the system
//! - [`EventHandler`] — the capability surface a reactive component implements
//! - [`EventDispatcher`] — the priority-ordered, failure-isolated fan-out
//! - [`QueryCache`] — a read-through key/group cache with TTL
//! - [`Clock`] — injectable time source so retention logic is testable
//!
//! Concrete handlers (baseline statistics, resource budgets, task state,
//! self-monitoring) and the capture/queue/processor pipeline live in
//! `vigil-monitoring`. The kernel must never depend on it.

pub mod cache;
pub mod clock;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod handler;

pub use cache::{CacheEntry, CacheStore, MemoryCacheStore, QueryCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use dispatch::{DispatchReport, EventDispatcher, EventOutbox, flush_outbox};
pub use error::{MonitorError, MonitorResult};
pub use event::{EventPriority, MonitorEvent, event_types};
pub use handler::EventHandler;
