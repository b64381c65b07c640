//! Priority-ordered, failure-isolated event fan-out.
//!
//! The dispatcher is the process-wide router: components hand it a
//! [`MonitorEvent`] and it synchronously invokes every registered handler
//! whose declared types match. There is deliberately no global instance —
//! the host bootstrap constructs one [`EventDispatcher`] and passes the
//! `Arc` to every component that emits or receives events.

use crate::error::MonitorResult;
use crate::event::MonitorEvent;
use crate::handler::EventHandler;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Ceiling on events processed within one `dispatch` call, counting the
/// original event plus everything handlers cascade through the outbox.
/// Breaks emission cycles; overflow is dropped with a warning.
const DEFAULT_MAX_CASCADE: usize = 32;

/// Collects events emitted by handlers during a fan-out.
///
/// One outbox exists per `dispatch` call. Emission never blocks and never
/// fails; the dispatcher drains it after each handler pass and routes the
/// drained events through the same dispatch path.
#[derive(Default)]
pub struct EventOutbox {
    pending: Mutex<VecDeque<MonitorEvent>>,
}

impl EventOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a follow-up event for dispatch after the current fan-out pass.
    pub fn emit(&self, event: MonitorEvent) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.push_back(event);
        }
    }

    /// Number of events waiting to be drained.
    pub fn len(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take everything queued so far.
    pub fn drain(&self) -> Vec<MonitorEvent> {
        self.pending
            .lock()
            .map(|mut p| p.drain(..).collect())
            .unwrap_or_default()
    }
}

struct Registration {
    handler: Arc<dyn EventHandler>,
    seq: u64,
}

/// Summary of one `dispatch` call, including the cascaded events.
#[derive(Debug, Default, Clone)]
pub struct DispatchReport {
    /// Events routed (original + cascaded).
    pub events_dispatched: usize,
    /// Handler invocations that passed the type and `can_handle` filters.
    pub handlers_invoked: usize,
    /// Invocations that returned `Ok(true)`.
    pub handled: usize,
    /// `(handler name, error message)` for every isolated failure.
    pub failures: Vec<(String, String)>,
    /// Events dropped because the cascade ceiling was hit.
    pub dropped: usize,
}

/// The monitoring manager: a registry of handlers keyed by event type.
///
/// Registrations are transient process state, rebuilt at bootstrap — there is
/// no teardown. Dispatch is strictly synchronous and in-process: handlers run
/// one at a time, in descending priority order, and a handler that blocks
/// blocks the whole fan-out (by design; the queue is where asynchrony lives).
pub struct EventDispatcher {
    handlers: RwLock<HashMap<String, Vec<Registration>>>,
    next_seq: AtomicU64,
    max_cascade: usize,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            max_cascade: DEFAULT_MAX_CASCADE,
        }
    }

    /// Override the cascade ceiling (events per dispatch call).
    pub fn with_max_cascade(mut self, max_cascade: usize) -> Self {
        self.max_cascade = max_cascade.max(1);
        self
    }

    /// Register `handler` under a single event type. A handler may be
    /// registered under any number of types.
    pub async fn register_handler(&self, event_type: &str, handler: Arc<dyn EventHandler>) {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let mut handlers = self.handlers.write().await;
        handlers
            .entry(event_type.to_string())
            .or_default()
            .push(Registration { handler, seq });
    }

    /// Register `handler` under every type it declares via `handled_types`.
    pub async fn register(&self, handler: Arc<dyn EventHandler>) {
        for event_type in handler.handled_types() {
            self.register_handler(&event_type, handler.clone()).await;
        }
    }

    /// Number of registrations under `event_type`.
    pub async fn handler_count(&self, event_type: &str) -> usize {
        self.handlers
            .read()
            .await
            .get(event_type)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Route `event` to every matching handler, then route everything the
    /// handlers emitted, until the outbox is empty or the cascade ceiling is
    /// hit. Handler failures are logged and recorded in the report; they
    /// never abort the chain.
    pub async fn dispatch(&self, event: MonitorEvent) -> DispatchReport {
        let mut report = DispatchReport::default();
        let mut queue = VecDeque::from([event]);

        while let Some(event) = queue.pop_front() {
            if report.events_dispatched >= self.max_cascade {
                report.dropped += 1 + queue.len();
                warn!(
                    event_type = %event.event_type,
                    dropped = report.dropped,
                    "dispatch cascade ceiling reached, dropping remaining events"
                );
                break;
            }
            report.events_dispatched += 1;

            let mut matched: Vec<(u8, u64, Arc<dyn EventHandler>)> = {
                let handlers = self.handlers.read().await;
                handlers
                    .get(&event.event_type)
                    .map(|regs| {
                        regs.iter()
                            .map(|r| (r.handler.priority(), r.seq, r.handler.clone()))
                            .collect()
                    })
                    .unwrap_or_default()
            };
            // Descending priority, ties broken by registration order.
            matched.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

            if matched.is_empty() {
                debug!(event_type = %event.event_type, "no handlers registered for event");
            }

            let outbox = EventOutbox::new();
            for (_, _, handler) in matched {
                if !handler.can_handle(&event) {
                    continue;
                }
                report.handlers_invoked += 1;
                match handler.handle(&event, &outbox).await {
                    Ok(true) => report.handled += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(
                            handler = handler.name(),
                            event_type = %event.event_type,
                            error = %e,
                            "handler failed, continuing fan-out"
                        );
                        report.failures.push((handler.name().to_string(), e.to_string()));
                    }
                }
            }
            queue.extend(outbox.drain());
        }

        report
    }
}

/// Dispatch every event queued in `outbox` through `dispatcher`, merging the
/// reports. Used by components that emit outside of a handler context.
pub async fn flush_outbox(dispatcher: &EventDispatcher, outbox: &EventOutbox) -> DispatchReport {
    let mut merged = DispatchReport::default();
    for event in outbox.drain() {
        let report = dispatcher.dispatch(event).await;
        merged.events_dispatched += report.events_dispatched;
        merged.handlers_invoked += report.handlers_invoked;
        merged.handled += report.handled;
        merged.failures.extend(report.failures);
        merged.dropped += report.dropped;
    }
    merged
}
