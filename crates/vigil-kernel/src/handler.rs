//! The handler contract consumed by the dispatcher.

use crate::dispatch::EventOutbox;
use crate::error::MonitorResult;
use crate::event::MonitorEvent;
use async_trait::async_trait;

/// A component that reacts to one or more event types.
///
/// Handlers are registered with the
/// [`EventDispatcher`](crate::dispatch::EventDispatcher) under the types
/// returned by [`handled_types`](EventHandler::handled_types). On dispatch the
/// manager consults [`can_handle`](EventHandler::can_handle) in addition to
/// the type match before invoking [`handle`](EventHandler::handle).
///
/// A handler that wants to react by emitting *new* events (a deviation alert,
/// a resource warning) pushes them into the provided [`EventOutbox`]; the
/// dispatcher routes them through the same fan-out within the same dispatch
/// call.
///
/// The `status`/`config`/`update_config` trio is the surface an external
/// admin layer reads and writes; the pipeline itself never calls it.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Stable identifier used in logs and dispatch reports.
    fn name(&self) -> &str;

    /// Fan-out order, `0..=100`. Higher runs earlier; ties are broken by
    /// registration order.
    fn priority(&self) -> u8 {
        50
    }

    /// Event types this handler wants to receive.
    fn handled_types(&self) -> Vec<String>;

    /// Finer-grained filter beyond the type match (e.g. source or context).
    fn can_handle(&self, _event: &MonitorEvent) -> bool {
        true
    }

    /// React to an event. Returns `Ok(true)` if the event was acted upon,
    /// `Ok(false)` if it was inspected and ignored. An `Err` is isolated by
    /// the dispatcher: it is logged and recorded, and the remaining handlers
    /// still run.
    async fn handle(&self, event: &MonitorEvent, outbox: &EventOutbox) -> MonitorResult<bool>;

    /// Point-in-time operational snapshot for the admin surface.
    async fn status(&self) -> serde_json::Value {
        serde_json::json!({})
    }

    /// Current configuration as JSON.
    async fn config(&self) -> serde_json::Value {
        serde_json::json!({})
    }

    /// Apply a configuration patch. Implementations clamp out-of-range values
    /// rather than rejecting them where the field has a documented range.
    async fn update_config(&self, _patch: serde_json::Value) -> MonitorResult<()> {
        Ok(())
    }
}
