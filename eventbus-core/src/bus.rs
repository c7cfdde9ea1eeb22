use std::sync::Arc;

use crate::subscriber::Subscriber;
use crate::tag::{BusEvent, TypeTag};

/// The bus interface presented to callers: fire-and-forget publish plus
/// universal/typed registration. Implemented by
/// [`crate::sync_bus::SyncEventBus`], [`crate::async_bus::AsyncEventBus`],
/// and [`crate::throttled_bus::ThrottledBus`].
pub trait Bus: Send + Sync {
    /// Register a subscriber that matches every event.
    fn add_universal(&self, sub: Arc<dyn Subscriber>);

    /// Register a subscriber matching events whose tag equals, or descends
    /// from (per the event's declared ancestors/interfaces), `tag`.
    fn add_typed(&self, tag: TypeTag, sub: Arc<dyn Subscriber>);

    /// Publish `event`. Fire-and-forget; no return value.
    fn publish(&self, event: BusEvent);

    /// Convenience wrapper for a possibly-absent event: a missing event is
    /// a silent no-op, never a dispatch or an error.
    fn publish_opt(&self, event: Option<BusEvent>) {
        if let Some(event) = event {
            self.publish(event);
        }
    }
}
