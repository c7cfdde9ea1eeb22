//! Synchronous bus: dispatches each publish in the caller's execution
//! context, with no internal buffering.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::bus::Bus;
use crate::log::{default_log_sink, LogSink, SharedLogSink};
use crate::registry::Registry;
use crate::subscriber::Subscriber;
use crate::tag::{BusEvent, TypeTag};

/// Dispatches every publish on the calling thread. When `publish` returns,
/// every matched subscriber has been invoked exactly once, in dispatch
/// order.
pub struct SyncEventBus {
    registry: Registry,
    log_sink: SharedLogSink,
}

impl Default for SyncEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncEventBus {
    pub fn new() -> Self {
        SyncEventBus {
            registry: Registry::new(),
            log_sink: default_log_sink(),
        }
    }

    pub fn with_log_sink(log_sink: Arc<dyn LogSink>) -> Self {
        SyncEventBus {
            registry: Registry::new(),
            log_sink,
        }
    }
}

impl Bus for SyncEventBus {
    fn add_universal(&self, sub: Arc<dyn Subscriber>) {
        self.registry.add_universal(sub);
    }

    fn add_typed(&self, tag: TypeTag, sub: Arc<dyn Subscriber>) {
        self.registry.add_typed(tag, sub);
    }

    fn publish(&self, event: BusEvent) {
        tracing::trace!(tag = event.tag().name(), "sync publish");
        self.registry.dispatch(&event, |sub| {
            let result = catch_unwind(AssertUnwindSafe(|| sub.handle(&event)));
            if let Err(payload) = result {
                let message = panic_message(&payload);
                self.log_sink.error(&format!("subscriber handler panicked: {message}"));
            }
        });
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug, Clone)]
    struct MarketData {
        symbol: &'static str,
        price: f64,
        volume: u64,
    }

    #[derive(Debug, Clone)]
    struct Trade {
        id: &'static str,
        symbol: &'static str,
        price: f64,
        qty: u64,
        side: &'static str,
    }

    #[test]
    fn basic_sync_dispatch() {
        let bus = SyncEventBus::new();
        let universal_hits = Arc::new(Mutex::new(0u32));
        let market_hits = Arc::new(Mutex::new(0u32));
        let trade_hits = Arc::new(Mutex::new(0u32));

        let u = universal_hits.clone();
        bus.add_universal(Arc::new(move |_: &BusEvent| *u.lock() += 1));

        let m = market_hits.clone();
        bus.add_typed(
            TypeTag::of::<MarketData>(),
            Arc::new(move |_: &BusEvent| *m.lock() += 1),
        );

        let t = trade_hits.clone();
        bus.add_typed(
            TypeTag::of::<Trade>(),
            Arc::new(move |_: &BusEvent| *t.lock() += 1),
        );

        bus.publish(BusEvent::new(MarketData {
            symbol: "AAPL",
            price: 150.0,
            volume: 1000,
        }));
        bus.publish(BusEvent::new(Trade {
            id: "T001",
            symbol: "AAPL",
            price: 150.0,
            qty: 100,
            side: "BUY",
        }));
        bus.publish(BusEvent::new("a string"));

        assert_eq!(*universal_hits.lock(), 3);
        assert_eq!(*market_hits.lock(), 1);
        assert_eq!(*trade_hits.lock(), 1);
    }

    #[test]
    fn handler_panic_does_not_stop_dispatch() {
        let bus = SyncEventBus::new();
        let second_ran = Arc::new(Mutex::new(false));

        bus.add_universal(Arc::new(|_: &BusEvent| panic!("boom")));
        let flag = second_ran.clone();
        bus.add_universal(Arc::new(move |_: &BusEvent| *flag.lock() = true));

        bus.publish(BusEvent::new(42i32));
        assert!(*second_ran.lock());
    }

    #[test]
    fn inheritance_walk_matches_ancestors_and_exact() {
        let bus = SyncEventBus::new();

        struct ObjectMarker;
        let object_hits = Arc::new(Mutex::new(0u32));
        let string_hits = Arc::new(Mutex::new(0u32));

        let o = object_hits.clone();
        bus.add_typed(
            TypeTag::of::<ObjectMarker>(),
            Arc::new(move |_: &BusEvent| *o.lock() += 1),
        );
        let s = string_hits.clone();
        bus.add_typed(
            TypeTag::of::<&'static str>(),
            Arc::new(move |_: &BusEvent| *s.lock() += 1),
        );

        let object_tag = TypeTag::of::<ObjectMarker>();
        bus.publish(BusEvent::with_hierarchy::<&'static str>(
            "hello",
            vec![object_tag],
            vec![],
        ));
        bus.publish(BusEvent::with_hierarchy::<i32>(42, vec![object_tag], vec![]));
        bus.publish(BusEvent::with_hierarchy::<MarketData>(
            MarketData {
                symbol: "AAPL",
                price: 150.0,
                volume: 1000,
            },
            vec![object_tag],
            vec![],
        ));

        assert_eq!(*object_hits.lock(), 3);
        assert_eq!(*string_hits.lock(), 1);
    }

    #[test]
    fn publish_after_construction_before_subscribe_is_missed() {
        let bus = SyncEventBus::new();
        bus.publish(BusEvent::new(1u32));

        let hits = Arc::new(Mutex::new(0u32));
        let h = hits.clone();
        bus.add_universal(Arc::new(move |_: &BusEvent| *h.lock() += 1));
        bus.publish(BusEvent::new(2u32));

        assert_eq!(*hits.lock(), 1);
    }
}
