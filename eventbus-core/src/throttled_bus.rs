//! Throttled bus adapter: wraps a [`Bus`] behind a [`RollingWindowThrottler`]
//! so publishes that exceed the admission rate queue instead of blocking the
//! caller or being dropped.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::bus::Bus;
use crate::subscriber::Subscriber;
use crate::tag::{BusEvent, TypeTag};
use crate::throttler::{Admission, RollingWindowThrottler, ThrottlerConfig};

const WAKE_POLL: Duration = Duration::from_millis(200);
const SHUTDOWN_JOIN_GRACE: Duration = Duration::from_secs(1);

/// Configuration for [`ThrottledBus`]: the admission window it enforces.
#[derive(Debug, Clone, Copy)]
pub struct ThrottledBusConfig {
    pub throttler: ThrottlerConfig,
}

struct Shared {
    inner: Arc<dyn Bus>,
    throttler: Arc<RollingWindowThrottler>,
    pending: Mutex<VecDeque<BusEvent>>,
    wake: Condvar,
    running: AtomicBool,
}

/// Queues publishes that the wrapped throttler would otherwise deny, and
/// drains them on a background thread as admission capacity frees up.
/// Registration (`add_universal`/`add_typed`) passes straight through to the
/// wrapped bus; only `publish` is subject to throttling.
pub struct ThrottledBus {
    shared: Arc<Shared>,
    drainer: Mutex<Option<JoinHandle<()>>>,
}

impl ThrottledBus {
    pub fn new(inner: Arc<dyn Bus>, config: ThrottledBusConfig) -> Self {
        let throttler = Arc::new(RollingWindowThrottler::new(config.throttler));
        Self::with_throttler(inner, throttler)
    }

    pub fn with_throttler(inner: Arc<dyn Bus>, throttler: Arc<RollingWindowThrottler>) -> Self {
        let shared = Arc::new(Shared {
            inner,
            throttler,
            pending: Mutex::new(VecDeque::new()),
            wake: Condvar::new(),
            running: AtomicBool::new(true),
        });

        let drainer = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("eventbus-throttled-drainer".to_string())
                .spawn(move || drain_loop(shared))
                .expect("spawn throttled bus drainer")
        };

        ThrottledBus {
            shared,
            drainer: Mutex::new(Some(drainer)),
        }
    }

    /// Number of publishes currently queued, waiting for admission capacity.
    pub fn pending_event_count(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Stop accepting throttled admission checks, flush whatever is queued
    /// straight to the wrapped bus (no further throttle check), and join the
    /// drainer thread. Idempotent.
    pub fn shutdown(&self) {
        if self.shared.running.swap(false, Ordering::SeqCst) {
            self.shared.wake.notify_all();
            if let Some(handle) = self.drainer.lock().take() {
                crate::async_bus::join_with_timeout(handle, SHUTDOWN_JOIN_GRACE);
            }
            let drained: Vec<_> = self.shared.pending.lock().drain(..).collect();
            for event in drained {
                self.shared.inner.publish(event);
            }
            self.shared.throttler.shutdown();
        }
    }
}

impl Bus for ThrottledBus {
    fn add_universal(&self, sub: Arc<dyn Subscriber>) {
        self.shared.inner.add_universal(sub);
    }

    fn add_typed(&self, tag: TypeTag, sub: Arc<dyn Subscriber>) {
        self.shared.inner.add_typed(tag, sub);
    }

    fn publish(&self, event: BusEvent) {
        if !self.shared.running.load(Ordering::SeqCst) {
            tracing::trace!("publish after shutdown, dropped");
            return;
        }
        let mut pending = self.shared.pending.lock();
        if pending.is_empty() && self.shared.throttler.should_proceed() == Admission::Proceed {
            drop(pending);
            self.shared.inner.publish(event);
            return;
        }
        pending.push_back(event);
        drop(pending);
        self.shared.wake.notify_all();
    }
}

fn drain_loop(shared: Arc<Shared>) {
    loop {
        if !shared.running.load(Ordering::SeqCst) {
            return;
        }

        let mut pending = shared.pending.lock();
        if pending.is_empty() {
            shared.wake.wait_for(&mut pending, WAKE_POLL);
            continue;
        }

        if shared.throttler.should_proceed() != Admission::Proceed {
            drop(pending);
            let armed = shared.clone();
            shared.throttler.notify_when_can_proceed(Arc::new(move || {
                armed.wake.notify_all();
            }));
            let mut pending = shared.pending.lock();
            shared.wake.wait_for(&mut pending, WAKE_POLL);
            continue;
        }

        let event = pending.pop_front().expect("checked non-empty above");
        drop(pending);
        shared.inner.publish(event);
    }
}

impl Drop for ThrottledBus {
    fn drop(&mut self) {
        self.shutdown();
    }
}
