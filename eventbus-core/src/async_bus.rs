//! Asynchronous, optionally-coalescing bus.
//!
//! A single drainer thread polls the publish queue (bounded to a 100ms
//! timeout, so shutdown stays responsive) and fans matched subscribers out
//! to a small worker pool: a worker-thread-plus-control-channel shape built
//! on `crossbeam_channel`.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::bus::Bus;
use crate::log::{default_log_sink, LogSink, SharedLogSink};
use crate::registry::Registry;
use crate::subscriber::Subscriber;
use crate::sync_bus::panic_message;
use crate::tag::{BusEvent, TypeTag};

const DRAIN_POLL: Duration = Duration::from_millis(100);
const SHUTDOWN_JOIN_GRACE: Duration = Duration::from_secs(5);

/// Configuration for [`AsyncEventBus`].
#[derive(Debug, Clone)]
pub struct AsyncBusConfig {
    pub workers: NonZeroUsize,
    pub coalesce: bool,
}

impl Default for AsyncBusConfig {
    fn default() -> Self {
        AsyncBusConfig {
            workers: NonZeroUsize::new(4).expect("4 is non-zero"),
            coalesce: false,
        }
    }
}

struct QueueSlot {
    event: BusEvent,
    enqueued_at: Instant,
}

#[derive(Default)]
struct CoalesceState {
    latest: HashMap<TypeTag, (BusEvent, Instant)>,
    queued: HashSet<TypeTag>,
}

struct DispatchJob {
    sub: Arc<dyn Subscriber>,
    event: BusEvent,
}

pub struct AsyncEventBus {
    registry: Arc<Registry>,
    log_sink: SharedLogSink,
    coalesce: bool,
    coalesce_state: Arc<Mutex<CoalesceState>>,
    queue_tx: Sender<QueueSlot>,
    running: Arc<AtomicBool>,
    drainer: Mutex<Option<JoinHandle<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    job_tx: Mutex<Option<Sender<DispatchJob>>>,
}

impl AsyncEventBus {
    pub fn new(config: AsyncBusConfig) -> Self {
        Self::with_log_sink(config, default_log_sink())
    }

    pub fn with_log_sink(config: AsyncBusConfig, log_sink: Arc<dyn LogSink>) -> Self {
        let registry = Arc::new(Registry::new());
        let (queue_tx, queue_rx) = unbounded::<QueueSlot>();
        let (job_tx, job_rx) = bounded::<DispatchJob>(1024);
        let running = Arc::new(AtomicBool::new(true));
        let coalesce_state = Arc::new(Mutex::new(CoalesceState::default()));

        let mut workers = Vec::with_capacity(config.workers.get());
        for idx in 0..config.workers.get() {
            let rx = job_rx.clone();
            let sink = log_sink.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("eventbus-async-worker-{idx}"))
                    .spawn(move || worker_loop(rx, sink))
                    .expect("spawn async bus worker"),
            );
        }

        let drainer = {
            let registry = registry.clone();
            let coalesce_state = coalesce_state.clone();
            let running = running.clone();
            let job_tx = job_tx.clone();
            let coalesce = config.coalesce;
            std::thread::Builder::new()
                .name("eventbus-async-drainer".to_string())
                .spawn(move || drain_loop(queue_rx, registry, coalesce_state, coalesce, job_tx, running))
                .expect("spawn async bus drainer")
        };

        AsyncEventBus {
            registry,
            log_sink,
            coalesce: config.coalesce,
            coalesce_state,
            queue_tx,
            running,
            drainer: Mutex::new(Some(drainer)),
            workers: Mutex::new(workers),
            job_tx: Mutex::new(Some(job_tx)),
        }
    }

    /// The log sink errors from panicking handlers are routed to.
    pub fn log_sink(&self) -> &dyn LogSink {
        self.log_sink.as_ref()
    }

    /// Stop accepting new work, drain in-flight dispatch, and join all
    /// background threads within a bounded grace period. Idempotent.
    pub fn shutdown(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            if let Some(handle) = self.drainer.lock().take() {
                join_with_timeout(handle, SHUTDOWN_JOIN_GRACE);
            }
            self.job_tx.lock().take();
            for handle in self.workers.lock().drain(..) {
                join_with_timeout(handle, SHUTDOWN_JOIN_GRACE);
            }
        }
    }

    fn publish_non_coalescing(&self, event: BusEvent) {
        let slot = QueueSlot {
            event,
            enqueued_at: Instant::now(),
        };
        let _ = self.queue_tx.send(slot);
    }

    fn publish_coalescing(&self, event: BusEvent) {
        let now = Instant::now();
        let tag = event.tag();
        let is_new_slot = {
            let mut state = self.coalesce_state.lock();
            state.latest.insert(tag, (event.clone(), now));
            let already_queued = !state.queued.insert(tag);
            !already_queued
        };
        if is_new_slot {
            let slot = QueueSlot {
                event,
                enqueued_at: now,
            };
            let _ = self.queue_tx.send(slot);
        }
    }
}

impl Bus for AsyncEventBus {
    fn add_universal(&self, sub: Arc<dyn Subscriber>) {
        self.registry.add_universal(sub);
    }

    fn add_typed(&self, tag: TypeTag, sub: Arc<dyn Subscriber>) {
        self.registry.add_typed(tag, sub);
    }

    fn publish(&self, event: BusEvent) {
        if !self.running.load(Ordering::SeqCst) {
            tracing::trace!("publish after shutdown, dropped");
            return;
        }
        if self.coalesce {
            self.publish_coalescing(event);
        } else {
            self.publish_non_coalescing(event);
        }
    }
}

fn drain_loop(
    queue_rx: Receiver<QueueSlot>,
    registry: Arc<Registry>,
    coalesce_state: Arc<Mutex<CoalesceState>>,
    coalesce: bool,
    job_tx: Sender<DispatchJob>,
    running: Arc<AtomicBool>,
) {
    loop {
        if !running.load(Ordering::SeqCst) {
            break;
        }
        match queue_rx.recv_timeout(DRAIN_POLL) {
            Ok(slot) => {
                let selected = select_event(slot, coalesce, &coalesce_state);
                registry.dispatch(&selected, |sub| {
                    let job = DispatchJob {
                        sub: sub.clone(),
                        event: selected.clone(),
                    };
                    let _ = job_tx.send(job);
                });
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// Resolve the queue slot the drainer actually dispatches: the `latest`
/// value if it's at least as fresh as the dequeued slot, else the slot's own
/// event. Removes the type from both coalescing maps before returning, so
/// exactly one queue slot per type exists between consumptions.
fn select_event(
    slot: QueueSlot,
    coalesce: bool,
    coalesce_state: &Mutex<CoalesceState>,
) -> BusEvent {
    if !coalesce {
        return slot.event;
    }
    let tag = slot.event.tag();
    let mut state = coalesce_state.lock();
    let resolved = match state.latest.get(&tag) {
        Some((event, ts)) if *ts >= slot.enqueued_at => event.clone(),
        _ => slot.event,
    };
    state.latest.remove(&tag);
    state.queued.remove(&tag);
    resolved
}

/// Join a handle, polling its completion so shutdown never blocks past
/// `grace`. Handlers are never forcibly cancelled: if a thread hasn't
/// finished by the deadline, shutdown simply stops waiting for it.
pub(crate) fn join_with_timeout(handle: JoinHandle<()>, grace: Duration) {
    let poll_interval = Duration::from_millis(10);
    let deadline = Instant::now() + grace;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return;
        }
        std::thread::sleep(poll_interval);
    }
    let _ = handle.join();
}

fn worker_loop(job_rx: Receiver<DispatchJob>, log_sink: SharedLogSink) {
    while let Ok(job) = job_rx.recv() {
        let result = catch_unwind(AssertUnwindSafe(|| job.sub.handle(&job.event)));
        if let Err(payload) = result {
            let message = panic_message(&payload);
            log_sink.error(&format!("async subscriber handler panicked: {message}"));
        }
    }
}

impl Drop for AsyncEventBus {
    fn drop(&mut self) {
        self.shutdown();
    }
}
