//! Rolling-window admission throttler.
//!
//! Poll interface (`should_proceed`) and push interface
//! (`notify_when_can_proceed`) share one admission FIFO, evicted lazily on
//! every call. The delayed re-check is a single background thread parked on
//! a `parking_lot::Condvar` rather than a reusable timer wheel, matching the
//! single-dedicated-thread shape used elsewhere in this crate for the async
//! bus drainer and the throttled adapter's own drainer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::BusError;
use crate::log::{default_log_sink, LogSink, SharedLogSink};

/// Outcome of [`RollingWindowThrottler::should_proceed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Proceed,
    DoNotProceed,
}

/// Configuration for [`RollingWindowThrottler`]. Validated at construction:
/// both `max_ops` and `window` must be positive.
#[derive(Debug, Clone, Copy)]
pub struct ThrottlerConfig {
    pub max_ops: u32,
    pub window: Duration,
}

impl ThrottlerConfig {
    pub fn new(max_ops: u32, window: Duration) -> Result<Self, BusError> {
        if max_ops == 0 {
            return Err(BusError::InvalidConfig("max_ops must be >= 1".to_string()));
        }
        if window.is_zero() {
            return Err(BusError::InvalidConfig("window_ms must be >= 1".to_string()));
        }
        Ok(ThrottlerConfig { max_ops, window })
    }
}

struct State {
    admissions: VecDeque<Instant>,
    callbacks: Vec<Arc<dyn Fn() + Send + Sync>>,
}

/// State shared with the background scheduler thread.
struct Shared {
    config: ThrottlerConfig,
    state: Mutex<State>,
    condvar: Condvar,
    notify_armed: AtomicBool,
    running: AtomicBool,
    log_sink: SharedLogSink,
}

/// Tracks admission timestamps in a sliding window and answers poll queries
/// (`should_proceed`) or schedules push callbacks
/// (`notify_when_can_proceed`).
pub struct RollingWindowThrottler {
    shared: Arc<Shared>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl RollingWindowThrottler {
    pub fn new(config: ThrottlerConfig) -> Self {
        Self::with_log_sink(config, default_log_sink())
    }

    pub fn with_defaults(max_ops: u32, window: Duration) -> Result<Self, BusError> {
        Ok(Self::new(ThrottlerConfig::new(max_ops, window)?))
    }

    pub fn with_log_sink(config: ThrottlerConfig, log_sink: Arc<dyn LogSink>) -> Self {
        let shared = Arc::new(Shared {
            config,
            state: Mutex::new(State {
                admissions: VecDeque::new(),
                callbacks: Vec::new(),
            }),
            condvar: Condvar::new(),
            notify_armed: AtomicBool::new(false),
            running: AtomicBool::new(true),
            log_sink,
        });

        let scheduler = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("eventbus-throttler-scheduler".to_string())
                .spawn(move || scheduler_loop(shared))
                .expect("spawn throttler scheduler")
        };

        RollingWindowThrottler {
            shared,
            scheduler: Mutex::new(Some(scheduler)),
        }
    }

    /// Consume a unit of capacity if available. This is the only operation
    /// that grants admission; callbacks are advisory wakeups, never grants.
    pub fn should_proceed(&self) -> Admission {
        if !self.shared.running.load(Ordering::SeqCst) {
            return Admission::DoNotProceed;
        }
        let mut state = self.shared.state.lock();
        evict(&mut state.admissions, self.shared.config.window);
        if (state.admissions.len() as u32) < self.shared.config.max_ops {
            state.admissions.push_back(Instant::now());
            Admission::Proceed
        } else {
            drop(state);
            arm(&self.shared);
            Admission::DoNotProceed
        }
    }

    /// Deliver `callback` immediately if capacity is available, else queue
    /// it and arm a delayed re-check.
    pub fn notify_when_can_proceed(&self, callback: Arc<dyn Fn() + Send + Sync>) {
        let mut state = self.shared.state.lock();
        evict(&mut state.admissions, self.shared.config.window);
        if (state.admissions.len() as u32) < self.shared.config.max_ops {
            drop(state);
            invoke(&callback, &self.shared.log_sink);
            return;
        }
        state.callbacks.push(callback);
        drop(state);
        arm(&self.shared);
    }

    /// Remove one occurrence of a previously-registered callback.
    pub fn remove_callback(&self, callback: &Arc<dyn Fn() + Send + Sync>) {
        let mut state = self.shared.state.lock();
        if let Some(pos) = state.callbacks.iter().position(|c| Arc::ptr_eq(c, callback)) {
            state.callbacks.remove(pos);
        }
    }

    /// Number of admissions currently inside the rolling window, after
    /// evicting stale entries.
    pub fn current_operation_count(&self) -> usize {
        let mut state = self.shared.state.lock();
        evict(&mut state.admissions, self.shared.config.window);
        state.admissions.len()
    }

    /// `Duration::ZERO` if capacity is available now, else the delay until
    /// the oldest admission rolls out of the window.
    pub fn time_until_next_operation(&self) -> Duration {
        let mut state = self.shared.state.lock();
        evict(&mut state.admissions, self.shared.config.window);
        compute_delay(&state.admissions, self.shared.config)
    }

    /// Stop the scheduler thread and reject further admissions. Idempotent.
    pub fn shutdown(&self) {
        if self.shared.running.swap(false, Ordering::SeqCst) {
            self.shared.condvar.notify_all();
        }
        if let Some(handle) = self.scheduler.lock().take() {
            crate::async_bus::join_with_timeout(handle, Duration::from_secs(5));
        }
    }
}

fn evict(admissions: &mut VecDeque<Instant>, window: Duration) {
    let now = Instant::now();
    while let Some(&front) = admissions.front() {
        if now.duration_since(front) >= window {
            admissions.pop_front();
        } else {
            break;
        }
    }
}

fn compute_delay(admissions: &VecDeque<Instant>, config: ThrottlerConfig) -> Duration {
    if (admissions.len() as u32) < config.max_ops {
        return Duration::ZERO;
    }
    let oldest = *admissions.front().expect("non-empty when at capacity");
    let elapsed = Instant::now().duration_since(oldest);
    config.window.saturating_sub(elapsed)
}

/// Arm a delayed re-check if one isn't already in flight. `notify_armed`
/// guards against duplicate scheduling.
fn arm(shared: &Arc<Shared>) {
    if shared
        .notify_armed
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
        shared.condvar.notify_all();
    }
}

fn scheduler_loop(shared: Arc<Shared>) {
    loop {
        if !shared.running.load(Ordering::SeqCst) {
            return;
        }

        if !shared.notify_armed.load(Ordering::SeqCst) {
            // Nothing armed; sleep briefly and re-check so shutdown stays
            // responsive without a dedicated wake channel.
            let mut state = shared.state.lock();
            shared.condvar.wait_for(&mut state, Duration::from_millis(100));
            continue;
        }

        let delay = {
            let mut state = shared.state.lock();
            evict(&mut state.admissions, shared.config.window);
            compute_delay(&state.admissions, shared.config)
        };

        if delay > Duration::ZERO {
            let mut state = shared.state.lock();
            shared.condvar.wait_for(&mut state, delay);
            if !shared.running.load(Ordering::SeqCst) {
                return;
            }
        }

        let (capacity_available, fireable) = {
            let mut state = shared.state.lock();
            evict(&mut state.admissions, shared.config.window);
            if (state.admissions.len() as u32) < shared.config.max_ops {
                (true, std::mem::take(&mut state.callbacks))
            } else {
                (false, Vec::new())
            }
        };

        if !capacity_available {
            // Still blocked: leave `notify_armed` set and loop back around
            // to re-evaluate the (shorter) remaining delay.
            continue;
        }

        // Capacity is open, whether or not anyone is listening: clear the
        // arm flag so a poll-only caller's denial-triggered arm doesn't spin
        // the scheduler once the window rolls over.
        shared.notify_armed.store(false, Ordering::SeqCst);
        for cb in &fireable {
            invoke(cb, &shared.log_sink);
        }
    }
}

fn invoke(callback: &Arc<dyn Fn() + Send + Sync>, log_sink: &SharedLogSink) {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback()));
    if let Err(payload) = result {
        let message = crate::sync_bus::panic_message(&payload);
        log_sink.error(&format!("throttler callback panicked: {message}"));
    }
}

impl Drop for RollingWindowThrottler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PMutex;

    #[test]
    fn rolling_window_admits_then_denies_then_recovers() {
        let throttler =
            RollingWindowThrottler::with_defaults(2, Duration::from_millis(500)).unwrap();
        assert_eq!(throttler.should_proceed(), Admission::Proceed);
        assert_eq!(throttler.should_proceed(), Admission::Proceed);
        assert_eq!(throttler.should_proceed(), Admission::DoNotProceed);

        std::thread::sleep(Duration::from_millis(600));
        assert_eq!(throttler.should_proceed(), Admission::Proceed);
        assert_eq!(throttler.current_operation_count(), 1);
    }

    #[test]
    fn push_callback_fires_once_capacity_returns() {
        let throttler =
            RollingWindowThrottler::with_defaults(1, Duration::from_millis(300)).unwrap();
        assert_eq!(throttler.should_proceed(), Admission::Proceed);

        let fired = Arc::new(PMutex::new(0u32));
        let f = fired.clone();
        throttler.notify_when_can_proceed(Arc::new(move || {
            *f.lock() += 1;
        }));

        std::thread::sleep(Duration::from_millis(500));
        assert_eq!(*fired.lock(), 1);
    }

    #[test]
    fn notify_when_capacity_already_available_fires_synchronously() {
        let throttler =
            RollingWindowThrottler::with_defaults(5, Duration::from_millis(300)).unwrap();
        let fired = Arc::new(PMutex::new(false));
        let f = fired.clone();
        throttler.notify_when_can_proceed(Arc::new(move || {
            *f.lock() = true;
        }));
        assert!(*fired.lock());
    }

    #[test]
    fn invalid_configuration_rejected() {
        assert!(ThrottlerConfig::new(0, Duration::from_millis(100)).is_err());
        assert!(ThrottlerConfig::new(1, Duration::ZERO).is_err());
    }

    #[test]
    fn remove_callback_prevents_future_firing() {
        let throttler =
            RollingWindowThrottler::with_defaults(1, Duration::from_millis(200)).unwrap();
        assert_eq!(throttler.should_proceed(), Admission::Proceed);

        let fired = Arc::new(PMutex::new(0u32));
        let f = fired.clone();
        let cb: Arc<dyn Fn() + Send + Sync> = Arc::new(move || {
            *f.lock() += 1;
        });
        throttler.notify_when_can_proceed(cb.clone());
        throttler.remove_callback(&cb);

        std::thread::sleep(Duration::from_millis(400));
        assert_eq!(*fired.lock(), 0);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let throttler =
            RollingWindowThrottler::with_defaults(1, Duration::from_millis(100)).unwrap();
        throttler.shutdown();
        throttler.shutdown();
        assert_eq!(throttler.should_proceed(), Admission::DoNotProceed);
    }
}
