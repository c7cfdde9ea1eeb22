//! In-process event distribution and admission control.
//!
//! Three pieces compose together: an event bus (synchronous or asynchronous,
//! the latter optionally coalescing bursts per event type), a rolling-window
//! admission throttler exposing both a poll interface and a push interface,
//! and a throttled-bus adapter wiring the throttler in front of a bus so
//! publishes queue instead of blocking when capacity is exhausted.

mod bus;
mod error;
mod log;
mod registry;
mod subscriber;
mod tag;

mod async_bus;
mod sync_bus;
mod throttled_bus;
mod throttler;

pub use bus::Bus;
pub use error::BusError;
pub use log::{LogSink, TracingLogSink};
pub use subscriber::Subscriber;
pub use tag::{BusEvent, TypeTag};

pub use async_bus::{AsyncBusConfig, AsyncEventBus};
pub use sync_bus::SyncEventBus;
pub use throttled_bus::{ThrottledBus, ThrottledBusConfig};
pub use throttler::{Admission, RollingWindowThrottler, ThrottlerConfig};
