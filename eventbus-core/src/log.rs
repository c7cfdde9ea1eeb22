//! A logger-sink collaborator: a single method accepting an error message, so
//! handler/callback failures can be reported without the bus depending on any
//! particular logging backend.

use std::sync::Arc;

/// Receives error messages the bus would otherwise have nowhere to put:
/// panicking handlers, panicking throttler callbacks, and similar
/// best-effort failures that must not abort dispatch.
pub trait LogSink: Send + Sync {
    fn error(&self, message: &str);
}

/// Default sink, forwarding to `tracing::error!`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn error(&self, message: &str) {
        tracing::error!(target: "eventbus_core", "{message}");
    }
}

pub(crate) type SharedLogSink = Arc<dyn LogSink>;

pub(crate) fn default_log_sink() -> SharedLogSink {
    Arc::new(TracingLogSink)
}
