use thiserror::Error;

/// Errors surfaced synchronously at construction time.
///
/// Every other failure mode in this crate (handler panics, callback panics,
/// publishing after shutdown) is swallowed and routed to a [`crate::log::LogSink`]
/// instead of being returned.
#[derive(Error, Debug)]
pub enum BusError {
    #[error("invalid throttler configuration: {0}")]
    InvalidConfig(String),
}
