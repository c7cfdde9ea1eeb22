use crate::tag::BusEvent;

/// A subscriber's single capability: receive a matched event.
///
/// `handle` must not panic out of the bus; if it does, the bus that invoked
/// it catches the panic, forwards its message to the configured
/// [`crate::log::LogSink`], and continues dispatch with the next subscriber.
/// On the async bus, `handle` may be called concurrently by multiple workers
/// for different events and must tolerate that.
pub trait Subscriber: Send + Sync {
    fn handle(&self, event: &BusEvent);
}

impl<F> Subscriber for F
where
    F: Fn(&BusEvent) + Send + Sync,
{
    fn handle(&self, event: &BusEvent) {
        (self)(event)
    }
}
