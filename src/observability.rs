use biometrics::{Collector, Counter, Moments};

pub(crate) static SESSION_SUBMITS: Counter = Counter::new("concierge.session.submits");
pub(crate) static SESSION_BUSY_REJECTIONS: Counter =
    Counter::new("concierge.session.busy_rejections");
pub(crate) static SESSION_EMPTY_REJECTIONS: Counter =
    Counter::new("concierge.session.empty_rejections");
pub(crate) static SESSION_TURNS_COMPLETED: Counter =
    Counter::new("concierge.session.turns_completed");
pub(crate) static SESSION_TURNS_FAILED: Counter = Counter::new("concierge.session.turns_failed");
pub(crate) static SESSION_TURNS_CANCELLED: Counter =
    Counter::new("concierge.session.turns_cancelled");
pub(crate) static SESSION_RESETS: Counter = Counter::new("concierge.session.resets");

pub(crate) static STREAM_CHUNKS: Counter = Counter::new("concierge.stream.chunks");
pub(crate) static STREAM_BYTES: Counter = Counter::new("concierge.stream.bytes");
pub(crate) static STREAM_ERRORS: Counter = Counter::new("concierge.stream.errors");
pub(crate) static STREAM_TTFB: Moments = Moments::new("concierge.stream.ttfb_seconds");
pub(crate) static STREAM_DURATION: Moments = Moments::new("concierge.stream.duration_seconds");

pub(crate) static TRANSPORT_REQUESTS: Counter = Counter::new("concierge.transport.requests");
pub(crate) static TRANSPORT_REQUEST_ERRORS: Counter =
    Counter::new("concierge.transport.request_errors");

/// Register this crate's biometrics with the provided collector.
pub fn register_biometrics(collector: Collector) {
    collector.register_counter(&SESSION_SUBMITS);
    collector.register_counter(&SESSION_BUSY_REJECTIONS);
    collector.register_counter(&SESSION_EMPTY_REJECTIONS);
    collector.register_counter(&SESSION_TURNS_COMPLETED);
    collector.register_counter(&SESSION_TURNS_FAILED);
    collector.register_counter(&SESSION_TURNS_CANCELLED);
    collector.register_counter(&SESSION_RESETS);

    collector.register_counter(&STREAM_CHUNKS);
    collector.register_counter(&STREAM_BYTES);
    collector.register_counter(&STREAM_ERRORS);
    collector.register_moments(&STREAM_TTFB);
    collector.register_moments(&STREAM_DURATION);

    collector.register_counter(&TRANSPORT_REQUESTS);
    collector.register_counter(&TRANSPORT_REQUEST_ERRORS);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_every_sensor() {
        register_biometrics(Collector::new());
    }
}
