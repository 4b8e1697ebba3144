use prometheus::{IntCounter, IntCounterVec, Opts, Registry};

// ============================================================================
// Metrics Module - Prometheus metrics for observability
// ============================================================================
//
// Counters for the event flow:
// - events published per event type
// - messages consumed per outcome (handled, missing_discriminator,
//   no_handler, decode_failed)
// - handler failures per event type
// - requeues and dead-letters
//
// The registry is exposed for embedding in whatever scrape surface the
// hosting process provides.
// ============================================================================

pub struct Metrics {
    registry: Registry,

    pub events_published: IntCounterVec,
    pub messages_consumed: IntCounterVec,
    pub handler_failures: IntCounterVec,
    pub messages_requeued: IntCounter,
    pub messages_dead_lettered: IntCounter,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let events_published = IntCounterVec::new(
            Opts::new("events_published_total", "Total domain events published"),
            &["event_type"],
        )?;
        registry.register(Box::new(events_published.clone()))?;

        let messages_consumed = IntCounterVec::new(
            Opts::new("messages_consumed_total", "Total messages consumed, by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(messages_consumed.clone()))?;

        let handler_failures = IntCounterVec::new(
            Opts::new("handler_failures_total", "Total handler invocation failures"),
            &["event_type"],
        )?;
        registry.register(Box::new(handler_failures.clone()))?;

        let messages_requeued = IntCounter::new(
            "messages_requeued_total",
            "Messages negative-acknowledged with requeue",
        )?;
        registry.register(Box::new(messages_requeued.clone()))?;

        let messages_dead_lettered = IntCounter::new(
            "messages_dead_lettered_total",
            "Messages routed to their dead-letter queue",
        )?;
        registry.register(Box::new(messages_dead_lettered.clone()))?;

        Ok(Self {
            registry,
            events_published,
            messages_consumed,
            handler_failures,
            messages_requeued,
            messages_dead_lettered,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_and_count() {
        let metrics = Metrics::new().unwrap();

        metrics
            .events_published
            .with_label_values(&["CustomerCreatedEvent"])
            .inc();
        metrics.messages_consumed.with_label_values(&["handled"]).inc();
        metrics.messages_dead_lettered.inc();

        assert_eq!(
            metrics
                .events_published
                .with_label_values(&["CustomerCreatedEvent"])
                .get(),
            1
        );
        assert_eq!(metrics.messages_dead_lettered.get(), 1);
        assert!(!metrics.registry().gather().is_empty());
    }
}
