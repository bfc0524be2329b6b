//! Queue consumer metrics

use std::sync::atomic::{AtomicU64, Ordering};

use opentelemetry::{
    KeyValue,
    metrics::{Counter, Histogram, Meter},
};

#[derive(Debug)]
pub struct ConsumerMetrics {
    /// Settled messages by how they were settled
    messages: Counter<u64>,

    /// Time from receiving a delivery to settling it
    handling_seconds: Histogram<f64>,

    delivered: AtomicU64,
    delayed: AtomicU64,
    rejected: AtomicU64,
    dropped: AtomicU64,
}

impl ConsumerMetrics {
    pub fn new(meter: &Meter) -> Self {
        let messages = meter
            .u64_counter("courier.amqp.messages")
            .with_description("Messages settled by the consumer, by state")
            .build();

        let handling_seconds = meter
            .f64_histogram("courier.amqp.handling.duration.seconds")
            .with_description("Time spent handling a single delivery")
            .with_unit("s")
            .build();

        Self {
            messages,
            handling_seconds,
            delivered: AtomicU64::new(0),
            delayed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    fn record(&self, state: &'static str, counter: &AtomicU64, duration_secs: f64) {
        let attributes = [KeyValue::new("state", state)];
        self.messages.add(1, &attributes);
        self.handling_seconds.record(duration_secs, &attributes);
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Rendered, sent and acknowledged
    pub fn record_delivered(&self, duration_secs: f64) {
        self.record("delivered", &self.delivered, duration_secs);
    }

    /// Failed, and handed to the delay exchange for another attempt
    pub fn record_delayed(&self, duration_secs: f64) {
        self.record("delayed", &self.delayed, duration_secs);
    }

    /// Rejected without requeueing, never to be retried
    pub fn record_rejected(&self, duration_secs: f64) {
        self.record("rejected", &self.rejected, duration_secs);
    }

    /// Failed with no retries left, and acknowledged to drop it
    pub fn record_dropped(&self, duration_secs: f64) {
        self.record("dropped", &self.dropped, duration_secs);
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn delayed(&self) -> u64 {
        self.delayed.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
