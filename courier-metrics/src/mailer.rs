//! Render and send metrics

use std::sync::atomic::{AtomicU64, Ordering};

use opentelemetry::{
    KeyValue,
    metrics::{Counter, Meter},
};

const SUCCESS: &str = "success";
const ERROR: &str = "error";

#[derive(Debug)]
pub struct MailerMetrics {
    renders: Counter<u64>,
    sends: Counter<u64>,

    render_errors: AtomicU64,
    sent: AtomicU64,
    send_errors: AtomicU64,
}

impl MailerMetrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            renders: meter
                .u64_counter("courier.mailer.render")
                .with_description("Template renders, by state")
                .build(),
            sends: meter
                .u64_counter("courier.mailer.send")
                .with_description("Emails handed to the delivery backend, by state")
                .build(),
            render_errors: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
        }
    }

    pub fn record_render(&self, ok: bool) {
        self.renders
            .add(1, &[KeyValue::new("state", if ok { SUCCESS } else { ERROR })]);

        if !ok {
            self.render_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_send(&self, ok: bool) {
        self.sends
            .add(1, &[KeyValue::new("state", if ok { SUCCESS } else { ERROR })]);

        if ok {
            self.sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.send_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn render_errors(&self) -> u64 {
        self.render_errors.load(Ordering::Relaxed)
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn send_errors(&self) -> u64 {
        self.send_errors.load(Ordering::Relaxed)
    }
}
