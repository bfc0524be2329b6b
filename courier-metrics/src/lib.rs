//! OpenTelemetry metrics for courier
//!
//! A [`Metrics`] handle is built once at startup and passed to whatever
//! records into it; nothing here is process global.
//!
//! ```text
//! courier → OTLP/HTTP → OpenTelemetry Collector → Prometheus (scrape) → Grafana
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use courier_metrics::{Metrics, MetricsConfig};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let metrics = Metrics::init(&MetricsConfig {
//!     enabled: true,
//!     endpoint: "http://localhost:4318/v1/metrics".to_string(),
//! })?;
//!
//! metrics.consumer.record_delivered(0.25);
//! metrics.shutdown()?;
//! # Ok(())
//! # }
//! ```

mod config;
mod consumer;
mod error;
mod exporter;
mod mailer;

use courier_common::internal;
use opentelemetry::metrics::{Meter, MeterProvider};
use opentelemetry_sdk::metrics::SdkMeterProvider;

pub use config::MetricsConfig;
pub use consumer::ConsumerMetrics;
pub use error::MetricsError;
pub use mailer::MailerMetrics;

const METER: &str = "courier";

#[derive(Debug)]
pub struct Metrics {
    pub consumer: ConsumerMetrics,
    pub mailer: MailerMetrics,
    provider: Option<SdkMeterProvider>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Instruments that record locally but export nowhere
    pub fn new() -> Self {
        Self::with_meter(&opentelemetry::global::meter(METER), None)
    }

    fn with_meter(meter: &Meter, provider: Option<SdkMeterProvider>) -> Self {
        Self {
            consumer: ConsumerMetrics::new(meter),
            mailer: MailerMetrics::new(meter),
            provider,
        }
    }

    /// Build the instruments, exporting them over OTLP when enabled
    ///
    /// # Errors
    ///
    /// The OTLP exporter could not be created.
    pub fn init(config: &MetricsConfig) -> Result<Self, MetricsError> {
        if !config.enabled {
            internal!("Metrics export is disabled");
            return Ok(Self::new());
        }

        internal!(
            level = INFO,
            endpoint = %config.endpoint,
            "Exporting metrics over OTLP"
        );

        let provider = exporter::otlp_provider(&config.endpoint)?;
        let meter = provider.meter(METER);

        Ok(Self::with_meter(&meter, Some(provider)))
    }

    pub const fn is_exporting(&self) -> bool {
        self.provider.is_some()
    }

    /// Flush anything not yet exported and stop the exporter
    ///
    /// # Errors
    ///
    /// The final export failed.
    pub fn shutdown(&self) -> Result<(), MetricsError> {
        let Some(provider) = &self.provider else {
            return Ok(());
        };

        provider
            .shutdown()
            .map_err(|e| MetricsError::OpenTelemetry(e.to_string()))
    }
}
