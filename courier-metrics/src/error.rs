use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("OpenTelemetry error: {0}")]
    OpenTelemetry(String),
}
