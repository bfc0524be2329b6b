use serde::Deserialize;

/// Where, if anywhere, metrics are pushed
///
/// Metrics are pushed over OTLP/HTTP, typically to an OpenTelemetry
/// Collector which exposes them for Prometheus to scrape.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_endpoint")]
    pub endpoint: String,
}

fn default_endpoint() -> String {
    "http://localhost:4318/v1/metrics".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_endpoint(),
        }
    }
}
