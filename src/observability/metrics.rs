// Prometheus metric registry for the gateway.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;

use crate::domain::ErrorKind;

/// Error type for metrics operations
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("Failed to register metric: {0}")]
    RegistrationError(String),

    #[error("Failed to export metrics: {0}")]
    ExportError(String),
}

/// Histogram buckets for tool-call latency, in seconds.
const REQUEST_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

/// Every metric the gateway records, registered against one registry.
pub struct Metrics {
    registry: Registry,

    pub requests_total: IntCounterVec,
    pub errors_total: IntCounterVec,
    pub request_duration_seconds: HistogramVec,

    pub plugin_health: IntGaugeVec,
    pub plugin_call_latency_seconds: HistogramVec,
    pub plugin_calls_total: IntCounterVec,
}

fn register<M: prometheus::core::Collector + Clone + 'static>(
    registry: &Registry,
    metric: M,
) -> Result<M, MetricsError> {
    registry
        .register(Box::new(metric.clone()))
        .map_err(|e| MetricsError::RegistrationError(e.to_string()))?;
    Ok(metric)
}

impl Metrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let requests_total = register(
            &registry,
            IntCounterVec::new(
                Opts::new("requests_total", "Total tool invocations")
                    .namespace("pulumicost_mcp"),
                &["service", "method"],
            )
            .map_err(|e| MetricsError::RegistrationError(e.to_string()))?,
        )?;

        let errors_total = register(
            &registry,
            IntCounterVec::new(
                Opts::new("errors_total", "Tool invocations that failed")
                    .namespace("pulumicost_mcp"),
                &["service", "method", "kind"],
            )
            .map_err(|e| MetricsError::RegistrationError(e.to_string()))?,
        )?;

        let request_duration_seconds = register(
            &registry,
            HistogramVec::new(
                HistogramOpts::new("request_duration_seconds", "Tool invocation duration")
                    .namespace("pulumicost_mcp")
                    .buckets(REQUEST_BUCKETS.to_vec()),
                &["service", "method"],
            )
            .map_err(|e| MetricsError::RegistrationError(e.to_string()))?,
        )?;

        let plugin_health = register(
            &registry,
            IntGaugeVec::new(
                Opts::new("plugin_health", "1 when the last probe succeeded, else 0")
                    .namespace("pulumicost_mcp"),
                &["name"],
            )
            .map_err(|e| MetricsError::RegistrationError(e.to_string()))?,
        )?;

        let plugin_call_latency_seconds = register(
            &registry,
            HistogramVec::new(
                HistogramOpts::new("plugin_call_latency_seconds", "Plugin gRPC call latency")
                    .namespace("pulumicost_mcp")
                    .buckets(REQUEST_BUCKETS.to_vec()),
                &["plugin"],
            )
            .map_err(|e| MetricsError::RegistrationError(e.to_string()))?,
        )?;

        let plugin_calls_total = register(
            &registry,
            IntCounterVec::new(
                Opts::new("plugin_calls_total", "Plugin gRPC calls by outcome")
                    .namespace("pulumicost_mcp"),
                &["plugin", "status"],
            )
            .map_err(|e| MetricsError::RegistrationError(e.to_string()))?,
        )?;

        Ok(Self {
            registry,
            requests_total,
            errors_total,
            request_duration_seconds,
            plugin_health,
            plugin_call_latency_seconds,
            plugin_calls_total,
        })
    }

    /// Record one completed tool invocation.
    pub fn record_request(
        &self,
        service: &str,
        method: &str,
        duration: Duration,
        error: Option<ErrorKind>,
    ) {
        self.requests_total
            .with_label_values(&[service, method])
            .inc();
        self.request_duration_seconds
            .with_label_values(&[service, method])
            .observe(duration.as_secs_f64());
        if let Some(kind) = error {
            self.errors_total
                .with_label_values(&[service, method, kind.as_str()])
                .inc();
        }
    }

    /// Record one plugin gRPC call outcome.
    pub fn record_plugin_call(&self, plugin: &str, duration: Duration, ok: bool) {
        let status = if ok { "ok" } else { "error" };
        self.plugin_calls_total
            .with_label_values(&[plugin, status])
            .inc();
        self.plugin_call_latency_seconds
            .with_label_values(&[plugin])
            .observe(duration.as_secs_f64());
    }

    /// Reflect a probe result on the health gauge.
    pub fn set_plugin_health(&self, plugin: &str, healthy: bool) {
        self.plugin_health
            .with_label_values(&[plugin])
            .set(if healthy { 1 } else { 0 });
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn export(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| MetricsError::ExportError(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::ExportError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_export() {
        let metrics = Metrics::new().unwrap();
        metrics.record_request(
            "cost",
            "analyze_projected",
            Duration::from_millis(120),
            None,
        );
        metrics.record_request(
            "cost",
            "get_actual",
            Duration::from_millis(80),
            Some(ErrorKind::TimeoutError),
        );
        metrics.record_plugin_call("aws-billing", Duration::from_millis(15), false);
        metrics.set_plugin_health("aws-billing", false);

        let text = metrics.export().unwrap();
        assert!(text.contains("pulumicost_mcp_requests_total"));
        assert!(text.contains("kind=\"timeout_error\""));
        assert!(text.contains("pulumicost_mcp_plugin_health{name=\"aws-billing\"} 0"));
    }

    #[test]
    fn test_error_counter_increments_once_per_failure() {
        let metrics = Metrics::new().unwrap();
        metrics.record_plugin_call("b", Duration::from_secs(30), false);
        let text = metrics.export().unwrap();
        assert!(text.contains("plugin_calls_total{plugin=\"b\",status=\"error\"} 1"));
    }
}
