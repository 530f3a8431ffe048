//! Metric counters and histograms, tracing initialization, and span
//! wrappers. The HTTP transport exposes the registry on `/metrics`.

pub mod metrics;
pub mod tracing;

pub use metrics::{Metrics, MetricsError};
pub use tracing::{init_tracing, tool_span};
