//! Value types for cost results, plugins, recommendations, anomalies,
//! forecasts, and budgets, plus their structural and relational validation.
//! No I/O and no concurrency live here.

pub mod analysis;
pub mod cost;
pub mod error;
pub mod plugin;
pub mod query;

pub use analysis::{
    Anomaly, Budget, BudgetPeriod, BudgetStatus, Confidence, CostComparison, Forecast,
    ForecastPoint, Recommendation, RecommendationType, Severity, ThresholdAlert,
    threshold_severity,
};
pub use cost::{round2, CostResult, ResourceCost, MIXED_CURRENCY};
pub use error::{ErrorKind, GatewayError, Result, TimeoutScope};
pub use plugin::{
    ConformanceLevel, CostKind, Health, HealthStatus, Plugin, PluginCapabilities,
    PluginValidationReport, ValidationTest,
};
pub use query::{
    CloudProvider, CostQuery, Granularity, GroupBy, ResourceFilter, TagFilter, TimeRange,
};
