//! PulumiCost MCP - read-only cost-intelligence gateway
//!
//! Exposes cloud-infrastructure cost analysis to AI assistants over the
//! Model Context Protocol. Cost math lives in the external `pulumicost`
//! orchestrator and in out-of-process cost-source plugins; this crate
//! routes, fans out, aggregates, and surfaces results while enforcing
//! timeouts, concurrency limits, backpressure, and partial-failure
//! semantics.

pub mod config;
pub mod conformance;
pub mod domain;
pub mod mcp;
pub mod observability;
pub mod orchestrator;
pub mod plugins;
pub mod proto;
pub mod services;
pub mod transport;

// Re-export commonly used types
pub use domain::{
    Anomaly, Budget, BudgetPeriod, BudgetStatus, CloudProvider, ConformanceLevel,
    CostComparison, CostKind, CostQuery, CostResult, ErrorKind, Forecast, GatewayError,
    Granularity, GroupBy, Health, HealthStatus, Plugin, PluginCapabilities,
    PluginValidationReport, Recommendation, ResourceCost, ResourceFilter, Result, Severity,
    TagFilter, TimeRange, TimeoutScope,
};

pub use config::Config;
pub use mcp::{Dispatcher, JsonRpcRequest, JsonRpcResponse, ToolRegistry};
pub use observability::{init_tracing, Metrics};
pub use orchestrator::OrchestratorClient;
pub use plugins::{CircuitBreaker, PluginResult, PluginSupervisor};
pub use services::Services;
pub use transport::{HttpTransport, StdioTransport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version of the cost-source plugin spec this gateway validates against.
pub const COST_SPEC_VERSION: &str = "0.1.0";
