//! Service layer: three logical services implementing the tool operations,
//! each a thin orchestration over the orchestrator adapter, the plugin
//! supervisor, and the conformance validator.

pub mod analysis;
pub mod cost;
pub mod plugin;

use std::sync::Arc;

use crate::config::Config;
use crate::conformance::ConformanceValidator;
use crate::observability::Metrics;
use crate::orchestrator::OrchestratorClient;
use crate::plugins::PluginSupervisor;

pub use analysis::{
    AnalysisService, BudgetReport, DetectAnomaliesParams, ForecastParams,
    GetRecommendationsParams, TrackBudgetParams,
};
pub use cost::{
    AnalyzeProjectedParams, AnalyzeResourceParams, AnalyzeStackParams, CompareCostsParams,
    ComparisonType, CostService, GetActualParams, QueryByTagsParams, ResourceAnalysis,
    TagCostReport,
};
pub use plugin::{
    GetPluginInfoParams, HealthCheckParams, ListPluginsParams, PluginInfo, PluginQueryReport,
    PluginService, QueryPluginCostsParams, ValidatePluginParams,
};

/// Everything the dispatcher needs, built once at startup.
pub struct Services {
    pub cost: CostService,
    pub plugin: PluginService,
    pub analysis: AnalysisService,
    pub supervisor: Arc<PluginSupervisor>,
}

impl Services {
    pub fn new(config: &Config, metrics: Arc<Metrics>) -> Self {
        let orchestrator = OrchestratorClient::new(&config.orchestrator);
        let supervisor = Arc::new(PluginSupervisor::new(
            config.plugins.clone(),
            Arc::clone(&metrics),
        ));
        let validator = ConformanceValidator::new(config.plugins.dial_timeout);
        Self {
            cost: CostService::new(orchestrator.clone()),
            plugin: PluginService::new(Arc::clone(&supervisor), validator),
            analysis: AnalysisService::new(orchestrator),
            supervisor,
        }
    }
}
