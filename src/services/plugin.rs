use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::conformance::ConformanceValidator;
use crate::domain::{
    CloudProvider, ConformanceLevel, CostKind, CostQuery, GatewayError, Health, Plugin,
    PluginValidationReport, Result,
};
use crate::plugins::{query_all_supporting, PluginResult, PluginSupervisor};

/// Plugin-facing operations: registry snapshots, health probes, conformance
/// validation, and the fan-out query surface.
pub struct PluginService {
    supervisor: Arc<PluginSupervisor>,
    validator: ConformanceValidator,
}

#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct ListPluginsParams {
    /// Probe every plugin before answering (bounded by the fan-out limit).
    #[serde(default)]
    pub include_health: bool,
}

/// Registry snapshot entry plus breaker-derived availability.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PluginInfo {
    #[serde(flatten)]
    pub plugin: Plugin,

    /// False while the plugin's circuit breaker is open.
    pub available: bool,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct GetPluginInfoParams {
    pub plugin_name: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ValidatePluginParams {
    /// Directory containing the target plugin's manifest.
    pub plugin_path: PathBuf,

    /// BASIC, STANDARD or FULL.
    pub conformance_level: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct HealthCheckParams {
    pub plugin_name: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct QueryPluginCostsParams {
    pub provider: CloudProvider,
    pub kind: CostKind,
    pub query: CostQuery,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PluginQueryReport {
    pub results: Vec<PluginResult>,
    pub succeeded: usize,
    pub failed: usize,
}

impl PluginService {
    pub fn new(supervisor: Arc<PluginSupervisor>, validator: ConformanceValidator) -> Self {
        Self {
            supervisor,
            validator,
        }
    }

    pub async fn list_plugins(
        &self,
        _cancel: &CancellationToken,
        params: ListPluginsParams,
    ) -> Result<Vec<PluginInfo>> {
        if params.include_health {
            // Probe concurrently, bounded by the fan-out semaphore.
            let mut probes = JoinSet::new();
            for plugin in self.supervisor.list().await {
                let supervisor = Arc::clone(&self.supervisor);
                let semaphore = supervisor.fanout_semaphore();
                probes.spawn(async move {
                    if let Ok(_permit) = semaphore.acquire_owned().await {
                        let _ = supervisor.probe(&plugin.name).await;
                    }
                });
            }
            while probes.join_next().await.is_some() {}
        }

        let mut infos = Vec::new();
        for plugin in self.supervisor.list().await {
            let available = !self.supervisor.is_circuit_open(&plugin.name).await;
            infos.push(PluginInfo { plugin, available });
        }
        Ok(infos)
    }

    pub async fn get_plugin_info(
        &self,
        _cancel: &CancellationToken,
        params: GetPluginInfoParams,
    ) -> Result<PluginInfo> {
        let plugin = self
            .supervisor
            .get(&params.plugin_name)
            .await
            .ok_or_else(|| GatewayError::not_found(format!("plugin {}", params.plugin_name)))?;
        let available = !self.supervisor.is_circuit_open(&plugin.name).await;
        Ok(PluginInfo { plugin, available })
    }

    /// Run the conformance battery against an on-disk plugin path. A failing
    /// battery is still a successful call: the report carries the verdict.
    pub async fn validate_plugin(
        &self,
        _cancel: &CancellationToken,
        params: ValidatePluginParams,
    ) -> Result<PluginValidationReport> {
        let level = ConformanceLevel::from_str(&params.conformance_level)?;
        let report = self.validator.validate(&params.plugin_path, level).await?;
        info!(
            plugin = %report.plugin_name,
            %level,
            passed = report.passed,
            "conformance battery finished"
        );
        Ok(report)
    }

    /// Force a probe and return the updated health record.
    pub async fn health_check(
        &self,
        _cancel: &CancellationToken,
        params: HealthCheckParams,
    ) -> Result<Health> {
        self.supervisor.probe(&params.plugin_name).await
    }

    /// Fan out a cost query to every supporting plugin. Partial failure is
    /// success as long as one plugin returned data; total failure across a
    /// non-empty eligible set is an error carrying the per-plugin failures.
    pub async fn query_plugin_costs(
        &self,
        cancel: &CancellationToken,
        params: QueryPluginCostsParams,
    ) -> Result<PluginQueryReport> {
        let results = query_all_supporting(
            &self.supervisor,
            cancel,
            &params.query,
            params.provider,
            params.kind,
        )
        .await?;

        let succeeded = results.iter().filter(|r| r.is_ok()).count();
        let failed = results.len() - succeeded;
        if !results.is_empty() && succeeded == 0 {
            let failures: Vec<String> = results
                .iter()
                .map(|r| {
                    format!(
                        "{}: {}",
                        r.plugin,
                        r.error.as_deref().unwrap_or("unknown error")
                    )
                })
                .collect();
            return Err(GatewayError::internal(
                "all_plugins_failed",
                failures.join("; "),
            ));
        }

        info!(succeeded, failed, "plugin fan-out complete");
        Ok(PluginQueryReport {
            results,
            succeeded,
            failed,
        })
    }
}
