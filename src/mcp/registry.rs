use schemars::{schema_for, JsonSchema};
use serde::Serialize;
use serde_json::Value;

use crate::services::{
    AnalyzeProjectedParams, AnalyzeResourceParams, AnalyzeStackParams, CompareCostsParams,
    DetectAnomaliesParams, ForecastParams, GetActualParams, GetPluginInfoParams,
    GetRecommendationsParams, HealthCheckParams, ListPluginsParams, QueryByTagsParams,
    QueryPluginCostsParams, TrackBudgetParams, ValidatePluginParams,
};

/// One registered tool: its MCP name, owning service, and parameter schema
/// derived from the typed params struct.
#[derive(Debug, Clone)]
pub struct ToolDef {
    pub name: &'static str,
    pub service: &'static str,
    pub description: &'static str,
    pub streaming: bool,
    pub input_schema: Value,
}

/// Entry shape returned by `tools/list`.
#[derive(Debug, Clone, Serialize)]
pub struct ToolListing {
    pub name: &'static str,
    pub description: &'static str,

    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

fn schema_of<P: JsonSchema>() -> Value {
    serde_json::to_value(schema_for!(P)).unwrap_or(Value::Null)
}

fn tool<P: JsonSchema>(
    name: &'static str,
    service: &'static str,
    description: &'static str,
) -> ToolDef {
    ToolDef {
        name,
        service,
        description,
        streaming: false,
        input_schema: schema_of::<P>(),
    }
}

/// Static tool registry built from the service layer at startup.
pub struct ToolRegistry {
    tools: Vec<ToolDef>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        let mut tools = vec![
            tool::<AnalyzeProjectedParams>(
                "analyze_projected",
                "cost",
                "Estimate monthly cost of planned infrastructure from a Pulumi state export",
            ),
            tool::<GetActualParams>(
                "get_actual",
                "cost",
                "Fetch historical billing-backed cost for a stack over a time range",
            ),
            tool::<CompareCostsParams>(
                "compare_costs",
                "cost",
                "Compare two cost queries and report the signed and percentage difference",
            ),
            tool::<AnalyzeResourceParams>(
                "analyze_resource",
                "cost",
                "Cost of a single resource, optionally including its transitive dependencies",
            ),
            tool::<QueryByTagsParams>(
                "query_by_tags",
                "cost",
                "Group stack costs by tag key and value",
            ),
            tool::<AnalyzeStackParams>(
                "analyze_stack",
                "cost",
                "Full streaming stack analysis with progress notifications",
            ),
            tool::<ListPluginsParams>(
                "list_plugins",
                "plugin",
                "List discovered cost-source plugins, optionally probing health",
            ),
            tool::<GetPluginInfoParams>(
                "get_plugin_info",
                "plugin",
                "Details and capabilities of one plugin",
            ),
            tool::<ValidatePluginParams>(
                "validate_plugin",
                "plugin",
                "Run the conformance battery against a plugin directory",
            ),
            tool::<HealthCheckParams>(
                "health_check",
                "plugin",
                "Force a health probe against one plugin",
            ),
            tool::<QueryPluginCostsParams>(
                "query_plugin_costs",
                "plugin",
                "Fan a cost query out to every supporting plugin and aggregate partial results",
            ),
            tool::<GetRecommendationsParams>(
                "get_recommendations",
                "analysis",
                "Cost optimization recommendations for a stack",
            ),
            tool::<DetectAnomaliesParams>(
                "detect_anomalies",
                "analysis",
                "Detect spending anomalies over a time range",
            ),
            tool::<ForecastParams>(
                "forecast",
                "analysis",
                "Forecast stack cost over a future period",
            ),
            tool::<TrackBudgetParams>(
                "track_budget",
                "analysis",
                "Track spending against a budget and derive threshold alerts",
            ),
        ];
        if let Some(analyze) = tools.iter_mut().find(|t| t.name == "analyze_stack") {
            analyze.streaming = true;
        }
        Self { tools }
    }

    pub fn get(&self, name: &str) -> Option<&ToolDef> {
        self.tools.iter().find(|t| t.name == name)
    }

    pub fn list(&self) -> Vec<ToolListing> {
        self.tools
            .iter()
            .map(|t| ToolListing {
                name: t.name,
                description: t.description,
                input_schema: t.input_schema.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_has_all_tools() {
        let registry = ToolRegistry::new();
        assert_eq!(registry.len(), 15);
        assert!(registry.get("analyze_projected").is_some());
        assert!(registry.get("track_budget").is_some());
        assert!(registry.get("nonexistent").is_none());
    }

    #[test]
    fn test_only_analyze_stack_streams() {
        let registry = ToolRegistry::new();
        for tool in registry.list() {
            let def = registry.get(tool.name).unwrap();
            assert_eq!(def.streaming, tool.name == "analyze_stack");
        }
    }

    #[test]
    fn test_listing_carries_schemas() {
        let registry = ToolRegistry::new();
        let listing = registry.list();
        for tool in listing {
            assert!(tool.input_schema.is_object(), "{} has no schema", tool.name);
        }
    }
}
