use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::domain::{
    round2, CostComparison, CostQuery, CostResult, GatewayError, Granularity, GroupBy,
    ResourceCost, ResourceFilter, Result, TagFilter, TimeRange, MIXED_CURRENCY,
};
use crate::orchestrator::{AnalyzeReceiver, OrchestratorClient};

/// Cost operations: thin orchestration over the orchestrator adapter with
/// local post-filtering and grouping. No cost arithmetic beyond the
/// spec-defined rounding of sums.
pub struct CostService {
    orchestrator: OrchestratorClient,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct AnalyzeProjectedParams {
    /// Pulumi state export to price.
    pub pulumi_json: serde_json::Value,

    #[serde(default)]
    pub filters: Option<ResourceFilter>,

    #[serde(default)]
    pub tag_filters: Vec<TagFilter>,

    #[serde(default)]
    pub group_by: Vec<GroupBy>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct GetActualParams {
    pub stack_name: String,
    pub time_range: TimeRange,

    #[serde(default)]
    pub granularity: Option<Granularity>,

    #[serde(default)]
    pub filters: Option<ResourceFilter>,

    #[serde(default)]
    pub tag_filters: Vec<TagFilter>,

    #[serde(default)]
    pub group_by: Vec<GroupBy>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CompareCostsParams {
    pub baseline: CostQuery,
    pub target: CostQuery,

    #[serde(default)]
    pub comparison_type: Option<ComparisonType>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ComparisonType {
    Projected,
    Actual,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct AnalyzeResourceParams {
    pub resource_urn: String,

    #[serde(default)]
    pub stack_name: Option<String>,

    #[serde(default)]
    pub pulumi_json: Option<serde_json::Value>,

    #[serde(default)]
    pub time_range: Option<TimeRange>,

    #[serde(default)]
    pub include_dependencies: bool,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ResourceAnalysis {
    pub resource: ResourceCost,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<ResourceCost>,

    /// Resource cost plus (when requested) its transitive dependencies,
    /// rounded to two decimals.
    pub total_monthly: f64,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct QueryByTagsParams {
    pub stack_name: String,
    pub tag_keys: Vec<String>,

    #[serde(default)]
    pub pulumi_json: Option<serde_json::Value>,

    #[serde(default)]
    pub filters: Option<ResourceFilter>,

    #[serde(default)]
    pub time_range: Option<TimeRange>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct TagCostReport {
    /// tag key → tag value → total monthly cost.
    pub by_tag: std::collections::BTreeMap<String, std::collections::BTreeMap<String, f64>>,
    pub total_monthly: f64,
    pub currency: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct AnalyzeStackParams {
    pub stack_name: String,

    #[serde(default)]
    pub include_recommendations: bool,
}

impl CostService {
    pub fn new(orchestrator: OrchestratorClient) -> Self {
        Self { orchestrator }
    }

    /// Tag keys to group by: explicit `tag` grouping means every key seen
    /// on the filtered resources.
    fn group_tags(group_by: &[GroupBy], resources: &[ResourceCost]) -> Vec<String> {
        if !group_by.contains(&GroupBy::Tag) {
            return Vec::new();
        }
        let mut keys: Vec<String> = resources
            .iter()
            .flat_map(|r| r.tags.keys().cloned())
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    pub async fn analyze_projected(
        &self,
        cancel: &CancellationToken,
        params: AnalyzeProjectedParams,
    ) -> Result<CostResult> {
        if params.pulumi_json.is_null() {
            return Err(GatewayError::validation("pulumi_json", "must not be null"));
        }
        let mut result = self
            .orchestrator
            .projected_cost(cancel, &params.pulumi_json)
            .await?;

        let filter = params.filters.unwrap_or_default();
        let group_tags = Self::group_tags(&params.group_by, &result.resources);
        result.apply_filters(&filter, &params.tag_filters, &group_tags);
        info!(
            resource_count = result.resources.len(),
            total_monthly = result.total_monthly,
            "projected analysis complete"
        );
        Ok(result)
    }

    pub async fn get_actual(
        &self,
        cancel: &CancellationToken,
        params: GetActualParams,
    ) -> Result<CostResult> {
        params.time_range.validate()?;
        let mut result = self
            .orchestrator
            .actual_cost(cancel, &params.stack_name, &params.time_range, params.granularity)
            .await?;

        let filter = params.filters.unwrap_or_default();
        let group_tags = Self::group_tags(&params.group_by, &result.resources);
        result.apply_filters(&filter, &params.tag_filters, &group_tags);
        info!(
            stack = %params.stack_name,
            resource_count = result.resources.len(),
            total_monthly = result.total_monthly,
            "actual cost query complete"
        );
        Ok(result)
    }

    /// Evaluate one comparison side. `pulumi_json` selects the projected
    /// path; otherwise `stack_name` plus a time range selects actuals.
    async fn evaluate_side(
        &self,
        cancel: &CancellationToken,
        side: &str,
        query: &CostQuery,
        forced: Option<ComparisonType>,
    ) -> Result<CostResult> {
        query.validate().map_err(|e| match e {
            GatewayError::Validation { field, message } => GatewayError::Validation {
                field: format!("{side}.{field}"),
                message,
            },
            other => other,
        })?;

        let projected = match forced {
            Some(ComparisonType::Projected) => true,
            Some(ComparisonType::Actual) => false,
            None => query.pulumi_json.is_some(),
        };

        if projected {
            let state = query.pulumi_json.as_ref().ok_or_else(|| {
                GatewayError::validation(
                    format!("{side}.pulumi_json"),
                    "required for a projected comparison side",
                )
            })?;
            self.orchestrator.projected_cost(cancel, state).await
        } else {
            let stack = query.stack_name.as_deref().ok_or_else(|| {
                GatewayError::validation(
                    format!("{side}.stack_name"),
                    "required for an actual comparison side",
                )
            })?;
            let range = query.time_range.as_ref().ok_or_else(|| {
                GatewayError::validation(
                    format!("{side}.time_range"),
                    "required for an actual comparison side",
                )
            })?;
            self.orchestrator
                .actual_cost(cancel, stack, range, query.granularity)
                .await
        }
    }

    pub async fn compare_costs(
        &self,
        cancel: &CancellationToken,
        params: CompareCostsParams,
    ) -> Result<CostComparison> {
        let baseline = self
            .evaluate_side(cancel, "baseline", &params.baseline, params.comparison_type)
            .await?;
        let target = self
            .evaluate_side(cancel, "target", &params.target, params.comparison_type)
            .await?;

        let currency = if baseline.currency == target.currency {
            baseline.currency.clone()
        } else {
            MIXED_CURRENCY.to_string()
        };
        Ok(CostComparison::compute(
            baseline.total_monthly,
            target.total_monthly,
            &currency,
        ))
    }

    pub async fn analyze_resource(
        &self,
        cancel: &CancellationToken,
        params: AnalyzeResourceParams,
    ) -> Result<ResourceAnalysis> {
        let result = match (&params.time_range, &params.pulumi_json) {
            (Some(range), _) => {
                let stack = params.stack_name.as_deref().ok_or_else(|| {
                    GatewayError::validation("stack_name", "required with a time range")
                })?;
                self.orchestrator
                    .actual_cost(cancel, stack, range, None)
                    .await?
            }
            (None, Some(state)) => self.orchestrator.projected_cost(cancel, state).await?,
            (None, None) => {
                return Err(GatewayError::validation(
                    "pulumi_json",
                    "one of pulumi_json or stack_name with time_range is required",
                ));
            }
        };

        let resource = result
            .find(&params.resource_urn)
            .cloned()
            .ok_or_else(|| GatewayError::not_found(format!("resource {}", params.resource_urn)))?;

        let dependencies: Vec<ResourceCost> = if params.include_dependencies {
            result
                .dependency_closure(&params.resource_urn)
                .into_iter()
                .cloned()
                .collect()
        } else {
            Vec::new()
        };

        let total_monthly = round2(
            resource.monthly_cost
                + dependencies.iter().map(|d| d.monthly_cost).sum::<f64>(),
        );
        Ok(ResourceAnalysis {
            resource,
            dependencies,
            total_monthly,
        })
    }

    pub async fn query_by_tags(
        &self,
        cancel: &CancellationToken,
        params: QueryByTagsParams,
    ) -> Result<TagCostReport> {
        if params.tag_keys.is_empty() {
            return Err(GatewayError::validation("tag_keys", "must not be empty"));
        }

        let mut result = match &params.time_range {
            Some(range) => {
                self.orchestrator
                    .actual_cost(cancel, &params.stack_name, range, None)
                    .await?
            }
            None => {
                // No range: price the planned stack instead.
                let state = params
                    .pulumi_json
                    .clone()
                    .unwrap_or_else(|| serde_json::json!({ "stack_name": params.stack_name }));
                self.orchestrator.projected_cost(cancel, &state).await?
            }
        };

        let filter = params.filters.unwrap_or_default();
        result.apply_filters(&filter, &[], &params.tag_keys);

        Ok(TagCostReport {
            by_tag: result.by_tag.unwrap_or_default(),
            total_monthly: result.total_monthly,
            currency: result.currency,
        })
    }

    /// Streaming stack analysis; the dispatcher turns the frames into MCP
    /// progress notifications.
    pub async fn analyze_stack(
        &self,
        cancel: &CancellationToken,
        params: AnalyzeStackParams,
    ) -> Result<AnalyzeReceiver> {
        if params.stack_name.is_empty() {
            return Err(GatewayError::validation("stack_name", "must not be empty"));
        }
        self.orchestrator
            .analyze_stack(cancel, &params.stack_name, params.include_recommendations)
            .await
    }
}
