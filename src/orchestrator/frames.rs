use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::{
    CloudProvider, CostResult, GatewayError, Recommendation, ResourceCost, Result,
};

/// One newline-delimited frame of a streaming stack analysis. The stream is
/// finite and ends at the first terminal frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnalyzeFrame {
    Progress {
        percent: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Partial {
        partial_result: serde_json::Value,
    },
    Final {
        result: CostDocument,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recommendations: Option<Vec<Recommendation>>,
    },
}

impl AnalyzeFrame {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AnalyzeFrame::Final { .. })
    }
}

/// Raw cost document as emitted by the orchestrator. Resources may omit
/// fields the URN already encodes; [`CostDocument::into_result`] fills them
/// in and computes the aggregations the orchestrator does not ship.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostDocument {
    #[serde(default)]
    pub total_monthly: Option<f64>,

    #[serde(default)]
    pub currency: Option<String>,

    #[serde(default)]
    pub resources: Vec<RawResource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawResource {
    pub urn: String,

    #[serde(default, rename = "type")]
    pub resource_type: Option<String>,

    #[serde(default)]
    pub name: Option<String>,

    pub provider: CloudProvider,

    #[serde(default)]
    pub service: Option<String>,

    #[serde(default)]
    pub region: Option<String>,

    pub monthly_cost: f64,

    #[serde(default)]
    pub hourly_cost: Option<f64>,

    #[serde(default)]
    pub currency: Option<String>,

    #[serde(default)]
    pub tags: HashMap<String, String>,

    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// `urn:pulumi:<stack>::<project>::<type>::<name>` — segments 2 and 3.
fn urn_segments(urn: &str) -> (Option<&str>, Option<&str>) {
    let mut parts = urn.splitn(4, "::");
    let _head = parts.next();
    let _project = parts.next();
    let ty = parts.next();
    let name = parts.next();
    (ty, name)
}

impl RawResource {
    fn into_resource(self) -> ResourceCost {
        let (urn_type, urn_name) = urn_segments(&self.urn);
        let resource_type = self
            .resource_type
            .or_else(|| urn_type.map(str::to_string))
            .unwrap_or_default();
        let name = self
            .name
            .or_else(|| urn_name.map(str::to_string))
            .unwrap_or_default();
        ResourceCost {
            urn: self.urn,
            resource_type,
            name,
            provider: self.provider,
            service: self.service.unwrap_or_default(),
            region: self.region.unwrap_or_default(),
            monthly_cost: self.monthly_cost,
            hourly_cost: self.hourly_cost.unwrap_or_default(),
            currency: self.currency,
            tags: self.tags,
            depends_on: self.depends_on,
        }
    }
}

impl CostDocument {
    /// Validate and lift the raw document into a [`CostResult`], computing
    /// every aggregation from the per-resource values.
    pub fn into_result(self, group_tags: &[String]) -> Result<CostResult> {
        let currency = self.currency.unwrap_or_else(|| "USD".to_string());
        let resources: Vec<ResourceCost> =
            self.resources.into_iter().map(RawResource::into_resource).collect();
        let result = CostResult::from_resources(resources, &currency, group_tags)
            .map_err(|e| GatewayError::OrchestratorDecode(e.to_string()))?;
        Ok(result)
    }
}
