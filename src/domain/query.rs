use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::error::{GatewayError, Result};

/// Cloud provider a resource or plugin belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum CloudProvider {
    Aws,
    Azure,
    Gcp,
    Kubernetes,
}

impl CloudProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloudProvider::Aws => "aws",
            CloudProvider::Azure => "azure",
            CloudProvider::Gcp => "gcp",
            CloudProvider::Kubernetes => "kubernetes",
        }
    }
}

impl std::fmt::Display for CloudProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for CloudProvider {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "aws" => Ok(CloudProvider::Aws),
            "azure" => Ok(CloudProvider::Azure),
            "gcp" => Ok(CloudProvider::Gcp),
            "kubernetes" => Ok(CloudProvider::Kubernetes),
            other => Err(GatewayError::validation(
                "provider",
                format!("unknown provider: {other}"),
            )),
        }
    }
}

/// Reporting granularity for actual-cost queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Hourly,
    Daily,
    Monthly,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Hourly => "hourly",
            Granularity::Daily => "daily",
            Granularity::Monthly => "monthly",
        }
    }
}

/// Dimension a cost response can be grouped by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum GroupBy {
    Provider,
    Service,
    Region,
    Tag,
}

/// Half-open wall-clock interval. `start` must strictly precede `end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        let range = Self { start, end };
        range.validate()?;
        Ok(range)
    }

    pub fn validate(&self) -> Result<()> {
        if self.start >= self.end {
            return Err(GatewayError::validation(
                "time_range",
                "start must be strictly before end",
            ));
        }
        Ok(())
    }
}

/// Resource-level filter applied after the orchestrator returns.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ResourceFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<CloudProvider>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

impl ResourceFilter {
    pub fn is_empty(&self) -> bool {
        self.provider.is_none() && self.resource_type.is_none() && self.region.is_none()
    }
}

/// Tag filter: the resource must carry `key` with one of the allowed values.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TagFilter {
    pub key: String,
    pub values: Vec<String>,
}

/// Request envelope shared by cost operations and the plugin fan-out.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct CostQuery {
    /// Pulumi stack to query. Required for actual-cost operations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_name: Option<String>,

    /// Opaque Pulumi state export. Required for projected-cost operations
    /// when no stack name is given.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pulumi_json: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<ResourceFilter>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tag_filters: Vec<TagFilter>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeRange>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub granularity: Option<Granularity>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group_by: Vec<GroupBy>,
}

impl CostQuery {
    pub fn validate(&self) -> Result<()> {
        if self.stack_name.is_none() && self.pulumi_json.is_none() {
            return Err(GatewayError::validation(
                "stack_name",
                "one of stack_name or pulumi_json is required",
            ));
        }
        if let Some(stack) = &self.stack_name {
            if stack.is_empty() {
                return Err(GatewayError::validation("stack_name", "must not be empty"));
            }
        }
        if let Some(range) = &self.time_range {
            range.validate()?;
        }
        for (i, tf) in self.tag_filters.iter().enumerate() {
            if tf.key.is_empty() {
                return Err(GatewayError::validation(
                    format!("tag_filters[{i}].key"),
                    "must not be empty",
                ));
            }
        }
        Ok(())
    }

    /// Actual-cost operations additionally require a time range.
    pub fn validate_for_actual(&self) -> Result<()> {
        self.validate()?;
        if self.time_range.is_none() {
            return Err(GatewayError::validation(
                "time_range",
                "required for actual cost operations",
            ));
        }
        Ok(())
    }
}
