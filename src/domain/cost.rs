use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use super::error::{GatewayError, Result};
use super::query::{CloudProvider, ResourceFilter, TagFilter};

/// `urn:pulumi:<stack>::<project>::<type>::<name>`; the type segment may
/// itself contain single colons (`aws:ec2/instance:Instance`).
static URN_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^urn:pulumi:[^:]+$").expect("urn prefix regex"));

/// ISO-4217 placeholder used when aggregated resources disagree on currency.
pub const MIXED_CURRENCY: &str = "XXX";

fn parse_urn(urn: &str) -> Option<(&str, &str, &str, &str)> {
    let mut parts = urn.splitn(4, "::");
    let head = parts.next()?;
    if !URN_PREFIX.is_match(head) {
        return None;
    }
    let stack = head.strip_prefix("urn:pulumi:")?;
    let project = parts.next()?;
    let ty = parts.next()?;
    let name = parts.next()?;
    if project.is_empty() || ty.is_empty() || name.is_empty() {
        return None;
    }
    Some((stack, project, ty, name))
}

/// Cost of a single Pulumi resource as reported by the orchestrator.
/// Never mutated after parse; lives only for the duration of one response.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ResourceCost {
    pub urn: String,

    #[serde(rename = "type")]
    pub resource_type: String,

    pub name: String,

    pub provider: CloudProvider,

    /// Billing service category, e.g. "ec2" or "storage".
    #[serde(default)]
    pub service: String,

    #[serde(default)]
    pub region: String,

    pub monthly_cost: f64,

    #[serde(default)]
    pub hourly_cost: f64,

    #[serde(default)]
    pub currency: Option<String>,

    #[serde(default)]
    pub tags: HashMap<String, String>,

    /// URNs of resources this one depends on, within the same stack.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl ResourceCost {
    pub fn validate(&self) -> Result<()> {
        let Some((stack, _, _, _)) = parse_urn(&self.urn) else {
            return Err(GatewayError::validation(
                "urn",
                format!("malformed resource urn: {}", self.urn),
            ));
        };
        if self.monthly_cost < 0.0 {
            return Err(GatewayError::validation("monthly_cost", "must be >= 0"));
        }
        if self.hourly_cost < 0.0 {
            return Err(GatewayError::validation("hourly_cost", "must be >= 0"));
        }
        for (i, dep) in self.depends_on.iter().enumerate() {
            match parse_urn(dep) {
                Some((dep_stack, _, _, _)) if dep_stack == stack => {}
                Some(_) => {
                    return Err(GatewayError::validation(
                        format!("depends_on[{i}]"),
                        "dependency urn belongs to a different stack",
                    ));
                }
                None => {
                    return Err(GatewayError::validation(
                        format!("depends_on[{i}]"),
                        format!("malformed dependency urn: {dep}"),
                    ));
                }
            }
        }
        Ok(())
    }

    fn matches(&self, filter: &ResourceFilter, tag_filters: &[TagFilter]) -> bool {
        if let Some(provider) = filter.provider {
            if self.provider != provider {
                return false;
            }
        }
        if let Some(ty) = &filter.resource_type {
            if &self.resource_type != ty {
                return false;
            }
        }
        if let Some(region) = &filter.region {
            if &self.region != region {
                return false;
            }
        }
        for tf in tag_filters {
            match self.tags.get(&tf.key) {
                Some(value) if tf.values.is_empty() || tf.values.contains(value) => {}
                _ => return false,
            }
        }
        true
    }
}

/// Aggregated cost response. Aggregations are 2-decimal roundings of sums of
/// values received from the orchestrator or plugins; no conversion, no
/// re-pricing happens here.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CostResult {
    pub total_monthly: f64,

    pub currency: String,

    pub resources: Vec<ResourceCost>,

    #[serde(default)]
    pub by_provider: BTreeMap<String, f64>,

    #[serde(default)]
    pub by_service: BTreeMap<String, f64>,

    #[serde(default)]
    pub by_region: BTreeMap<String, f64>,

    /// Per-currency totals. Meaningful when resources disagree on currency;
    /// the top-level `currency` is then [`MIXED_CURRENCY`].
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub by_currency: BTreeMap<String, f64>,

    /// Grouped by tag key, then tag value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub by_tag: Option<BTreeMap<String, BTreeMap<String, f64>>>,

    pub timestamp: DateTime<Utc>,
}

pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

impl CostResult {
    /// Build a result from parsed resources, computing every aggregation.
    /// `document_currency` is the currency tag carried by the orchestrator
    /// document, used when resources do not tag currencies themselves.
    pub fn from_resources(
        resources: Vec<ResourceCost>,
        document_currency: &str,
        group_tags: &[String],
    ) -> Result<Self> {
        for resource in &resources {
            resource.validate()?;
        }

        let mut result = CostResult {
            total_monthly: 0.0,
            currency: document_currency.to_string(),
            resources,
            by_provider: BTreeMap::new(),
            by_service: BTreeMap::new(),
            by_region: BTreeMap::new(),
            by_currency: BTreeMap::new(),
            by_tag: None,
            timestamp: Utc::now(),
        };
        result.recompute(document_currency, group_tags);
        Ok(result)
    }

    /// Recompute totals and aggregations from `self.resources`.
    pub fn recompute(&mut self, document_currency: &str, group_tags: &[String]) {
        let mut total = 0.0f64;
        let mut by_provider: BTreeMap<String, f64> = BTreeMap::new();
        let mut by_service: BTreeMap<String, f64> = BTreeMap::new();
        let mut by_region: BTreeMap<String, f64> = BTreeMap::new();
        let mut by_currency: BTreeMap<String, f64> = BTreeMap::new();
        let mut by_tag: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();

        for resource in &self.resources {
            total += resource.monthly_cost;
            *by_provider
                .entry(resource.provider.to_string())
                .or_default() += resource.monthly_cost;
            if !resource.service.is_empty() {
                *by_service.entry(resource.service.clone()).or_default() +=
                    resource.monthly_cost;
            }
            if !resource.region.is_empty() {
                *by_region.entry(resource.region.clone()).or_default() += resource.monthly_cost;
            }
            let currency = resource
                .currency
                .clone()
                .unwrap_or_else(|| document_currency.to_string());
            *by_currency.entry(currency).or_default() += resource.monthly_cost;

            for key in group_tags {
                if let Some(value) = resource.tags.get(key) {
                    *by_tag
                        .entry(key.clone())
                        .or_default()
                        .entry(value.clone())
                        .or_default() += resource.monthly_cost;
                }
            }
        }

        for map in [&mut by_provider, &mut by_service, &mut by_region, &mut by_currency] {
            for value in map.values_mut() {
                *value = round2(*value);
            }
        }
        for values in by_tag.values_mut() {
            for value in values.values_mut() {
                *value = round2(*value);
            }
        }

        self.total_monthly = round2(total);
        self.currency = if by_currency.len() > 1 {
            MIXED_CURRENCY.to_string()
        } else {
            by_currency
                .keys()
                .next()
                .cloned()
                .unwrap_or_else(|| document_currency.to_string())
        };
        self.by_provider = by_provider;
        self.by_service = by_service;
        self.by_region = by_region;
        self.by_currency = by_currency;
        self.by_tag = if by_tag.is_empty() { None } else { Some(by_tag) };
    }

    /// Drop resources not matching the filter and recompute aggregations.
    pub fn apply_filters(
        &mut self,
        filter: &ResourceFilter,
        tag_filters: &[TagFilter],
        group_tags: &[String],
    ) {
        if filter.is_empty() && tag_filters.is_empty() {
            if !group_tags.is_empty() {
                let currency = self.currency.clone();
                self.recompute(&currency, group_tags);
            }
            return;
        }
        self.resources.retain(|r| r.matches(filter, tag_filters));
        let currency = self.currency.clone();
        self.recompute(&currency, group_tags);
    }

    /// Check the aggregation invariants: total and every per-dimension value
    /// equal the rounded sum of contributing resources.
    pub fn validate(&self) -> Result<()> {
        if self.total_monthly < 0.0 {
            return Err(GatewayError::validation("total_monthly", "must be >= 0"));
        }
        let sum: f64 = self.resources.iter().map(|r| r.monthly_cost).sum();
        if (self.total_monthly - round2(sum)).abs() > f64::EPSILON * 100.0 {
            return Err(GatewayError::validation(
                "total_monthly",
                format!(
                    "does not equal rounded resource sum: {} != {}",
                    self.total_monthly,
                    round2(sum)
                ),
            ));
        }
        for resource in &self.resources {
            resource.validate()?;
        }
        Ok(())
    }

    /// Look up a resource by URN.
    pub fn find(&self, urn: &str) -> Option<&ResourceCost> {
        self.resources.iter().find(|r| r.urn == urn)
    }

    /// Transitive dependency closure of `urn`, in breadth-first order,
    /// excluding the root itself. Unknown dependency URNs are skipped.
    pub fn dependency_closure(&self, urn: &str) -> Vec<&ResourceCost> {
        let mut seen = std::collections::HashSet::new();
        let mut queue = std::collections::VecDeque::new();
        let mut out = Vec::new();
        seen.insert(urn.to_string());
        queue.push_back(urn.to_string());
        while let Some(current) = queue.pop_front() {
            let Some(resource) = self.find(&current) else {
                continue;
            };
            for dep in &resource.depends_on {
                if seen.insert(dep.clone()) {
                    if let Some(found) = self.find(dep) {
                        out.push(found);
                        queue.push_back(dep.clone());
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(urn: &str, provider: CloudProvider, monthly: f64) -> ResourceCost {
        ResourceCost {
            urn: urn.to_string(),
            resource_type: "aws:ec2/instance:Instance".to_string(),
            name: "web".to_string(),
            provider,
            service: "ec2".to_string(),
            region: "us-east-1".to_string(),
            monthly_cost: monthly,
            hourly_cost: monthly / 730.0,
            currency: None,
            tags: HashMap::new(),
            depends_on: Vec::new(),
        }
    }

    #[test]
    fn test_urn_parse() {
        assert!(parse_urn("urn:pulumi:dev::app::aws:ec2/instance:Instance::web").is_some());
        assert!(parse_urn("urn:pulumi:dev::app::web").is_none());
        assert!(parse_urn("arn:aws:ec2:whatever").is_none());
    }

    #[test]
    fn test_total_equals_rounded_sum() {
        let result = CostResult::from_resources(
            vec![
                resource("urn:pulumi:dev::app::aws:ec2/instance:Instance::a", CloudProvider::Aws, 10.105),
                resource("urn:pulumi:dev::app::aws:ec2/instance:Instance::b", CloudProvider::Aws, 0.10),
            ],
            "USD",
            &[],
        )
        .unwrap();
        assert_eq!(result.total_monthly, 10.21);
        assert_eq!(result.by_provider["aws"], 10.21);
        assert!(result.validate().is_ok());
    }

    #[test]
    fn test_mixed_currency_grouping() {
        let mut eur = resource(
            "urn:pulumi:dev::app::aws:ec2/instance:Instance::a",
            CloudProvider::Aws,
            5.0,
        );
        eur.currency = Some("EUR".to_string());
        let usd = resource(
            "urn:pulumi:dev::app::aws:ec2/instance:Instance::b",
            CloudProvider::Aws,
            7.0,
        );
        let result = CostResult::from_resources(vec![eur, usd], "USD", &[]).unwrap();
        assert_eq!(result.currency, MIXED_CURRENCY);
        assert_eq!(result.by_currency["EUR"], 5.0);
        assert_eq!(result.by_currency["USD"], 7.0);
    }

    #[test]
    fn test_filter_recomputes_totals() {
        let mut result = CostResult::from_resources(
            vec![
                resource("urn:pulumi:p::a::aws:ec2/instance:Instance::a", CloudProvider::Aws, 3.0),
                resource("urn:pulumi:p::a::aws:ec2/instance:Instance::b", CloudProvider::Aws, 4.0),
                resource("urn:pulumi:p::a::azure:compute/vm:VM::c", CloudProvider::Azure, 9.0),
            ],
            "USD",
            &[],
        )
        .unwrap();

        let filter = ResourceFilter {
            provider: Some(CloudProvider::Aws),
            ..Default::default()
        };
        result.apply_filters(&filter, &[], &[]);
        assert_eq!(result.resources.len(), 2);
        assert_eq!(result.total_monthly, 7.0);
        assert!(result.by_provider.get("azure").is_none());
    }

    #[test]
    fn test_dependency_closure() {
        let mut a = resource("urn:pulumi:p::a::t:x/y:Z::a", CloudProvider::Aws, 1.0);
        let mut b = resource("urn:pulumi:p::a::t:x/y:Z::b", CloudProvider::Aws, 2.0);
        let c = resource("urn:pulumi:p::a::t:x/y:Z::c", CloudProvider::Aws, 3.0);
        a.depends_on = vec!["urn:pulumi:p::a::t:x/y:Z::b".to_string()];
        b.depends_on = vec!["urn:pulumi:p::a::t:x/y:Z::c".to_string()];
        let result = CostResult::from_resources(vec![a, b, c], "USD", &[]).unwrap();

        let closure = result.dependency_closure("urn:pulumi:p::a::t:x/y:Z::a");
        let urns: Vec<_> = closure.iter().map(|r| r.urn.as_str()).collect();
        assert_eq!(
            urns,
            vec!["urn:pulumi:p::a::t:x/y:Z::b", "urn:pulumi:p::a::t:x/y:Z::c"]
        );
    }

    #[test]
    fn test_cross_stack_dependency_rejected() {
        let mut a = resource("urn:pulumi:p::a::t:x/y:Z::a", CloudProvider::Aws, 1.0);
        a.depends_on = vec!["urn:pulumi:other::a::t:x/y:Z::b".to_string()];
        assert!(a.validate().is_err());
    }
}
