use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

use super::error::{GatewayError, Result};
use super::query::CloudProvider;

static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9-]*$").expect("plugin name regex"));
static SEMVER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d+\.\d+\.\d+(-[0-9A-Za-z.-]+)?(\+[0-9A-Za-z.-]+)?$").expect("semver regex")
});
static ADDR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9.\-\[\]:]+:\d{1,5}$").expect("grpc address regex"));

/// Probe-derived health of a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "HEALTHY"),
            HealthStatus::Unhealthy => write!(f, "UNHEALTHY"),
            HealthStatus::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Last-known probe outcome for one plugin.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Health {
    pub status: HealthStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_check: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Default for Health {
    fn default() -> Self {
        Self {
            status: HealthStatus::Unknown,
            last_check: None,
            latency_ms: None,
            error: None,
        }
    }
}

impl Health {
    pub fn healthy(latency_ms: u64) -> Self {
        Self {
            status: HealthStatus::Healthy,
            last_check: Some(Utc::now()),
            latency_ms: Some(latency_ms),
            error: None,
        }
    }

    pub fn unhealthy(error: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            last_check: Some(Utc::now()),
            latency_ms: None,
            error: Some(error.into()),
        }
    }
}

/// What a plugin claims to be able to answer.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct PluginCapabilities {
    #[serde(default)]
    pub supports_projected: bool,

    #[serde(default)]
    pub supports_actual: bool,

    #[serde(default)]
    pub providers: Vec<CloudProvider>,

    #[serde(default)]
    pub resource_types: Vec<String>,
}

impl PluginCapabilities {
    pub fn validate(&self) -> Result<()> {
        if !self.supports_projected && !self.supports_actual {
            return Err(GatewayError::validation(
                "capabilities",
                "plugin must support at least one of projected or actual cost",
            ));
        }
        Ok(())
    }

    pub fn covers(&self, provider: CloudProvider, kind: CostKind) -> bool {
        let kind_ok = match kind {
            CostKind::Projected => self.supports_projected,
            CostKind::Actual => self.supports_actual,
        };
        kind_ok && (self.providers.is_empty() || self.providers.contains(&provider))
    }
}

/// Which flavor of cost a query asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum CostKind {
    Projected,
    Actual,
}

/// A discovered cost-source plugin. Owned by the supervisor for the process
/// lifetime; services see read-only snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Plugin {
    pub name: String,

    /// Semantic version as declared in the manifest.
    pub version: String,

    #[serde(default)]
    pub description: String,

    /// Loopback `host:port` the plugin's gRPC server listens on.
    pub grpc_address: String,

    pub capabilities: PluginCapabilities,

    #[serde(default)]
    pub metadata: HashMap<String, String>,

    #[serde(default)]
    pub health: Health,
}

impl Plugin {
    pub fn validate(&self) -> Result<()> {
        if !NAME_RE.is_match(&self.name) {
            return Err(GatewayError::validation(
                "name",
                format!("invalid plugin name: {:?}", self.name),
            ));
        }
        if !SEMVER_RE.is_match(&self.version) {
            return Err(GatewayError::validation(
                "version",
                format!("not a semantic version: {:?}", self.version),
            ));
        }
        if !ADDR_RE.is_match(&self.grpc_address) {
            return Err(GatewayError::validation(
                "grpc_address",
                format!("expected host:port, got {:?}", self.grpc_address),
            ));
        }
        self.capabilities.validate()
    }
}

/// Depth of the conformance battery to run against a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConformanceLevel {
    Basic,
    Standard,
    Full,
}

impl FromStr for ConformanceLevel {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "BASIC" => Ok(ConformanceLevel::Basic),
            "STANDARD" => Ok(ConformanceLevel::Standard),
            "FULL" => Ok(ConformanceLevel::Full),
            other => Err(GatewayError::validation(
                "conformance_level",
                format!("unknown conformance level: {other}"),
            )),
        }
    }
}

impl std::fmt::Display for ConformanceLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConformanceLevel::Basic => write!(f, "BASIC"),
            ConformanceLevel::Standard => write!(f, "STANDARD"),
            ConformanceLevel::Full => write!(f, "FULL"),
        }
    }
}

/// Outcome of one conformance probe.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ValidationTest {
    pub name: String,
    pub passed: bool,
    pub duration_ms: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Full battery result for one plugin endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PluginValidationReport {
    pub plugin_name: String,
    pub conformance_level: ConformanceLevel,

    /// AND of every included test outcome.
    pub passed: bool,

    pub tests: Vec<ValidationTest>,
    pub timestamp: DateTime<Utc>,
    pub spec_version: String,
}

impl PluginValidationReport {
    pub fn new(plugin_name: impl Into<String>, level: ConformanceLevel, tests: Vec<ValidationTest>) -> Self {
        let passed = !tests.is_empty() && tests.iter().all(|t| t.passed);
        Self {
            plugin_name: plugin_name.into(),
            conformance_level: level,
            passed,
            tests,
            timestamp: Utc::now(),
            spec_version: crate::COST_SPEC_VERSION.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plugin() -> Plugin {
        Plugin {
            name: "aws-billing".to_string(),
            version: "1.2.3".to_string(),
            description: "AWS billing source".to_string(),
            grpc_address: "127.0.0.1:50051".to_string(),
            capabilities: PluginCapabilities {
                supports_projected: false,
                supports_actual: true,
                providers: vec![CloudProvider::Aws],
                resource_types: vec![],
            },
            metadata: HashMap::new(),
            health: Health::default(),
        }
    }

    #[test]
    fn test_plugin_validation() {
        assert!(plugin().validate().is_ok());

        let mut bad = plugin();
        bad.name = "has spaces".to_string();
        assert!(bad.validate().is_err());

        let mut bad = plugin();
        bad.version = "one.two".to_string();
        assert!(bad.validate().is_err());

        let mut bad = plugin();
        bad.grpc_address = "nowhere".to_string();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_capabilities_require_one_bit() {
        let caps = PluginCapabilities::default();
        assert!(caps.validate().is_err());
    }

    #[test]
    fn test_capability_coverage() {
        let caps = plugin().capabilities;
        assert!(caps.covers(CloudProvider::Aws, CostKind::Actual));
        assert!(!caps.covers(CloudProvider::Aws, CostKind::Projected));
        assert!(!caps.covers(CloudProvider::Gcp, CostKind::Actual));
    }

    #[test]
    fn test_conformance_level_parse() {
        assert_eq!(
            ConformanceLevel::from_str("standard").unwrap(),
            ConformanceLevel::Standard
        );
        assert!(ConformanceLevel::from_str("EXTREME").is_err());
    }

    #[test]
    fn test_report_passed_is_and_of_tests() {
        let tests = vec![
            ValidationTest {
                name: "health_check".to_string(),
                passed: true,
                duration_ms: 3,
                error: None,
            },
            ValidationTest {
                name: "name_non_empty".to_string(),
                passed: false,
                duration_ms: 1,
                error: Some("empty name".to_string()),
            },
        ];
        let report = PluginValidationReport::new("p", ConformanceLevel::Basic, tests);
        assert!(!report.passed);
    }
}
