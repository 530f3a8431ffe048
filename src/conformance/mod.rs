//! Conformance validator: a fixed battery of gRPC probes run against a
//! plugin endpoint described by an on-disk manifest path. The target does
//! not need to be (and is never added to) the supervisor registry.

use std::path::Path;
use std::time::{Duration, Instant};
use tonic::transport::{Channel, Endpoint};
use tonic::Code;
use tracing::debug;

use crate::domain::{
    ConformanceLevel, GatewayError, Plugin, PluginValidationReport, Result, ValidationTest,
};
use crate::plugins::load_plugin;
use crate::proto::{
    CostSourceClient, GetActualCostRequest, HealthCheckRequest, NameRequest, ResourceDescriptor,
};

/// Per-probe deadline mandated for `HealthCheck`; reused for the rest of
/// the battery.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Resource type no conforming plugin may claim to price.
const UNSUPPORTED_TYPE: &str = "conformance:unsupported/resource:Never";

pub struct ConformanceValidator {
    dial_timeout: Duration,
}

impl ConformanceValidator {
    pub fn new(dial_timeout: Duration) -> Self {
        Self { dial_timeout }
    }

    /// Run the battery for `level` against the plugin described at
    /// `plugin_path`. An unparsable manifest is a validation error; probe
    /// failures are recorded in the report, never raised.
    pub async fn validate(
        &self,
        plugin_path: &Path,
        level: ConformanceLevel,
    ) -> Result<PluginValidationReport> {
        let plugin = load_plugin(plugin_path).map_err(|e| {
            GatewayError::validation("plugin_path", format!("unusable manifest: {e}"))
        })?;
        debug!(plugin = %plugin.name, %level, "running conformance battery");

        let mut tests = Vec::new();

        let channel = match self.connect(&plugin, &mut tests).await {
            Some(channel) => channel,
            None => {
                // Without a connection the battery cannot continue.
                return Ok(PluginValidationReport::new(plugin.name, level, tests));
            }
        };
        let client = CostSourceClient::new(channel);

        self.run_basic(client.clone(), &mut tests).await;
        if level >= ConformanceLevel::Standard {
            self.run_standard(client.clone(), &mut tests).await;
        }
        if level >= ConformanceLevel::Full {
            self.run_full(client, &mut tests).await;
        }

        Ok(PluginValidationReport::new(plugin.name, level, tests))
    }

    async fn connect(&self, plugin: &Plugin, tests: &mut Vec<ValidationTest>) -> Option<Channel> {
        let started = Instant::now();
        let outcome = async {
            let endpoint = Endpoint::from_shared(format!("http://{}", plugin.grpc_address))
                .map_err(|e| format!("invalid address: {e}"))?
                .connect_timeout(self.dial_timeout);
            endpoint.connect().await.map_err(|e| format!("dial failed: {e}"))
        }
        .await;

        match outcome {
            Ok(channel) => {
                tests.push(pass("connect", started));
                Some(channel)
            }
            Err(error) => {
                tests.push(fail("connect", started, error));
                None
            }
        }
    }

    async fn run_basic(&self, client: CostSourceClient<Channel>, tests: &mut Vec<ValidationTest>) {
        {
            let mut client = client.clone();
            let started = Instant::now();
            let outcome = tokio::time::timeout(
                PROBE_TIMEOUT,
                client.health_check(tonic::Request::new(HealthCheckRequest {})),
            )
            .await;
            tests.push(match outcome {
                Ok(Ok(_)) => pass("health_check_responds", started),
                Ok(Err(status)) => fail("health_check_responds", started, status.to_string()),
                Err(_) => fail(
                    "health_check_responds",
                    started,
                    format!("no response within {PROBE_TIMEOUT:?}"),
                ),
            });
        }

        {
            let mut client = client;
            let started = Instant::now();
            let outcome = tokio::time::timeout(
                PROBE_TIMEOUT,
                client.name(tonic::Request::new(NameRequest {})),
            )
            .await;
            tests.push(match outcome {
                Ok(Ok(ref response)) if !response.get_ref().name.is_empty() => {
                    pass("name_non_empty", started)
                }
                Ok(Ok(_)) => fail("name_non_empty", started, "empty plugin name"),
                Ok(Err(status)) => fail("name_non_empty", started, status.to_string()),
                Err(_) => fail("name_non_empty", started, "probe timed out"),
            });
        }
    }

    async fn run_standard(
        &self,
        client: CostSourceClient<Channel>,
        tests: &mut Vec<ValidationTest>,
    ) {
        {
            let mut client = client.clone();
            let started = Instant::now();
            let outcome = tokio::time::timeout(
                PROBE_TIMEOUT,
                client.get_actual_cost(tonic::Request::new(canned_actual_request())),
            )
            .await;
            tests.push(match outcome {
                Ok(Ok(response)) => {
                    let body = response.into_inner();
                    let malformed = body
                        .entries
                        .iter()
                        .find(|e| e.urn.is_empty() || e.monthly_cost < 0.0);
                    match malformed {
                        None => pass("actual_cost_canned", started),
                        Some(entry) => fail(
                            "actual_cost_canned",
                            started,
                            format!("malformed entry for urn {:?}", entry.urn),
                        ),
                    }
                }
                Ok(Err(status)) => fail("actual_cost_canned", started, status.to_string()),
                Err(_) => fail("actual_cost_canned", started, "call timed out"),
            });
        }

        {
            let mut client = client;
            let started = Instant::now();
            let mut request = canned_actual_request();
            request.resources[0].resource_type = UNSUPPORTED_TYPE.to_string();
            let outcome = tokio::time::timeout(
                PROBE_TIMEOUT,
                client.get_actual_cost(tonic::Request::new(request)),
            )
            .await;
            tests.push(match outcome {
                Ok(Err(status)) if status.code() == Code::InvalidArgument => {
                    pass("unsupported_resource_error", started)
                }
                Ok(Err(status)) => fail(
                    "unsupported_resource_error",
                    started,
                    format!("expected INVALID_ARGUMENT, got {:?}", status.code()),
                ),
                Ok(Ok(_)) => fail(
                    "unsupported_resource_error",
                    started,
                    "plugin accepted an unsupported resource type",
                ),
                Err(_) => fail("unsupported_resource_error", started, "call timed out"),
            });
        }
    }

    async fn run_full(&self, client: CostSourceClient<Channel>, tests: &mut Vec<ValidationTest>) {
        {
            let mut client = client.clone();
            let started = Instant::now();
            let request = canned_actual_request();
            let requested: Vec<String> =
                request.resources.iter().map(|r| r.urn.clone()).collect();
            let outcome = tokio::time::timeout(
                PROBE_TIMEOUT,
                client.get_actual_cost(tonic::Request::new(request)),
            )
            .await;
            tests.push(match outcome {
                Ok(Ok(response)) => {
                    let stray = response
                        .into_inner()
                        .entries
                        .into_iter()
                        .find(|e| !requested.contains(&e.urn));
                    match stray {
                        None => pass("resource_filtering", started),
                        Some(entry) => fail(
                            "resource_filtering",
                            started,
                            format!("entry for unrequested urn {:?}", entry.urn),
                        ),
                    }
                }
                Ok(Err(status)) => fail("resource_filtering", started, status.to_string()),
                Err(_) => fail("resource_filtering", started, "call timed out"),
            });
        }

        {
            let mut client = client.clone();
            let started = Instant::now();
            let mut request = canned_actual_request();
            // Inverted range must be rejected.
            std::mem::swap(&mut request.start, &mut request.end);
            let outcome = tokio::time::timeout(
                PROBE_TIMEOUT,
                client.get_actual_cost(tonic::Request::new(request)),
            )
            .await;
            tests.push(match outcome {
                Ok(Err(status)) if status.code() == Code::InvalidArgument => {
                    pass("time_range_handling", started)
                }
                Ok(Err(status)) => fail(
                    "time_range_handling",
                    started,
                    format!("expected INVALID_ARGUMENT, got {:?}", status.code()),
                ),
                Ok(Ok(_)) => fail(
                    "time_range_handling",
                    started,
                    "plugin accepted an inverted time range",
                ),
                Err(_) => fail("time_range_handling", started, "call timed out"),
            });
        }

        {
            let started = Instant::now();
            let mut first = client.clone();
            let mut second = client;
            let outcome = tokio::time::timeout(PROBE_TIMEOUT * 2, async {
                let a = first
                    .get_actual_cost(tonic::Request::new(canned_actual_request()))
                    .await?;
                let b = second
                    .get_actual_cost(tonic::Request::new(canned_actual_request()))
                    .await?;
                Ok::<_, tonic::Status>((a.into_inner(), b.into_inner()))
            })
            .await;
            tests.push(match outcome {
                Ok(Ok((a, b))) => {
                    let urns = |entries: &[crate::proto::CostEntry]| -> Vec<String> {
                        entries.iter().map(|e| e.urn.clone()).collect()
                    };
                    if urns(&a.entries) == urns(&b.entries) {
                        pass("deterministic_ordering", started)
                    } else {
                        fail(
                            "deterministic_ordering",
                            started,
                            "identical calls returned entries in different orders",
                        )
                    }
                }
                Ok(Err(status)) => fail("deterministic_ordering", started, status.to_string()),
                Err(_) => fail("deterministic_ordering", started, "calls timed out"),
            });
        }
    }
}

fn canned_actual_request() -> GetActualCostRequest {
    let end = chrono::Utc::now();
    let start = end - chrono::Duration::hours(24);
    GetActualCostRequest {
        resources: vec![ResourceDescriptor {
            urn: "urn:pulumi:conformance::probe::aws:ec2/instance:Instance::canary".to_string(),
            resource_type: "aws:ec2/instance:Instance".to_string(),
            provider: "aws".to_string(),
            region: "us-east-1".to_string(),
            tags: Default::default(),
            inputs_json: String::new(),
        }],
        start: start.to_rfc3339(),
        end: end.to_rfc3339(),
        granularity: "daily".to_string(),
    }
}

fn pass(name: &str, started: Instant) -> ValidationTest {
    ValidationTest {
        name: name.to_string(),
        passed: true,
        duration_ms: started.elapsed().as_millis() as u64,
        error: None,
    }
}

fn fail(name: &str, started: Instant, error: impl Into<String>) -> ValidationTest {
    ValidationTest {
        name: name.to_string(),
        passed: false,
        duration_ms: started.elapsed().as_millis() as u64,
        error: Some(error.into()),
    }
}
