//! Shared test fixtures: an in-process fake cost-source plugin served over
//! gRPC, a scripted fake orchestrator binary, and manifest scaffolding.

#![allow(dead_code)]

use std::io::Write;
use std::path::{Path, PathBuf};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

use pulumicost_mcp::proto::costsource::v1::health_check_response::Status as HealthStatus;
use pulumicost_mcp::proto::{
    CostEntry, CostSource, CostSourceServer, GetActualCostRequest, GetActualCostResponse,
    GetCapabilitiesRequest, GetCapabilitiesResponse, GetProjectedCostRequest,
    GetProjectedCostResponse, HealthCheckRequest, HealthCheckResponse, NameRequest, NameResponse,
};

/// Resource type the fake plugin refuses to price.
pub const UNSUPPORTED_TYPE: &str = "conformance:unsupported/resource:Never";

/// In-process cost-source plugin with canned behaviour.
pub struct FakePlugin {
    pub name: String,
    pub healthy: bool,
    pub monthly_cost: f64,
    pub currency: String,
}

impl Default for FakePlugin {
    fn default() -> Self {
        Self {
            name: "fake-plugin".to_string(),
            healthy: true,
            monthly_cost: 10.5,
            currency: "USD".to_string(),
        }
    }
}

impl FakePlugin {
    fn entries_for(&self, resources: &[pulumicost_mcp::proto::ResourceDescriptor]) -> Vec<CostEntry> {
        let default_urn = "urn:pulumi:dev::app::aws:ec2/instance:Instance::web";
        let urns: Vec<String> = if resources.is_empty() {
            vec![default_urn.to_string()]
        } else {
            resources.iter().map(|r| r.urn.clone()).collect()
        };
        urns.into_iter()
            .map(|urn| CostEntry {
                urn,
                resource_type: "aws:ec2/instance:Instance".to_string(),
                provider: "aws".to_string(),
                service: "ec2".to_string(),
                region: "us-east-1".to_string(),
                monthly_cost: self.monthly_cost,
                hourly_cost: self.monthly_cost / 730.0,
                currency: self.currency.clone(),
                tags: Default::default(),
            })
            .collect()
    }

    fn check_actual(&self, request: &GetActualCostRequest) -> Result<(), Status> {
        if let Some(resource) = request
            .resources
            .iter()
            .find(|r| r.resource_type == UNSUPPORTED_TYPE)
        {
            return Err(Status::invalid_argument(format!(
                "unsupported resource type {:?}",
                resource.resource_type
            )));
        }
        let start = chrono::DateTime::parse_from_rfc3339(&request.start)
            .map_err(|e| Status::invalid_argument(format!("bad start: {e}")))?;
        let end = chrono::DateTime::parse_from_rfc3339(&request.end)
            .map_err(|e| Status::invalid_argument(format!("bad end: {e}")))?;
        if start >= end {
            return Err(Status::invalid_argument("start must precede end"));
        }
        Ok(())
    }
}

#[tonic::async_trait]
impl CostSource for FakePlugin {
    async fn name(&self, _request: Request<NameRequest>) -> Result<Response<NameResponse>, Status> {
        Ok(Response::new(NameResponse {
            name: self.name.clone(),
            version: "0.1.0".to_string(),
        }))
    }

    async fn health_check(
        &self,
        _request: Request<HealthCheckRequest>,
    ) -> Result<Response<HealthCheckResponse>, Status> {
        let status = if self.healthy {
            HealthStatus::Serving
        } else {
            HealthStatus::NotServing
        };
        Ok(Response::new(HealthCheckResponse {
            status: status as i32,
            message: String::new(),
        }))
    }

    async fn get_capabilities(
        &self,
        _request: Request<GetCapabilitiesRequest>,
    ) -> Result<Response<GetCapabilitiesResponse>, Status> {
        Ok(Response::new(GetCapabilitiesResponse {
            supports_projected: true,
            supports_actual: true,
            providers: vec!["aws".to_string()],
            resource_types: vec![],
        }))
    }

    async fn get_projected_cost(
        &self,
        request: Request<GetProjectedCostRequest>,
    ) -> Result<Response<GetProjectedCostResponse>, Status> {
        let body = request.into_inner();
        Ok(Response::new(GetProjectedCostResponse {
            entries: self.entries_for(&body.resources),
            currency: self.currency.clone(),
        }))
    }

    async fn get_actual_cost(
        &self,
        request: Request<GetActualCostRequest>,
    ) -> Result<Response<GetActualCostResponse>, Status> {
        let body = request.into_inner();
        self.check_actual(&body)?;
        Ok(Response::new(GetActualCostResponse {
            entries: self.entries_for(&body.resources),
            currency: self.currency.clone(),
        }))
    }
}

/// Serve a fake plugin on an ephemeral loopback port. Returns the bound
/// address and a token that stops the server when cancelled.
pub async fn spawn_plugin(plugin: FakePlugin) -> (String, CancellationToken) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        let _ = tonic::transport::Server::builder()
            .add_service(CostSourceServer::new(plugin))
            .serve_with_incoming_shutdown(
                TcpListenerStream::new(listener),
                shutdown.cancelled(),
            )
            .await;
    });
    (format!("127.0.0.1:{}", addr.port()), token)
}

/// Write a plugin manifest under `dir/<subdir>/plugin.json`.
pub fn write_manifest(dir: &Path, subdir: &str, name: &str, addr: &str, capabilities: &str) {
    let plugin_dir = dir.join(subdir);
    std::fs::create_dir_all(&plugin_dir).unwrap();
    let manifest = format!(
        r#"{{
          "name": "{name}",
          "version": "0.1.0",
          "description": "test plugin",
          "grpc_address": "{addr}",
          "capabilities": {capabilities}
        }}"#
    );
    std::fs::write(plugin_dir.join("plugin.json"), manifest).unwrap();
}

/// Materialize an executable shell script standing in for the orchestrator.
pub fn fake_orchestrator_script(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("pulumicost");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "#!/bin/sh").unwrap();
    writeln!(file, "{body}").unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    path
}

/// Orchestrator script that answers every one-shot and streaming mode with
/// fixed documents, switching on the mode flag.
pub fn standard_orchestrator(dir: &Path) -> PathBuf {
    fake_orchestrator_script(
        dir,
        r#"
case "$*" in
  *--projected*)
    input=$(cat)
    case "$input" in
      *'"resources":[]'*)
        echo '{"total_monthly":0,"currency":"USD","resources":[]}'
        ;;
      *)
        echo '{"total_monthly":10.5,"currency":"USD","resources":[{"urn":"urn:pulumi:dev::app::aws:ec2/instance:Instance::web","type":"aws:ec2/instance:Instance","monthly_cost":10.5,"provider":"aws","region":"us-east-1"}]}'
        ;;
    esac
    ;;
  *--actual*)
    echo '{"total_monthly":30.0,"currency":"USD","resources":[{"urn":"urn:pulumi:prod::app::aws:ec2/instance:Instance::a","monthly_cost":12.5,"provider":"aws","region":"us-east-1","tags":{"team":"core"}},{"urn":"urn:pulumi:prod::app::aws:s3/bucket:Bucket::b","monthly_cost":7.5,"provider":"aws","region":"us-east-1","tags":{"team":"data"}},{"urn":"urn:pulumi:prod::app::azure:compute/vm:VM::c","monthly_cost":10.0,"provider":"azure","region":"westeurope"}]}'
    ;;
  *--analyze-stack*)
    echo '{"kind":"progress","percent":0}'
    echo '{"kind":"progress","percent":25,"message":"enumerating resources"}'
    echo '{"kind":"progress","percent":50}'
    echo '{"kind":"progress","percent":75}'
    echo '{"kind":"progress","percent":100}'
    echo '{"kind":"final","result":{"total_monthly":30.0,"currency":"USD","resources":[{"urn":"urn:pulumi:prod::app::aws:ec2/instance:Instance::a","monthly_cost":30.0,"provider":"aws","region":"us-east-1"}]}}'
    ;;
  *--recommendations*)
    echo '[{"id":"rec-2","type":"RIGHTSIZING","resource_urn":"urn:pulumi:prod::app::aws:ec2/instance:Instance::a","current_cost":30.0,"projected_savings":12.0,"confidence":"HIGH","description":"downsize","action_steps":["switch to t3.small"]},{"id":"rec-1","type":"IDLE_RESOURCES","resource_urn":"urn:pulumi:prod::app::aws:s3/bucket:Bucket::b","current_cost":7.5,"projected_savings":12.0,"confidence":"MEDIUM","description":"idle","action_steps":[]},{"id":"rec-3","type":"SPOT_INSTANCES","resource_urn":"urn:pulumi:prod::app::aws:ec2/instance:Instance::a","current_cost":30.0,"projected_savings":2.0,"confidence":"LOW","description":"spot","action_steps":[]}]'
    ;;
  *--anomalies*)
    echo '[{"id":"an-1","timestamp":"2024-01-10T00:00:00Z","resource_urns":[],"severity":"MEDIUM","current_cost":50.0,"baseline_cost":20.0,"deviation_percent":150.0,"potential_causes":["scale-up"]},{"id":"an-2","timestamp":"2024-01-12T00:00:00Z","resource_urns":[],"severity":"CRITICAL","current_cost":200.0,"baseline_cost":20.0,"deviation_percent":900.0,"potential_causes":[]}]'
    ;;
  *--forecast*)
    echo '{"stack_name":"prod","forecast_period":{"start":"2024-02-01T00:00:00Z","end":"2024-03-01T00:00:00Z"},"data_points":[{"timestamp":"2024-02-01T00:00:00Z","predicted_cost":31.0,"lower_bound":28.0,"upper_bound":35.0}],"confidence_level":0.95,"methodology":"linear-trend"}'
    ;;
  *)
    echo 'unknown mode' >&2
    exit 64
    ;;
esac
"#,
    )
}
