//! Supervisor, fan-out, and conformance tests against an in-process fake
//! cost-source plugin.

mod helpers;

use pretty_assertions::assert_eq;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use pulumicost_mcp::config::{Config, PluginsConfig};
use pulumicost_mcp::conformance::ConformanceValidator;
use pulumicost_mcp::domain::{
    CloudProvider, ConformanceLevel, CostKind, CostQuery, ErrorKind, HealthStatus, TimeRange,
};
use pulumicost_mcp::mcp::{Dispatcher, NullSink, JsonRpcRequest, RequestId, JSONRPC_VERSION};
use pulumicost_mcp::observability::Metrics;
use pulumicost_mcp::plugins::PluginSupervisor;
use pulumicost_mcp::services::Services;

const ACTUAL_AWS: &str = r#"{"supports_actual": true, "providers": ["aws"]}"#;

fn supervisor_for(dir: &Path) -> Arc<PluginSupervisor> {
    let config = PluginsConfig {
        directory: dir.to_path_buf(),
        dial_timeout: std::time::Duration::from_millis(500),
        ..Default::default()
    };
    Arc::new(PluginSupervisor::new(
        config,
        Arc::new(Metrics::new().unwrap()),
    ))
}

fn january() -> TimeRange {
    TimeRange {
        start: "2024-01-01T00:00:00Z".parse().unwrap(),
        end: "2024-01-31T00:00:00Z".parse().unwrap(),
    }
}

#[tokio::test]
async fn test_probe_live_plugin_is_healthy() {
    let (addr, server) = helpers::spawn_plugin(helpers::FakePlugin::default()).await;
    let dir = tempfile::tempdir().unwrap();
    helpers::write_manifest(dir.path(), "fake", "fake-plugin", &addr, ACTUAL_AWS);

    let supervisor = supervisor_for(dir.path());
    supervisor.scan().await;

    let health = supervisor.probe("fake-plugin").await.unwrap();
    assert_eq!(health.status, HealthStatus::Healthy);
    assert!(health.latency_ms.is_some());
    assert!(health.error.is_none());

    server.cancel();
}

#[tokio::test]
async fn test_probe_not_serving_plugin_is_unhealthy() {
    let plugin = helpers::FakePlugin {
        healthy: false,
        ..Default::default()
    };
    let (addr, server) = helpers::spawn_plugin(plugin).await;
    let dir = tempfile::tempdir().unwrap();
    helpers::write_manifest(dir.path(), "fake", "fake-plugin", &addr, ACTUAL_AWS);

    let supervisor = supervisor_for(dir.path());
    supervisor.scan().await;

    let health = supervisor.probe("fake-plugin").await.unwrap();
    assert_eq!(health.status, HealthStatus::Unhealthy);
    assert!(health.error.is_some());

    server.cancel();
}

#[tokio::test]
async fn test_call_actual_returns_cost_result() {
    let (addr, server) = helpers::spawn_plugin(helpers::FakePlugin::default()).await;
    let dir = tempfile::tempdir().unwrap();
    helpers::write_manifest(dir.path(), "fake", "fake-plugin", &addr, ACTUAL_AWS);

    let supervisor = supervisor_for(dir.path());
    supervisor.scan().await;

    let result = supervisor
        .call_actual(
            &CancellationToken::new(),
            "fake-plugin",
            vec![],
            &january(),
            None,
        )
        .await
        .unwrap();
    assert_eq!(result.total_monthly, 10.5);
    assert_eq!(result.by_provider["aws"], 10.5);

    server.cancel();
}

/// One live plugin and one unreachable plugin: the live result comes back,
/// the dead one is a per-plugin failure, and the overall call succeeds.
#[tokio::test]
async fn test_fanout_partial_failure() {
    let (addr, server) = helpers::spawn_plugin(helpers::FakePlugin::default()).await;
    let dir = tempfile::tempdir().unwrap();
    helpers::write_manifest(dir.path(), "live", "plugin-a", &addr, ACTUAL_AWS);
    helpers::write_manifest(dir.path(), "dead", "plugin-b", "127.0.0.1:1", ACTUAL_AWS);

    let mut config = Config::default();
    config.plugins.directory = dir.path().to_path_buf();
    config.plugins.dial_timeout = std::time::Duration::from_millis(500);
    let metrics = Arc::new(Metrics::new().unwrap());
    let services = Services::new(&config, Arc::clone(&metrics));
    services.supervisor.scan().await;

    let report = services
        .plugin
        .query_plugin_costs(
            &CancellationToken::new(),
            serde_json::from_value(json!({
                "provider": "aws",
                "kind": "actual",
                "query": {
                    "stack_name": "prod",
                    "time_range": {"start": "2024-01-01T00:00:00Z", "end": "2024-01-31T00:00:00Z"}
                }
            }))
            .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 1);
    let ok = report.results.iter().find(|r| r.plugin == "plugin-a").unwrap();
    assert_eq!(ok.result.as_ref().unwrap().total_monthly, 10.5);
    let dead = report.results.iter().find(|r| r.plugin == "plugin-b").unwrap();
    assert_eq!(dead.error_kind, Some(ErrorKind::PluginUnavailable));

    // The failed call shows up on the plugin error counter.
    let text = metrics.export().unwrap();
    assert!(text.contains("plugin_calls_total{plugin=\"plugin-b\",status=\"error\"} 1"));

    // Health probes agree with the fan-out outcome.
    let infos = services
        .plugin
        .list_plugins(
            &CancellationToken::new(),
            serde_json::from_value(json!({"include_health": true})).unwrap(),
        )
        .await
        .unwrap();
    let a = infos.iter().find(|i| i.plugin.name == "plugin-a").unwrap();
    let b = infos.iter().find(|i| i.plugin.name == "plugin-b").unwrap();
    assert_eq!(a.plugin.health.status, HealthStatus::Healthy);
    assert_eq!(b.plugin.health.status, HealthStatus::Unhealthy);

    server.cancel();
}

#[tokio::test]
async fn test_all_plugins_failed_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    helpers::write_manifest(dir.path(), "dead", "plugin-b", "127.0.0.1:1", ACTUAL_AWS);

    let mut config = Config::default();
    config.plugins.directory = dir.path().to_path_buf();
    config.plugins.dial_timeout = std::time::Duration::from_millis(200);
    let services = Services::new(&config, Arc::new(Metrics::new().unwrap()));
    services.supervisor.scan().await;

    let err = services
        .plugin
        .query_plugin_costs(
            &CancellationToken::new(),
            serde_json::from_value(json!({
                "provider": "aws",
                "kind": "actual",
                "query": {
                    "stack_name": "prod",
                    "time_range": {"start": "2024-01-01T00:00:00Z", "end": "2024-01-31T00:00:00Z"}
                }
            }))
            .unwrap(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InternalError);
    assert!(err.to_string().contains("all_plugins_failed"));
}

#[tokio::test]
async fn test_empty_directory_lists_no_plugins() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = supervisor_for(dir.path());
    supervisor.scan().await;
    assert!(supervisor.list().await.is_empty());
}

#[tokio::test]
async fn test_supervisor_direct_query_supporting_none() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = supervisor_for(dir.path());
    supervisor.scan().await;
    let results = pulumicost_mcp::plugins::query_all_supporting(
        &supervisor,
        &CancellationToken::new(),
        &CostQuery {
            stack_name: Some("prod".to_string()),
            time_range: Some(january()),
            ..Default::default()
        },
        CloudProvider::Aws,
        CostKind::Actual,
    )
    .await
    .unwrap();
    assert!(results.is_empty());
}

#[tokio::test]
async fn test_conformance_full_battery_passes() {
    let (addr, server) = helpers::spawn_plugin(helpers::FakePlugin::default()).await;
    let dir = tempfile::tempdir().unwrap();
    helpers::write_manifest(dir.path(), "fake", "fake-plugin", &addr, ACTUAL_AWS);

    let validator = ConformanceValidator::new(std::time::Duration::from_secs(1));
    let report = validator
        .validate(&dir.path().join("fake"), ConformanceLevel::Full)
        .await
        .unwrap();

    assert!(report.passed, "failed tests: {:?}", report.tests);
    let names: Vec<&str> = report.tests.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "connect",
            "health_check_responds",
            "name_non_empty",
            "actual_cost_canned",
            "unsupported_resource_error",
            "resource_filtering",
            "time_range_handling",
            "deterministic_ordering",
        ]
    );

    server.cancel();
}

#[tokio::test]
async fn test_conformance_bad_level_fails_synchronously() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.plugins.directory = dir.path().to_path_buf();
    let services = Services::new(&config, Arc::new(Metrics::new().unwrap()));

    let err = services
        .plugin
        .validate_plugin(
            &CancellationToken::new(),
            serde_json::from_value(json!({
                "plugin_path": "/nonexistent",
                "conformance_level": "EXTREME"
            }))
            .unwrap(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationError);
}

#[tokio::test]
async fn test_get_plugin_info_unknown_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.plugins.directory = dir.path().to_path_buf();
    let metrics = Arc::new(Metrics::new().unwrap());
    let services = Services::new(&config, Arc::clone(&metrics));
    let dispatcher = Dispatcher::new(services, metrics, &config);

    let response = dispatcher
        .handle(
            JsonRpcRequest {
                jsonrpc: JSONRPC_VERSION.to_string(),
                id: Some(RequestId::Number(1)),
                method: "tools/call".to_string(),
                params: Some(json!({
                    "name": "get_plugin_info",
                    "arguments": {"plugin_name": "missing"}
                })),
            },
            &NullSink,
        )
        .await
        .unwrap();
    let error = response.error.unwrap();
    assert_eq!(error.data.unwrap()["kind"], "not_found");
}
