use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tracing::{debug, info, warn};

use crate::config::PluginsConfig;
use crate::domain::{
    CloudProvider, CostResult, GatewayError, Granularity, Health, Plugin, ResourceCost, Result,
    TimeRange, TimeoutScope,
};
use crate::observability::Metrics;
use crate::proto::{
    CostEntry, CostSourceClient, GetActualCostRequest, GetProjectedCostRequest,
    HealthCheckRequest, ResourceDescriptor,
};

use super::breaker::CircuitBreaker;
use super::channel::ChannelPool;
use super::manifest;

/// Health probes race a fixed 2 s deadline.
pub const PROBE_DEADLINE: Duration = Duration::from_secs(2);

/// Background probe cadence for recently used plugins.
const BACKGROUND_PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// How recently a plugin must have been called to earn background probes.
const RECENT_USE_WINDOW: Duration = Duration::from_secs(300);

/// Registry entry owned by the supervisor for the process lifetime.
/// Services only ever see [`Plugin`] snapshots.
pub struct PluginEntry {
    plugin: RwLock<Plugin>,
    pub breaker: CircuitBreaker,
    last_used: std::sync::Mutex<Option<Instant>>,
}

impl PluginEntry {
    fn new(plugin: Plugin) -> Self {
        Self {
            plugin: RwLock::new(plugin),
            breaker: CircuitBreaker::default(),
            last_used: std::sync::Mutex::new(None),
        }
    }

    async fn snapshot(&self) -> Plugin {
        self.plugin.read().await.clone()
    }

    fn mark_used(&self) {
        *self.last_used.lock().expect("last_used lock") = Some(Instant::now());
    }

    fn recently_used(&self) -> bool {
        self.last_used
            .lock()
            .expect("last_used lock")
            .is_some_and(|at| at.elapsed() <= RECENT_USE_WINDOW)
    }
}

type Registry = Arc<HashMap<String, Arc<PluginEntry>>>;

/// Owns the set of known plugins and their gRPC channels. Registry swaps are
/// atomic: a rescan installs a new map in one step, and calls in flight keep
/// the map that was current at dispatch time.
pub struct PluginSupervisor {
    config: PluginsConfig,
    metrics: Arc<Metrics>,
    registry: RwLock<Registry>,
    channels: ChannelPool,
    fanout: Arc<Semaphore>,
}

impl PluginSupervisor {
    pub fn new(config: PluginsConfig, metrics: Arc<Metrics>) -> Self {
        let fanout = Arc::new(Semaphore::new(config.max_concurrent));
        let channels = ChannelPool::new(config.dial_timeout);
        Self {
            config,
            metrics,
            registry: RwLock::new(Arc::new(HashMap::new())),
            channels,
            fanout,
        }
    }

    pub fn fanout_semaphore(&self) -> Arc<Semaphore> {
        Arc::clone(&self.fanout)
    }

    /// Rescan the plugin directory and install the new set. Entries that
    /// keep their name and address survive with breaker and health state;
    /// removed plugins lose their channels.
    pub async fn scan(&self) {
        let discovered = manifest::scan_directory(&self.config.directory);
        let previous = self.snapshot().await;

        let mut next: HashMap<String, Arc<PluginEntry>> = HashMap::new();
        for plugin in discovered {
            let name = plugin.name.clone();
            let survivor = if let Some(existing) = previous.get(&name) {
                let same_endpoint =
                    existing.plugin.read().await.grpc_address == plugin.grpc_address;
                same_endpoint.then(|| Arc::clone(existing))
            } else {
                None
            };
            match survivor {
                Some(existing) => {
                    // Same endpoint: refresh manifest fields, keep breaker
                    // and health state.
                    {
                        let mut current = existing.plugin.write().await;
                        let health = current.health.clone();
                        *current = plugin;
                        current.health = health;
                    }
                    next.insert(name, existing);
                }
                None => {
                    next.insert(name, Arc::new(PluginEntry::new(plugin)));
                }
            }
        }

        let live: HashSet<String> = next.keys().cloned().collect();
        let removed: Vec<String> = previous
            .keys()
            .filter(|name| !live.contains(*name))
            .cloned()
            .collect();

        *self.registry.write().await = Arc::new(next);
        self.channels.retain(&live).await;

        if !removed.is_empty() {
            info!(?removed, "plugins removed from registry");
        }
        debug!(count = live.len(), "plugin registry installed");
    }

    /// Background loop: periodic rescans plus health probes for plugins
    /// that served a call recently. Runs until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut scan_tick = tokio::time::interval(self.config.health_check_interval);
        let mut probe_tick = tokio::time::interval(BACKGROUND_PROBE_INTERVAL);
        loop {
            tokio::select! {
                _ = scan_tick.tick() => self.scan().await,
                _ = probe_tick.tick() => self.probe_recently_used().await,
                _ = cancel.cancelled() => {
                    debug!("plugin supervisor stopping");
                    return;
                }
            }
        }
    }

    async fn probe_recently_used(&self) {
        let registry = self.snapshot().await;
        for (name, entry) in registry.iter() {
            if entry.recently_used() {
                let _ = self.probe(name).await;
            }
        }
    }

    async fn snapshot(&self) -> Registry {
        Arc::clone(&*self.registry.read().await)
    }

    /// Read-only snapshot of every plugin, sorted by name.
    pub async fn list(&self) -> Vec<Plugin> {
        let registry = self.snapshot().await;
        let mut plugins = Vec::with_capacity(registry.len());
        for entry in registry.values() {
            plugins.push(entry.snapshot().await);
        }
        plugins.sort_by(|a, b| a.name.cmp(&b.name));
        plugins
    }

    pub async fn get(&self, name: &str) -> Option<Plugin> {
        let registry = self.snapshot().await;
        match registry.get(name) {
            Some(entry) => Some(entry.snapshot().await),
            None => None,
        }
    }

    pub(crate) async fn entry(&self, name: &str) -> Option<Arc<PluginEntry>> {
        self.snapshot().await.get(name).map(Arc::clone)
    }

    /// Required breaker contract: callers surface availability from this.
    pub async fn is_circuit_open(&self, name: &str) -> bool {
        match self.entry(name).await {
            Some(entry) => entry.breaker.is_open(),
            None => false,
        }
    }

    /// Names of plugins whose capabilities cover the request.
    pub async fn supporting(
        &self,
        provider: CloudProvider,
        kind: crate::domain::CostKind,
    ) -> Vec<String> {
        let registry = self.snapshot().await;
        let mut names = Vec::new();
        for (name, entry) in registry.iter() {
            if entry.plugin.read().await.capabilities.covers(provider, kind) {
                names.push(name.clone());
            }
        }
        names.sort();
        names
    }

    async fn client(&self, name: &str, addr: &str) -> Result<CostSourceClient<Channel>> {
        let channel = self.channels.get(name, addr).await?;
        Ok(CostSourceClient::new(channel))
    }

    /// Force a health probe and update the plugin's health record
    /// atomically. Unknown plugins are `not_found`; a failed probe is a
    /// normal return carrying `UNHEALTHY`, not an error.
    pub async fn probe(&self, name: &str) -> Result<Health> {
        let entry = self
            .entry(name)
            .await
            .ok_or_else(|| GatewayError::not_found(format!("plugin {name}")))?;
        let addr = entry.plugin.read().await.grpc_address.clone();

        let started = Instant::now();
        let outcome = match self.client(name, &addr).await {
            Ok(mut client) => {
                tokio::time::timeout(
                    PROBE_DEADLINE,
                    client.health_check(tonic::Request::new(HealthCheckRequest {})),
                )
                .await
            }
            Err(e) => {
                let health = Health::unhealthy(e.to_string());
                self.install_health(&entry, name, health.clone()).await;
                entry.breaker.record_failure();
                return Ok(health);
            }
        };

        let latency_ms = started.elapsed().as_millis() as u64;
        let health = match outcome {
            Ok(Ok(response)) => {
                use crate::proto::costsource::v1::health_check_response::Status;
                let body = response.into_inner();
                if body.status() == Status::Serving {
                    Health::healthy(latency_ms)
                } else {
                    Health::unhealthy(format!("plugin reports {:?}", body.status()))
                }
            }
            Ok(Err(status)) => Health::unhealthy(format!("probe failed: {status}")),
            Err(_) => Health::unhealthy(format!("probe exceeded {PROBE_DEADLINE:?}")),
        };

        if health.status == crate::domain::HealthStatus::Healthy {
            entry.breaker.record_success();
        } else {
            entry.breaker.record_failure();
        }
        self.install_health(&entry, name, health.clone()).await;
        Ok(health)
    }

    async fn install_health(&self, entry: &PluginEntry, name: &str, health: Health) {
        let healthy = health.status == crate::domain::HealthStatus::Healthy;
        entry.plugin.write().await.health = health;
        self.metrics.set_plugin_health(name, healthy);
    }

    /// Actual-cost call against one plugin, breaker-gated and deadline-bound.
    pub async fn call_actual(
        &self,
        cancel: &CancellationToken,
        name: &str,
        resources: Vec<ResourceDescriptor>,
        range: &TimeRange,
        granularity: Option<Granularity>,
    ) -> Result<CostResult> {
        let request = GetActualCostRequest {
            resources,
            start: range.start.to_rfc3339(),
            end: range.end.to_rfc3339(),
            granularity: granularity.map(|g| g.as_str().to_string()).unwrap_or_default(),
        };
        self.call(cancel, name, move |mut client| async move {
            client
                .get_actual_cost(tonic::Request::new(request))
                .await
                .map(|response| {
                    let body = response.into_inner();
                    (body.entries, body.currency)
                })
        })
        .await
    }

    /// Projected-cost call against one plugin.
    pub async fn call_projected(
        &self,
        cancel: &CancellationToken,
        name: &str,
        resources: Vec<ResourceDescriptor>,
    ) -> Result<CostResult> {
        let request = GetProjectedCostRequest { resources };
        self.call(cancel, name, move |mut client| async move {
            client
                .get_projected_cost(tonic::Request::new(request))
                .await
                .map(|response| {
                    let body = response.into_inner();
                    (body.entries, body.currency)
                })
        })
        .await
    }

    async fn call<F, Fut>(
        &self,
        cancel: &CancellationToken,
        name: &str,
        rpc: F,
    ) -> Result<CostResult>
    where
        F: FnOnce(CostSourceClient<Channel>) -> Fut,
        Fut: std::future::Future<
            Output = std::result::Result<(Vec<CostEntry>, String), tonic::Status>,
        >,
    {
        let entry = self
            .entry(name)
            .await
            .ok_or_else(|| GatewayError::not_found(format!("plugin {name}")))?;

        if entry.breaker.try_acquire().is_err() {
            return Err(GatewayError::plugin_unavailable(name, "circuit open"));
        }
        entry.mark_used();

        let addr = entry.plugin.read().await.grpc_address.clone();
        let client = match self.client(name, &addr).await {
            Ok(client) => client,
            Err(e) => {
                entry.breaker.record_failure();
                self.metrics.record_plugin_call(name, Duration::ZERO, false);
                return Err(e);
            }
        };

        let started = Instant::now();
        let outcome = tokio::select! {
            outcome = tokio::time::timeout(self.config.timeout, rpc(client)) => outcome,
            _ = cancel.cancelled() => {
                // Discarded outcome: the breaker only releases its trial slot.
                entry.breaker.abandon();
                return Err(GatewayError::Cancelled);
            }
        };
        let elapsed = started.elapsed();

        match outcome {
            Ok(Ok((entries, currency))) => {
                entry.breaker.record_success();
                self.metrics.record_plugin_call(name, elapsed, true);
                entries_to_result(name, entries, &currency)
            }
            Ok(Err(status)) => {
                entry.breaker.record_failure();
                self.metrics.record_plugin_call(name, elapsed, false);
                warn!(plugin = name, %status, "plugin call failed");
                Err(GatewayError::plugin_unavailable(name, status.to_string()))
            }
            Err(_) => {
                entry.breaker.record_failure();
                self.metrics.record_plugin_call(name, elapsed, false);
                Err(GatewayError::timeout(TimeoutScope::Plugin, self.config.timeout))
            }
        }
    }
}

/// Map wire entries into a validated [`CostResult`]. No arithmetic beyond
/// the aggregation sums the result computes for itself.
fn entries_to_result(plugin: &str, entries: Vec<CostEntry>, currency: &str) -> Result<CostResult> {
    let mut resources = Vec::with_capacity(entries.len());
    for entry in entries {
        let provider: CloudProvider = entry.provider.parse().map_err(|_| {
            GatewayError::internal(
                "plugin_decode",
                format!("plugin {plugin} reported unknown provider {:?}", entry.provider),
            )
        })?;
        resources.push(ResourceCost {
            name: entry
                .urn
                .rsplit("::")
                .next()
                .unwrap_or_default()
                .to_string(),
            urn: entry.urn,
            resource_type: entry.resource_type,
            provider,
            service: entry.service,
            region: entry.region,
            monthly_cost: entry.monthly_cost,
            hourly_cost: entry.hourly_cost,
            currency: if entry.currency.is_empty() {
                None
            } else {
                Some(entry.currency)
            },
            tags: entry.tags,
            depends_on: Vec::new(),
        });
    }
    let currency = if currency.is_empty() { "USD" } else { currency };
    CostResult::from_resources(resources, currency, &[])
        .map_err(|e| GatewayError::internal("plugin_decode", e.to_string()))
}

/// Best-effort extraction of resource descriptors from a Pulumi state
/// export. Unknown shapes simply yield no descriptors; enumeration
/// ultimately belongs to the plugin.
pub fn descriptors_from_state(pulumi_json: &serde_json::Value) -> Vec<ResourceDescriptor> {
    let Some(resources) = pulumi_json.get("resources").and_then(|r| r.as_array()) else {
        return Vec::new();
    };
    resources
        .iter()
        .filter_map(|resource| {
            let urn = resource.get("urn")?.as_str()?.to_string();
            let resource_type = resource
                .get("type")
                .and_then(|t| t.as_str())
                .unwrap_or_default()
                .to_string();
            let provider = resource_type.split(':').next().unwrap_or_default().to_string();
            let inputs_json = resource
                .get("inputs")
                .map(|inputs| inputs.to_string())
                .unwrap_or_default();
            Some(ResourceDescriptor {
                urn,
                resource_type,
                provider,
                region: String::new(),
                tags: HashMap::new(),
                inputs_json,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::CostKind;
    use std::io::Write;
    use std::path::Path;

    fn write_manifest(dir: &Path, plugin: &str, body: &str) {
        let plugin_dir = dir.join(plugin);
        std::fs::create_dir_all(&plugin_dir).unwrap();
        let mut file =
            std::fs::File::create(plugin_dir.join(super::super::manifest::MANIFEST_FILE)).unwrap();
        file.write_all(body.as_bytes()).unwrap();
    }

    fn supervisor_for(dir: &Path) -> PluginSupervisor {
        let config = PluginsConfig {
            directory: dir.to_path_buf(),
            ..Default::default()
        };
        PluginSupervisor::new(config, Arc::new(Metrics::new().unwrap()))
    }

    const AWS_MANIFEST: &str = r#"{
      "name": "aws-billing",
      "version": "0.3.0",
      "grpc_address": "127.0.0.1:50051",
      "capabilities": {"supports_actual": true, "providers": ["aws"]}
    }"#;

    #[tokio::test]
    async fn test_scan_installs_and_removes() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor_for(dir.path());

        supervisor.scan().await;
        assert!(supervisor.list().await.is_empty());

        write_manifest(dir.path(), "aws", AWS_MANIFEST);
        supervisor.scan().await;
        assert_eq!(supervisor.list().await.len(), 1);
        assert!(supervisor.get("aws-billing").await.is_some());

        std::fs::remove_dir_all(dir.path().join("aws")).unwrap();
        supervisor.scan().await;
        assert!(supervisor.get("aws-billing").await.is_none());
    }

    #[tokio::test]
    async fn test_rescan_preserves_breaker_state() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), "aws", AWS_MANIFEST);
        let supervisor = supervisor_for(dir.path());
        supervisor.scan().await;

        let entry = supervisor.entry("aws-billing").await.unwrap();
        for _ in 0..5 {
            entry.breaker.record_failure();
        }
        assert!(supervisor.is_circuit_open("aws-billing").await);

        supervisor.scan().await;
        assert!(supervisor.is_circuit_open("aws-billing").await);
    }

    #[tokio::test]
    async fn test_open_breaker_fails_fast_without_network() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), "aws", AWS_MANIFEST);
        let supervisor = supervisor_for(dir.path());
        supervisor.scan().await;

        let entry = supervisor.entry("aws-billing").await.unwrap();
        for _ in 0..5 {
            entry.breaker.record_failure();
        }

        let range = TimeRange::new(
            "2024-01-01T00:00:00Z".parse().unwrap(),
            "2024-01-31T00:00:00Z".parse().unwrap(),
        )
        .unwrap();
        let err = supervisor
            .call_actual(&CancellationToken::new(), "aws-billing", vec![], &range, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::domain::ErrorKind::PluginUnavailable);
    }

    #[tokio::test]
    async fn test_supporting_filters_by_capability() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), "aws", AWS_MANIFEST);
        write_manifest(
            dir.path(),
            "gcp",
            r#"{
              "name": "gcp-costs",
              "version": "1.0.0",
              "grpc_address": "127.0.0.1:50052",
              "capabilities": {"supports_projected": true, "providers": ["gcp"]}
            }"#,
        );
        let supervisor = supervisor_for(dir.path());
        supervisor.scan().await;

        assert_eq!(
            supervisor.supporting(CloudProvider::Aws, CostKind::Actual).await,
            vec!["aws-billing".to_string()]
        );
        assert_eq!(
            supervisor.supporting(CloudProvider::Gcp, CostKind::Projected).await,
            vec!["gcp-costs".to_string()]
        );
        assert!(supervisor
            .supporting(CloudProvider::Azure, CostKind::Actual)
            .await
            .is_empty());
    }

    #[test]
    fn test_descriptors_from_state() {
        let state = serde_json::json!({
            "resources": [
                {"urn": "urn:pulumi:dev::app::aws:ec2/instance:Instance::web",
                 "type": "aws:ec2/instance:Instance",
                 "inputs": {"instanceType": "t3.micro"}}
            ]
        });
        let descriptors = descriptors_from_state(&state);
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].provider, "aws");
        assert!(descriptors[0].inputs_json.contains("t3.micro"));
    }
}
