use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::domain::{
    CloudProvider, CostKind, CostQuery, CostResult, ErrorKind, GatewayError, Result,
};

use super::supervisor::{descriptors_from_state, PluginSupervisor};

/// Outcome of one plugin call within a fan-out. Failures are data, not
/// errors: a failing plugin never aborts the fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginResult {
    pub plugin: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<CostResult>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl PluginResult {
    pub fn ok(plugin: impl Into<String>, result: CostResult) -> Self {
        Self {
            plugin: plugin.into(),
            result: Some(result),
            error: None,
            error_kind: None,
        }
    }

    pub fn err(plugin: impl Into<String>, error: &GatewayError) -> Self {
        Self {
            plugin: plugin.into(),
            result: None,
            error: Some(error.client_message()),
            error_kind: Some(error.kind()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_some()
    }
}

/// Query every plugin whose capabilities cover `provider` and `kind`,
/// bounded by the supervisor's fan-out semaphore. Returns one entry per
/// eligible plugin once all launched calls complete; on cancellation the
/// in-flight calls are cancelled and their outcomes discarded.
pub async fn query_all_supporting(
    supervisor: &Arc<PluginSupervisor>,
    cancel: &CancellationToken,
    query: &CostQuery,
    provider: CloudProvider,
    kind: CostKind,
) -> Result<Vec<PluginResult>> {
    query.validate()?;
    if kind == CostKind::Actual {
        query.validate_for_actual()?;
    }

    let names = supervisor.supporting(provider, kind).await;
    debug!(?names, %provider, "plugin fan-out");
    if names.is_empty() {
        return Ok(Vec::new());
    }

    let descriptors = query
        .pulumi_json
        .as_ref()
        .map(descriptors_from_state)
        .unwrap_or_default();

    let mut tasks = JoinSet::new();
    for name in names {
        let supervisor = Arc::clone(supervisor);
        let semaphore = supervisor.fanout_semaphore();
        let cancel = cancel.clone();
        let descriptors = descriptors.clone();
        let time_range = query.time_range;
        let granularity = query.granularity;
        tasks.spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    return PluginResult::err(&name, &GatewayError::Cancelled);
                }
            };
            let outcome = match kind {
                CostKind::Projected => {
                    supervisor.call_projected(&cancel, &name, descriptors).await
                }
                CostKind::Actual => {
                    // Presence checked by validate_for_actual above.
                    let range = time_range.expect("actual query carries a time range");
                    supervisor
                        .call_actual(&cancel, &name, descriptors, &range, granularity)
                        .await
                }
            };
            match outcome {
                Ok(result) => PluginResult::ok(&name, result),
                Err(error) => PluginResult::err(&name, &error),
            }
        });
    }

    let mut results = Vec::new();
    loop {
        tokio::select! {
            joined = tasks.join_next() => match joined {
                Some(Ok(result)) => results.push(result),
                Some(Err(join_error)) => {
                    results.push(PluginResult::err(
                        "unknown",
                        &GatewayError::internal("fanout_join", join_error.to_string()),
                    ));
                }
                None => break,
            },
            _ = cancel.cancelled() => {
                tasks.abort_all();
                return Err(GatewayError::Cancelled);
            }
        }
    }
    results.sort_by(|a, b| a.plugin.cmp(&b.plugin));
    Ok(results)
}
