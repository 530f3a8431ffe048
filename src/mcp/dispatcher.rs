use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, Instrument};

use crate::config::Config;
use crate::domain::{GatewayError, Result, TimeoutScope};
use crate::observability::{tool_span, Metrics};
use crate::orchestrator::AnalyzeFrame;
use crate::services::Services;

use super::progress::{ProgressSink, ProgressTracker};
use super::protocol::{
    JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId,
    JSONRPC_VERSION,
};
use super::registry::{ToolDef, ToolRegistry};

/// MCP protocol revision this server speaks.
const PROTOCOL_VERSION: &str = "2024-11-05";

/// Owns the MCP-facing surface: the tool registry, request routing, progress
/// fan-out, and error mapping. Transports feed it one request at a time and
/// forward whatever notifications it emits.
pub struct Dispatcher {
    services: Services,
    registry: ToolRegistry,
    metrics: Arc<Metrics>,
    request_timeout: Duration,
    stream_timeout: Duration,
    enable_streaming: bool,
    shutdown: CancellationToken,
    inflight: Mutex<HashMap<RequestId, CancellationToken>>,
}

impl Dispatcher {
    pub fn new(services: Services, metrics: Arc<Metrics>, config: &Config) -> Self {
        Self {
            services,
            registry: ToolRegistry::new(),
            metrics,
            request_timeout: config.mcp.request_timeout,
            // Streaming tools get the orchestrator's streaming cap plus
            // headroom for queue drain.
            stream_timeout: config.orchestrator.stream_timeout + Duration::from_secs(5),
            enable_streaming: config.mcp.enable_streaming,
            shutdown: CancellationToken::new(),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Token parenting every request context; cancelling it begins shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Handle one inbound frame. `None` means no response is owed: the
    /// frame was a notification, or the request was cancelled.
    pub async fn handle(
        &self,
        request: JsonRpcRequest,
        sink: &dyn ProgressSink,
    ) -> Option<JsonRpcResponse> {
        if request.jsonrpc != JSONRPC_VERSION {
            return request.id.map(|id| {
                JsonRpcResponse::failure(
                    id,
                    JsonRpcError::invalid_request("unsupported jsonrpc version"),
                )
            });
        }

        match request.method.as_str() {
            "initialize" => request.id.map(|id| {
                JsonRpcResponse::success(
                    id,
                    serde_json::json!({
                        "protocolVersion": PROTOCOL_VERSION,
                        "serverInfo": {
                            "name": "pulumicost-mcp",
                            "version": crate::VERSION,
                        },
                        "capabilities": { "tools": {} },
                    }),
                )
            }),
            "ping" => request
                .id
                .map(|id| JsonRpcResponse::success(id, serde_json::json!({}))),
            "tools/list" => request.id.map(|id| {
                JsonRpcResponse::success(
                    id,
                    serde_json::json!({ "tools": self.registry.list() }),
                )
            }),
            "tools/call" => {
                let id = request.id?;
                self.tools_call(id, request.params, sink).await
            }
            "notifications/cancelled" => {
                self.cancel_request(request.params).await;
                None
            }
            "notifications/initialized" => None,
            other => request.id.map(|id| {
                JsonRpcResponse::failure(id, JsonRpcError::method_not_found(other))
            }),
        }
    }

    async fn cancel_request(&self, params: Option<Value>) {
        let Some(params) = params else { return };
        let id = params
            .get("request_id")
            .or_else(|| params.get("requestId"))
            .cloned();
        let Some(id) = id.and_then(|v| serde_json::from_value::<RequestId>(v).ok()) else {
            return;
        };
        if let Some(token) = self.inflight.lock().await.get(&id) {
            debug!(request_id = %id, "client cancelled request");
            token.cancel();
        }
    }

    async fn tools_call(
        &self,
        id: RequestId,
        params: Option<Value>,
        sink: &dyn ProgressSink,
    ) -> Option<JsonRpcResponse> {
        let (name, arguments) = match parse_call_params(params) {
            Ok(pair) => pair,
            Err(error) => return Some(JsonRpcResponse::failure(id, (&error).into())),
        };

        let Some(tool) = self.registry.get(&name) else {
            let error = JsonRpcError {
                data: Some(serde_json::json!({ "kind": "not_found", "details": Value::Null })),
                ..JsonRpcError::method_not_found(&name)
            };
            return Some(JsonRpcResponse::failure(id, error));
        };
        let tool = tool.clone();

        let token = self.shutdown.child_token();
        self.inflight.lock().await.insert(id.clone(), token.clone());

        let started = Instant::now();
        let span = tool_span(tool.service, tool.name, &id.to_string());
        let outcome = self
            .run_tool(&tool, &id, arguments, &token, sink)
            .instrument(span)
            .await;

        self.inflight.lock().await.remove(&id);
        let duration = started.elapsed();
        let status = match &outcome {
            Ok(_) => "ok",
            Err(error) => error.kind().as_str(),
        };
        self.metrics.record_request(
            tool.service,
            tool.name,
            duration,
            outcome.as_ref().err().map(|e| e.kind()),
        );
        info!(
            service = tool.service,
            method = tool.name,
            duration_ms = duration.as_millis() as u64,
            status,
            request_id = %id,
            "tool call finished"
        );

        match outcome {
            Ok(result) => Some(JsonRpcResponse::success(id, result)),
            // Writer-wins: a cancelled request produces no terminal
            // response; the stream simply closes for that id.
            Err(GatewayError::Cancelled) => None,
            Err(error) => Some(JsonRpcResponse::failure(id, (&error).into())),
        }
    }

    async fn run_tool(
        &self,
        tool: &ToolDef,
        id: &RequestId,
        arguments: Value,
        token: &CancellationToken,
        sink: &dyn ProgressSink,
    ) -> Result<Value> {
        if tool.streaming {
            return self.run_streaming(id, arguments, token, sink).await;
        }

        let handler = self.invoke(tool.name, arguments, token);
        tokio::pin!(handler);
        tokio::select! {
            result = &mut handler => result,
            _ = token.cancelled() => Err(GatewayError::Cancelled),
            _ = tokio::time::sleep(self.request_timeout) => {
                token.cancel();
                Err(GatewayError::timeout(TimeoutScope::Request, self.request_timeout))
            }
        }
    }

    /// Streaming tool: forward progress frames as notifications, then turn
    /// the terminal frame into the response. At most one terminal outcome
    /// leaves here.
    async fn run_streaming(
        &self,
        id: &RequestId,
        arguments: Value,
        token: &CancellationToken,
        sink: &dyn ProgressSink,
    ) -> Result<Value> {
        let params = parse_args(arguments)?;
        let mut frames = self.services.cost.analyze_stack(token, params).await?;

        let mut tracker = ProgressTracker::new();
        let deadline = tokio::time::sleep(self.stream_timeout);
        tokio::pin!(deadline);

        loop {
            let frame = tokio::select! {
                frame = frames.recv() => frame,
                _ = token.cancelled() => return Err(GatewayError::Cancelled),
                _ = &mut deadline => {
                    token.cancel();
                    return Err(GatewayError::timeout(TimeoutScope::Request, self.stream_timeout));
                }
            };
            match frame {
                Some(Ok(AnalyzeFrame::Progress { percent, message })) => {
                    if !self.enable_streaming {
                        continue;
                    }
                    if let Some(admitted) = tracker.admit(percent) {
                        sink.notify(JsonRpcNotification::progress(
                            id,
                            admitted,
                            message.as_deref(),
                        ))
                        .await;
                    }
                }
                Some(Ok(AnalyzeFrame::Partial { .. })) => {
                    // Partial results are not part of the notification
                    // contract; the terminal frame carries the full result.
                    debug!(request_id = %id, "partial result frame received");
                }
                Some(Ok(AnalyzeFrame::Final {
                    result,
                    recommendations,
                })) => {
                    let cost = result.into_result(&[])?;
                    let mut payload = serde_json::to_value(cost)?;
                    if let Some(recommendations) = recommendations {
                        payload["recommendations"] = serde_json::to_value(recommendations)?;
                    }
                    return Ok(payload);
                }
                Some(Err(error)) => return Err(error),
                None => return Err(GatewayError::Cancelled),
            }
        }
    }

    /// Route one unary tool to its service method.
    async fn invoke(
        &self,
        name: &str,
        arguments: Value,
        token: &CancellationToken,
    ) -> Result<Value> {
        match name {
            "analyze_projected" => to_value(
                self.services
                    .cost
                    .analyze_projected(token, parse_args(arguments)?)
                    .await?,
            ),
            "get_actual" => to_value(
                self.services
                    .cost
                    .get_actual(token, parse_args(arguments)?)
                    .await?,
            ),
            "compare_costs" => to_value(
                self.services
                    .cost
                    .compare_costs(token, parse_args(arguments)?)
                    .await?,
            ),
            "analyze_resource" => to_value(
                self.services
                    .cost
                    .analyze_resource(token, parse_args(arguments)?)
                    .await?,
            ),
            "query_by_tags" => to_value(
                self.services
                    .cost
                    .query_by_tags(token, parse_args(arguments)?)
                    .await?,
            ),
            "list_plugins" => to_value(
                self.services
                    .plugin
                    .list_plugins(token, parse_args(arguments)?)
                    .await?,
            ),
            "get_plugin_info" => to_value(
                self.services
                    .plugin
                    .get_plugin_info(token, parse_args(arguments)?)
                    .await?,
            ),
            "validate_plugin" => to_value(
                self.services
                    .plugin
                    .validate_plugin(token, parse_args(arguments)?)
                    .await?,
            ),
            "health_check" => to_value(
                self.services
                    .plugin
                    .health_check(token, parse_args(arguments)?)
                    .await?,
            ),
            "query_plugin_costs" => to_value(
                self.services
                    .plugin
                    .query_plugin_costs(token, parse_args(arguments)?)
                    .await?,
            ),
            "get_recommendations" => to_value(
                self.services
                    .analysis
                    .get_recommendations(token, parse_args(arguments)?)
                    .await?,
            ),
            "detect_anomalies" => to_value(
                self.services
                    .analysis
                    .detect_anomalies(token, parse_args(arguments)?)
                    .await?,
            ),
            "forecast" => to_value(
                self.services
                    .analysis
                    .forecast(token, parse_args(arguments)?)
                    .await?,
            ),
            "track_budget" => to_value(
                self.services
                    .analysis
                    .track_budget(token, parse_args(arguments)?)
                    .await?,
            ),
            other => Err(GatewayError::not_found(format!("tool {other}"))),
        }
    }
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

fn parse_call_params(params: Option<Value>) -> Result<(String, Value)> {
    let params =
        params.ok_or_else(|| GatewayError::validation("params", "tools/call requires params"))?;
    let name = params
        .get("name")
        .and_then(|v| v.as_str())
        .ok_or_else(|| GatewayError::validation("params.name", "tool name is required"))?
        .to_string();
    let arguments = params
        .get("arguments")
        .cloned()
        .unwrap_or_else(|| Value::Object(Default::default()));
    Ok((name, arguments))
}

/// Deserialize tool arguments into the typed params struct. Failures become
/// `validation_error` carrying serde's path-bearing message.
fn parse_args<P: serde::de::DeserializeOwned>(arguments: Value) -> Result<P> {
    serde_json::from_value(arguments)
        .map_err(|e| GatewayError::validation("arguments", e.to_string()))
}
