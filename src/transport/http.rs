use async_trait::async_trait;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::stream::Stream;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::Config;
use crate::domain::{GatewayError, Result};
use crate::mcp::{Dispatcher, JsonRpcNotification, JsonRpcRequest, ProgressSink};
use crate::observability::Metrics;

/// Buffered notifications per subscribed request id.
const SSE_CHANNEL_CAPACITY: usize = 64;

type Subscribers = Arc<RwLock<HashMap<String, broadcast::Sender<String>>>>;

/// HTTP transport: `POST /rpc` for requests, an SSE companion endpoint for
/// progress notifications keyed by request id, plus `/metrics` and
/// `/healthz`. Connection-scoped state is limited to the subscriber set.
pub struct HttpTransport {
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<Metrics>,
    host: String,
    port: u16,
    max_message_size: usize,
    shutdown_timeout: Duration,
}

#[derive(Clone)]
struct AppState {
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<Metrics>,
    subscribers: Subscribers,
    ready: Arc<AtomicBool>,
}

/// Pushes notifications to whoever subscribed to this request id.
struct SseSink {
    request_id: Option<String>,
    subscribers: Subscribers,
}

#[async_trait]
impl ProgressSink for SseSink {
    async fn notify(&self, notification: JsonRpcNotification) {
        let Some(request_id) = &self.request_id else { return };
        let Ok(line) = serde_json::to_string(&notification) else {
            return;
        };
        if let Some(sender) = self.subscribers.read().await.get(request_id) {
            // A send error only means no subscriber is listening right now.
            let _ = sender.send(line);
        }
    }
}

impl HttpTransport {
    pub fn new(dispatcher: Arc<Dispatcher>, metrics: Arc<Metrics>, config: &Config) -> Self {
        Self {
            dispatcher,
            metrics,
            host: config.server.host.clone(),
            port: config.server.port,
            max_message_size: config.mcp.max_message_size,
            shutdown_timeout: config.server.shutdown_timeout,
        }
    }

    fn router(&self, state: AppState) -> Router {
        Router::new()
            .route("/rpc", post(rpc_handler))
            .route("/events/:request_id", get(events_handler))
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .layer(RequestBodyLimitLayer::new(self.max_message_size))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    pub async fn serve(&self, shutdown: CancellationToken) -> Result<()> {
        let ready = Arc::new(AtomicBool::new(false));
        let state = AppState {
            dispatcher: Arc::clone(&self.dispatcher),
            metrics: Arc::clone(&self.metrics),
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            ready: Arc::clone(&ready),
        };
        let router = self.router(state);

        let addr = format!("{}:{}", self.host, self.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| GatewayError::config(format!("cannot bind {addr}: {e}")))?;
        info!(%addr, "http transport listening");
        ready.store(true, Ordering::Release);

        let graceful = shutdown.clone();
        let server = axum::serve(listener, router)
            .with_graceful_shutdown(async move { graceful.cancelled().await });

        let shutdown_timeout = self.shutdown_timeout;
        tokio::select! {
            result = server => result.map_err(|e| GatewayError::internal("http_serve", e.to_string()))?,
            _ = async {
                shutdown.cancelled().await;
                // Drain window after the shutdown signal.
                tokio::time::sleep(shutdown_timeout).await;
            } => {
                warn!("drain window elapsed; closing listeners");
            }
        }
        Ok(())
    }
}

async fn rpc_handler(
    State(state): State<AppState>,
    Json(request): Json<JsonRpcRequest>,
) -> axum::response::Response {
    let request_id = request.id.as_ref().map(|id| id.to_string());

    // Make the channel exist before dispatch so subscribers can attach
    // while the call is still running.
    if let Some(id) = &request_id {
        state
            .subscribers
            .write()
            .await
            .entry(id.clone())
            .or_insert_with(|| broadcast::channel(SSE_CHANNEL_CAPACITY).0);
    }

    let sink = SseSink {
        request_id: request_id.clone(),
        subscribers: Arc::clone(&state.subscribers),
    };
    let response = state.dispatcher.handle(request, &sink).await;

    if let Some(id) = &request_id {
        state.subscribers.write().await.remove(id);
    }

    match response {
        Some(response) => Json(response).into_response(),
        // Notification or cancelled request: nothing to return.
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn events_handler(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let receiver = {
        let mut subscribers = state.subscribers.write().await;
        subscribers
            .entry(request_id)
            .or_insert_with(|| broadcast::channel(SSE_CHANNEL_CAPACITY).0)
            .subscribe()
    };

    let stream = BroadcastStream::new(receiver).filter_map(|item| match item {
        Ok(line) => Some(Ok(Event::default().data(line))),
        // Lagged receivers skip ahead; progress is not replayable.
        Err(_) => None,
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn metrics_handler(State(state): State<AppState>) -> axum::response::Response {
    match state.metrics.export() {
        Ok(text) => (StatusCode::OK, text).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn healthz_handler(State(state): State<AppState>) -> axum::response::Response {
    if state.ready.load(Ordering::Acquire) {
        (StatusCode::OK, "ok").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "starting").into_response()
    }
}
