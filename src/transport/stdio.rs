use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::domain::Result;
use crate::mcp::{
    Dispatcher, JsonRpcError, JsonRpcNotification, JsonRpcRequest, ProgressSink,
};

/// Line-delimited JSON-RPC over stdin/stdout. Frames are dispatched on a
/// worker set; all writes (responses and notifications) funnel through one
/// writer task so stdout stays frame-atomic. Logs go to stderr.
pub struct StdioTransport {
    dispatcher: Arc<Dispatcher>,
    max_message_size: usize,
    shutdown_timeout: Duration,
}

/// Progress sink that forwards notifications to the shared writer.
struct StdioSink {
    writer: mpsc::Sender<String>,
}

#[async_trait]
impl ProgressSink for StdioSink {
    async fn notify(&self, notification: JsonRpcNotification) {
        if let Ok(line) = serde_json::to_string(&notification) {
            let _ = self.writer.send(line).await;
        }
    }
}

impl StdioTransport {
    pub fn new(dispatcher: Arc<Dispatcher>, config: &Config) -> Self {
        Self {
            dispatcher,
            max_message_size: config.mcp.max_message_size,
            shutdown_timeout: config.server.shutdown_timeout,
        }
    }

    pub async fn run(&self) -> Result<()> {
        let (writer_tx, mut writer_rx) = mpsc::channel::<String>(64);
        let writer = tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            while let Some(line) = writer_rx.recv().await {
                if stdout.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdout.write_all(b"\n").await.is_err() {
                    break;
                }
                let _ = stdout.flush().await;
            }
        });

        let mut workers = JoinSet::new();
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            if line.len() > self.max_message_size {
                warn!(size = line.len(), "dropping oversized frame");
                let error = transport_error(format!(
                    "message exceeds maximum size of {} bytes",
                    self.max_message_size
                ));
                let _ = writer_tx.send(error).await;
                continue;
            }

            let request: JsonRpcRequest = match serde_json::from_str(&line) {
                Ok(request) => request,
                Err(e) => {
                    debug!(error = %e, "unparsable frame");
                    let _ = writer_tx.send(transport_error(format!("invalid request: {e}"))).await;
                    continue;
                }
            };

            let dispatcher = Arc::clone(&self.dispatcher);
            let writer_tx = writer_tx.clone();
            workers.spawn(async move {
                let sink = StdioSink {
                    writer: writer_tx.clone(),
                };
                if let Some(response) = dispatcher.handle(request, &sink).await {
                    match serde_json::to_string(&response) {
                        Ok(line) => {
                            let _ = writer_tx.send(line).await;
                        }
                        Err(e) => warn!(error = %e, "unserializable response"),
                    }
                }
            });
        }

        // EOF: stop reading, cancel in-flight contexts, and give workers
        // the shutdown grace window to unwind.
        info!("stdin closed; shutting down");
        self.dispatcher.shutdown_token().cancel();
        let drain = async {
            while workers.join_next().await.is_some() {}
        };
        if tokio::time::timeout(self.shutdown_timeout, drain).await.is_err() {
            warn!("workers did not drain within the shutdown window");
            workers.abort_all();
        }

        drop(writer_tx);
        let _ = writer.await;
        Ok(())
    }
}

/// Transport-level rejection: the frame never reached the dispatcher, so
/// the response carries a null id.
fn transport_error(message: String) -> String {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": null,
        "error": JsonRpcError::invalid_request(message),
    })
    .to_string()
}
