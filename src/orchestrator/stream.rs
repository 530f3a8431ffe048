use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::{GatewayError, Result, TimeoutScope};

use super::adapter::{terminate, OrchestratorClient, STDERR_CAP};
use super::frames::AnalyzeFrame;

/// Capacity of the producer→consumer queue. A full queue blocks the
/// producer, which stops reading the child's stdout and lets the pipe
/// apply backpressure to the subprocess.
pub const STREAM_QUEUE_CAPACITY: usize = 32;

/// Receiving half of a streaming analysis. Yields at most one terminal item:
/// either the `Final` frame or an error.
pub type AnalyzeReceiver = mpsc::Receiver<Result<AnalyzeFrame>>;

/// Spawn the orchestrator in streaming mode and return the frame receiver.
/// The producer task owns the child process and stops at the first terminal
/// frame, on cancellation, or when the stream deadline fires.
pub(crate) async fn analyze_stack(
    client: &OrchestratorClient,
    cancel: &CancellationToken,
    stack: &str,
    include_recommendations: bool,
) -> Result<AnalyzeReceiver> {
    let mut args = vec!["--analyze-stack", "--stack", stack, "--stream"];
    if include_recommendations {
        args.push("--include-recommendations");
    }
    debug!(binary = %client.binary.display(), stack, "starting streaming analysis");

    let mut child = Command::new(&client.binary)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            GatewayError::internal(
                "orchestrator_spawn",
                format!("cannot spawn {}: {e}", client.binary.display()),
            )
        })?;

    let stdout = child.stdout.take().ok_or_else(|| {
        GatewayError::internal("orchestrator_spawn", "child stdout unavailable")
    })?;
    let stderr = child.stderr.take().ok_or_else(|| {
        GatewayError::internal("orchestrator_spawn", "child stderr unavailable")
    })?;

    let (tx, rx) = mpsc::channel(STREAM_QUEUE_CAPACITY);
    let cancel = cancel.clone();
    let stream_timeout = client.stream_timeout;

    tokio::spawn(async move {
        // Drain stderr concurrently so the child never blocks on it.
        let stderr_task = tokio::spawn(async move {
            use tokio::io::AsyncReadExt;
            let mut buf = Vec::new();
            let mut reader = stderr.take(STDERR_CAP as u64);
            let _ = reader.read_to_end(&mut buf).await;
            buf
        });

        let mut lines = BufReader::new(stdout).lines();
        let deadline = tokio::time::sleep(stream_timeout);
        tokio::pin!(deadline);

        let outcome = loop {
            let line = tokio::select! {
                line = lines.next_line() => line,
                _ = cancel.cancelled() => break StreamEnd::Cancelled,
                _ = &mut deadline => break StreamEnd::TimedOut,
            };
            match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<AnalyzeFrame>(line) {
                        Ok(frame) => {
                            let terminal = frame.is_terminal();
                            // Blocks when the queue is full: backpressure.
                            if tx.send(Ok(frame)).await.is_err() {
                                break StreamEnd::ConsumerGone;
                            }
                            if terminal {
                                break StreamEnd::Finished;
                            }
                        }
                        Err(e) => break StreamEnd::Decode(e.to_string()),
                    }
                }
                Ok(None) => break StreamEnd::Eof,
                Err(e) => break StreamEnd::Decode(e.to_string()),
            }
        };

        match outcome {
            StreamEnd::Finished => {
                // Producer stops after the first terminal frame; reap.
                terminate(&mut child).await;
            }
            StreamEnd::Cancelled | StreamEnd::ConsumerGone => {
                // Remaining frames are dropped without forwarding.
                terminate(&mut child).await;
            }
            StreamEnd::TimedOut => {
                terminate(&mut child).await;
                let _ = tx
                    .send(Err(GatewayError::timeout(
                        TimeoutScope::Orchestrator,
                        stream_timeout,
                    )))
                    .await;
            }
            StreamEnd::Decode(message) => {
                warn!(%message, "undecodable stream frame");
                terminate(&mut child).await;
                let _ = tx.send(Err(GatewayError::OrchestratorDecode(message))).await;
            }
            StreamEnd::Eof => {
                // Stream ended without a terminal frame: classify by exit.
                let status = child.wait().await;
                let stderr = stderr_task.await.unwrap_or_default();
                let err = match status {
                    Ok(status) if status.success() => GatewayError::OrchestratorDecode(
                        "stream ended without a final frame".to_string(),
                    ),
                    Ok(status) => GatewayError::OrchestratorExit {
                        status: status.code().unwrap_or(-1),
                        stderr: String::from_utf8_lossy(&stderr).into_owned(),
                    },
                    Err(e) => GatewayError::internal("orchestrator_wait", e.to_string()),
                };
                let _ = tx.send(Err(err)).await;
            }
        }
    });

    Ok(rx)
}

enum StreamEnd {
    Finished,
    Cancelled,
    ConsumerGone,
    TimedOut,
    Decode(String),
    Eof,
}
