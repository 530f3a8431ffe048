use chrono::SecondsFormat;
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::OrchestratorConfig;
use crate::domain::{
    Anomaly, CostResult, Forecast, GatewayError, Granularity, Recommendation, Result,
    TimeRange, TimeoutScope,
};

use super::frames::CostDocument;
use super::stream::AnalyzeReceiver;

/// Stderr kept for diagnostics is capped at 4 KiB.
pub(crate) const STDERR_CAP: usize = 4096;

/// Grace window between the termination signal and a forced kill.
pub(crate) const KILL_GRACE: Duration = Duration::from_secs(5);

/// Client for the external `pulumicost` binary. One-shot modes read a single
/// JSON document from stdout; the streaming mode is in [`super::stream`].
#[derive(Debug, Clone)]
pub struct OrchestratorClient {
    pub(crate) binary: PathBuf,
    pub(crate) timeout: Duration,
    pub(crate) stream_timeout: Duration,
}

impl OrchestratorClient {
    pub fn new(config: &OrchestratorConfig) -> Self {
        Self {
            binary: config.binary_path.clone(),
            timeout: config.timeout,
            stream_timeout: config.stream_timeout,
        }
    }

    /// Projected cost over a Pulumi state export.
    pub async fn projected_cost(
        &self,
        cancel: &CancellationToken,
        pulumi_json: &Value,
    ) -> Result<CostResult> {
        let payload = serde_json::to_string(pulumi_json)?;
        let stdout = self
            .run_oneshot(cancel, &["--projected"], Some(payload))
            .await?;
        decode_document(&stdout)?.into_result(&[])
    }

    /// Actual (billing-backed) cost for a stack over a time range.
    pub async fn actual_cost(
        &self,
        cancel: &CancellationToken,
        stack: &str,
        range: &TimeRange,
        granularity: Option<Granularity>,
    ) -> Result<CostResult> {
        let start = range.start.to_rfc3339_opts(SecondsFormat::Secs, true);
        let end = range.end.to_rfc3339_opts(SecondsFormat::Secs, true);
        let mut args: Vec<&str> = vec![
            "--actual",
            "--stack",
            stack,
            "--start",
            start.as_str(),
            "--end",
            end.as_str(),
        ];
        if let Some(granularity) = granularity {
            args.push("--granularity");
            args.push(granularity.as_str());
        }
        let stdout = self.run_oneshot(cancel, &args, None).await?;
        decode_document(&stdout)?.into_result(&[])
    }

    /// Optimization recommendations for a stack, delegated wholesale.
    pub async fn recommendations(
        &self,
        cancel: &CancellationToken,
        stack: &str,
    ) -> Result<Vec<Recommendation>> {
        let stdout = self
            .run_oneshot(cancel, &["--recommendations", "--stack", stack], None)
            .await?;
        decode_list(&stdout, "recommendations")
    }

    /// Spending anomalies over a time range at a given sensitivity.
    pub async fn anomalies(
        &self,
        cancel: &CancellationToken,
        stack: &str,
        range: &TimeRange,
        sensitivity: f64,
    ) -> Result<Vec<Anomaly>> {
        let start = range.start.to_rfc3339_opts(SecondsFormat::Secs, true);
        let end = range.end.to_rfc3339_opts(SecondsFormat::Secs, true);
        let sensitivity = format!("{sensitivity}");
        let args = [
            "--anomalies",
            "--stack",
            stack,
            "--start",
            start.as_str(),
            "--end",
            end.as_str(),
            "--sensitivity",
            sensitivity.as_str(),
        ];
        let stdout = self.run_oneshot(cancel, &args, None).await?;
        decode_list(&stdout, "anomalies")
    }

    /// Cost forecast for a stack over a future period.
    pub async fn forecast(
        &self,
        cancel: &CancellationToken,
        stack: &str,
        period: &TimeRange,
        confidence: f64,
    ) -> Result<Forecast> {
        let start = period.start.to_rfc3339_opts(SecondsFormat::Secs, true);
        let end = period.end.to_rfc3339_opts(SecondsFormat::Secs, true);
        let confidence = format!("{confidence}");
        let args = [
            "--forecast",
            "--stack",
            stack,
            "--start",
            start.as_str(),
            "--end",
            end.as_str(),
            "--confidence",
            confidence.as_str(),
        ];
        let stdout = self.run_oneshot(cancel, &args, None).await?;
        serde_json::from_slice(&stdout)
            .map_err(|e| GatewayError::OrchestratorDecode(e.to_string()))
    }

    /// Streaming stack analysis; see [`super::stream::analyze_stack`].
    pub async fn analyze_stack(
        &self,
        cancel: &CancellationToken,
        stack: &str,
        include_recommendations: bool,
    ) -> Result<AnalyzeReceiver> {
        super::stream::analyze_stack(self, cancel, stack, include_recommendations).await
    }

    /// Spawn the binary, feed optional stdin, enforce the one-shot deadline,
    /// and return stdout on clean exit.
    pub(crate) async fn run_oneshot(
        &self,
        cancel: &CancellationToken,
        args: &[&str],
        stdin_payload: Option<String>,
    ) -> Result<Vec<u8>> {
        debug!(binary = %self.binary.display(), ?args, "invoking orchestrator");
        let mut command = Command::new(&self.binary);
        command
            .args(args)
            .stdin(if stdin_payload.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            GatewayError::internal(
                "orchestrator_spawn",
                format!("cannot spawn {}: {e}", self.binary.display()),
            )
        })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            GatewayError::internal("orchestrator_spawn", "child stdout unavailable")
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            GatewayError::internal("orchestrator_spawn", "child stderr unavailable")
        })?;
        // Drain both pipes before feeding stdin so a chatty child cannot
        // deadlock against a large payload.
        let stdout_task = tokio::spawn(read_all(stdout));
        let stderr_task = tokio::spawn(read_capped(stderr));

        if let Some(payload) = stdin_payload {
            let mut stdin = child.stdin.take().ok_or_else(|| {
                GatewayError::internal("orchestrator_spawn", "child stdin unavailable")
            })?;
            // A child that exits without reading closes the pipe; its exit
            // status decides the outcome, not the broken write.
            let _ = stdin.write_all(payload.as_bytes()).await;
            drop(stdin);
        }

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = cancel.cancelled() => {
                terminate(&mut child).await;
                return Err(GatewayError::Cancelled);
            }
            _ = tokio::time::sleep(self.timeout) => {
                terminate(&mut child).await;
                return Err(GatewayError::timeout(TimeoutScope::Orchestrator, self.timeout));
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            let code = status.code().unwrap_or(-1);
            warn!(code, "orchestrator exited nonzero");
            return Err(GatewayError::OrchestratorExit {
                status: code,
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
            });
        }
        Ok(stdout)
    }
}

async fn read_all(mut reader: impl tokio::io::AsyncRead + Unpin) -> Vec<u8> {
    use tokio::io::AsyncReadExt;
    let mut buf = Vec::new();
    let _ = reader.read_to_end(&mut buf).await;
    buf
}

/// Read stderr, keeping at most [`STDERR_CAP`] bytes.
async fn read_capped(mut reader: impl tokio::io::AsyncRead + Unpin) -> Vec<u8> {
    use tokio::io::AsyncReadExt;
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if buf.len() < STDERR_CAP {
                    let take = n.min(STDERR_CAP - buf.len());
                    buf.extend_from_slice(&chunk[..take]);
                }
                // Keep draining so the child never blocks on stderr.
            }
        }
    }
    buf
}

/// Ask the child to stop, reap within the grace window, then force.
pub(crate) async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: plain signal send to a child we own.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    tokio::select! {
        _ = child.wait() => {}
        _ = tokio::time::sleep(KILL_GRACE) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

fn decode_document(stdout: &[u8]) -> Result<CostDocument> {
    serde_json::from_slice(stdout).map_err(|e| GatewayError::OrchestratorDecode(e.to_string()))
}

/// One-shot list modes emit either a bare array or `{"<key>": [...]}`.
fn decode_list<T: serde::de::DeserializeOwned>(stdout: &[u8], key: &str) -> Result<Vec<T>> {
    let value: Value =
        serde_json::from_slice(stdout).map_err(|e| GatewayError::OrchestratorDecode(e.to_string()))?;
    let list = match &value {
        Value::Array(_) => value,
        Value::Object(map) => map
            .get(key)
            .cloned()
            .ok_or_else(|| GatewayError::OrchestratorDecode(format!("missing {key:?} key")))?,
        _ => return Err(GatewayError::OrchestratorDecode("expected array or object".into())),
    };
    serde_json::from_value(list).map_err(|e| GatewayError::OrchestratorDecode(e.to_string()))
}
