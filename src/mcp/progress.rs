use async_trait::async_trait;

use super::protocol::JsonRpcNotification;

/// Where progress notifications for one request go. The stdio transport
/// writes them to stdout under the writer lock; the HTTP transport pushes
/// them to the request's SSE subscribers.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn notify(&self, notification: JsonRpcNotification);
}

/// Sink that drops everything; used when streaming is disabled.
pub struct NullSink;

#[async_trait]
impl ProgressSink for NullSink {
    async fn notify(&self, _notification: JsonRpcNotification) {}
}

/// Enforces the progress contract for one request: percents are clamped to
/// non-decreasing, bounded to [0, 100], and the 100% completion is left to
/// the terminal response rather than emitted as a notification.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    last: f64,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self { last: 0.0 }
    }

    /// Admit a frame's percent. Returns the value to emit, or `None` when
    /// the frame must be swallowed (completion frames).
    pub fn admit(&mut self, percent: f64) -> Option<f64> {
        let clamped = percent.clamp(self.last, 100.0);
        if clamped >= 100.0 {
            // Completion is coincident with the terminal response.
            self.last = 100.0;
            return None;
        }
        self.last = clamped;
        Some(clamped)
    }
}
