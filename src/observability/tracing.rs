// Tracing initialization and span helpers.

use tracing::Span;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize the global subscriber. Logs go to stderr so the stdio
/// transport keeps stdout clean for protocol frames.
pub fn init_tracing(log_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    if json {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init();
    }
}

/// Span wrapping one tool invocation. Carries the same identifying
/// attributes as the completion log record.
pub fn tool_span(service: &str, method: &str, request_id: &str) -> Span {
    tracing::info_span!(
        "tool_call",
        service = %service,
        method = %method,
        request_id = %request_id,
    )
}
