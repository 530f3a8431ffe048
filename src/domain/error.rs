use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Which of the nested deadlines expired, narrowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutScope {
    Plugin,
    Orchestrator,
    Request,
}

impl std::fmt::Display for TimeoutScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutScope::Plugin => write!(f, "plugin"),
            TimeoutScope::Orchestrator => write!(f, "orchestrator"),
            TimeoutScope::Request => write!(f, "request"),
        }
    }
}

/// Domain error kind, surfaced to MCP clients in `error.data.kind` and used
/// as the `kind` label on the error counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationError,
    NotFound,
    TimeoutError,
    Cancelled,
    PluginUnavailable,
    OrchestratorExit,
    OrchestratorDecode,
    ConformanceFailure,
    InternalError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::NotFound => "not_found",
            ErrorKind::TimeoutError => "timeout_error",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::PluginUnavailable => "plugin_unavailable",
            ErrorKind::OrchestratorExit => "orchestrator_exit",
            ErrorKind::OrchestratorDecode => "orchestrator_decode",
            ErrorKind::ConformanceFailure => "conformance_failure",
            ErrorKind::InternalError => "internal_error",
        }
    }
}

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("validation error at {field}: {message}")]
    Validation { field: String, message: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{scope} deadline of {timeout:?} expired")]
    Timeout { scope: TimeoutScope, timeout: Duration },

    #[error("request cancelled")]
    Cancelled,

    #[error("plugin {plugin} unavailable: {reason}")]
    PluginUnavailable { plugin: String, reason: String },

    #[error("orchestrator exited with status {status}: {stderr}")]
    OrchestratorExit { status: i32, stderr: String },

    #[error("orchestrator output could not be decoded: {0}")]
    OrchestratorDecode(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error ({tag}): {message}")]
    Internal { tag: String, message: String },
}

impl GatewayError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        GatewayError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        GatewayError::NotFound(what.into())
    }

    pub fn timeout(scope: TimeoutScope, timeout: Duration) -> Self {
        GatewayError::Timeout { scope, timeout }
    }

    pub fn plugin_unavailable(plugin: impl Into<String>, reason: impl Into<String>) -> Self {
        GatewayError::PluginUnavailable {
            plugin: plugin.into(),
            reason: reason.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        GatewayError::Config(msg.into())
    }

    pub fn internal(tag: impl Into<String>, message: impl Into<String>) -> Self {
        GatewayError::Internal {
            tag: tag.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Validation { .. } => ErrorKind::ValidationError,
            GatewayError::NotFound(_) => ErrorKind::NotFound,
            GatewayError::Timeout { .. } => ErrorKind::TimeoutError,
            GatewayError::Cancelled => ErrorKind::Cancelled,
            GatewayError::PluginUnavailable { .. } => ErrorKind::PluginUnavailable,
            GatewayError::OrchestratorExit { .. } => ErrorKind::OrchestratorExit,
            GatewayError::OrchestratorDecode(_) => ErrorKind::OrchestratorDecode,
            GatewayError::Config(_)
            | GatewayError::Io(_)
            | GatewayError::Serialization(_)
            | GatewayError::Internal { .. } => ErrorKind::InternalError,
        }
    }

    /// JSON-RPC error code for this error. Unknown-tool resolution maps to
    /// -32601 in the dispatcher before a `GatewayError` is ever built, so
    /// `NotFound` here always means a domain object (plugin, resource).
    pub fn jsonrpc_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::ValidationError => -32602,
            ErrorKind::NotFound => -32001,
            ErrorKind::TimeoutError => -32002,
            ErrorKind::PluginUnavailable => -32003,
            ErrorKind::OrchestratorExit => -32004,
            ErrorKind::OrchestratorDecode => -32005,
            ErrorKind::Cancelled => -32006,
            ErrorKind::ConformanceFailure => -32007,
            ErrorKind::InternalError => -32603,
        }
    }

    /// Message safe to surface to MCP clients. Internal failures are
    /// redacted to their tag.
    pub fn client_message(&self) -> String {
        match self {
            GatewayError::Internal { tag, .. } => format!("internal error ({tag})"),
            GatewayError::Io(_) | GatewayError::Serialization(_) | GatewayError::Config(_) => {
                "internal error".to_string()
            }
            other => other.to_string(),
        }
    }
}
