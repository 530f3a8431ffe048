//! Typed configuration envelope. Recognized options are enumerated in one
//! struct tree; the loader fills it from an optional YAML file, applies
//! environment overrides, and validates ranges before anything starts.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::{GatewayError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub orchestrator: OrchestratorConfig,
    pub plugins: PluginsConfig,
    pub mcp: McpConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub log_level: String,

    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "localhost".to_string(),
            log_level: "info".to_string(),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Path to the pulumicost binary. Required; absence is fatal at startup.
    pub binary_path: PathBuf,

    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub stream_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            binary_path: PathBuf::new(),
            timeout: Duration::from_secs(30),
            stream_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    /// Directory scanned for plugin manifests. Required.
    pub directory: PathBuf,

    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    pub max_concurrent: usize,

    #[serde(with = "humantime_serde")]
    pub health_check_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub dial_timeout: Duration,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::new(),
            timeout: Duration::from_secs(30),
            max_concurrent: 10,
            health_check_interval: Duration::from_secs(60),
            dial_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct McpConfig {
    pub enable_streaming: bool,

    /// Maximum inbound frame size in bytes, enforced by the transport
    /// before a request reaches the dispatcher.
    pub max_message_size: usize,

    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            enable_streaming: true,
            max_message_size: 10 * 1024 * 1024,
            request_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub metrics_enabled: bool,
    pub tracing_enabled: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracing_endpoint: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            tracing_enabled: false,
            tracing_endpoint: None,
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::config(format!("cannot read {}: {e}", path.display())))?;
        serde_yaml::from_str(&contents)
            .map_err(|e| GatewayError::config(format!("cannot parse {}: {e}", path.display())))
    }

    /// Load from an optional file path, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    /// Environment variables take precedence over the file.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(port) = env_var("MCP_SERVER_PORT") {
            self.server.port = port
                .parse()
                .map_err(|_| GatewayError::config(format!("MCP_SERVER_PORT: not a port: {port}")))?;
        }
        if let Some(host) = env_var("MCP_SERVER_HOST") {
            self.server.host = host;
        }
        if let Some(level) = env_var("MCP_LOG_LEVEL") {
            self.server.log_level = level;
        }
        if let Some(path) = env_var("PULUMICOST_CORE_PATH") {
            self.orchestrator.binary_path = PathBuf::from(path);
        }
        if let Some(dir) = env_var("PULUMICOST_PLUGIN_DIR") {
            self.plugins.directory = PathBuf::from(dir);
        }
        if let Some(timeout) = env_var("PLUGIN_TIMEOUT") {
            self.plugins.timeout = humantime::parse_duration(&timeout).map_err(|e| {
                GatewayError::config(format!("PLUGIN_TIMEOUT: not a duration: {e}"))
            })?;
        }
        if let Some(n) = env_var("PLUGIN_MAX_CONCURRENT") {
            self.plugins.max_concurrent = n.parse().map_err(|_| {
                GatewayError::config(format!("PLUGIN_MAX_CONCURRENT: not an integer: {n}"))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !matches!(
            self.server.log_level.as_str(),
            "debug" | "info" | "warn" | "error"
        ) {
            return Err(GatewayError::config(format!(
                "server.log_level must be one of debug, info, warn, error; got {:?}",
                self.server.log_level
            )));
        }
        if self.orchestrator.binary_path.as_os_str().is_empty() {
            return Err(GatewayError::config(
                "orchestrator.binary_path is required (or set PULUMICOST_CORE_PATH)",
            ));
        }
        if !self.orchestrator.binary_path.is_file() {
            return Err(GatewayError::config(format!(
                "orchestrator binary not found: {}",
                self.orchestrator.binary_path.display()
            )));
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&self.orchestrator.binary_path)
                .map_err(|e| GatewayError::config(format!("orchestrator binary: {e}")))?
                .permissions()
                .mode();
            if mode & 0o111 == 0 {
                return Err(GatewayError::config(format!(
                    "orchestrator binary is not executable: {}",
                    self.orchestrator.binary_path.display()
                )));
            }
        }
        if self.plugins.directory.as_os_str().is_empty() {
            return Err(GatewayError::config(
                "plugins.directory is required (or set PULUMICOST_PLUGIN_DIR)",
            ));
        }
        if self.plugins.max_concurrent == 0 {
            return Err(GatewayError::config("plugins.max_concurrent must be >= 1"));
        }
        if self.mcp.max_message_size < 1024 {
            return Err(GatewayError::config("mcp.max_message_size must be >= 1024"));
        }
        if self.mcp.request_timeout.is_zero() {
            return Err(GatewayError::config("mcp.request_timeout must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "localhost");
        assert_eq!(config.orchestrator.timeout, Duration::from_secs(30));
        assert_eq!(config.orchestrator.stream_timeout, Duration::from_secs(300));
        assert_eq!(config.plugins.max_concurrent, 10);
        assert_eq!(config.plugins.dial_timeout, Duration::from_secs(2));
        assert_eq!(config.mcp.max_message_size, 10 * 1024 * 1024);
        assert!(config.mcp.enable_streaming);
    }

    #[test]
    fn test_yaml_round_trip() {
        let yaml = r#"
server:
  port: 9090
  log_level: debug
orchestrator:
  binary_path: /usr/local/bin/pulumicost
  timeout: 45s
plugins:
  directory: /var/lib/pulumicost/plugins
  max_concurrent: 4
mcp:
  request_timeout: 2m
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.orchestrator.timeout, Duration::from_secs(45));
        assert_eq!(config.plugins.max_concurrent, 4);
        assert_eq!(config.mcp.request_timeout, Duration::from_secs(120));
        // Untouched sections keep their defaults.
        assert_eq!(config.server.shutdown_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_validate_requires_binary() {
        let config = Config {
            plugins: PluginsConfig {
                directory: PathBuf::from("/tmp"),
                ..Default::default()
            },
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("binary_path"));
    }

    #[test]
    fn test_validate_rejects_bad_log_level() {
        let mut config = Config::default();
        config.server.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }
}
