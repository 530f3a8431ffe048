use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

use crate::domain::{GatewayError, Result};

/// One long-lived gRPC channel per plugin, created on first use and reused
/// across requests. The trust boundary is the local host, so channels dial
/// loopback TCP with no transport credentials.
pub struct ChannelPool {
    dial_timeout: Duration,
    channels: Mutex<HashMap<String, Channel>>,
}

impl ChannelPool {
    pub fn new(dial_timeout: Duration) -> Self {
        Self {
            dial_timeout,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached channel for `name`, dialing `addr` if none exists.
    /// Dial failures are reported but do not evict the plugin.
    pub async fn get(&self, name: &str, addr: &str) -> Result<Channel> {
        {
            let channels = self.channels.lock().await;
            if let Some(channel) = channels.get(name) {
                return Ok(channel.clone());
            }
        }

        let endpoint = Endpoint::from_shared(format!("http://{addr}"))
            .map_err(|e| {
                GatewayError::plugin_unavailable(name, format!("invalid address {addr}: {e}"))
            })?
            .connect_timeout(self.dial_timeout);

        debug!(plugin = name, addr, "dialing plugin channel");
        let channel = endpoint.connect().await.map_err(|e| {
            GatewayError::plugin_unavailable(name, format!("dial {addr} failed: {e}"))
        })?;

        let mut channels = self.channels.lock().await;
        let channel = channels.entry(name.to_string()).or_insert(channel);
        Ok(channel.clone())
    }

    /// Drop the channel for a removed plugin.
    pub async fn remove(&self, name: &str) {
        self.channels.lock().await.remove(name);
    }

    /// Keep only channels whose plugin survived a rescan.
    pub async fn retain(&self, live: &std::collections::HashSet<String>) {
        self.channels.lock().await.retain(|name, _| live.contains(name));
    }
}
