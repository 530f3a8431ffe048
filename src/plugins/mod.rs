//! Plugin supervision: filesystem discovery, gRPC channel lifecycle, health
//! probing, per-plugin circuit breaking, and concurrency-limited fan-out
//! with partial-result aggregation.

pub mod breaker;
pub mod channel;
pub mod fanout;
pub mod manifest;
pub mod supervisor;

pub use breaker::{BreakerState, CircuitBreaker};
pub use channel::ChannelPool;
pub use fanout::{query_all_supporting, PluginResult};
pub use manifest::{load_plugin, scan_directory, MANIFEST_FILE};
pub use supervisor::{descriptors_from_state, PluginSupervisor, PROBE_DEADLINE};
