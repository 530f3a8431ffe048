//! MCP tool dispatcher: JSON-RPC 2.0 protocol types, the tool registry with
//! schema derivation, request routing with per-request deadlines and
//! cancellation, and progress-notification fan-out.

pub mod dispatcher;
pub mod progress;
pub mod protocol;
pub mod registry;

pub use dispatcher::Dispatcher;
pub use progress::{NullSink, ProgressSink, ProgressTracker};
pub use protocol::{
    codes, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId,
    JSONRPC_VERSION,
};
pub use registry::{ToolDef, ToolListing, ToolRegistry};
