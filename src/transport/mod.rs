//! JSON-RPC 2.0 framing over stdio and HTTP+SSE. Both transports share the
//! dispatcher and enforce the maximum message size before a frame reaches
//! it.

pub mod http;
pub mod stdio;

pub use http::HttpTransport;
pub use stdio::StdioTransport;
