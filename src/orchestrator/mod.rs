//! Adapter around the external `pulumicost` binary: one-shot invocations
//! returning a single JSON document and a streaming mode emitting
//! newline-delimited frames through a bounded queue.

pub mod adapter;
pub mod frames;
pub mod stream;

pub use adapter::OrchestratorClient;
pub use frames::{AnalyzeFrame, CostDocument, RawResource};
pub use stream::{AnalyzeReceiver, STREAM_QUEUE_CAPACITY};
