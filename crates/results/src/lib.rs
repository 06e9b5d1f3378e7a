//! Buffered persistence of per-invocation results.
//!
//! Results are telemetry, not transactional request outcomes: the pipeline
//! absorbs bursty write load off the request path and delivers batches to
//! the sink at most once. A failed flush is logged and the batch dropped.

pub mod pipeline;
pub mod record;
pub mod sink;

pub use pipeline::Pipeline;
pub use record::InvocationResult;
pub use sink::{MemorySink, ResultSink, SinkError, SqliteSink};
