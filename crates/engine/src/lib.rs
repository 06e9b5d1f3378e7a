//! Top-level façade over the execution engine: registry lookup, sandboxed
//! invocation, resource accounting, and result batching behind a single
//! `handle` entry point.

pub mod config;
pub mod engine;

pub use config::EngineConfig;
pub use engine::Engine;

pub use accounting::{Accountant, ResourceDelta, ResourceUsage};
pub use fetch::{Body, BodyError, Headers, Request, Response};
pub use pool::{FaultKind, PoolConfig, PoolMetrics};
pub use registry::{Deployment, InMemoryRegistry, Registry};
pub use results::{InvocationResult, ResultSink, SinkError, SqliteSink};
