//! Isolate lifecycle management for multi-tenant handler execution.
//!
//! One execution context exists per live deployment, owned by exactly one
//! worker thread. Consistent hashing routes every invocation for a
//! deployment to its owning worker, so invocations against one context are
//! serialized by the worker's queue while distinct deployments execute
//! concurrently across workers.

pub mod envelope;
pub mod fault;
pub mod idle;
pub mod isolate_pool;
pub mod shim;

pub use envelope::{RequestPayload, ResponseEnvelope};
pub use fault::FaultKind;
pub use idle::IdleCache;
pub use isolate_pool::{ContextUsage, Invocation, IsolatePool, PoolConfig, PoolHooks, PoolMetrics};
