//! Read-only deployment lookup consumed by the execution engine.
//!
//! The upload/versioning workflow that produces deployments lives outside
//! this workspace; it drives `InMemoryRegistry` through `insert`,
//! `set_current`, and `remove`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Deserialize;

/// An immutable, versioned bundle of code, assets, and limits belonging to
/// a function. Exactly one deployment per function is current at any time;
/// that pointer is owned by the registry, not the engine.
#[derive(Debug, Clone, Deserialize)]
pub struct Deployment {
    pub function_id: String,
    pub deployment_id: String,
    /// Bundled handler source. Everything must be in this single unit; the
    /// sandbox resolves no imports.
    pub code: String,
    /// Named static blobs served without entering the sandbox.
    #[serde(default)]
    pub assets: HashMap<String, Vec<u8>>,
    /// V8 heap bound for the deployment's context, in megabytes.
    pub memory_limit_mb: usize,
    /// Wall-clock bound per invocation, in milliseconds.
    pub timeout_ms: u64,
    /// Environment variables exposed to handler code.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Deployment {
    /// Asset body for a request path, if the deployment bundles one.
    /// Leading slashes are ignored so `/index.css` matches `index.css`.
    pub fn asset(&self, path: &str) -> Option<&[u8]> {
        self.assets
            .get(path.trim_start_matches('/'))
            .map(Vec::as_slice)
    }
}

pub trait Registry: Send + Sync {
    /// The current deployment for a function, if the function exists.
    fn lookup_current(&self, function_id: &str) -> Option<Arc<Deployment>>;

    /// A specific deployment by id.
    fn lookup(&self, deployment_id: &str) -> Option<Arc<Deployment>>;
}

#[derive(Default)]
pub struct InMemoryRegistry {
    inner: RwLock<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    deployments: HashMap<String, Arc<Deployment>>,
    current: HashMap<String, String>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, deployment: Deployment) -> Arc<Deployment> {
        let deployment = Arc::new(deployment);
        let mut state = self.inner.write().expect("registry lock");
        state
            .deployments
            .insert(deployment.deployment_id.clone(), Arc::clone(&deployment));
        deployment
    }

    /// Point a function at one of its registered deployments.
    pub fn set_current(&self, function_id: &str, deployment_id: &str) {
        let mut state = self.inner.write().expect("registry lock");
        state
            .current
            .insert(function_id.to_string(), deployment_id.to_string());
    }

    pub fn remove(&self, deployment_id: &str) {
        let mut state = self.inner.write().expect("registry lock");
        state.deployments.remove(deployment_id);
        state
            .current
            .retain(|_, current| current != deployment_id);
    }
}

impl Registry for InMemoryRegistry {
    fn lookup_current(&self, function_id: &str) -> Option<Arc<Deployment>> {
        let state = self.inner.read().expect("registry lock");
        let deployment_id = state.current.get(function_id)?;
        state.deployments.get(deployment_id).cloned()
    }

    fn lookup(&self, deployment_id: &str) -> Option<Arc<Deployment>> {
        let state = self.inner.read().expect("registry lock");
        state.deployments.get(deployment_id).cloned()
    }
}
