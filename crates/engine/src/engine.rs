use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use accounting::{Accountant, ResourceUsage};
use fetch::{Body, Headers, Request, Response};
use pool::{FaultKind, IsolatePool, PoolHooks};
use registry::{Deployment, Registry};
use results::{InvocationResult, Pipeline, ResultSink, SqliteSink};

use crate::config::EngineConfig;

/// The execution engine: maps a request to its deployment's isolated
/// context, meters the invocation, and buffers the result record, all
/// behind one `handle` call exposed to the request router.
pub struct Engine {
    registry: Arc<dyn Registry>,
    pool: IsolatePool,
    accountant: Arc<Accountant>,
    pipeline: Pipeline,
}

impl Engine {
    pub fn new(registry: Arc<dyn Registry>, config: EngineConfig) -> Self {
        let sink: Arc<dyn ResultSink> = Arc::new(SqliteSink::new(
            config.results_db_path(),
            config.results_retention_days(),
        ));
        Self::with_sink(registry, config, sink)
    }

    /// Wire the engine against a caller-provided sink.
    pub fn with_sink(
        registry: Arc<dyn Registry>,
        config: EngineConfig,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        let accountant = Arc::new(Accountant::new());

        // Context teardown and baseline removal happen as one step, so no
        // baseline can outlive its context.
        let hook_accountant = Arc::clone(&accountant);
        let hooks = PoolHooks {
            on_teardown: Arc::new(move |deployment_id| {
                hook_accountant.forget(deployment_id);
            }),
        };

        let pool = IsolatePool::new(config.pool_config(), hooks);
        let pipeline = Pipeline::new(sink, config.flush_window());

        Self {
            registry,
            pool,
            accountant,
            pipeline,
        }
    }

    /// Entry point for the router: run a request against a specific
    /// deployment.
    pub async fn handle(
        &self,
        deployment_id: &str,
        request: Request,
    ) -> Result<Response, FaultKind> {
        let deployment = self
            .registry
            .lookup(deployment_id)
            .ok_or(FaultKind::NotFound)?;
        self.run(deployment, request).await
    }

    /// Run a request against a function's current deployment.
    pub async fn handle_current(
        &self,
        function_id: &str,
        request: Request,
    ) -> Result<Response, FaultKind> {
        let deployment = self
            .registry
            .lookup_current(function_id)
            .ok_or(FaultKind::NotFound)?;
        self.run(deployment, request).await
    }

    /// Tear down a deployment's context (and its baseline), if live.
    pub async fn evict(&self, deployment_id: &str) -> bool {
        self.pool.evict(deployment_id).await
    }

    pub fn pool(&self) -> &IsolatePool {
        &self.pool
    }

    pub fn accountant(&self) -> &Accountant {
        &self.accountant
    }

    async fn run(
        &self,
        deployment: Arc<Deployment>,
        request: Request,
    ) -> Result<Response, FaultKind> {
        let received_bytes = request.body.len() as u64;

        // Static assets are served without entering the sandbox and are
        // still recorded, at zero resource cost.
        if let Some(asset) = deployment.asset(url_path(&request.url)) {
            let response = asset_response(&request.url, asset);
            self.record(&deployment, Duration::ZERO, 0, received_bytes, &Ok(response.clone()));
            return Ok(response);
        }

        let invocation = self
            .pool
            .invoke(Arc::clone(&deployment), request)
            .await
            .map_err(FaultKind::SandboxCorrupted)?;

        // Counters come back for every outcome; faulted invocations still
        // bill their partial consumption.
        let delta = self.accountant.account(
            &deployment.deployment_id,
            ResourceUsage {
                cpu_time: invocation.usage.cpu_time,
                heap_bytes: invocation.usage.heap_bytes,
            },
        );

        self.record(
            &deployment,
            delta.cpu_time,
            delta.heap_bytes,
            received_bytes,
            &invocation.outcome,
        );

        invocation.outcome
    }

    fn record(
        &self,
        deployment: &Deployment,
        cpu_time: Duration,
        memory_bytes: u64,
        received_bytes: u64,
        outcome: &Result<Response, FaultKind>,
    ) {
        let (status_code, sent_bytes) = match outcome {
            Ok(response) => (response.status, response.body.len() as u64),
            Err(fault) => (fault.status_code(), 0),
        };

        self.pipeline.record(InvocationResult {
            function_id: deployment.function_id.clone(),
            deployment_id: deployment.deployment_id.clone(),
            cpu_time_us: cpu_time.as_micros() as u64,
            memory_bytes,
            received_bytes,
            sent_bytes,
            status_code,
            timestamp_ms: now_millis(),
        });
    }
}

/// Path component of a URL: everything after the host, before query or
/// fragment. A bare path comes back unchanged.
fn url_path(url: &str) -> &str {
    let after_scheme = match url.find("://") {
        Some(index) => &url[index + 3..],
        None => url,
    };
    let path = match after_scheme.find('/') {
        Some(index) => &after_scheme[index..],
        None => "/",
    };
    let end = path
        .find(['?', '#'])
        .unwrap_or(path.len());
    &path[..end]
}

fn asset_response(url: &str, asset: &[u8]) -> Response {
    let mut headers = Headers::new();
    headers.set("content-type", content_type_for(url_path(url)));

    Response::new(Body::Bytes(asset.to_vec()))
        .with_headers(headers)
        .with_url(url)
}

fn content_type_for(path: &str) -> &'static str {
    let extension = path.rsplit('.').next().unwrap_or_default();
    match extension {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" | "mjs" => "text/javascript",
        "json" => "application/json",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "ico" => "image/x-icon",
        "txt" => "text/plain",
        "wasm" => "application/wasm",
        _ => "application/octet-stream",
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
