//! Worker-thread pool owning one V8 context per live deployment.
//!
//! Contexts are created lazily on first use, reused across invocations,
//! and disposed by the idle sweep, by LRU capacity pressure, on redeploy,
//! or on a fault that leaves the sandbox unusable. Workers own their
//! contexts locally because `JsRuntime` is `!Send`; requests reach the
//! owning worker through its queue and are processed one at a time, which
//! keeps each context's counters coherent without locks.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use deno_core::{JsRuntime, ModuleCodeString, PollEventLoopOptions, RuntimeOptions, serde_v8, v8};
use nanoid::nanoid;
use tokio::sync::{mpsc, oneshot};

use fetch::{Request, Response};
use registry::Deployment;

use crate::envelope::{RequestPayload, ResponseEnvelope};
use crate::fault::FaultKind;
use crate::idle::IdleCache;
use crate::shim::{SHIM, wrap_handler_code};

const ID_ALPHABET: [char; 62] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I',
    'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R', 'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z', 'a', 'b',
    'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u',
    'v', 'w', 'x', 'y', 'z',
];

// ========== OS-level Thread CPU Time ==========

/// CPU time consumed by the current thread.
#[cfg(target_os = "linux")]
fn get_thread_cpu_time() -> Duration {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_THREAD_CPUTIME_ID, &mut ts);
    }
    Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
}

/// CPU time consumed by the current thread (macOS).
#[cfg(target_os = "macos")]
fn get_thread_cpu_time() -> Duration {
    use libc::{THREAD_BASIC_INFO, thread_basic_info, thread_info};
    use mach2::mach_init::mach_thread_self;

    unsafe {
        let mut info = std::mem::zeroed::<thread_basic_info>();
        let mut count =
            (std::mem::size_of::<thread_basic_info>() / std::mem::size_of::<libc::c_int>()) as u32;

        let kr = thread_info(
            mach_thread_self(),
            THREAD_BASIC_INFO as u32,
            &mut info as *mut _ as *mut _,
            &mut count,
        );

        if kr == 0 {
            let user = Duration::new(
                info.user_time.seconds as u64,
                info.user_time.microseconds as u32 * 1000,
            );
            let sys = Duration::new(
                info.system_time.seconds as u64,
                info.system_time.microseconds as u32 * 1000,
            );
            user + sys
        } else {
            Duration::ZERO
        }
    }
}

/// Fallback for unsupported platforms.
#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn get_thread_cpu_time() -> Duration {
    Duration::ZERO
}

// ========== Configuration ==========

#[derive(Clone)]
pub struct PoolConfig {
    /// Number of worker threads (default: num_cpus).
    pub num_workers: usize,
    /// Max contexts per worker before LRU eviction (0 = unlimited).
    pub max_contexts_per_worker: usize,
    /// Idle time after which a context is evicted by the sweep.
    pub idle_timeout: Duration,
    /// How often each worker runs the idle sweep.
    pub sweep_interval: Duration,
    /// Consecutive timeouts/crashes before a context is torn down.
    pub max_consecutive_faults: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
            max_contexts_per_worker: 100,
            idle_timeout: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(60),
            max_consecutive_faults: 3,
        }
    }
}

impl PoolConfig {
    /// Config from environment variables, falling back to the defaults.
    ///
    /// - POOL_WORKERS: number of worker threads
    /// - POOL_MAX_CONTEXTS: max contexts per worker (0 = unlimited)
    /// - POOL_IDLE_TIMEOUT_SECS: idle eviction threshold
    /// - POOL_SWEEP_INTERVAL_SECS: sweep cadence
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            num_workers: std::env::var("POOL_WORKERS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.num_workers),
            max_contexts_per_worker: std::env::var("POOL_MAX_CONTEXTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_contexts_per_worker),
            idle_timeout: std::env::var("POOL_IDLE_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.idle_timeout),
            sweep_interval: std::env::var("POOL_SWEEP_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
            max_consecutive_faults: defaults.max_consecutive_faults,
        }
    }
}

fn default_num_workers() -> usize {
    num_cpus::get().max(1)
}

/// Callbacks out of the pool. `on_teardown` fires whenever a context dies
/// (idle sweep, LRU pressure, redeploy, corruption, explicit evict) so the
/// owner can drop per-deployment state in the same step.
#[derive(Clone)]
pub struct PoolHooks {
    pub on_teardown: Arc<dyn Fn(&str) + Send + Sync>,
}

impl Default for PoolHooks {
    fn default() -> Self {
        Self {
            on_teardown: Arc::new(|_| {}),
        }
    }
}

// ========== Invocation Types ==========

/// Cumulative counters for a context, read after every invocation —
/// including faulted ones, so partial consumption is still billed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextUsage {
    /// Monotonically increasing CPU time since the context was created.
    pub cpu_time: Duration,
    /// Current heap usage sample; may decrease after a GC.
    pub heap_bytes: u64,
}

impl ContextUsage {
    fn zero() -> Self {
        Self {
            cpu_time: Duration::ZERO,
            heap_bytes: 0,
        }
    }
}

/// Outcome of one invocation plus the counters behind it.
#[derive(Debug)]
pub struct Invocation {
    pub outcome: Result<Response, FaultKind>,
    pub usage: ContextUsage,
    /// Whether this invocation had to build the context first.
    pub cold_start: bool,
    pub duration: Duration,
}

struct WorkerInvoke {
    deployment: Arc<Deployment>,
    request: Request,
    response_tx: oneshot::Sender<Invocation>,
}

enum WorkerControl {
    /// Tear down one context, if this worker has it.
    Evict {
        deployment_id: String,
        response_tx: oneshot::Sender<bool>,
    },
    /// Number of live contexts on this worker.
    ContextCount { response_tx: oneshot::Sender<usize> },
}

// ========== Pool Metrics ==========

/// Counters for monitoring pool health.
pub struct PoolMetrics {
    pub total_invocations: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub evictions: AtomicU64,
}

impl Default for PoolMetrics {
    fn default() -> Self {
        Self {
            total_invocations: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }
}

impl PoolMetrics {
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.total_invocations.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        self.cache_hits.load(Ordering::Relaxed) as f64 / total as f64
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "total_invocations": self.total_invocations.load(Ordering::Relaxed),
            "cache_hits": self.cache_hits.load(Ordering::Relaxed),
            "cache_misses": self.cache_misses.load(Ordering::Relaxed),
            "cache_hit_rate": self.cache_hit_rate(),
            "evictions": self.evictions.load(Ordering::Relaxed),
        })
    }
}

// ========== Main Pool ==========

struct WorkerHandle {
    invoke_tx: mpsc::UnboundedSender<WorkerInvoke>,
    control_tx: mpsc::UnboundedSender<WorkerControl>,
    #[allow(dead_code)]
    thread: JoinHandle<()>,
}

pub struct IsolatePool {
    workers: Vec<WorkerHandle>,
    config: PoolConfig,
    metrics: Arc<PoolMetrics>,
}

impl IsolatePool {
    pub fn new(config: PoolConfig, hooks: PoolHooks) -> Self {
        let metrics = Arc::new(PoolMetrics::default());
        let mut workers = Vec::with_capacity(config.num_workers);
        let core_ids = core_affinity::get_core_ids();

        tracing::info!(
            "initializing isolate pool: {} workers, {} max contexts/worker, {:?} idle timeout",
            config.num_workers,
            config.max_contexts_per_worker,
            config.idle_timeout
        );

        for worker_id in 0..config.num_workers {
            let (invoke_tx, invoke_rx) = mpsc::unbounded_channel();
            let (control_tx, control_rx) = mpsc::unbounded_channel();
            let worker_config = config.clone();
            let worker_metrics = Arc::clone(&metrics);
            let worker_hooks = hooks.clone();
            let core_id = core_ids
                .as_ref()
                .and_then(|ids| ids.get(worker_id % ids.len()).cloned());

            let thread = std::thread::spawn(move || {
                if let Some(core_id) = core_id {
                    core_affinity::set_for_current(core_id);
                }
                let mut worker =
                    WorkerThread::new(worker_id, worker_config, worker_metrics, worker_hooks);
                worker.run(invoke_rx, control_rx);
            });

            workers.push(WorkerHandle {
                invoke_tx,
                control_tx,
                thread,
            });
        }

        Self {
            workers,
            config,
            metrics,
        }
    }

    /// Run one invocation against the deployment's context, creating it if
    /// needed. All invocations for a deployment are serialized by its
    /// owning worker's queue.
    pub async fn invoke(
        &self,
        deployment: Arc<Deployment>,
        request: Request,
    ) -> Result<Invocation, String> {
        let worker_index = self.worker_for(&deployment.deployment_id);
        let (response_tx, response_rx) = oneshot::channel();

        self.workers[worker_index]
            .invoke_tx
            .send(WorkerInvoke {
                deployment,
                request,
                response_tx,
            })
            .map_err(|_| "worker thread dead".to_string())?;

        response_rx
            .await
            .map_err(|_| "worker dropped response channel".to_string())
    }

    /// Tear down a deployment's context, if live. Returns whether one was.
    pub async fn evict(&self, deployment_id: &str) -> bool {
        let worker_index = self.worker_for(deployment_id);
        let (response_tx, response_rx) = oneshot::channel();

        if self.workers[worker_index]
            .control_tx
            .send(WorkerControl::Evict {
                deployment_id: deployment_id.to_string(),
                response_tx,
            })
            .is_err()
        {
            return false;
        }

        response_rx.await.unwrap_or(false)
    }

    /// Live contexts across all workers.
    pub async fn context_count(&self) -> usize {
        let mut total = 0;
        for worker in &self.workers {
            let (response_tx, response_rx) = oneshot::channel();
            if worker
                .control_tx
                .send(WorkerControl::ContextCount { response_tx })
                .is_ok()
            {
                total += response_rx.await.unwrap_or(0);
            }
        }
        total
    }

    pub fn metrics(&self) -> &PoolMetrics {
        &self.metrics
    }

    pub fn stats(&self) -> serde_json::Value {
        serde_json::json!({
            "config": {
                "num_workers": self.config.num_workers,
                "max_contexts_per_worker": self.config.max_contexts_per_worker,
                "idle_timeout_secs": self.config.idle_timeout.as_secs(),
                "sweep_interval_secs": self.config.sweep_interval.as_secs(),
            },
            "metrics": self.metrics.to_json(),
        })
    }

    /// Consistent hash from deployment id to its owning worker.
    fn worker_for(&self, deployment_id: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        deployment_id.hash(&mut hasher);
        (hasher.finish() as usize) % self.workers.len()
    }
}

// ========== Execution Context ==========

/// Trips when V8 approaches the deployment's heap limit: the execution is
/// terminated and the limit raised so the process survives long enough to
/// tear the context down.
struct HeapGuard {
    tripped: AtomicBool,
    handle: v8::IsolateHandle,
}

extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    let guard = unsafe { &*(data as *const HeapGuard) };
    guard.tripped.store(true, Ordering::SeqCst);
    guard.handle.terminate_execution();
    current_heap_limit * 2
}

struct Context {
    context_id: String,
    runtime: JsRuntime,
    // Referenced by the near-heap-limit callback for the runtime's
    // lifetime; the runtime field above must drop first.
    heap_guard: Box<HeapGuard>,
    source_hash: u64,
    cumulative_cpu: Duration,
    heap_used_bytes: usize,
    consecutive_faults: u32,
}

impl Context {
    fn usage(&self) -> ContextUsage {
        ContextUsage {
            cpu_time: self.cumulative_cpu,
            heap_bytes: self.heap_used_bytes as u64,
        }
    }
}

// ========== Worker Thread ==========

struct WorkerThread {
    worker_id: usize,
    config: PoolConfig,
    metrics: Arc<PoolMetrics>,
    hooks: PoolHooks,
    contexts: HashMap<String, Context>,
    lru_order: Vec<String>,
    idle: IdleCache,
}

impl WorkerThread {
    fn new(
        worker_id: usize,
        config: PoolConfig,
        metrics: Arc<PoolMetrics>,
        hooks: PoolHooks,
    ) -> Self {
        let idle = IdleCache::new(config.idle_timeout);
        Self {
            worker_id,
            config,
            metrics,
            hooks,
            contexts: HashMap::new(),
            lru_order: Vec::new(),
            idle,
        }
    }

    fn run(
        &mut self,
        mut invoke_rx: mpsc::UnboundedReceiver<WorkerInvoke>,
        mut control_rx: mpsc::UnboundedReceiver<WorkerControl>,
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to create tokio runtime for worker");

        tracing::debug!("worker {} started", self.worker_id);

        rt.block_on(async {
            let mut sweep = tokio::time::interval(self.config.sweep_interval);
            sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    invoke = invoke_rx.recv() => match invoke {
                        Some(invoke) => {
                            let response = self.process_invoke(invoke.deployment, invoke.request).await;
                            let _ = invoke.response_tx.send(response);
                        }
                        None => break,
                    },
                    control = control_rx.recv() => match control {
                        Some(control) => self.handle_control(control),
                        None => break,
                    },
                    _ = sweep.tick() => self.run_sweep(),
                }
            }
        });

        tracing::debug!("worker {} shutting down", self.worker_id);
    }

    fn handle_control(&mut self, control: WorkerControl) {
        match control {
            WorkerControl::Evict {
                deployment_id,
                response_tx,
            } => {
                let existed = self.contexts.contains_key(&deployment_id);
                if existed {
                    self.teardown_context(&deployment_id, "explicit evict");
                }
                let _ = response_tx.send(existed);
            }
            WorkerControl::ContextCount { response_tx } => {
                let _ = response_tx.send(self.contexts.len());
            }
        }
    }

    /// Idle sweep: dispose every context whose deployment has been idle
    /// past the threshold. Runs on the worker's own loop, so it can never
    /// observe an in-flight invocation.
    fn run_sweep(&mut self) {
        let now = Instant::now();
        for deployment_id in self.idle.sweep(now) {
            tracing::info!(
                "worker {} evicting idle context for {}",
                self.worker_id,
                deployment_id
            );
            self.teardown_context(&deployment_id, "idle");
        }
    }

    async fn process_invoke(&mut self, deployment: Arc<Deployment>, request: Request) -> Invocation {
        let started = Instant::now();
        self.metrics
            .total_invocations
            .fetch_add(1, Ordering::Relaxed);

        let deployment_id = deployment.deployment_id.clone();

        let cold_start = match self.ensure_context(&deployment) {
            Ok(cold_start) => cold_start,
            Err((fault, usage)) => {
                return Invocation {
                    outcome: Err(fault),
                    usage,
                    cold_start: true,
                    duration: started.elapsed(),
                };
            }
        };

        let (outcome, usage, teardown) = self.run_in_context(&deployment, &request).await;

        if let Some(reason) = teardown {
            self.teardown_context(&deployment_id, reason);
        } else if outcome.is_ok() {
            self.idle.touch(&deployment_id, Instant::now());
        }

        Invocation {
            outcome,
            usage,
            cold_start,
            duration: started.elapsed(),
        }
    }

    /// Make sure a live, up-to-date context exists for the deployment.
    /// Returns whether one had to be created. A compile failure leaves
    /// nothing registered.
    fn ensure_context(
        &mut self,
        deployment: &Arc<Deployment>,
    ) -> Result<bool, (FaultKind, ContextUsage)> {
        let deployment_id = &deployment.deployment_id;
        let source_hash = hash_source(&deployment.code);

        if let Some(context) = self.contexts.get(deployment_id) {
            if context.source_hash == source_hash {
                self.metrics.cache_hits.fetch_add(1, Ordering::Relaxed);
                self.touch_lru(deployment_id);
                return Ok(false);
            }
            tracing::debug!(
                "worker {} code changed for {}, invalidating context",
                self.worker_id,
                deployment_id
            );
            self.teardown_context(deployment_id, "redeployed");
        }

        self.metrics.cache_misses.fetch_add(1, Ordering::Relaxed);

        if self.config.max_contexts_per_worker > 0
            && self.contexts.len() >= self.config.max_contexts_per_worker
        {
            self.evict_lru();
        }

        let build_start = Instant::now();
        let context = self.create_context(deployment, source_hash)?;
        tracing::info!(
            "worker {} cold start for {} ({} in {:?})",
            self.worker_id,
            deployment_id,
            context.context_id,
            build_start.elapsed()
        );

        self.contexts.insert(deployment_id.clone(), context);
        self.lru_order.push(deployment_id.clone());
        self.idle.touch(deployment_id, Instant::now());
        Ok(true)
    }

    fn create_context(
        &self,
        deployment: &Arc<Deployment>,
        source_hash: u64,
    ) -> Result<Context, (FaultKind, ContextUsage)> {
        let cpu_start = get_thread_cpu_time();
        let compile_usage = |cpu_start: Duration| ContextUsage {
            cpu_time: get_thread_cpu_time()
                .checked_sub(cpu_start)
                .unwrap_or(Duration::ZERO),
            heap_bytes: 0,
        };

        let heap_limit_bytes = deployment.memory_limit_mb * 1024 * 1024;
        let mut runtime = JsRuntime::new(RuntimeOptions {
            create_params: Some(v8::CreateParams::default().heap_limits(0, heap_limit_bytes)),
            ..Default::default()
        });

        let handle = runtime.v8_isolate().thread_safe_handle();
        let heap_guard = Box::new(HeapGuard {
            tripped: AtomicBool::new(false),
            handle,
        });
        let guard_ptr = heap_guard.as_ref() as *const HeapGuard as *mut std::ffi::c_void;
        runtime
            .v8_isolate()
            .add_near_heap_limit_callback(near_heap_limit_callback, guard_ptr);

        // Assembled before any code runs so the error paths below drop the
        // runtime before the guard its callback points at.
        let mut context = Context {
            context_id: format!("ctx_{}", nanoid!(10, &ID_ALPHABET)),
            runtime,
            heap_guard,
            source_hash,
            cumulative_cpu: Duration::ZERO,
            heap_used_bytes: 0,
            consecutive_faults: 0,
        };

        if let Err(err) = set_global(&mut context.runtime, "__envVars", &deployment.env) {
            return Err((
                FaultKind::SandboxCorrupted(format!("failed to inject environment: {}", err)),
                compile_usage(cpu_start),
            ));
        }

        if let Err(err) = context
            .runtime
            .execute_script("surface.js", ModuleCodeString::from(SHIM.to_string()))
        {
            return Err((
                FaultKind::SandboxCorrupted(format!("surface bootstrap failed: {}", err)),
                compile_usage(cpu_start),
            ));
        }

        let wrapped = wrap_handler_code(&deployment.code);
        if let Err(err) = context
            .runtime
            .execute_script("deployment.js", ModuleCodeString::from(wrapped))
        {
            return Err((
                FaultKind::CompileError(err.to_string()),
                compile_usage(cpu_start),
            ));
        }

        context.cumulative_cpu = get_thread_cpu_time()
            .checked_sub(cpu_start)
            .unwrap_or(Duration::ZERO);

        Ok(context)
    }

    /// Execute one invocation in the deployment's live context. Always
    /// reads the cumulative counters, whatever the outcome. Returns the
    /// outcome, the counters, and an optional teardown reason the caller
    /// applies after the context borrow ends.
    async fn run_in_context(
        &mut self,
        deployment: &Arc<Deployment>,
        request: &Request,
    ) -> (
        Result<Response, FaultKind>,
        ContextUsage,
        Option<&'static str>,
    ) {
        let context = match self.contexts.get_mut(&deployment.deployment_id) {
            Some(context) => context,
            None => {
                return (
                    Err(FaultKind::SandboxCorrupted("context disappeared".into())),
                    ContextUsage::zero(),
                    None,
                );
            }
        };

        context.heap_guard.tripped.store(false, Ordering::SeqCst);
        if context.runtime.v8_isolate().is_execution_terminating() {
            context.runtime.v8_isolate().cancel_terminate_execution();
        }

        let payload = RequestPayload::from_request(request);
        if let Err(err) = set_global(&mut context.runtime, "__requestPayload", &payload) {
            let usage = read_counters(context);
            return (
                Err(FaultKind::RuntimeFault(format!(
                    "request marshalling failed: {}",
                    err
                ))),
                usage,
                None,
            );
        }

        // Wall-clock watchdog on its own OS thread so even a busy-looping
        // handler that never yields back to tokio gets terminated.
        let timeout = Duration::from_millis(deployment.timeout_ms);
        let fired = Arc::new(AtomicBool::new(false));
        let done = Arc::new(AtomicBool::new(false));
        if !timeout.is_zero() {
            let fired = Arc::clone(&fired);
            let done = Arc::clone(&done);
            let handle = context.runtime.v8_isolate().thread_safe_handle();
            std::thread::spawn(move || {
                let deadline = Instant::now() + timeout;
                while Instant::now() < deadline {
                    if done.load(Ordering::Acquire) {
                        return;
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                if !done.load(Ordering::Acquire) {
                    fired.store(true, Ordering::SeqCst);
                    handle.terminate_execution();
                }
            });
        }

        let cpu_start = get_thread_cpu_time();

        let script_result = context
            .runtime
            .execute_script(
                "invoke.js",
                ModuleCodeString::from("globalThis.__invoke()".to_string()),
            )
            .map_err(|err| err.to_string());

        // Drive the event loop only if the handler's promise is pending.
        let mut event_loop_error: Option<String> = None;
        if let Ok(value) = &script_result {
            let pending = {
                deno_core::scope!(scope, &mut context.runtime);
                let local = v8::Local::new(scope, value);
                match v8::Local::<v8::Promise>::try_from(local) {
                    Ok(promise) => matches!(promise.state(), v8::PromiseState::Pending),
                    Err(_) => false,
                }
            };

            if pending {
                if let Err(err) = context
                    .runtime
                    .run_event_loop(PollEventLoopOptions::default())
                    .await
                {
                    event_loop_error = Some(err.to_string());
                }
            }
        }

        done.store(true, Ordering::Release);

        // Counters are read before any teardown decision so partial
        // consumption from faulted invocations is still billed.
        let cpu_elapsed = get_thread_cpu_time()
            .checked_sub(cpu_start)
            .unwrap_or(Duration::ZERO);
        context.cumulative_cpu += cpu_elapsed;
        let usage = read_counters(context);

        if context.heap_guard.tripped.load(Ordering::SeqCst) {
            return (
                Err(FaultKind::SandboxCorrupted("heap limit reached".into())),
                usage,
                Some("heap exhaustion"),
            );
        }

        if fired.load(Ordering::SeqCst) {
            context.runtime.v8_isolate().cancel_terminate_execution();
            context.consecutive_faults += 1;
            let teardown = if context.consecutive_faults >= self.config.max_consecutive_faults {
                Some("repeated faults")
            } else {
                None
            };
            return (Err(FaultKind::Timeout), usage, teardown);
        }

        let error = match (&script_result, event_loop_error) {
            (Err(err), _) => Some(err.clone()),
            (Ok(_), Some(err)) => Some(err),
            (Ok(_), None) => None,
        };
        if let Some(err) = error {
            context.consecutive_faults += 1;
            let teardown = if context.consecutive_faults >= self.config.max_consecutive_faults {
                Some("repeated faults")
            } else {
                None
            };
            return (Err(FaultKind::RuntimeFault(err)), usage, teardown);
        }

        let value = script_result.expect("checked above");
        let outcome = decode_response(&mut context.runtime, &value, &request.url);

        match outcome {
            Ok(response) => {
                context.consecutive_faults = 0;
                (Ok(response), usage, None)
            }
            Err(fault) => {
                context.consecutive_faults += 1;
                let teardown = if context.consecutive_faults >= self.config.max_consecutive_faults {
                    Some("repeated faults")
                } else {
                    None
                };
                (Err(fault), usage, teardown)
            }
        }
    }

    /// Dispose a context together with every piece of per-deployment
    /// state tracked alongside it.
    fn teardown_context(&mut self, deployment_id: &str, reason: &str) {
        if self.contexts.remove(deployment_id).is_some() {
            self.lru_order.retain(|id| id != deployment_id);
            self.idle.remove(deployment_id);
            self.metrics.evictions.fetch_add(1, Ordering::Relaxed);
            (self.hooks.on_teardown)(deployment_id);
            tracing::debug!(
                "worker {} tore down context for {} ({})",
                self.worker_id,
                deployment_id,
                reason
            );
        }
    }

    fn touch_lru(&mut self, deployment_id: &str) {
        if let Some(position) = self.lru_order.iter().position(|id| id == deployment_id) {
            self.lru_order.remove(position);
            self.lru_order.push(deployment_id.to_string());
        }
    }

    fn evict_lru(&mut self) {
        if let Some(oldest) = self.lru_order.first().cloned() {
            tracing::debug!("worker {} at capacity, evicting {}", self.worker_id, oldest);
            self.teardown_context(&oldest, "capacity");
        }
    }
}

fn read_counters(context: &mut Context) -> ContextUsage {
    let heap_stats = context.runtime.v8_isolate().get_heap_statistics();
    context.heap_used_bytes = heap_stats.used_heap_size();
    context.usage()
}

fn decode_response(
    runtime: &mut JsRuntime,
    value: &v8::Global<v8::Value>,
    url: &str,
) -> Result<Response, FaultKind> {
    deno_core::scope!(scope, runtime);
    let local = v8::Local::new(scope, value);

    let resolved: Result<v8::Local<v8::Value>, FaultKind> =
        match v8::Local::<v8::Promise>::try_from(local) {
            Ok(promise) => match promise.state() {
                v8::PromiseState::Fulfilled => Ok(promise.result(scope)),
                v8::PromiseState::Rejected => {
                    let reason = promise.result(scope);
                    Err(FaultKind::RuntimeFault(format!(
                        "handler rejected: {}",
                        reason.to_rust_string_lossy(scope)
                    )))
                }
                v8::PromiseState::Pending => Err(FaultKind::RuntimeFault(
                    "handler promise still pending after event loop".into(),
                )),
            },
            Err(_) => Ok(local),
        };

    let resolved = resolved?;
    let value: serde_json::Value = serde_v8::from_v8(scope, resolved).map_err(|err| {
        FaultKind::RuntimeFault(format!("handler returned non-serializable result: {}", err))
    })?;

    let envelope = ResponseEnvelope::from_value(value).map_err(|err| {
        FaultKind::RuntimeFault(format!("handler returned invalid response: {}", err))
    })?;

    envelope.into_response(url).map_err(FaultKind::RuntimeFault)
}

fn set_global<T: serde::Serialize>(
    runtime: &mut JsRuntime,
    name: &str,
    value: &T,
) -> Result<(), String> {
    deno_core::scope!(scope, runtime);
    let context = scope.get_current_context();
    let global = context.global(scope);

    let key =
        v8::String::new(scope, name).ok_or_else(|| format!("failed to allocate key {}", name))?;
    let value =
        serde_v8::to_v8(scope, value).map_err(|err| format!("{} to v8: {}", name, err))?;
    global.set(scope, key.into(), value);
    Ok(())
}

fn hash_source(source: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    source.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use std::sync::Mutex;

    fn deployment(deployment_id: &str, code: &str) -> Arc<Deployment> {
        Arc::new(Deployment {
            function_id: "fn_test".to_string(),
            deployment_id: deployment_id.to_string(),
            code: code.to_string(),
            assets: StdHashMap::new(),
            memory_limit_mb: 128,
            timeout_ms: 5_000,
            env: StdHashMap::new(),
        })
    }

    fn test_pool(num_workers: usize) -> IsolatePool {
        let config = PoolConfig {
            num_workers,
            ..PoolConfig::default()
        };
        IsolatePool::new(config, PoolHooks::default())
    }

    #[tokio::test]
    async fn handler_response_comes_back_with_status_and_body() {
        let pool = test_pool(2);
        let deployment = deployment(
            "dep_echo",
            r#"export function handler(request) {
                return new Response('hello ' + request.method, {
                    status: 201,
                    headers: { 'x-engine': 'pool' },
                });
            }"#,
        );

        let invocation = pool
            .invoke(Arc::clone(&deployment), Request::new("https://fn.example/"))
            .await
            .expect("invoke");

        let response = invocation.outcome.expect("response");
        assert_eq!(response.status, 201);
        assert_eq!(response.text(), "hello GET");
        assert_eq!(response.headers.get("x-engine"), Some("pool"));
        assert!(invocation.cold_start);
    }

    #[tokio::test]
    async fn contexts_are_reused_after_the_first_invocation() {
        let pool = test_pool(2);
        let deployment = deployment(
            "dep_counter",
            r#"let calls = 0;
            export function handler(request) {
                calls += 1;
                return new Response(String(calls));
            }"#,
        );

        let first = pool
            .invoke(Arc::clone(&deployment), Request::new("https://fn.example/"))
            .await
            .expect("invoke");
        let second = pool
            .invoke(Arc::clone(&deployment), Request::new("https://fn.example/"))
            .await
            .expect("invoke");

        assert!(first.cold_start);
        assert!(!second.cold_start);
        // Same context, so in-context state survives between invocations.
        assert_eq!(second.outcome.expect("response").text(), "2");
    }

    #[tokio::test]
    async fn async_handlers_resolve_through_the_event_loop() {
        let pool = test_pool(2);
        let deployment = deployment(
            "dep_async",
            r#"export async function handler(request) {
                const body = await request.text();
                return new Response('got: ' + body);
            }"#,
        );

        let request = Request::new("https://fn.example/")
            .with_method("POST")
            .with_body("payload");
        let invocation = pool.invoke(deployment, request).await.expect("invoke");

        assert_eq!(invocation.outcome.expect("response").text(), "got: payload");
    }

    #[tokio::test]
    async fn byte_bodies_round_trip_through_the_sandbox() {
        let pool = test_pool(2);
        let deployment = deployment(
            "dep_bytes",
            r#"export async function handler(request) {
                const bytes = await request.arrayBuffer();
                return new Response(new Uint8Array(bytes));
            }"#,
        );

        let request = Request::new("https://fn.example/")
            .with_method("POST")
            .with_body(vec![1u8, 2, 254, 255]);
        let invocation = pool.invoke(deployment, request).await.expect("invoke");

        let response = invocation.outcome.expect("response");
        assert_eq!(
            response.body,
            fetch::Body::Bytes(vec![1u8, 2, 254, 255])
        );
    }

    #[tokio::test]
    async fn env_vars_are_visible_to_handler_code() {
        let pool = test_pool(2);
        let mut env = StdHashMap::new();
        env.insert("GREETING".to_string(), "bonjour".to_string());
        let deployment = Arc::new(Deployment {
            env,
            ..(*deployment("dep_env", r#"export function handler(request) {
                return new Response(process.env.GREETING);
            }"#))
            .clone()
        });

        let invocation = pool
            .invoke(deployment, Request::new("https://fn.example/"))
            .await
            .expect("invoke");

        assert_eq!(invocation.outcome.expect("response").text(), "bonjour");
    }

    #[tokio::test]
    async fn compile_errors_surface_without_registering_a_context() {
        let pool = test_pool(2);
        let deployment = deployment("dep_bad", "export function handler(request) {");

        let invocation = pool
            .invoke(Arc::clone(&deployment), Request::new("https://fn.example/"))
            .await
            .expect("invoke");

        assert!(matches!(
            invocation.outcome,
            Err(FaultKind::CompileError(_))
        ));
        assert_eq!(pool.context_count().await, 0);
    }

    #[tokio::test]
    async fn missing_handler_function_is_a_compile_error() {
        let pool = test_pool(2);
        let deployment = deployment("dep_nohandler", "const x = 1;");

        let invocation = pool
            .invoke(deployment, Request::new("https://fn.example/"))
            .await
            .expect("invoke");

        assert!(matches!(
            invocation.outcome,
            Err(FaultKind::CompileError(_))
        ));
    }

    #[tokio::test]
    async fn uncaught_exceptions_are_runtime_faults_and_keep_the_context() {
        let pool = test_pool(2);
        let deployment = deployment(
            "dep_throw",
            r#"let calls = 0;
            export function handler(request) {
                calls += 1;
                if (calls === 1) {
                    throw new Error('first call explodes');
                }
                return new Response(String(calls));
            }"#,
        );

        let first = pool
            .invoke(Arc::clone(&deployment), Request::new("https://fn.example/"))
            .await
            .expect("invoke");
        assert!(matches!(first.outcome, Err(FaultKind::RuntimeFault(_))));

        // The context survived the fault: state is still there.
        let second = pool
            .invoke(deployment, Request::new("https://fn.example/"))
            .await
            .expect("invoke");
        assert!(!second.cold_start);
        assert_eq!(second.outcome.expect("response").text(), "2");
    }

    #[tokio::test]
    async fn busy_loops_hit_the_wall_clock_timeout() {
        let pool = test_pool(2);
        let deployment = Arc::new(Deployment {
            timeout_ms: 100,
            ..(*deployment("dep_spin", r#"export function handler(request) {
                while (true) {}
            }"#))
            .clone()
        });

        let invocation = pool
            .invoke(deployment, Request::new("https://fn.example/"))
            .await
            .expect("invoke");

        assert!(matches!(invocation.outcome, Err(FaultKind::Timeout)));
        // Partial consumption is still reported.
        assert!(invocation.usage.cpu_time > Duration::ZERO);
    }

    #[tokio::test]
    async fn a_single_timeout_keeps_the_context_usable() {
        let pool = test_pool(2);
        let deployment = Arc::new(Deployment {
            timeout_ms: 100,
            ..(*deployment("dep_sometimes_slow", r#"let calls = 0;
            export function handler(request) {
                calls += 1;
                if (calls === 1) {
                    while (true) {}
                }
                return new Response(String(calls));
            }"#))
            .clone()
        });

        let first = pool
            .invoke(Arc::clone(&deployment), Request::new("https://fn.example/"))
            .await
            .expect("invoke");
        assert!(matches!(first.outcome, Err(FaultKind::Timeout)));

        let second = pool
            .invoke(deployment, Request::new("https://fn.example/"))
            .await
            .expect("invoke");
        assert!(!second.cold_start);
        assert_eq!(second.outcome.expect("response").text(), "2");
    }

    #[tokio::test]
    async fn repeated_timeouts_tear_the_context_down() {
        let pool = test_pool(2);
        let deployment = Arc::new(Deployment {
            timeout_ms: 50,
            ..(*deployment("dep_always_slow", r#"export function handler(request) {
                while (true) {}
            }"#))
            .clone()
        });

        for _ in 0..3 {
            let invocation = pool
                .invoke(Arc::clone(&deployment), Request::new("https://fn.example/"))
                .await
                .expect("invoke");
            assert!(matches!(invocation.outcome, Err(FaultKind::Timeout)));
        }

        // Third consecutive fault tore the context down.
        assert_eq!(pool.context_count().await, 0);
    }

    #[tokio::test]
    async fn heap_exhaustion_corrupts_and_tears_down_the_context() {
        let pool = test_pool(2);
        let deployment = Arc::new(Deployment {
            memory_limit_mb: 16,
            ..(*deployment("dep_hog", r#"export function handler(request) {
                const chunks = [];
                while (true) {
                    chunks.push('x'.repeat(1024 * 1024));
                }
            }"#))
            .clone()
        });

        let invocation = pool
            .invoke(deployment, Request::new("https://fn.example/"))
            .await
            .expect("invoke");

        assert!(matches!(
            invocation.outcome,
            Err(FaultKind::SandboxCorrupted(_))
        ));
        assert_eq!(pool.context_count().await, 0);
    }

    #[tokio::test]
    async fn cumulative_cpu_counters_only_grow() {
        let pool = test_pool(2);
        let deployment = deployment(
            "dep_work",
            r#"export function handler(request) {
                let total = 0;
                for (let i = 0; i < 100000; i++) {
                    total += i;
                }
                return new Response(String(total));
            }"#,
        );

        let first = pool
            .invoke(Arc::clone(&deployment), Request::new("https://fn.example/"))
            .await
            .expect("invoke");
        let second = pool
            .invoke(deployment, Request::new("https://fn.example/"))
            .await
            .expect("invoke");

        assert!(second.usage.cpu_time >= first.usage.cpu_time);
    }

    #[tokio::test]
    async fn explicit_evict_forces_the_next_cold_start() {
        let pool = test_pool(2);
        let deployment = deployment(
            "dep_evict",
            r#"export function handler(request) { return new Response('ok'); }"#,
        );

        pool.invoke(Arc::clone(&deployment), Request::new("https://fn.example/"))
            .await
            .expect("invoke");
        assert_eq!(pool.context_count().await, 1);

        assert!(pool.evict("dep_evict").await);
        assert_eq!(pool.context_count().await, 0);
        assert!(!pool.evict("dep_evict").await);

        let next = pool
            .invoke(deployment, Request::new("https://fn.example/"))
            .await
            .expect("invoke");
        assert!(next.cold_start);
    }

    #[tokio::test]
    async fn teardown_hook_fires_with_the_deployment_id() {
        let torn_down: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let hook_log = Arc::clone(&torn_down);
        let hooks = PoolHooks {
            on_teardown: Arc::new(move |deployment_id| {
                hook_log.lock().expect("log lock").push(deployment_id.to_string());
            }),
        };
        let pool = IsolatePool::new(
            PoolConfig {
                num_workers: 2,
                ..PoolConfig::default()
            },
            hooks,
        );

        let deployment = deployment(
            "dep_hooked",
            r#"export function handler(request) { return new Response('ok'); }"#,
        );
        pool.invoke(deployment, Request::new("https://fn.example/"))
            .await
            .expect("invoke");
        pool.evict("dep_hooked").await;

        assert_eq!(
            torn_down.lock().expect("log lock").as_slice(),
            ["dep_hooked".to_string()]
        );
    }

    #[tokio::test]
    async fn redeployed_code_invalidates_the_old_context() {
        let pool = test_pool(2);
        let before = deployment(
            "dep_redeploy",
            r#"export function handler(request) { return new Response('v1'); }"#,
        );
        let after = deployment(
            "dep_redeploy",
            r#"export function handler(request) { return new Response('v2'); }"#,
        );

        let first = pool
            .invoke(before, Request::new("https://fn.example/"))
            .await
            .expect("invoke");
        assert_eq!(first.outcome.expect("response").text(), "v1");

        let second = pool
            .invoke(after, Request::new("https://fn.example/"))
            .await
            .expect("invoke");
        assert!(second.cold_start);
        assert_eq!(second.outcome.expect("response").text(), "v2");
    }

    #[tokio::test]
    async fn distinct_deployments_run_concurrently_without_interference() {
        let pool = Arc::new(test_pool(4));
        let mut handles = Vec::new();

        for index in 0..4 {
            let pool = Arc::clone(&pool);
            let deployment = deployment(
                &format!("dep_concurrent_{}", index),
                &format!(
                    r#"export function handler(request) {{ return new Response('dep {}'); }}"#,
                    index
                ),
            );
            handles.push(tokio::spawn(async move {
                let invocation = pool
                    .invoke(deployment, Request::new("https://fn.example/"))
                    .await
                    .expect("invoke");
                invocation.outcome.expect("response").text().into_owned()
            }));
        }

        for (index, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.expect("join"), format!("dep {}", index));
        }
    }

    #[tokio::test]
    async fn form_data_parses_inside_the_sandbox() {
        let pool = test_pool(2);
        let deployment = deployment(
            "dep_form",
            r#"export async function handler(request) {
                const fields = await request.formData();
                return new Response(fields.user + '/' + fields.city);
            }"#,
        );

        let body = "--edge9\r\nContent-Disposition: form-data; name=\"user\"\r\n\r\nada\r\n--edge9\r\nContent-Disposition: form-data; name=\"city\"\r\n\r\nlisbon\r\n--edge9--\r\n";
        let request = Request::new("https://fn.example/")
            .with_method("POST")
            .with_headers(fetch::Headers::from_pairs([(
                "content-type",
                "multipart/form-data; boundary=edge9",
            )]))
            .with_body(body);

        let invocation = pool.invoke(deployment, request).await.expect("invoke");
        assert_eq!(invocation.outcome.expect("response").text(), "ada/lisbon");
    }
}
