use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::record::InvocationResult;
use crate::sink::ResultSink;

/// Buffers invocation results and flushes them to the sink in batches.
///
/// `record` runs on the request path and only touches the in-memory
/// buffer. Flushing happens on background threads: the buffer is drained
/// under the lock, the lock is released, and the owned batch is handed
/// over a channel to the writer thread that owns the sink. A failed write
/// is logged and the batch dropped; results are telemetry, delivered at
/// most once.
pub struct Pipeline {
    state: Arc<Mutex<BufferState>>,
    batch_tx: Option<mpsc::Sender<Vec<InvocationResult>>>,
    shutdown: Arc<AtomicBool>,
    window: Duration,
    ticker: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct BufferState {
    /// Grouped by (function_id, deployment_id); flushed as one unit.
    buffer: HashMap<(String, String), Vec<InvocationResult>>,
    buffered: usize,
    last_flush: Option<Instant>,
}

impl BufferState {
    /// Drain every buffered result into one batch and mark the flush.
    /// Must run under the pipeline lock so no result is double-flushed or
    /// dropped between the handoff and the clear.
    fn drain(&mut self, now: Instant) -> Vec<InvocationResult> {
        let mut batch = Vec::with_capacity(self.buffered);
        for (_, results) in self.buffer.drain() {
            batch.extend(results);
        }
        self.buffered = 0;
        self.last_flush = Some(now);
        batch
    }

    fn flush_due(&self, now: Instant, window: Duration) -> bool {
        match self.last_flush {
            // Idle pipeline: flush the very first buffered result right
            // away so low-traffic functions are not starved.
            None => true,
            Some(last) => now.duration_since(last) >= window,
        }
    }
}

impl Pipeline {
    /// Spawn the ticker and writer threads. `window` is the maximum time a
    /// recorded result waits before a flush is attempted.
    pub fn new(sink: Arc<dyn ResultSink>, window: Duration) -> Self {
        let state = Arc::new(Mutex::new(BufferState::default()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let (batch_tx, batch_rx) = mpsc::channel::<Vec<InvocationResult>>();

        let writer = std::thread::spawn(move || {
            while let Ok(batch) = batch_rx.recv() {
                if batch.is_empty() {
                    continue;
                }
                let count = batch.len();
                if let Err(err) = sink.write(&batch) {
                    tracing::warn!("dropping batch of {} results: {}", count, err);
                } else {
                    tracing::debug!("flushed {} invocation results", count);
                }
            }
        });

        let ticker_state = Arc::clone(&state);
        let ticker_shutdown = Arc::clone(&shutdown);
        let ticker_tx = batch_tx.clone();
        let tick = (window / 4).max(Duration::from_millis(10));
        let ticker = std::thread::spawn(move || {
            while !ticker_shutdown.load(Ordering::Relaxed) {
                std::thread::sleep(tick);

                let now = Instant::now();
                let batch = {
                    let mut state = ticker_state.lock().expect("pipeline lock");
                    if state.buffered > 0 && state.flush_due(now, window) {
                        Some(state.drain(now))
                    } else {
                        if state.buffered == 0 && state.flush_due(now, window) {
                            // Re-arm the immediate-flush path for the next
                            // result after an idle stretch.
                            state.last_flush = None;
                        }
                        None
                    }
                };

                if let Some(batch) = batch {
                    if ticker_tx.send(batch).is_err() {
                        break;
                    }
                }
            }
        });

        Self {
            state,
            batch_tx: Some(batch_tx),
            shutdown,
            window,
            ticker: Some(ticker),
            writer: Some(writer),
        }
    }

    /// Buffer one result. Triggers a flush when the pipeline was idle or
    /// the flush window has elapsed; otherwise the ticker picks it up.
    pub fn record(&self, result: InvocationResult) {
        let now = Instant::now();
        let batch = {
            let mut state = self.state.lock().expect("pipeline lock");
            state.buffer.entry(result.key()).or_default().push(result);
            state.buffered += 1;

            if state.flush_due(now, self.window) {
                Some(state.drain(now))
            } else {
                None
            }
        };

        if let Some(batch) = batch {
            if let Some(tx) = &self.batch_tx {
                // The writer only disappears at shutdown; a send failure
                // there means the batch is dropped, which is the shutdown
                // contract anyway.
                let _ = tx.send(batch);
            }
        }
    }

    /// Number of results currently waiting for a flush.
    pub fn buffered(&self) -> usize {
        self.state.lock().expect("pipeline lock").buffered
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);

        // Final drain so nothing recorded is silently lost on shutdown.
        let batch = {
            let mut state = self.state.lock().expect("pipeline lock");
            state.drain(Instant::now())
        };
        if let Some(tx) = self.batch_tx.take() {
            if !batch.is_empty() {
                let _ = tx.send(batch);
            }
        }

        if let Some(ticker) = self.ticker.take() {
            let _ = ticker.join();
        }
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
    }
}
