use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Tracks when each deployment was last invoked and decides which
/// contexts an eviction sweep should dispose.
///
/// Each worker owns one cache for the deployments it hosts, so the sweep
/// runs on the same thread that executes invocations and can never race
/// one. Eligibility is `now - last_invoked >= threshold`.
pub struct IdleCache {
    last_invoked: HashMap<String, Instant>,
    threshold: Duration,
}

impl IdleCache {
    pub fn new(threshold: Duration) -> Self {
        Self {
            last_invoked: HashMap::new(),
            threshold,
        }
    }

    pub fn touch(&mut self, deployment_id: &str, now: Instant) {
        self.last_invoked.insert(deployment_id.to_string(), now);
    }

    pub fn should_evict(&self, deployment_id: &str, now: Instant) -> bool {
        match self.last_invoked.get(deployment_id) {
            Some(last) => now.duration_since(*last) >= self.threshold,
            None => false,
        }
    }

    /// Deployments eligible for eviction. The caller tears each context
    /// down and then removes the entry via `remove`.
    pub fn sweep(&self, now: Instant) -> Vec<String> {
        self.last_invoked
            .keys()
            .filter(|id| self.should_evict(id, now))
            .cloned()
            .collect()
    }

    pub fn remove(&mut self, deployment_id: &str) {
        self.last_invoked.remove(deployment_id);
    }

    pub fn len(&self) -> usize {
        self.last_invoked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_invoked.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THRESHOLD: Duration = Duration::from_secs(600);

    #[test]
    fn exactly_at_threshold_is_evicted() {
        let mut cache = IdleCache::new(THRESHOLD);
        let start = Instant::now();
        cache.touch("dep_1", start);

        assert!(cache.should_evict("dep_1", start + THRESHOLD));
    }

    #[test]
    fn one_second_short_of_threshold_is_kept() {
        let mut cache = IdleCache::new(THRESHOLD);
        let start = Instant::now();
        cache.touch("dep_1", start);

        assert!(!cache.should_evict("dep_1", start + THRESHOLD - Duration::from_secs(1)));
    }

    #[test]
    fn touch_resets_the_idle_clock() {
        let mut cache = IdleCache::new(THRESHOLD);
        let start = Instant::now();
        cache.touch("dep_1", start);
        cache.touch("dep_1", start + THRESHOLD);

        assert!(!cache.should_evict("dep_1", start + THRESHOLD + Duration::from_secs(1)));
        assert!(cache.should_evict("dep_1", start + THRESHOLD + THRESHOLD));
    }

    #[test]
    fn sweep_returns_only_eligible_deployments() {
        let mut cache = IdleCache::new(THRESHOLD);
        let start = Instant::now();
        cache.touch("idle", start);
        cache.touch("busy", start + THRESHOLD);

        let mut eligible = cache.sweep(start + THRESHOLD);
        eligible.sort();
        assert_eq!(eligible, vec!["idle".to_string()]);
    }

    #[test]
    fn untracked_deployments_are_never_evicted() {
        let cache = IdleCache::new(THRESHOLD);
        assert!(!cache.should_evict("unknown", Instant::now()));
    }
}
