use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU64, Ordering};

static GLOBAL: Lazy<DispatchMetrics> = Lazy::new(DispatchMetrics::new);

/// Process-wide dispatch counters.
pub fn global() -> &'static DispatchMetrics {
    &GLOBAL
}

#[derive(Debug, Default)]
pub struct DispatchMetrics {
    kernel_cache_hits: AtomicU64,
    kernel_cache_misses: AtomicU64,
    kernel_builds: AtomicU64,
    launches: AtomicU64,
    tuning_runs: AtomicU64,
    scratch_reuses: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub kernel_cache_hits: u64,
    pub kernel_cache_misses: u64,
    pub kernel_builds: u64,
    pub launches: u64,
    pub tuning_runs: u64,
    /// Scratch leases served from a pooled region.
    pub scratch_reuses: u64,
}

impl DispatchMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_hit(&self) {
        self.kernel_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_miss(&self) {
        self.kernel_cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_build(&self) {
        self.kernel_builds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_launches(&self, n: u64) {
        self.launches.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_tuning_run(&self) {
        self.tuning_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_scratch_reuse(&self) {
        self.scratch_reuses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            kernel_cache_hits: self.kernel_cache_hits.load(Ordering::Relaxed),
            kernel_cache_misses: self.kernel_cache_misses.load(Ordering::Relaxed),
            kernel_builds: self.kernel_builds.load(Ordering::Relaxed),
            launches: self.launches.load(Ordering::Relaxed),
            tuning_runs: self.tuning_runs.load(Ordering::Relaxed),
            scratch_reuses: self.scratch_reuses.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.kernel_cache_hits.store(0, Ordering::Relaxed);
        self.kernel_cache_misses.store(0, Ordering::Relaxed);
        self.kernel_builds.store(0, Ordering::Relaxed);
        self.launches.store(0, Ordering::Relaxed);
        self.tuning_runs.store(0, Ordering::Relaxed);
        self.scratch_reuses.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_and_reset() {
        let metrics = DispatchMetrics::new();
        metrics.inc_hit();
        metrics.inc_miss();
        metrics.inc_build();
        metrics.add_launches(3);
        metrics.inc_scratch_reuse();
        metrics.inc_scratch_reuse();
        let snap = metrics.snapshot();
        assert_eq!(snap.kernel_cache_hits, 1);
        assert_eq!(snap.launches, 3);
        assert_eq!(snap.scratch_reuses, 2);
        assert_eq!(snap.tuning_runs, 0);
        metrics.reset();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }
}
