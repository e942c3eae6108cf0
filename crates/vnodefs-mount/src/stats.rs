//! Statistics for a mounted volume.
//!
//! All counters are lock-free atomics so they can be bumped from any request
//! thread, including while graph or node locks are held.
//!
//! ```
//! use vnodefs_mount::stats::VolumeStats;
//!
//! let stats = VolumeStats::new();
//! stats.record_backend_call();
//! stats.record_backend_error();
//! stats.record_lock_retry();
//!
//! let snap = stats.snapshot();
//! assert_eq!(snap.backend_calls, 1);
//! assert_eq!(snap.backend_errors, 1);
//! assert_eq!(snap.lock_retries, 1);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters describing graph, lock and backend activity.
#[derive(Debug, Default)]
pub struct VolumeStats {
    lookups: AtomicU64,
    backend_calls: AtomicU64,
    backend_errors: AtomicU64,
    lock_acquisitions: AtomicU64,
    /// Node locks that could not be taken without blocking.
    lock_contentions: AtomicU64,
    /// Whole chain acquisitions restarted after a structural change.
    lock_retries: AtomicU64,
    /// Name resolutions restarted because the bound node changed identity.
    stale_retries: AtomicU64,
    nodes_created: AtomicU64,
    nodes_destroyed: AtomicU64,
    dir_cache_builds: AtomicU64,
}

/// Point-in-time copy of [`VolumeStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VolumeStatsSnapshot {
    pub lookups: u64,
    pub backend_calls: u64,
    pub backend_errors: u64,
    pub lock_acquisitions: u64,
    pub lock_contentions: u64,
    pub lock_retries: u64,
    pub stale_retries: u64,
    pub nodes_created: u64,
    pub nodes_destroyed: u64,
    pub dir_cache_builds: u64,
}

impl VolumeStatsSnapshot {
    /// Nodes currently alive according to the counters.
    pub fn live_nodes(&self) -> u64 {
        self.nodes_created.saturating_sub(self.nodes_destroyed)
    }

    /// Fraction of backend calls that failed, 0.0 when nothing was called.
    pub fn backend_error_rate(&self) -> f64 {
        if self.backend_calls == 0 {
            0.0
        } else {
            self.backend_errors as f64 / self.backend_calls as f64
        }
    }

    /// Rows for tabular display, in a stable order.
    pub fn rows(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("lookups", self.lookups),
            ("backend calls", self.backend_calls),
            ("backend errors", self.backend_errors),
            ("lock acquisitions", self.lock_acquisitions),
            ("lock contentions", self.lock_contentions),
            ("lock retries", self.lock_retries),
            ("stale retries", self.stale_retries),
            ("nodes created", self.nodes_created),
            ("nodes destroyed", self.nodes_destroyed),
            ("dir cache builds", self.dir_cache_builds),
        ]
    }
}

impl VolumeStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_lookup(&self) {
        self.lookups.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_backend_call(&self) {
        self.backend_calls.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_backend_error(&self) {
        self.backend_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_lock_acquisition(&self) {
        self.lock_acquisitions.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_lock_contention(&self) {
        self.lock_contentions.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_lock_retry(&self) {
        self.lock_retries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_stale_retry(&self) {
        self.stale_retries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_node_created(&self) {
        self.nodes_created.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_node_destroyed(&self) {
        self.nodes_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_dir_cache_build(&self) {
        self.dir_cache_builds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> VolumeStatsSnapshot {
        VolumeStatsSnapshot {
            lookups: self.lookups.load(Ordering::Relaxed),
            backend_calls: self.backend_calls.load(Ordering::Relaxed),
            backend_errors: self.backend_errors.load(Ordering::Relaxed),
            lock_acquisitions: self.lock_acquisitions.load(Ordering::Relaxed),
            lock_contentions: self.lock_contentions.load(Ordering::Relaxed),
            lock_retries: self.lock_retries.load(Ordering::Relaxed),
            stale_retries: self.stale_retries.load(Ordering::Relaxed),
            nodes_created: self.nodes_created.load(Ordering::Relaxed),
            nodes_destroyed: self.nodes_destroyed.load(Ordering::Relaxed),
            dir_cache_builds: self.dir_cache_builds.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_snapshot_starts_empty() {
        let stats = VolumeStats::new();
        assert_eq!(stats.snapshot(), VolumeStatsSnapshot::default());
        assert!(stats.snapshot().backend_error_rate().abs() < f64::EPSILON);
    }

    #[test]
    fn test_live_nodes() {
        let stats = VolumeStats::new();
        for _ in 0..5 {
            stats.record_node_created();
        }
        stats.record_node_destroyed();
        stats.record_node_destroyed();
        assert_eq!(stats.snapshot().live_nodes(), 3);
    }

    #[test]
    fn test_error_rate() {
        let stats = VolumeStats::new();
        for _ in 0..4 {
            stats.record_backend_call();
        }
        stats.record_backend_error();
        let rate = stats.snapshot().backend_error_rate();
        assert!((rate - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_rows_cover_every_counter() {
        let stats = VolumeStats::new();
        stats.record_dir_cache_build();
        let rows = stats.snapshot().rows();
        assert_eq!(rows.len(), 10);
        assert_eq!(rows.last(), Some(&("dir cache builds", 1)));
    }

    #[test]
    fn test_concurrent_updates() {
        let stats = Arc::new(VolumeStats::new());
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let stats = Arc::clone(&stats);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.record_lookup();
                        stats.record_lock_acquisition();
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        let snap = stats.snapshot();
        assert_eq!(snap.lookups, 8000);
        assert_eq!(snap.lock_acquisitions, 8000);
    }
}
