use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Cache-wide operation counters.
///
/// Counters only; gauges for resident and passivated instances are read off
/// the live structures when a snapshot is taken.
#[derive(Debug, Default)]
pub(crate) struct CacheStats {
    /// Checkouts served from the active map
    hits: AtomicU64,
    /// Checkouts that had to go to the store or the factory
    misses: AtomicU64,
    /// Entries restored from a store
    activations: AtomicU64,
    /// Entries written to a store
    passivations: AtomicU64,
    /// Store entries expired by the sweep
    expirations: AtomicU64,
    /// Instances dropped from memory without a store write
    evictions: AtomicU64,
    /// Explicit removals
    removals: AtomicU64,
}

impl CacheStats {
    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_activation(&self) {
        self.activations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_passivation(&self) {
        self.passivations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_expiration(&self) {
        self.expirations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_removal(&self) {
        self.removals.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(
        &self,
        resident: usize,
        checked_out: usize,
        passivated: usize,
    ) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            resident,
            checked_out,
            passivated,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            activations: self.activations.load(Ordering::Relaxed),
            passivations: self.passivations.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            removals: self.removals.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of a cache's counters and gauges.
#[derive(Debug, Clone)]
pub struct CacheStatsSnapshot {
    /// Instances in the active map, idle or checked out
    pub resident: usize,
    /// Instances currently checked out by callers
    pub checked_out: usize,
    /// Entries held by the passivation store
    pub passivated: usize,
    pub hits: u64,
    pub misses: u64,
    pub activations: u64,
    pub passivations: u64,
    pub expirations: u64,
    pub evictions: u64,
    pub removals: u64,
}

impl fmt::Display for CacheStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Cache Stats: {} resident ({} checked out), {} passivated, {} hits, {} misses, {} activations, {} passivations, {} expirations, {} evictions, {} removals",
            self.resident,
            self.checked_out,
            self.passivated,
            self.hits,
            self.misses,
            self.activations,
            self.passivations,
            self.expirations,
            self.evictions,
            self.removals
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = CacheStats::default();
        stats.record_hit();
        stats.record_hit();
        stats.record_miss();
        stats.record_passivation();

        let snapshot = stats.snapshot(3, 1, 2);
        assert_eq!(snapshot.hits, 2);
        assert_eq!(snapshot.misses, 1);
        assert_eq!(snapshot.passivations, 1);
        assert_eq!(snapshot.resident, 3);
        assert_eq!(snapshot.checked_out, 1);
        assert_eq!(snapshot.passivated, 2);
    }

    #[test]
    fn test_snapshot_display() {
        let stats = CacheStats::default();
        stats.record_miss();

        let text = stats.snapshot(1, 0, 0).to_string();
        assert!(text.contains("1 resident (0 checked out)"));
        assert!(text.contains("1 misses"));
    }
}
