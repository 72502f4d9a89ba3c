//! Process-wide pipeline counters.
//!
//! Cheap atomic counters bumped by each stage and snapshotted on demand
//! through the scheduler's `stats()` surface.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Stats {
    pub ticks: AtomicU64,
    pub tick_failures: AtomicU64,
    pub events_emitted: AtomicU64,
    pub analyses_computed: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub deliveries: AtomicU64,
    pub duplicates_dropped: AtomicU64,
    pub delivery_failures: AtomicU64,
    pub sweeps: AtomicU64,
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub ticks: u64,
    pub tick_failures: u64,
    pub events_emitted: u64,
    pub analyses_computed: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub deliveries: u64,
    pub duplicates_dropped: u64,
    pub delivery_failures: u64,
    pub sweeps: u64,
}

impl Stats {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            tick_failures: self.tick_failures.load(Ordering::Relaxed),
            events_emitted: self.events_emitted.load(Ordering::Relaxed),
            analyses_computed: self.analyses_computed.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            duplicates_dropped: self.duplicates_dropped.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            sweeps: self.sweeps.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let stats = Stats::default();
        Stats::incr(&stats.ticks);
        Stats::incr(&stats.ticks);
        Stats::incr(&stats.deliveries);

        let snap = stats.snapshot();
        assert_eq!(snap.ticks, 2);
        assert_eq!(snap.deliveries, 1);
        assert_eq!(snap.cache_hits, 0);
    }
}
