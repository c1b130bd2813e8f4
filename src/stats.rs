//! Runtime counters exposed to embedders via the `stats` attribute (§6).
//!
//! Kept as plain atomics rather than behind the data lock — these are
//! diagnostic counters, not part of the on-disk format, so a torn read
//! under concurrent access is an acceptable inaccuracy.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Stats {
    pub allocations: AtomicU64,
    pub frees: AtomicU64,
    pub expansions: AtomicU64,
    pub transactions_committed: AtomicU64,
    pub transactions_cancelled: AtomicU64,
    pub lock_waits: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_alloc(&self) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_free(&self) {
        self.frees.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_expansion(&self) {
        self.expansions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit(&self) {
        self.transactions_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancel(&self) {
        self.transactions_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_wait(&self) {
        self.lock_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            allocations: self.allocations.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            expansions: self.expansions.load(Ordering::Relaxed),
            transactions_committed: self.transactions_committed.load(Ordering::Relaxed),
            transactions_cancelled: self.transactions_cancelled.load(Ordering::Relaxed),
            lock_waits: self.lock_waits.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of `Stats`, handed to embedders so they aren't
/// holding references into the live atomics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub allocations: u64,
    pub frees: u64,
    pub expansions: u64,
    pub transactions_committed: u64,
    pub transactions_cancelled: u64,
    pub lock_waits: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_increment() {
        let s = Stats::new();
        assert_eq!(s.snapshot().allocations, 0);
        s.record_alloc();
        s.record_alloc();
        assert_eq!(s.snapshot().allocations, 2);
    }
}
