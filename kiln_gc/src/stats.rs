//! Barrier runtime statistics.
//!
//! Counts how often compiled barriers fell through to the runtime and how
//! many entries reached the collector's queues.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated by the barrier slow paths.
#[derive(Debug, Default)]
pub struct BarrierStats {
    // =========================================================================
    // Slow Path Calls
    // =========================================================================
    /// SATB pre-barrier runtime calls.
    pub pre_slow_calls: AtomicU64,
    /// Dirty-card post-barrier runtime calls.
    pub post_slow_calls: AtomicU64,

    // =========================================================================
    // Queue Traffic
    // =========================================================================
    /// Old values recorded by the runtime SATB path.
    pub satb_enqueued: AtomicU64,
    /// Card addresses recorded by the runtime card path.
    pub cards_enqueued: AtomicU64,

    // =========================================================================
    // Errors
    // =========================================================================
    /// Accesses outside every mapped segment.
    pub faults: AtomicU64,
}

/// Plain copy of [`BarrierStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BarrierStatsSnapshot {
    pub pre_slow_calls: u64,
    pub post_slow_calls: u64,
    pub satb_enqueued: u64,
    pub cards_enqueued: u64,
    pub faults: u64,
}

impl BarrierStats {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a consistent-enough copy for reporting.
    pub fn snapshot(&self) -> BarrierStatsSnapshot {
        BarrierStatsSnapshot {
            pre_slow_calls: self.pre_slow_calls.load(Ordering::Relaxed),
            post_slow_calls: self.post_slow_calls.load(Ordering::Relaxed),
            satb_enqueued: self.satb_enqueued.load(Ordering::Relaxed),
            cards_enqueued: self.cards_enqueued.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        for counter in [
            &self.pre_slow_calls,
            &self.post_slow_calls,
            &self.satb_enqueued,
            &self.cards_enqueued,
            &self.faults,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_and_reset() {
        let stats = BarrierStats::new();
        BarrierStats::bump(&stats.pre_slow_calls);
        BarrierStats::bump(&stats.pre_slow_calls);
        BarrierStats::bump(&stats.faults);
        let snap = stats.snapshot();
        assert_eq!(snap.pre_slow_calls, 2);
        assert_eq!(snap.faults, 1);
        stats.reset();
        assert_eq!(stats.snapshot(), BarrierStatsSnapshot::default());
    }
}
