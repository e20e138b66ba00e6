//! Narrow instrumentation surface.
//!
//! `lls` does not own a logging or metrics sink (those are external
//! collaborators); it only emits `tracing` spans/events and exposes a
//! small set of counters a caller can scrape.

use std::sync::atomic::{AtomicU64, Ordering};

/// Plain atomic counters tracking the volume of background activity.
///
/// Sunk nowhere by this crate; a caller reads them directly.
#[derive(Default)]
pub struct Counters {
    pub events_emitted: AtomicU64,
    pub eager_writes: AtomicU64,
    pub heartbeats: AtomicU64,
    pub restores: AtomicU64,
    pub restores_skipped: AtomicU64,
    pub reconciliation_cycles: AtomicU64,
    pub reconciliation_events_emitted: AtomicU64,
    pub eviction_candidates_emitted: AtomicU64,
    pub proactive_copies_attempted: AtomicU64,
    pub checkpoints_created: AtomicU64,
    pub expired_entries_compacted: AtomicU64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_accumulate() {
        let c = Counters::new();
        assert_eq!(c.heartbeats.load(Ordering::Relaxed), 0);
        Counters::incr(&c.heartbeats);
        Counters::add(&c.events_emitted, 3);
        assert_eq!(c.heartbeats.load(Ordering::Relaxed), 1);
        assert_eq!(c.events_emitted.load(Ordering::Relaxed), 3);
    }
}
