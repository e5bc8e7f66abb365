// Process-wide engine-status counters (spec §9, "Global mutable state").
//
// The original keeps on the order of 150 `CACHETABLE_STATUS` counters.
// This crate carries a representative subset behind a `StatusSink` trait,
// so a test can install a stub sink and assert on counts deterministically
// instead of reading a single hardwired global.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub trait StatusSink: Send + Sync {
    fn incr(&self, counter: Counter);
    fn add(&self, counter: Counter, n: u64);
    fn get(&self, counter: Counter) -> u64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    PairsTotal,
    EvictionsTotal,
    PartialEvictionsTotal,
    ClonesTotal,
    CachePressureWaitsTotal,
    ChecksBegunTotal,
    ChecksEndedTotal,
    CleanerIterationsTotal,
    LongWaitPressureTotal,
    NonblockingRetriesTotal,
}

const NUM_COUNTERS: usize = 10;

impl Counter {
    fn index(self) -> usize {
        match self {
            Counter::PairsTotal => 0,
            Counter::EvictionsTotal => 1,
            Counter::PartialEvictionsTotal => 2,
            Counter::ClonesTotal => 3,
            Counter::CachePressureWaitsTotal => 4,
            Counter::ChecksBegunTotal => 5,
            Counter::ChecksEndedTotal => 6,
            Counter::CleanerIterationsTotal => 7,
            Counter::LongWaitPressureTotal => 8,
            Counter::NonblockingRetriesTotal => 9,
        }
    }
}

/// The default sink: plain atomics, no external reporting. Good enough
/// for an embedded library; a host process can supply its own `StatusSink`
/// (e.g. wired to its metrics exporter) via `CacheTable::with_status_sink`.
pub struct AtomicStatusSink {
    counters: [AtomicU64; NUM_COUNTERS],
}

impl AtomicStatusSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            counters: Default::default(),
        })
    }
}

impl Default for AtomicStatusSink {
    fn default() -> Self {
        Self {
            counters: Default::default(),
        }
    }
}

impl StatusSink for AtomicStatusSink {
    fn incr(&self, counter: Counter) {
        self.counters[counter.index()].fetch_add(1, Ordering::Relaxed);
    }

    fn add(&self, counter: Counter, n: u64) {
        self.counters[counter.index()].fetch_add(n, Ordering::Relaxed);
    }

    fn get(&self, counter: Counter) -> u64 {
        self.counters[counter.index()].load(Ordering::Relaxed)
    }
}
