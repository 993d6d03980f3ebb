//! Monotone event counters for the scan core.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counts of scan-core events since startup. All counters only grow.
#[derive(Debug, Default)]
pub struct ScanCounters {
    /// Extent items below the window floor (old data on new pages).
    pub gen_low: AtomicU64,
    /// Extent items at or above the window ceiling (next cycle's data).
    pub gen_high: AtomicU64,
    /// Inline extents skipped.
    pub inline_skipped: AtomicU64,
    /// Preallocated extents seen (then treated as regular).
    pub prealloc: AtomicU64,
    /// Holes skipped.
    pub hole_skipped: AtomicU64,
    /// Unrecognised extent types skipped.
    pub unknown_type: AtomicU64,
    /// Ranges delivered to the deduper.
    pub pushed: AtomicU64,
    /// Ranges the deduper asked to see again.
    pub retry: AtomicU64,
    /// Ranges dropped by the blacklist.
    pub blacklisted: AtomicU64,
    /// Workers that backed off a contended inode lock.
    pub inode_deferred: AtomicU64,
    /// Deduper errors swallowed (cursor advanced anyway).
    pub dedupe_errors: AtomicU64,
    /// Successful pops dispatched to workers.
    pub batches: AtomicU64,
    /// Scheduler ticks that found no crawler able to produce.
    pub idle_ticks: AtomicU64,
    /// Crawlers created by membership refresh or state load.
    pub crawlers_created: AtomicU64,
    /// Crawler erasures refused to keep the map non-empty.
    pub erase_refused: AtomicU64,
    /// Sentinel values repaired while loading the state file.
    pub state_repairs: AtomicU64,
}

/// Point-in-time copy of [`ScanCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanCountersSnapshot {
    pub gen_low: u64,
    pub gen_high: u64,
    pub inline_skipped: u64,
    pub prealloc: u64,
    pub hole_skipped: u64,
    pub unknown_type: u64,
    pub pushed: u64,
    pub retry: u64,
    pub blacklisted: u64,
    pub inode_deferred: u64,
    pub dedupe_errors: u64,
    pub batches: u64,
    pub idle_ticks: u64,
    pub crawlers_created: u64,
    pub erase_refused: u64,
    pub state_repairs: u64,
}

impl ScanCounters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> ScanCountersSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        ScanCountersSnapshot {
            gen_low: load(&self.gen_low),
            gen_high: load(&self.gen_high),
            inline_skipped: load(&self.inline_skipped),
            prealloc: load(&self.prealloc),
            hole_skipped: load(&self.hole_skipped),
            unknown_type: load(&self.unknown_type),
            pushed: load(&self.pushed),
            retry: load(&self.retry),
            blacklisted: load(&self.blacklisted),
            inode_deferred: load(&self.inode_deferred),
            dedupe_errors: load(&self.dedupe_errors),
            batches: load(&self.batches),
            idle_ticks: load(&self.idle_ticks),
            crawlers_created: load(&self.crawlers_created),
            erase_refused: load(&self.erase_refused),
            state_repairs: load(&self.state_repairs),
        }
    }
}
