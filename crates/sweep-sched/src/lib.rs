#![forbid(unsafe_code)]
//! Scan scheduling policies.
//!
//! A [`ScanMode`] decides which subvolume's crawler is popped next.
//! Each policy keeps a private ordered view over the crawler map and
//! rebuilds it from scratch on every transid tick; the rebuilt view is
//! published by pointer swap so an in-flight [`scan`](ScanMode::scan)
//! finishes on the view it captured. Crawlers whose look-ahead is empty
//! are omitted from the view.
//!
//! `scan` pops at most one range (through [`CrawlSink::crawl_batch`])
//! and returns false only once every crawler in the view has been
//! tried; the caller treats false as "idle until the next transid".
//! A duplicate key in an ordered view is a programmer invariant:
//! the operation fails loudly with [`SweepError::Invariant`] and is
//! aborted, the process keeps running.

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use sweep_crawl::{Crawler, CrawlerMap};
use sweep_error::{Result, SweepError};
use tracing::info;

/// The roots-level pop-and-dispatch hook a policy drives.
pub trait CrawlSink: Send + Sync {
    /// Pop one range from `crawler` and schedule its worker. False
    /// means the crawler could not produce.
    fn crawl_batch(&self, crawler: &Arc<Crawler>) -> bool;
}

/// One scan scheduling policy.
pub trait ScanMode: Send + Sync {
    /// Pop at most one range from one crawler. `Ok(true)` if a pop
    /// happened; an error aborts this scan pass.
    fn scan(&self, sink: &dyn CrawlSink) -> Result<bool>;

    /// Rebuild the ordered view over `map`, omitting crawlers without a
    /// look-ahead, and publish it atomically. An error leaves the
    /// previous view in place.
    fn next_transid(&self, map: &CrawlerMap) -> Result<()>;

    fn name(&self) -> &'static str;
}

// ── Policy selection ────────────────────────────────────────────────────────

/// Selector for the four scheduling policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanModeKind {
    Lockstep,
    #[default]
    Independent,
    Sequential,
    Recent,
}

impl ScanModeKind {
    /// Construct the policy this selector names.
    #[must_use]
    pub fn build(self) -> Arc<dyn ScanMode> {
        match self {
            Self::Lockstep => Arc::new(LockstepMode::default()),
            Self::Independent => Arc::new(IndependentMode::default()),
            Self::Sequential => Arc::new(SequentialMode::default()),
            Self::Recent => Arc::new(RecentMode::default()),
        }
    }
}

impl fmt::Display for ScanModeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Lockstep => "LOCKSTEP",
            Self::Independent => "INDEPENDENT",
            Self::Sequential => "SEQUENTIAL",
            Self::Recent => "RECENT",
        })
    }
}

impl FromStr for ScanModeKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lockstep" => Ok(Self::Lockstep),
            "independent" => Ok(Self::Independent),
            "sequential" => Ok(Self::Sequential),
            "recent" => Ok(Self::Recent),
            other => Err(format!("unknown scan mode '{other}'")),
        }
    }
}

// ── LOCKSTEP ────────────────────────────────────────────────────────────────

/// Sort key: `(ino, offset, root)` of the current look-ahead.
type LockstepKey = (u64, u64, u64);

/// Visit the same `(ino, offset)` across all subvolumes in near
/// lockstep. Best hash-index hit rate on snapshot-heavy filesystems
/// with stable data.
#[derive(Default)]
pub struct LockstepMode {
    view: ArcSwapOption<Mutex<BTreeMap<LockstepKey, Arc<Crawler>>>>,
}

fn lockstep_key(crawler: &Arc<Crawler>) -> Option<LockstepKey> {
    crawler
        .peek_front()
        .map(|range| (range.fid.ino.0, range.begin, range.fid.root.0))
}

impl ScanMode for LockstepMode {
    fn scan(&self, sink: &dyn CrawlSink) -> Result<bool> {
        let Some(view) = self.view.load_full() else {
            info!(target: "sweep::sched", "lockstep scan without a sorted view");
            return Ok(false);
        };
        let mut sorted = view.lock();
        while let Some((_, crawler)) = sorted.pop_first() {
            if sink.crawl_batch(&crawler) {
                if let Some(key) = lockstep_key(&crawler) {
                    if sorted.insert(key, crawler).is_some() {
                        return Err(SweepError::Invariant(format!(
                            "duplicate lockstep key {key:?}"
                        )));
                    }
                }
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn next_transid(&self, map: &CrawlerMap) -> Result<()> {
        let mut sorted = BTreeMap::new();
        for crawler in map.values() {
            if let Some(key) = lockstep_key(crawler) {
                if sorted.insert(key, Arc::clone(crawler)).is_some() {
                    return Err(SweepError::Invariant(format!(
                        "duplicate lockstep key {key:?} in rebuild"
                    )));
                }
            }
        }
        self.view.store(Some(Arc::new(Mutex::new(sorted))));
        Ok(())
    }

    fn name(&self) -> &'static str {
        "LOCKSTEP"
    }
}

// ── INDEPENDENT ─────────────────────────────────────────────────────────────

/// Round-robin over subvolumes with no cross-subvolume ordering.
/// Trades hit rate for contention-free forward progress.
#[derive(Default)]
pub struct IndependentMode {
    view: ArcSwapOption<Mutex<VecDeque<Arc<Crawler>>>>,
}

impl ScanMode for IndependentMode {
    fn scan(&self, sink: &dyn CrawlSink) -> Result<bool> {
        let Some(view) = self.view.load_full() else {
            info!(target: "sweep::sched", "independent scan without a subvol list");
            return Ok(false);
        };
        let mut subvols = view.lock();
        while let Some(crawler) = subvols.pop_front() {
            if sink.crawl_batch(&crawler) {
                subvols.push_back(crawler);
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn next_transid(&self, map: &CrawlerMap) -> Result<()> {
        let subvols: VecDeque<_> = map
            .values()
            .filter(|crawler| crawler.peek_front().is_some())
            .map(Arc::clone)
            .collect();
        self.view.store(Some(Arc::new(Mutex::new(subvols))));
        Ok(())
    }

    fn name(&self) -> &'static str {
        "INDEPENDENT"
    }
}

// ── SEQUENTIAL ──────────────────────────────────────────────────────────────

/// Complete one subvolume, in numerical order, before the next. Lowest
/// hit rate; retained for completeness.
#[derive(Default)]
pub struct SequentialMode {
    view: ArcSwapOption<Mutex<BTreeMap<u64, Arc<Crawler>>>>,
}

impl ScanMode for SequentialMode {
    fn scan(&self, sink: &dyn CrawlSink) -> Result<bool> {
        let Some(view) = self.view.load_full() else {
            info!(target: "sweep::sched", "sequential scan without a sorted view");
            return Ok(false);
        };
        let mut sorted = view.lock();
        loop {
            let Some((&root, crawler)) = sorted.iter().next() else {
                return Ok(false);
            };
            let crawler = Arc::clone(crawler);
            if sink.crawl_batch(&crawler) {
                // Stays at the front until it runs dry.
                return Ok(true);
            }
            sorted.remove(&root);
        }
    }

    fn next_transid(&self, map: &CrawlerMap) -> Result<()> {
        let mut sorted = BTreeMap::new();
        for crawler in map.values() {
            if crawler.peek_front().is_some()
                && sorted.insert(crawler.root().0, Arc::clone(crawler)).is_some()
            {
                return Err(SweepError::Invariant(format!(
                    "duplicate sequential key {}",
                    crawler.root()
                )));
            }
        }
        self.view.store(Some(Arc::new(Mutex::new(sorted))));
        Ok(())
    }

    fn name(&self) -> &'static str {
        "SEQUENTIAL"
    }
}

// ── RECENT ──────────────────────────────────────────────────────────────────

/// Bucket key ordered by *descending* `min_transid`: recently completed
/// subvolumes come first, so new data is deduped before it accumulates
/// behind large first scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RecentKey {
    min_transid: u64,
    max_transid: u64,
}

impl Ord for RecentKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (other.min_transid, other.max_transid).cmp(&(self.min_transid, self.max_transid))
    }
}

impl PartialOrd for RecentKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Prefer subvolumes with the highest window floor; ties share a FIFO
/// bucket.
#[derive(Default)]
pub struct RecentMode {
    view: ArcSwapOption<Mutex<BTreeMap<RecentKey, VecDeque<Arc<Crawler>>>>>,
}

impl ScanMode for RecentMode {
    fn scan(&self, sink: &dyn CrawlSink) -> Result<bool> {
        let Some(view) = self.view.load_full() else {
            info!(target: "sweep::sched", "recent scan without a sorted view");
            return Ok(false);
        };
        let mut sorted = view.lock();
        loop {
            let Some(mut entry) = sorted.first_entry() else {
                return Ok(false);
            };
            let key = *entry.key();
            let Some(crawler) = entry.get_mut().pop_front() else {
                entry.remove();
                continue;
            };
            if sink.crawl_batch(&crawler) {
                sorted.entry(key).or_default().push_back(crawler);
                return Ok(true);
            }
        }
    }

    fn next_transid(&self, map: &CrawlerMap) -> Result<()> {
        let mut sorted: BTreeMap<RecentKey, VecDeque<Arc<Crawler>>> = BTreeMap::new();
        for crawler in map.values() {
            if crawler.peek_front().is_some() {
                let state = crawler.state_end();
                // max_transid is pinned to zero: keying on the real
                // max_transid would drift this toward sequential order.
                let key = RecentKey {
                    min_transid: state.min_transid,
                    max_transid: 0,
                };
                sorted.entry(key).or_default().push_back(Arc::clone(crawler));
            }
        }
        self.view.store(Some(Arc::new(Mutex::new(sorted))));
        Ok(())
    }

    fn name(&self) -> &'static str {
        "RECENT"
    }
}
