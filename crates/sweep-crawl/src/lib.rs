#![forbid(unsafe_code)]
//! Per-subvolume crawler: a lazy cursor over the stream of extent-data
//! items whose metadata pages fall inside the current generation
//! window.
//!
//! A crawler owns at most one fetched-ahead item. `peek_front` fills
//! the look-ahead without consuming it; `pop_front` consumes it so the
//! next call re-fetches. Fetching advances the end-cursor to the *next*
//! inode; the remainder of the popped inode is walked by the worker
//! that received the range, not by the crawler.
//!
//! The crawler reaches global state (current transid, read-only
//! status, dirty marking) only through [`CrawlEnv`], so it never holds
//! a reference back into the coordinator that owns it.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use sweep_progress::{ProgressHolder, ProgressTracker};
use sweep_tree::TreeSearch;
use sweep_types::{CrawlState, ExtentItem, FileRange, RootId};
use tracing::{debug, info, warn};

/// Map of all live crawlers, keyed by subvolume.
pub type CrawlerMap = BTreeMap<RootId, Arc<Crawler>>;

/// Coordinator-owned state a crawler consults during fetches.
pub trait CrawlEnv: Send + Sync {
    /// Most recently sampled filesystem generation.
    fn transid_max(&self) -> u64;

    /// True when `root` must not be scanned (read-only subvolume under
    /// the send workaround, or vanished).
    fn is_root_ro(&self, root: RootId) -> bool;

    /// Record that persistent crawl state changed.
    fn mark_state_dirty(&self);
}

/// Wall-clock seconds since the epoch, for the advisory `started` stamp.
#[must_use]
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[derive(Debug, Default)]
struct CrawlInner {
    /// One-slot look-ahead.
    next: Option<ExtentItem>,
    /// Skipped until the next transid cycle clears this.
    deferred: bool,
    /// Window exhausted; nothing until `next_transid` opens a new one.
    finished: bool,
}

/// Lazy extent cursor for one subvolume.
pub struct Crawler {
    env: Arc<dyn CrawlEnv>,
    tree: Arc<dyn TreeSearch>,
    root: RootId,
    progress: ProgressTracker<CrawlState>,
    inner: Mutex<CrawlInner>,
}

impl Crawler {
    #[must_use]
    pub fn new(env: Arc<dyn CrawlEnv>, tree: Arc<dyn TreeSearch>, initial: CrawlState) -> Self {
        Self {
            env,
            tree,
            root: initial.root,
            progress: ProgressTracker::new(initial),
            inner: Mutex::new(CrawlInner::default()),
        }
    }

    #[must_use]
    pub fn root(&self) -> RootId {
        self.root
    }

    /// Safe persist point: no in-flight range started below it.
    #[must_use]
    pub fn state_begin(&self) -> CrawlState {
        self.progress.begin()
    }

    /// Leading edge the crawler has reached.
    #[must_use]
    pub fn state_end(&self) -> CrawlState {
        self.progress.end()
    }

    /// Pin `state` until the returned token drops.
    #[must_use]
    pub fn hold_state(&self, state: CrawlState) -> ProgressHolder<CrawlState> {
        self.progress.hold(state)
    }

    /// Advance the end-cursor and mark persistent state dirty.
    pub fn set_state(&self, state: CrawlState) {
        self.progress.set(state);
        self.env.mark_state_dirty();
    }

    pub fn set_deferred(&self, deferred: bool) {
        self.inner.lock().deferred = deferred;
    }

    #[must_use]
    pub fn is_deferred(&self) -> bool {
        self.inner.lock().deferred
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.inner.lock().finished
    }

    /// Fill the look-ahead if needed and return the range it covers,
    /// without consuming it.
    #[must_use]
    pub fn peek_front(&self) -> Option<FileRange> {
        let mut inner = self.inner.lock();
        self.fetch_extents_harder(&mut inner);
        inner.next.as_ref().map(|item| item.range_in(self.root))
    }

    /// Fill the look-ahead if needed and consume it.
    #[must_use]
    pub fn pop_front(&self) -> Option<FileRange> {
        let mut inner = self.inner.lock();
        self.fetch_extents_harder(&mut inner);
        inner.next.take().map(|item| item.range_in(self.root))
    }

    fn fetch_extents_harder(&self, inner: &mut CrawlInner) {
        while inner.next.is_none() {
            if !self.fetch_extents(inner) {
                return;
            }
        }
    }

    /// One fetch attempt. Returns true when progress was made (an item
    /// was fetched or a new window opened) and another attempt is worth
    /// making.
    fn fetch_extents(&self, inner: &mut CrawlInner) -> bool {
        // Membership refresh will undefer us. Until then, nothing.
        if inner.deferred {
            return false;
        }

        let old_state = self.progress.end();

        // An empty transid interval cannot be scanned.
        if inner.finished || old_state.window_is_empty() {
            return self.next_transid(inner);
        }

        if self.env.is_root_ro(self.root) {
            // Send workaround: pretend the subvolume is empty. Keep
            // max_transid current while the scan has never started, so
            // flipping the subvolume read-write later does not trigger
            // searches across ancient transids.
            debug!(target: "sweep::crawl", root = %self.root, "skipping scan of read-only subvol");
            if old_state.objectid == 0 {
                let mut state = old_state;
                state.max_transid = state.max_transid.max(self.env.transid_max());
                state.started = now_secs();
                self.set_state(state);
            }
            inner.deferred = true;
            return false;
        }

        // Note: no max_transid filter here. The item-generation window
        // is applied per extent by the worker; the page-level filter
        // below min_transid alone keeps old refs on new pages visible.
        match self
            .tree
            .next_extent(self.root, old_state.objectid, old_state.min_transid)
        {
            Err(err) => {
                // Transient per-subvolume failure: stop scanning this
                // subvol until the next transid cycle.
                warn!(target: "sweep::crawl", root = %self.root, %err, "extent fetch failed, deferring");
                inner.deferred = true;
                false
            }
            Ok(None) => {
                // Ran out of data in this subvol and window. Restart
                // immediately if more transids are available.
                self.next_transid(inner)
            }
            Ok(Some(item)) => {
                let mut new_state = old_state;
                new_state.objectid = item.objectid.checked_add(1).unwrap_or(item.objectid);
                new_state.offset = 0;
                inner.next = Some(item);
                self.set_state(new_state);
                true
            }
        }
    }

    /// Close the current window and open the next one if the global
    /// transid has moved on. Returns true when a new window opened.
    fn next_transid(&self, inner: &mut CrawlInner) -> bool {
        let next = self.env.transid_max();
        let mut state = self.progress.end();

        inner.finished = state.max_transid >= next;
        if inner.finished {
            inner.deferred = true;
            info!(target: "sweep::crawl", root = %self.root, %state, "crawl finished");
            return false;
        }

        state.min_transid = state.max_transid;
        state.max_transid = next;
        state.objectid = 0;
        state.offset = 0;
        state.started = now_secs();
        self.set_state(state);
        inner.deferred = false;
        info!(target: "sweep::crawl", root = %self.root, %state, "crawl started");
        true
    }
}

impl std::fmt::Debug for Crawler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Crawler")
            .field("root", &self.root)
            .field("end", &self.progress.end())
            .finish_non_exhaustive()
    }
}
