#![forbid(unsafe_code)]
//! Roots coordinator: owns the crawler map, the scan scheduler, the
//! transid watcher, and crawl-state writeback.
//!
//! Two dedicated threads run here. The **transid watcher** samples the
//! filesystem generation, and whenever it moves: purges the FD caches
//! (open root FDs pin snapshots against kernel cleanup), refreshes
//! subvolume membership, rebuilds the scheduler's ordered view, and
//! re-arms the scan loop task. The **writeback** thread flushes the
//! textual crawl state whenever the dirty counter has moved past the
//! clean counter, and once more on shutdown.
//!
//! Lock discipline: the scheduler mutex here is taken, copied from,
//! and released before calling into the scheduler or the crawlers, so
//! no coordinator lock is ever held across a tree search or a dedupe
//! call.

mod config;
mod context;
mod counters;
mod statefile;
mod task;
mod worker;

pub use config::RootsConfig;
pub use context::{Blacklist, Deduper, InodeGuard, InodeLocks, RetryHandle, ScanContext};
pub use counters::{ScanCounters, ScanCountersSnapshot};
pub use statefile::{
    RepairStats, STATE_FILE_NAME, format_timestamp, load_from, parse_states, render_states,
    save_to,
};
pub use task::{TaskFn, TaskPool};

use parking_lot::{Condvar, Mutex};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use sweep_crawl::{CrawlEnv, Crawler, CrawlerMap, now_secs};
use sweep_error::{Result, SweepError};
use sweep_progress::RateEstimator;
use sweep_sched::{CrawlSink, ScanMode, ScanModeKind};
use sweep_types::{CrawlState, EXTENT_TREE_OBJECTID, FS_TREE_OBJECTID, OFFSET_EOF_SENTINEL, RootId};
use tracing::{debug, error, info, trace, warn};

/// Ceiling on the predicted transid poll interval, seconds.
pub const MAX_TRANSID_POLL_SECS: f64 = 3600.0;

/// Smoothing time constant for the transid rate estimate, seconds.
const TRANSID_RATE_TAU_SECS: f64 = 600.0;

// ── Shared crawler environment ──────────────────────────────────────────────

/// State shared between the coordinator and its crawlers. Crawlers hold
/// this instead of the coordinator itself, so there is no reference
/// cycle through the crawler map.
struct RootsShared {
    tree: Arc<dyn sweep_tree::TreeSearch>,
    transid: Mutex<RateEstimator>,
    /// Monotone count of crawl-state changes since startup.
    dirty: AtomicU64,
    workaround_send: AtomicBool,
}

impl CrawlEnv for RootsShared {
    fn transid_max(&self) -> u64 {
        self.transid.lock().count()
    }

    fn is_root_ro(&self, root: RootId) -> bool {
        // Without the send workaround every root is read-write to us.
        if !self.workaround_send.load(Ordering::Relaxed) {
            return false;
        }
        match self.tree.root_item(root) {
            Ok(Some(info)) => info.read_only(),
            // Unreadable root item: guess read-only.
            _ => true,
        }
    }

    fn mark_state_dirty(&self) {
        self.dirty.fetch_add(1, Ordering::AcqRel);
    }
}

// ── Stop signal ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct StopSignal {
    flag: Mutex<bool>,
    wake: Condvar,
}

impl StopSignal {
    fn request(&self) {
        *self.flag.lock() = true;
        self.wake.notify_all();
    }

    /// Sleep up to `timeout`; true means stop was requested.
    fn wait_for(&self, timeout: Duration) -> bool {
        let mut stopped = self.flag.lock();
        if *stopped {
            return true;
        }
        self.wake.wait_for(&mut stopped, timeout);
        *stopped
    }
}

// ── Coordinator ─────────────────────────────────────────────────────────────

struct SchedState {
    crawl_map: CrawlerMap,
    scanner: Arc<dyn ScanMode>,
}

/// The roots coordinator.
pub struct Roots {
    ctx: Arc<ScanContext>,
    config: RootsConfig,
    shared: Arc<RootsShared>,
    sched: Mutex<SchedState>,
    /// Dirty count last flushed to disk.
    clean: AtomicU64,
    counters: Arc<ScanCounters>,
    pool: TaskPool,
    stop: StopSignal,
    last_transid: AtomicU64,
    watcher: Mutex<Option<JoinHandle<()>>>,
    writeback: Mutex<Option<JoinHandle<()>>>,
    self_weak: Weak<Roots>,
}

impl Roots {
    #[must_use]
    pub fn new(ctx: ScanContext, config: RootsConfig) -> Arc<Self> {
        let pool = if config.workers == 0 {
            TaskPool::inline()
        } else {
            TaskPool::new(config.workers)
        };
        let shared = Arc::new(RootsShared {
            tree: Arc::clone(&ctx.tree),
            transid: Mutex::new(RateEstimator::new(TRANSID_RATE_TAU_SECS)),
            dirty: AtomicU64::new(0),
            workaround_send: AtomicBool::new(config.workaround_btrfs_send),
        });
        let scanner = config.scan_mode.build();
        info!(target: "sweep::roots", mode = scanner.name(), "scan mode set");

        Arc::new_cyclic(|weak| Self {
            ctx: Arc::new(ctx),
            config,
            shared,
            sched: Mutex::new(SchedState {
                crawl_map: CrawlerMap::new(),
                scanner,
            }),
            clean: AtomicU64::new(0),
            counters: Arc::new(ScanCounters::default()),
            pool,
            stop: StopSignal::default(),
            last_transid: AtomicU64::new(0),
            watcher: Mutex::new(None),
            writeback: Mutex::new(None),
            self_weak: weak.clone(),
        })
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Sample the filesystem generation and load persisted crawl state.
    /// Errors here are startup errors and propagate.
    pub fn startup(&self) -> Result<()> {
        let sample = self.transid_max_nocache()?;
        self.shared.transid.lock().update(sample);
        self.state_load()
    }

    /// Run [`startup`](Self::startup), then launch the transid watcher
    /// and writeback threads.
    pub fn start(&self) -> Result<()> {
        self.startup()?;
        let Some(this) = self.self_weak.upgrade() else {
            return Err(SweepError::Invariant("roots dropped during start".to_owned()));
        };

        let roots = Arc::clone(&this);
        let watcher = std::thread::Builder::new()
            .name("crawl-transid".to_owned())
            .spawn(move || roots.watcher_loop())?;
        *self.watcher.lock() = Some(watcher);

        let roots = this;
        let writeback = std::thread::Builder::new()
            .name("crawl-writeback".to_owned())
            .spawn(move || roots.writeback_loop())?;
        *self.writeback.lock() = Some(writeback);
        Ok(())
    }

    pub fn stop_request(&self) {
        debug!(target: "sweep::roots", "stop requested");
        self.stop.request();
    }

    /// Join the background threads and shut down the task pool.
    /// Writeback is joined first: it must flush the final state before
    /// in-flight worker progress is discarded with the queue.
    pub fn stop_wait(&self) {
        if let Some(handle) = self.writeback.lock().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.watcher.lock().take() {
            let _ = handle.join();
        }
        self.pool.shutdown();
        debug!(target: "sweep::roots", "stopped");
    }

    // ── Transid watching ────────────────────────────────────────────────

    fn watcher_loop(&self) {
        loop {
            if let Err(err) = self.transid_tick() {
                warn!(target: "sweep::roots", %err, "transid tick failed");
            }
            let poll_secs = {
                let estimator = self.shared.transid.lock();
                estimator
                    .seconds_for(1, MAX_TRANSID_POLL_SECS)
                    .max(self.config.transid_poll_floor_secs as f64)
            };
            debug!(target: "sweep::roots", poll_secs, "waiting for next transid");
            if self.stop.wait_for(Duration::from_secs_f64(poll_secs)) {
                debug!(target: "sweep::roots", "stop requested in transid watcher");
                return;
            }
        }
    }

    /// One watcher iteration: sample the generation; when it moved,
    /// purge caches, refresh membership, rebuild the scheduler view,
    /// and re-arm the scan loop.
    pub fn transid_tick(&self) -> Result<()> {
        let sample = self.transid_max_nocache()?;
        self.shared.transid.lock().update(sample);

        let new_transid = self.shared.transid.lock().count();
        let previous = self.last_transid.swap(new_transid, Ordering::Relaxed);
        if new_transid != previous {
            // Open FDs pin snapshots the kernel wants to reap; drop
            // them all before anything else happens this cycle.
            for cache in &self.ctx.caches {
                cache.purge();
            }
            self.insert_new_crawl()?;
            self.spawn_scan_task();
        }
        Ok(())
    }

    /// Latest smoothed generation sample.
    #[must_use]
    pub fn transid_max(&self) -> u64 {
        self.shared.transid.lock().count()
    }

    /// Read the generation straight from the extent tree's root item.
    pub fn transid_max_nocache(&self) -> Result<u64> {
        let info = self
            .ctx
            .tree
            .root_item(RootId(EXTENT_TREE_OBJECTID))?
            .ok_or_else(|| SweepError::NotFound("extent tree root item".to_owned()))?;
        if info.transid == 0 || info.transid == u64::MAX {
            return Err(SweepError::Invariant(format!(
                "implausible filesystem transid {}",
                info.transid
            )));
        }
        Ok(info.transid)
    }

    /// Smallest window floor across writable subvolumes; new crawlers
    /// start here. Zero on an empty map; an error when a non-empty map
    /// has no writable subvolume (starting at zero would be wrong, and
    /// an overflowed minimum would be worse).
    pub fn transid_min(&self) -> Result<u64> {
        let map = { self.sched.lock().crawl_map.clone() };
        if map.is_empty() {
            return Ok(0);
        }
        let mut min = u64::MAX;
        for (root, crawler) in &map {
            // Read-only subvols never advance under the send
            // workaround; they must not drag the fleet minimum.
            if !self.shared.is_root_ro(*root) {
                min = min.min(crawler.state_end().min_transid);
            }
        }
        if min == u64::MAX {
            return Err(SweepError::Invariant(
                "no writable subvolume anchors transid_min".to_owned(),
            ));
        }
        Ok(min)
    }

    // ── Membership ──────────────────────────────────────────────────────

    /// Next live subvolume after `root`, via root-backref order. The
    /// filesystem tree root has no backref and is seeded explicitly;
    /// zero means exhausted.
    pub fn next_root(&self, root: RootId) -> Result<RootId> {
        if root.0 < FS_TREE_OBJECTID {
            return Ok(RootId(FS_TREE_OBJECTID));
        }
        let Some(min) = root.0.checked_add(1) else {
            return Ok(RootId(0));
        };
        Ok(self
            .ctx
            .tree
            .next_root_backref(min)?
            .map_or(RootId(0), |backref| backref.root))
    }

    /// Create a crawler for `new_state.root` if missing, and clear its
    /// deferred flag either way.
    pub fn insert_root(&self, new_state: CrawlState) {
        let mut sched = self.sched.lock();
        let crawler = sched.crawl_map.entry(new_state.root).or_insert_with(|| {
            ScanCounters::bump(&self.counters.crawlers_created);
            self.shared.mark_state_dirty();
            debug!(target: "sweep::roots", state = %new_state, "creating crawler");
            Arc::new(Crawler::new(
                Arc::clone(&self.shared) as Arc<dyn CrawlEnv>,
                Arc::clone(&self.ctx.tree),
                new_state,
            ))
        });
        crawler.set_deferred(false);
    }

    fn crawl_state_erase(&self, root: RootId) {
        let mut sched = self.sched.lock();
        // The last entry pins the fleet-wide max_transid; keep it even
        // if its subvolume is gone.
        if sched.crawl_map.len() < 2 {
            ScanCounters::bump(&self.counters.erase_refused);
            return;
        }
        if sched.crawl_map.remove(&root).is_some() {
            debug!(target: "sweep::roots", %root, "erased crawler");
            self.shared.mark_state_dirty();
        }
    }

    /// Refresh subvolume membership: insert crawlers for new roots,
    /// erase crawlers for vanished ones, then rebuild the scheduler's
    /// ordered view.
    pub fn insert_new_crawl(&self) -> Result<()> {
        let min_transid = self.transid_min()?;
        let max_transid = self.transid_max();

        let mut excess: BTreeSet<RootId> =
            { self.sched.lock().crawl_map.keys().copied().collect() };

        let mut root = self.next_root(RootId(0))?;
        while root.0 != 0 {
            excess.remove(&root);
            self.insert_root(CrawlState::new(root, min_transid, max_transid, now_secs()));
            root = self.next_root(root)?;
        }
        for stale in excess {
            self.crawl_state_erase(stale);
        }

        // Work from a copy: rebuilding the view peeks crawlers, which
        // fetches, which must not happen under the coordinator lock.
        let (map_copy, scanner) = {
            let sched = self.sched.lock();
            (sched.crawl_map.clone(), Arc::clone(&sched.scanner))
        };
        if map_copy.is_empty() {
            info!(target: "sweep::roots", "crawl map is empty");
        }
        scanner.next_transid(&map_copy)?;
        Ok(())
    }

    // ── Scanning ────────────────────────────────────────────────────────

    /// One scheduler tick: pop and dispatch at most one range. False
    /// means idle until the next transid.
    pub fn crawl_roots(&self) -> bool {
        let scanner = { Arc::clone(&self.sched.lock().scanner) };
        match scanner.scan(self) {
            Ok(true) => true,
            Ok(false) => {
                ScanCounters::bump(&self.counters.idle_ticks);
                info!(target: "sweep::roots", mode = scanner.name(), "scan ran out of data");
                false
            }
            Err(err) => {
                // Programmer invariant tripped: abort this scan pass,
                // not the process. The next transid tick re-arms the
                // loop.
                error!(target: "sweep::roots", mode = scanner.name(), %err, "scan pass aborted");
                false
            }
        }
    }

    /// Arm the self-re-enqueueing scan loop task.
    pub fn spawn_scan_task(&self) {
        let weak = self.self_weak.clone();
        self.pool.spawn(
            "crawl_more",
            Box::new(move || weak.upgrade().is_some_and(|roots| roots.crawl_roots())),
        );
    }

    pub fn set_scan_mode(&self, kind: ScanModeKind) {
        let scanner = kind.build();
        info!(target: "sweep::roots", mode = scanner.name(), "scan mode set");
        self.sched.lock().scanner = scanner;
    }

    pub fn set_workaround_btrfs_send(&self, enable: bool) {
        if enable {
            info!(target: "sweep::roots", "btrfs send workaround enabled");
        } else {
            info!(target: "sweep::roots", "btrfs send workaround disabled");
        }
        self.shared.workaround_send.store(enable, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_root_ro(&self, root: RootId) -> bool {
        self.shared.is_root_ro(root)
    }

    // ── Persistence ─────────────────────────────────────────────────────

    fn state_load(&self) -> Result<()> {
        info!(target: "sweep::roots", "loading crawl state");
        let Some((states, repairs)) = statefile::load_from(&self.config.state_dir)? else {
            info!(target: "sweep::roots", "no crawl state file, cold start");
            return Ok(());
        };
        for _ in 0..repairs.total() {
            ScanCounters::bump(&self.counters.state_repairs);
        }
        let records = states.len();
        for state in states {
            self.insert_root(state);
        }
        info!(target: "sweep::roots", records, repairs = repairs.total(), "loaded crawl state");
        Ok(())
    }

    /// Flush crawl state if it changed since the last flush. The dirty
    /// count is snapshotted before rendering and committed to clean
    /// only after a successful write; a newer dirty value is caught by
    /// the next tick.
    pub fn state_save(&self) -> Result<()> {
        let dirty = self.shared.dirty.load(Ordering::Acquire);
        if dirty == self.clean.load(Ordering::Acquire) {
            trace!(target: "sweep::roots", "crawl state clean, nothing to save");
            return Ok(());
        }

        let states: Vec<CrawlState> = {
            let sched = self.sched.lock();
            sched
                .crawl_map
                .values()
                .map(|crawler| crawler.state_begin())
                .collect()
        };

        if states.iter().all(|state| state.max_transid == 0) {
            warn!(target: "sweep::roots", "crawl state is empty, skipping write");
            self.clean.store(dirty, Ordering::Release);
            return Ok(());
        }

        statefile::save_to(&self.config.state_dir, &states)?;
        self.clean.store(dirty, Ordering::Release);
        info!(target: "sweep::roots", records = states.len(), "saved crawl state");
        Ok(())
    }

    fn writeback_loop(&self) {
        loop {
            if let Err(err) = self.state_save() {
                warn!(target: "sweep::roots", %err, "crawl state save failed");
            }
            let interval = Duration::from_secs(self.config.writeback_interval_secs);
            if self.stop.wait_for(interval) {
                debug!(target: "sweep::roots", "stop requested in writeback thread");
                if let Err(err) = self.state_save() {
                    warn!(target: "sweep::roots", %err, "final crawl state flush failed");
                }
                return;
            }
        }
    }

    // ── Introspection ───────────────────────────────────────────────────

    #[must_use]
    pub fn crawler(&self, root: RootId) -> Option<Arc<Crawler>> {
        self.sched.lock().crawl_map.get(&root).cloned()
    }

    #[must_use]
    pub fn subvols(&self) -> Vec<RootId> {
        self.sched.lock().crawl_map.keys().copied().collect()
    }

    #[must_use]
    pub fn counters(&self) -> ScanCountersSnapshot {
        self.counters.snapshot()
    }

    #[must_use]
    pub fn pool(&self) -> &TaskPool {
        &self.pool
    }

    #[must_use]
    pub fn config(&self) -> &RootsConfig {
        &self.config
    }
}

impl CrawlSink for Roots {
    /// Pop one range, spawn its worker, and park the crawler cursor
    /// near EOF so the same inode is not dispatched twice. The worker
    /// walks the rest of the inode itself.
    fn crawl_batch(&self, crawler: &Arc<Crawler>) -> bool {
        let this_state = crawler.state_end();
        let Some(range) = crawler.pop_front() else {
            return false;
        };
        trace!(target: "sweep::roots", %range, "dispatching batch");

        let file_crawl = worker::FileCrawl::new(
            Arc::clone(&self.ctx),
            Arc::clone(&self.counters),
            self.pool.clone(),
            Arc::clone(crawler),
            this_state,
            range,
        );
        file_crawl.submit();

        let mut next_state = this_state;
        next_state.offset = next_state.offset.max(OFFSET_EOF_SENTINEL);
        crawler.set_state(next_state);
        ScanCounters::bump(&self.counters.batches);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use sweep_fdcache::CachePurge;
    use sweep_tree::{MemoryTree, TreeSearch};
    use sweep_types::{FileId, FileRange, InodeNum};

    struct NullDeduper;

    impl Deduper for NullDeduper {
        fn scan_forward(&self, _range: &FileRange) -> Result<bool> {
            Ok(false)
        }
    }

    struct FreeLocks;

    impl InodeLocks for FreeLocks {
        fn try_lock(&self, _ino: InodeNum, _retry: RetryHandle) -> Option<InodeGuard> {
            Some(InodeGuard(Box::new(())))
        }
    }

    struct NoBlacklist;

    impl Blacklist for NoBlacklist {
        fn is_blacklisted(&self, _fid: FileId) -> bool {
            false
        }
    }

    #[derive(Default)]
    struct PurgeCounter(AtomicU64);

    impl CachePurge for PurgeCounter {
        fn purge(&self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn test_roots_in(dir: &std::path::Path, tree: &Arc<MemoryTree>) -> (Arc<Roots>, Arc<PurgeCounter>) {
        let purge = Arc::new(PurgeCounter::default());
        let ctx = ScanContext {
            tree: Arc::clone(tree) as Arc<dyn TreeSearch>,
            deduper: Arc::new(NullDeduper),
            locks: Arc::new(FreeLocks),
            blacklist: Arc::new(NoBlacklist),
            caches: vec![Arc::clone(&purge) as Arc<dyn CachePurge>],
        };
        let config = RootsConfig {
            workers: 0,
            state_dir: dir.to_path_buf(),
            ..RootsConfig::default()
        };
        (Roots::new(ctx, config), purge)
    }

    #[test]
    fn membership_refresh_inserts_and_erases() {
        let dir = tempfile::tempdir().unwrap();
        let tree = Arc::new(MemoryTree::new(4096));
        for root in [256, 257, 258] {
            tree.add_subvol(RootId(root), &format!("vol{root}"));
        }
        tree.set_transid(10);
        let (roots, _) = test_roots_in(dir.path(), &tree);
        roots.startup().unwrap();

        roots.insert_new_crawl().unwrap();
        assert_eq!(
            roots.subvols(),
            vec![RootId(5), RootId(256), RootId(257), RootId(258)]
        );

        // 257 and 258 vanish, 259 appears.
        tree.remove_subvol(RootId(257));
        tree.remove_subvol(RootId(258));
        tree.add_subvol(RootId(259), "vol259");
        roots.insert_new_crawl().unwrap();
        assert_eq!(roots.subvols(), vec![RootId(5), RootId(256), RootId(259)]);
    }

    #[test]
    fn insert_root_is_idempotent_and_undefers() {
        let dir = tempfile::tempdir().unwrap();
        let tree = Arc::new(MemoryTree::new(4096));
        tree.add_subvol(RootId(256), "vol");
        tree.set_transid(10);
        let (roots, _) = test_roots_in(dir.path(), &tree);

        let state = CrawlState::new(RootId(256), 0, 10, 0);
        roots.insert_root(state);
        let crawler = roots.crawler(RootId(256)).unwrap();
        crawler.set_deferred(true);
        roots.insert_root(state);
        assert_eq!(roots.subvols().len(), 1);
        assert!(!crawler.is_deferred());
        assert_eq!(roots.counters().crawlers_created, 1);
    }

    #[test]
    fn last_crawler_is_never_erased() {
        let dir = tempfile::tempdir().unwrap();
        let tree = Arc::new(MemoryTree::new(4096));
        tree.set_transid(10);
        let (roots, _) = test_roots_in(dir.path(), &tree);

        roots.insert_root(CrawlState::new(RootId(256), 0, 10, 0));
        roots.crawl_state_erase(RootId(256));
        assert_eq!(roots.subvols(), vec![RootId(256)]);
        assert_eq!(roots.counters().erase_refused, 1);
    }

    #[test]
    fn transid_min_skips_read_only_and_fails_without_writable() {
        let dir = tempfile::tempdir().unwrap();
        let tree = Arc::new(MemoryTree::new(4096));
        tree.set_transid(10);
        tree.add_subvol(RootId(256), "vol");
        tree.add_subvol_ro(RootId(260), "snap");
        let (roots, _) = test_roots_in(dir.path(), &tree);
        roots.set_workaround_btrfs_send(true);

        assert_eq!(roots.transid_min().unwrap(), 0, "empty map");

        roots.insert_root(CrawlState::new(RootId(260), 7, 10, 0));
        // Only a read-only subvol: loud failure, not an overflow.
        assert!(roots.transid_min().is_err());

        roots.insert_root(CrawlState::new(RootId(256), 3, 10, 0));
        assert_eq!(roots.transid_min().unwrap(), 3);
    }

    #[test]
    fn transid_max_nocache_rejects_implausible_values() {
        let dir = tempfile::tempdir().unwrap();
        let tree = Arc::new(MemoryTree::new(4096));
        tree.set_transid(0);
        let (roots, _) = test_roots_in(dir.path(), &tree);
        assert!(roots.transid_max_nocache().is_err());
        tree.set_transid(u64::MAX);
        assert!(roots.transid_max_nocache().is_err());
        tree.set_transid(7);
        assert_eq!(roots.transid_max_nocache().unwrap(), 7);
    }

    #[test]
    fn crawl_batch_parks_cursor_at_eof_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let tree = Arc::new(MemoryTree::new(4096));
        tree.set_transid(10);
        tree.add_subvol(RootId(256), "vol");
        tree.add_extent(RootId(256), 300, 0, 4096, 5);
        let (roots, _) = test_roots_in(dir.path(), &tree);
        roots.startup().unwrap();
        roots.insert_root(CrawlState::new(RootId(256), 0, 10, 0));

        let crawler = roots.crawler(RootId(256)).unwrap();
        // The scheduler only dispatches crawlers it has peeked.
        assert!(crawler.peek_front().is_some());
        assert!(roots.crawl_batch(&crawler));
        assert!(crawler.state_end().offset >= OFFSET_EOF_SENTINEL);
        assert_eq!(roots.counters().batches, 1);
        assert_eq!(roots.pool().queued(), 1, "worker task queued");
    }

    #[test]
    fn transid_tick_purges_caches_only_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let tree = Arc::new(MemoryTree::new(4096));
        tree.set_transid(10);
        tree.add_subvol(RootId(256), "vol");
        let (roots, purge) = test_roots_in(dir.path(), &tree);
        roots.startup().unwrap();

        roots.transid_tick().unwrap();
        assert_eq!(purge.0.load(Ordering::Relaxed), 1);
        roots.transid_tick().unwrap();
        assert_eq!(purge.0.load(Ordering::Relaxed), 1, "no change, no purge");
        tree.set_transid(11);
        roots.transid_tick().unwrap();
        assert_eq!(purge.0.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn state_save_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let tree = Arc::new(MemoryTree::new(4096));
        tree.set_transid(10);
        tree.add_subvol(RootId(256), "vol");
        let (roots, _) = test_roots_in(dir.path(), &tree);
        roots.startup().unwrap();
        roots.insert_root(CrawlState::new(RootId(256), 0, 10, 77));
        roots.state_save().unwrap();

        let (reloaded, _) = test_roots_in(dir.path(), &tree);
        reloaded.startup().unwrap();
        let crawler = reloaded.crawler(RootId(256)).unwrap();
        let state = crawler.state_end();
        assert_eq!((state.min_transid, state.max_transid), (0, 10));
    }

    #[test]
    fn clean_state_skips_writes() {
        let dir = tempfile::tempdir().unwrap();
        let tree = Arc::new(MemoryTree::new(4096));
        tree.set_transid(10);
        let (roots, _) = test_roots_in(dir.path(), &tree);
        // Empty map, nothing dirty: writeback must not block or write.
        roots.state_save().unwrap();
        assert!(!dir.path().join(STATE_FILE_NAME).exists());
    }

    #[test]
    fn start_and_stop_threads() {
        let dir = tempfile::tempdir().unwrap();
        let tree = Arc::new(MemoryTree::new(4096));
        tree.set_transid(10);
        tree.add_subvol(RootId(256), "vol");
        tree.add_extent(RootId(256), 300, 0, 4096, 5);
        let (roots, purge) = test_roots_in(dir.path(), &tree);

        roots.start().unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while purge.0.load(Ordering::Relaxed) == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(purge.0.load(Ordering::Relaxed) >= 1);
        roots.stop_request();
        roots.stop_wait();
        // The final writeback flushed the dirty crawler map.
        assert!(dir.path().join(STATE_FILE_NAME).exists());
    }
}
