#![forbid(unsafe_code)]
//! Reference implementations of the scan core's external collaborators,
//! for tests and simulations: a scriptable dedupe stub, a working
//! per-inode lock table with unlock re-arming, a static blacklist, and
//! a scenario builder that wires a coordinator over a [`MemoryTree`]
//! with the caller-drained inline task pool.

#[cfg(test)]
mod e2e;

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use sweep_error::{Result, SweepError};
use sweep_fdcache::CachePurge;
use sweep_roots::{
    Blacklist, Deduper, InodeGuard, InodeLocks, RetryHandle, Roots, RootsConfig, ScanContext,
};
use sweep_tree::{MemoryTree, TreeSearch};
use sweep_types::{FileId, FileRange, InodeNum};
use tempfile::TempDir;

// ── Dedupe stub ─────────────────────────────────────────────────────────────

type ScanHook = Box<dyn Fn(&FileRange) + Send + Sync>;

/// Recording deduper with per-range retry scripting and an optional
/// mid-call hook (for exercising what other threads observe while
/// `scan_forward` is in flight).
#[derive(Default)]
pub struct StubDeduper {
    delivered: Mutex<Vec<FileRange>>,
    retries: Mutex<HashMap<FileRange, u32>>,
    failures: Mutex<HashSet<FileRange>>,
    hook: Mutex<Option<ScanHook>>,
}

impl StubDeduper {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `times` offers of `range` return "retry later".
    pub fn script_retry(&self, range: FileRange, times: u32) {
        self.retries.lock().insert(range, times);
    }

    /// Make every offer of `range` fail.
    pub fn fail_on(&self, range: FileRange) {
        self.failures.lock().insert(range);
    }

    /// Run `hook` inside every `scan_forward` call, before it returns.
    pub fn set_hook(&self, hook: impl Fn(&FileRange) + Send + Sync + 'static) {
        *self.hook.lock() = Some(Box::new(hook));
    }

    /// Ranges delivered so far, in order.
    #[must_use]
    pub fn delivered(&self) -> Vec<FileRange> {
        self.delivered.lock().clone()
    }

    /// `(root, ino)` pairs delivered so far, in order.
    #[must_use]
    pub fn delivered_files(&self) -> Vec<(u64, u64)> {
        self.delivered
            .lock()
            .iter()
            .map(|range| (range.fid.root.0, range.fid.ino.0))
            .collect()
    }
}

impl Deduper for StubDeduper {
    fn scan_forward(&self, range: &FileRange) -> Result<bool> {
        self.delivered.lock().push(*range);
        if let Some(hook) = self.hook.lock().as_ref() {
            hook(range);
        }
        if self.failures.lock().contains(range) {
            return Err(SweepError::NotFound(format!("{range} vanished")));
        }
        let mut retries = self.retries.lock();
        if let Some(remaining) = retries.get_mut(range) {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(true);
            }
        }
        Ok(false)
    }
}

// ── Inode lock table ────────────────────────────────────────────────────────

#[derive(Default)]
struct LockSlot {
    held: bool,
    waiters: Vec<RetryHandle>,
}

#[derive(Default)]
struct LockInner {
    slots: Mutex<HashMap<u64, LockSlot>>,
    contended: AtomicU64,
}

/// Working per-inode advisory lock table. Contended attempts arm a
/// retry that fires when the holder's guard drops.
#[derive(Clone, Default)]
pub struct InodeLockTable {
    inner: Arc<LockInner>,
}

struct LockRelease {
    inner: Arc<LockInner>,
    ino: u64,
}

impl Drop for LockRelease {
    fn drop(&mut self) {
        let waiters = {
            let mut slots = self.inner.slots.lock();
            slots.get_mut(&self.ino).map_or_else(Vec::new, |slot| {
                slot.held = false;
                std::mem::take(&mut slot.waiters)
            })
        };
        // Re-arm outside the table lock.
        for retry in waiters {
            retry();
        }
    }
}

impl InodeLockTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock directly (to stage contention in a test). Panics
    /// if already held.
    #[must_use]
    pub fn hold_for_test(&self, ino: u64) -> InodeGuard {
        self.try_lock(InodeNum(ino), Box::new(|| {}))
            .expect("lock already held")
    }

    /// Times a caller found the lock contended.
    #[must_use]
    pub fn contended(&self) -> u64 {
        self.inner.contended.load(Ordering::Relaxed)
    }
}

impl InodeLocks for InodeLockTable {
    fn try_lock(&self, ino: InodeNum, retry: RetryHandle) -> Option<InodeGuard> {
        let mut slots = self.inner.slots.lock();
        let slot = slots.entry(ino.0).or_default();
        if slot.held {
            slot.waiters.push(retry);
            self.inner.contended.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        slot.held = true;
        Some(InodeGuard(Box::new(LockRelease {
            inner: Arc::clone(&self.inner),
            ino: ino.0,
        })))
    }
}

// ── Blacklist ───────────────────────────────────────────────────────────────

/// Fixed-set toxic-extent filter; empty by default.
#[derive(Default)]
pub struct StaticBlacklist {
    fids: Mutex<HashSet<FileId>>,
}

impl StaticBlacklist {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, fid: FileId) {
        self.fids.lock().insert(fid);
    }
}

impl Blacklist for StaticBlacklist {
    fn is_blacklisted(&self, fid: FileId) -> bool {
        self.fids.lock().contains(&fid)
    }
}

// ── Cache purge probe ───────────────────────────────────────────────────────

/// Counts purges the transid watcher issues.
#[derive(Default)]
pub struct PurgeProbe(AtomicU64);

impl PurgeProbe {
    #[must_use]
    pub fn count(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl CachePurge for PurgeProbe {
    fn purge(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

// ── Scenario wiring ─────────────────────────────────────────────────────────

/// A coordinator wired over a [`MemoryTree`] with stub collaborators
/// and the inline task pool, plus the state directory it persists to.
pub struct Scenario {
    pub tree: Arc<MemoryTree>,
    pub deduper: Arc<StubDeduper>,
    pub locks: InodeLockTable,
    pub blacklist: Arc<StaticBlacklist>,
    pub purge: Arc<PurgeProbe>,
    pub roots: Arc<Roots>,
    state_dir: TempDir,
}

impl Scenario {
    /// Build over `tree` with default config (inline pool, INDEPENDENT).
    #[must_use]
    pub fn new(tree: Arc<MemoryTree>) -> Self {
        Self::with_config(tree, |_| {})
    }

    #[must_use]
    pub fn with_config(tree: Arc<MemoryTree>, tweak: impl FnOnce(&mut RootsConfig)) -> Self {
        let state_dir = tempfile::tempdir().expect("create state dir");
        Self::wire(tree, state_dir, tweak)
    }

    fn wire(
        tree: Arc<MemoryTree>,
        state_dir: TempDir,
        tweak: impl FnOnce(&mut RootsConfig),
    ) -> Self {
        let deduper = StubDeduper::new();
        let locks = InodeLockTable::new();
        let blacklist = StaticBlacklist::new();
        let purge = Arc::new(PurgeProbe::default());

        let mut config = RootsConfig {
            workers: 0,
            state_dir: state_dir.path().to_path_buf(),
            ..RootsConfig::default()
        };
        tweak(&mut config);

        let ctx = ScanContext {
            tree: Arc::clone(&tree) as Arc<dyn TreeSearch>,
            deduper: Arc::clone(&deduper) as Arc<dyn Deduper>,
            locks: Arc::new(locks.clone()) as Arc<dyn InodeLocks>,
            blacklist: Arc::clone(&blacklist) as Arc<dyn Blacklist>,
            caches: vec![Arc::clone(&purge) as Arc<dyn CachePurge>],
        };
        let roots = Roots::new(ctx, config);

        Self {
            tree,
            deduper,
            locks,
            blacklist,
            purge,
            roots,
            state_dir,
        }
    }

    /// Boot: sample the generation and load any persisted state.
    pub fn startup(&self) {
        self.roots.startup().expect("startup");
    }

    /// One transid tick plus a full drain of the inline pool.
    pub fn tick_and_drain(&self) {
        self.roots.transid_tick().expect("transid tick");
        self.roots.pool().drain();
    }

    /// Simulate an abrupt kill and restart: the old coordinator is
    /// dropped without any flush, and a fresh one is wired over the
    /// same tree and state directory.
    #[must_use]
    pub fn restart(self) -> Self {
        let Self {
            tree, state_dir, ..
        } = self;
        Self::wire(tree, state_dir, |_| {})
    }

    /// Path of the persisted state file.
    #[must_use]
    pub fn state_file(&self) -> std::path::PathBuf {
        self.state_dir.path().join(sweep_roots::STATE_FILE_NAME)
    }
}
