//! Contracts for the external collaborators the scan core drives.
//!
//! The dedupe engine, the filesystem-wide inode locks, and the toxic
//! extent blacklist all live outside this workspace; the coordinator
//! only ever sees them through these traits.

use std::any::Any;
use std::sync::Arc;
use sweep_error::Result;
use sweep_fdcache::CachePurge;
use sweep_tree::TreeSearch;
use sweep_types::{FileId, FileRange, InodeNum};

/// Dedupe engine entry point.
pub trait Deduper: Send + Sync {
    /// Hash, look up, and clone-range `range`. Returns true when the
    /// same range must be re-offered later (progress cannot yet advance
    /// past it), false when the range is fully handled.
    fn scan_forward(&self, range: &FileRange) -> Result<bool>;
}

/// Callback re-submitting a worker once a contended inode lock frees up.
pub type RetryHandle = Box<dyn FnOnce() + Send + 'static>;

/// RAII guard for a held inode lock. Dropping it releases the lock and
/// fires any armed retries.
pub struct InodeGuard(pub Box<dyn Any + Send>);

/// Filesystem-wide per-inode advisory locks: only one worker dedupes a
/// given inode number at a time, across all subvolumes.
pub trait InodeLocks: Send + Sync {
    /// Try to take the lock for `ino`. On contention, `retry` is armed
    /// to run when the current holder releases, and `None` is returned;
    /// the caller drops its task without rescheduling itself.
    fn try_lock(&self, ino: InodeNum, retry: RetryHandle) -> Option<InodeGuard>;
}

/// Toxic-extent filter.
pub trait Blacklist: Send + Sync {
    fn is_blacklisted(&self, fid: FileId) -> bool;
}

/// Everything the scan core needs from the outside world.
pub struct ScanContext {
    pub tree: Arc<dyn TreeSearch>,
    pub deduper: Arc<dyn Deduper>,
    pub locks: Arc<dyn InodeLocks>,
    pub blacklist: Arc<dyn Blacklist>,
    /// Caches to purge on every transid change (FD cache, resolver
    /// cache). Open root FDs pin snapshots against kernel cleanup, so
    /// this purge is not optional.
    pub caches: Vec<Arc<dyn CachePurge>>,
}
