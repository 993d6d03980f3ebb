//! Coordinator configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use sweep_sched::ScanModeKind;

/// Settings for the roots coordinator. The config surface itself
/// (files, flags) is owned by the daemon frontend; this struct is what
/// arrives here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RootsConfig {
    /// Scheduling policy for the scan loop.
    pub scan_mode: ScanModeKind,
    /// Treat read-only subvolumes as empty so an in-progress `send` is
    /// never disturbed.
    pub workaround_btrfs_send: bool,
    /// Directory holding the crawl state file.
    pub state_dir: PathBuf,
    /// Lower bound on the transid poll interval, seconds.
    pub transid_poll_floor_secs: u64,
    /// Writeback cadence for the crawl state file, seconds.
    pub writeback_interval_secs: u64,
    /// Worker threads for the scan task pool. Zero selects the inline
    /// pool: tasks only run when the caller drains them, which is what
    /// the deterministic tests want.
    pub workers: usize,
    /// Capacity of the `root -> fd` cache.
    pub root_fd_cache_size: usize,
    /// Capacity of the `(root, ino) -> fd` cache.
    pub file_fd_cache_size: usize,
}

impl Default for RootsConfig {
    fn default() -> Self {
        Self {
            scan_mode: ScanModeKind::Independent,
            workaround_btrfs_send: false,
            state_dir: PathBuf::from("."),
            transid_poll_floor_secs: 30,
            writeback_interval_secs: 900,
            workers: std::thread::available_parallelism().map_or(1, usize::from),
            root_fd_cache_size: sweep_fdcache::DEFAULT_ROOT_CAPACITY,
            file_fd_cache_size: sweep_fdcache::DEFAULT_INO_CAPACITY,
        }
    }
}
