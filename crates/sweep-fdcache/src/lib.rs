#![forbid(unsafe_code)]
//! Bounded FD caches and the subvolume-path resolver.
//!
//! Translates `root` and `(root, ino)` to open file descriptors by
//! walking root backrefs and inode paths, and memoizes the results in
//! two bounded LRU maps. Descriptor handles are reference counted by
//! the [`VfsOps`] implementation; evicting or clearing a cache entry
//! drops the handle, which closes the descriptor once the last user is
//! done with it.
//!
//! Both caches must be cleared on every transid change so the kernel
//! can reap snapshots the daemon would otherwise pin open; the roots
//! coordinator drives that through [`CachePurge`].

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use sweep_error::{Result, SweepError};
use sweep_tree::TreeSearch;
use sweep_types::{FIRST_FREE_OBJECTID, FS_TREE_OBJECTID, FileId, InodeNum, ROOT_TREE_OBJECTID, RootId};
use tracing::{debug, info, warn};

// ── LRU map ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct LruEntry<V> {
    value: V,
    seq: u64,
}

/// Bounded associative cache with least-recently-used eviction.
///
/// Two indexes kept in lockstep: the value map and an access-ordered
/// sequence index. Evicted values are dropped by the caller's scope.
#[derive(Debug)]
pub struct LruMap<K, V> {
    capacity: usize,
    next_seq: u64,
    map: HashMap<K, LruEntry<V>>,
    order: BTreeMap<u64, K>,
}

impl<K: Eq + Hash + Clone, V> LruMap<K, V> {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_seq: 0,
            map: HashMap::new(),
            order: BTreeMap::new(),
        }
    }

    fn touch(&mut self, key: &K) {
        if let Some(entry) = self.map.get_mut(key) {
            self.order.remove(&entry.seq);
            entry.seq = self.next_seq;
            self.order.insert(self.next_seq, key.clone());
            self.next_seq += 1;
        }
    }

    pub fn get(&mut self, key: &K) -> Option<&V> {
        if self.map.contains_key(key) {
            self.touch(key);
        }
        self.map.get(key).map(|entry| &entry.value)
    }

    /// Insert, evicting the least recently used entries down to capacity.
    /// Returns the number of evictions.
    pub fn insert(&mut self, key: K, value: V) -> usize {
        if let Some(old) = self.map.remove(&key) {
            self.order.remove(&old.seq);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.map.insert(key.clone(), LruEntry { value, seq });
        self.order.insert(seq, key);

        let mut evicted = 0;
        while self.map.len() > self.capacity {
            let Some((&oldest_seq, _)) = self.order.iter().next() else {
                break;
            };
            if let Some(oldest_key) = self.order.remove(&oldest_seq) {
                self.map.remove(&oldest_key);
                evicted += 1;
            }
        }
        evicted
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.order.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

// ── Filesystem surface ──────────────────────────────────────────────────────

/// The slice of filesystem operations the resolver needs. The real
/// implementation wraps the mount FD and the inode-path/open syscalls;
/// tests provide an in-memory fake.
pub trait VfsOps: Send + Sync {
    /// Shared descriptor handle. Cloning shares the underlying
    /// descriptor; dropping the last clone closes it.
    type Fd: Clone + Send + Sync + 'static;

    /// Descriptor for the filesystem tree root (the mount point).
    fn mount_fd(&self) -> Self::Fd;

    /// Paths of `ino` relative to the subvolume containing `dir`.
    fn ino_paths(&self, dir: &Self::Fd, ino: InodeNum) -> Result<Vec<String>>;

    /// Open a directory named `path` relative to `dir`.
    fn open_dir_at(&self, dir: &Self::Fd, path: &str) -> Result<Self::Fd>;

    /// Open a file read-only at `path` relative to `dir`. Read-only is
    /// deliberate: the clone-range ioctl does not need write access, and
    /// a writable descriptor would block exec of the file.
    fn open_file_at(&self, dir: &Self::Fd, path: &str) -> Result<Self::Fd>;

    /// Subvolume id the descriptor lives in.
    fn root_of(&self, fd: &Self::Fd) -> Result<RootId>;

    /// Inode number of the descriptor.
    fn inode_of(&self, fd: &Self::Fd) -> Result<InodeNum>;

    /// Device id, for same-filesystem verification.
    fn device_of(&self, fd: &Self::Fd) -> Result<u64>;

    /// True if the inode carries the no-cow attribute. The kernel
    /// rejects dedupe between datasum and nodatasum inodes, so no-cow
    /// files are excluded entirely.
    fn is_nocow(&self, fd: &Self::Fd) -> Result<bool>;
}

/// Clear hook the transid watcher calls on every generation change.
pub trait CachePurge: Send + Sync {
    fn purge(&self);
}

// ── Stats ───────────────────────────────────────────────────────────────────

/// Monotone event counters for the cache and resolver.
#[derive(Debug, Default)]
pub struct FdCacheStats {
    pub root_hit: AtomicU64,
    pub root_miss: AtomicU64,
    pub root_fail: AtomicU64,
    pub ino_hit: AtomicU64,
    pub ino_miss: AtomicU64,
    pub tmpfile_hit: AtomicU64,
    pub evictions: AtomicU64,
    pub lookup_enoent: AtomicU64,
    pub lookup_error: AtomicU64,
    pub wrong_ino: AtomicU64,
    pub wrong_root: AtomicU64,
    pub wrong_dev: AtomicU64,
    pub wrong_flags: AtomicU64,
    pub no_path: AtomicU64,
}

/// Point-in-time copy of [`FdCacheStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FdCacheSnapshot {
    pub root_hit: u64,
    pub root_miss: u64,
    pub root_fail: u64,
    pub ino_hit: u64,
    pub ino_miss: u64,
    pub tmpfile_hit: u64,
    pub evictions: u64,
    pub lookup_enoent: u64,
    pub lookup_error: u64,
    pub wrong_ino: u64,
    pub wrong_root: u64,
    pub wrong_dev: u64,
    pub wrong_flags: u64,
    pub no_path: u64,
}

impl FdCacheStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> FdCacheSnapshot {
        FdCacheSnapshot {
            root_hit: self.root_hit.load(Ordering::Relaxed),
            root_miss: self.root_miss.load(Ordering::Relaxed),
            root_fail: self.root_fail.load(Ordering::Relaxed),
            ino_hit: self.ino_hit.load(Ordering::Relaxed),
            ino_miss: self.ino_miss.load(Ordering::Relaxed),
            tmpfile_hit: self.tmpfile_hit.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            lookup_enoent: self.lookup_enoent.load(Ordering::Relaxed),
            lookup_error: self.lookup_error.load(Ordering::Relaxed),
            wrong_ino: self.wrong_ino.load(Ordering::Relaxed),
            wrong_root: self.wrong_root.load(Ordering::Relaxed),
            wrong_dev: self.wrong_dev.load(Ordering::Relaxed),
            wrong_flags: self.wrong_flags.load(Ordering::Relaxed),
            no_path: self.no_path.load(Ordering::Relaxed),
        }
    }
}

// ── FD cache ────────────────────────────────────────────────────────────────

/// Default capacity of the `root → Fd` cache.
pub const DEFAULT_ROOT_CAPACITY: usize = 1024;
/// Default capacity of the `(root, ino) → Fd` cache.
pub const DEFAULT_INO_CAPACITY: usize = 16384;

/// Bounded cache over the path resolver.
pub struct FdCache<V: VfsOps> {
    vfs: Arc<V>,
    tree: Arc<dyn TreeSearch>,
    roots: Mutex<LruMap<RootId, V::Fd>>,
    inos: Mutex<LruMap<FileId, V::Fd>>,
    /// Registered temporary files, returned unconditionally and never
    /// evicted by `clear`.
    tmpfiles: Mutex<HashMap<FileId, V::Fd>>,
    stats: FdCacheStats,
}

impl<V: VfsOps> FdCache<V> {
    #[must_use]
    pub fn new(vfs: Arc<V>, tree: Arc<dyn TreeSearch>) -> Self {
        Self::with_capacity(vfs, tree, DEFAULT_ROOT_CAPACITY, DEFAULT_INO_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(
        vfs: Arc<V>,
        tree: Arc<dyn TreeSearch>,
        root_capacity: usize,
        ino_capacity: usize,
    ) -> Self {
        Self {
            vfs,
            tree,
            roots: Mutex::new(LruMap::new(root_capacity)),
            inos: Mutex::new(LruMap::new(ino_capacity)),
            tmpfiles: Mutex::new(HashMap::new()),
            stats: FdCacheStats::default(),
        }
    }

    #[must_use]
    pub fn stats(&self) -> FdCacheSnapshot {
        self.stats.snapshot()
    }

    /// Drop every cached descriptor. Tmpfiles are kept: they are owned
    /// by live temporary files, not by snapshots the kernel may want to
    /// delete.
    pub fn clear(&self) {
        self.roots.lock().clear();
        self.inos.lock().clear();
        debug!(target: "sweep::fdcache", "cleared fd caches");
    }

    /// Register a temporary file so `(root, ino)` lookups resolve to it
    /// without touching the filesystem.
    pub fn insert_tmpfile(&self, fid: FileId, fd: V::Fd) {
        let previous = self.tmpfiles.lock().insert(fid, fd);
        if previous.is_some() {
            warn!(target: "sweep::fdcache", %fid, "tmpfile registered twice");
        }
    }

    pub fn erase_tmpfile(&self, fid: FileId) {
        if self.tmpfiles.lock().remove(&fid).is_none() {
            warn!(target: "sweep::fdcache", %fid, "erasing unknown tmpfile");
        }
    }

    /// Open the root directory of a subvolume. `None` means every
    /// resolution candidate failed; nothing here is fatal to the daemon.
    pub fn open_root(&self, root: RootId) -> Option<V::Fd> {
        // The root tree id shows up in logical-ino output; it is not a
        // subvolume and can never be opened.
        if root.0 == ROOT_TREE_OBJECTID {
            return None;
        }
        if let Some(fd) = self.roots.lock().get(&root).cloned() {
            FdCacheStats::bump(&self.stats.root_hit);
            return Some(fd);
        }
        FdCacheStats::bump(&self.stats.root_miss);
        match self.open_root_uncached(root) {
            Some(fd) => {
                let evicted = self.roots.lock().insert(root, fd.clone());
                self.stats
                    .evictions
                    .fetch_add(evicted as u64, Ordering::Relaxed);
                Some(fd)
            }
            None => {
                FdCacheStats::bump(&self.stats.root_fail);
                None
            }
        }
    }

    fn open_root_uncached(&self, root: RootId) -> Option<V::Fd> {
        // Recursion bottoms out at the filesystem tree root.
        if root.0 == FS_TREE_OBJECTID {
            return Some(self.vfs.mount_fd());
        }

        let backrefs = match self.tree.root_backrefs(root) {
            Ok(backrefs) => backrefs,
            Err(err) => {
                debug!(target: "sweep::fdcache", %root, %err, "backref lookup failed");
                return None;
            }
        };

        for backref in &backrefs {
            let Some(parent_fd) = self.open_root(backref.parent) else {
                debug!(target: "sweep::fdcache", %root, parent = %backref.parent, "no parent fd");
                continue;
            };

            // The subvolume entry may live below the parent's root
            // directory; resolve the containing directory first.
            let dir_fd = if backref.dirid == FIRST_FREE_OBJECTID {
                parent_fd
            } else {
                let paths = match self.vfs.ino_paths(&parent_fd, InodeNum(backref.dirid)) {
                    Ok(paths) => paths,
                    Err(err) => {
                        info!(
                            target: "sweep::fdcache",
                            %root, dirid = backref.dirid, %err,
                            "dirid path lookup failed"
                        );
                        continue;
                    }
                };
                let Some(path) = paths.first() else {
                    info!(target: "sweep::fdcache", %root, dirid = backref.dirid, "dirid has no paths");
                    continue;
                };
                match self.vfs.open_dir_at(&parent_fd, path) {
                    Ok(fd) => fd,
                    Err(err) => {
                        debug!(target: "sweep::fdcache", %root, %path, %err, "dirid open failed");
                        continue;
                    }
                }
            };

            let fd = match self.vfs.open_dir_at(&dir_fd, &backref.name) {
                Ok(fd) => fd,
                Err(err) => {
                    debug!(
                        target: "sweep::fdcache",
                        %root, name = backref.name.as_str(), %err,
                        "subvol open failed"
                    );
                    continue;
                }
            };

            // Both checks are fatal for this candidate only.
            match self.vfs.root_of(&fd) {
                Ok(opened_root) if opened_root == root => {}
                Ok(opened_root) => {
                    warn!(target: "sweep::fdcache", %root, %opened_root, "opened wrong root");
                    continue;
                }
                Err(err) => {
                    warn!(target: "sweep::fdcache", %root, %err, "root id check failed");
                    continue;
                }
            }
            match self.vfs.inode_of(&fd) {
                Ok(ino) if ino.0 == FIRST_FREE_OBJECTID => {}
                Ok(ino) => {
                    warn!(target: "sweep::fdcache", %root, %ino, "subvol root has wrong inode");
                    continue;
                }
                Err(err) => {
                    warn!(target: "sweep::fdcache", %root, %err, "inode check failed");
                    continue;
                }
            }

            return Some(fd);
        }

        debug!(target: "sweep::fdcache", %root, "no path for root");
        None
    }

    /// Open the file `(root, ino)` read-only. Registered tmpfiles win
    /// unconditionally.
    pub fn open_root_ino(&self, root: RootId, ino: InodeNum) -> Option<V::Fd> {
        let fid = FileId::new(root, ino);
        if let Some(fd) = self.tmpfiles.lock().get(&fid).cloned() {
            FdCacheStats::bump(&self.stats.tmpfile_hit);
            return Some(fd);
        }
        if let Some(fd) = self.inos.lock().get(&fid).cloned() {
            FdCacheStats::bump(&self.stats.ino_hit);
            return Some(fd);
        }
        FdCacheStats::bump(&self.stats.ino_miss);
        let fd = self.open_root_ino_uncached(fid)?;
        let evicted = self.inos.lock().insert(fid, fd.clone());
        self.stats
            .evictions
            .fetch_add(evicted as u64, Ordering::Relaxed);
        Some(fd)
    }

    fn open_root_ino_uncached(&self, fid: FileId) -> Option<V::Fd> {
        let root_fd = self.open_root(fid.root)?;

        let paths = match self.vfs.ino_paths(&root_fd, fid.ino) {
            Ok(paths) => paths,
            Err(SweepError::NotFound(_)) => {
                FdCacheStats::bump(&self.stats.lookup_enoent);
                return None;
            }
            Err(err) => {
                info!(target: "sweep::fdcache", %fid, %err, "inode path lookup failed");
                FdCacheStats::bump(&self.stats.lookup_error);
                return None;
            }
        };
        if paths.is_empty() {
            warn!(target: "sweep::fdcache", %fid, "no paths for inode");
        }

        for path in &paths {
            let fd = match self.vfs.open_file_at(&root_fd, path) {
                Ok(fd) => fd,
                Err(SweepError::NotFound(_)) => continue,
                Err(err) => {
                    warn!(target: "sweep::fdcache", %fid, %path, %err, "could not open path");
                    continue;
                }
            };

            // A mismatch means the paths are stale; later paths came
            // from the same lookup, so there is no point trying them.
            match self.vfs.inode_of(&fd) {
                Ok(ino) if ino == fid.ino => {}
                _ => {
                    warn!(target: "sweep::fdcache", %fid, %path, "opened wrong inode");
                    FdCacheStats::bump(&self.stats.wrong_ino);
                    break;
                }
            }
            match self.vfs.root_of(&fd) {
                Ok(root) if root == fid.root => {}
                _ => {
                    warn!(target: "sweep::fdcache", %fid, %path, "opened wrong root");
                    FdCacheStats::bump(&self.stats.wrong_root);
                    break;
                }
            }
            match (self.vfs.device_of(&fd), self.vfs.device_of(&root_fd)) {
                (Ok(file_dev), Ok(root_dev)) if file_dev == root_dev => {}
                _ => {
                    warn!(target: "sweep::fdcache", %fid, %path, "path left the filesystem");
                    FdCacheStats::bump(&self.stats.wrong_dev);
                    break;
                }
            }
            match self.vfs.is_nocow(&fd) {
                Ok(false) => {}
                _ => {
                    debug!(target: "sweep::fdcache", %fid, %path, "no-cow inode excluded");
                    FdCacheStats::bump(&self.stats.wrong_flags);
                    break;
                }
            }

            return Some(fd);
        }

        FdCacheStats::bump(&self.stats.no_path);
        None
    }
}

impl<V: VfsOps + 'static> CachePurge for FdCache<V> {
    fn purge(&self) {
        self.clear();
    }
}
