#![forbid(unsafe_code)]
//! Upstream tree-search contracts.
//!
//! The daemon reads filesystem metadata exclusively through the
//! [`TreeSearch`] trait: lower-bound extent-data lookups filtered by
//! metadata-page transid, root-item fetches, and root-backref
//! enumeration. The ioctl-backed implementation lives outside this
//! workspace; [`MemoryTree`] is the in-memory stand-in used by tests
//! and the harness.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use sweep_error::{Result, SweepError};
use sweep_types::{ExtentItem, ExtentKind, FS_TREE_OBJECTID, InodeNum, ROOT_SUBVOL_RDONLY, RootId};

// ── Decoded root-tree entries ───────────────────────────────────────────────

/// Parsed subset of a root item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootInfo {
    /// Generation recorded in the root item.
    pub transid: u64,
    /// Root flags.
    pub flags: u64,
}

impl RootInfo {
    #[must_use]
    pub fn read_only(&self) -> bool {
        self.flags & ROOT_SUBVOL_RDONLY != 0
    }
}

/// One root backref: which directory in which parent subvolume refers
/// to a given subvolume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootBackref {
    pub root: RootId,
    pub parent: RootId,
    /// Inode of the containing directory inside the parent.
    pub dirid: u64,
    /// Name of the subvolume entry in that directory.
    pub name: String,
}

// ── The search contract ─────────────────────────────────────────────────────

/// Read-only metadata access used by the crawler, the coordinator, and
/// the path resolver.
///
/// The transid filter on the extent lookups applies to the *metadata
/// page* that carries an item, not to the extent item's own generation;
/// callers that need the item-generation window apply it themselves.
pub trait TreeSearch: Send + Sync {
    /// Filesystem block size in bytes.
    fn block_size(&self) -> u64;

    /// Fetch the root item for `root`, or `None` if the root is gone.
    fn root_item(&self, root: RootId) -> Result<Option<RootInfo>>;

    /// First extent-data item in subvolume `tree` at `objectid >=
    /// min_objectid`, restricted to metadata pages with transid `>=
    /// min_transid`. Items are ordered by `(objectid, offset)`.
    fn next_extent(
        &self,
        tree: RootId,
        min_objectid: u64,
        min_transid: u64,
    ) -> Result<Option<ExtentItem>>;

    /// First extent-data item of inode `ino` in subvolume `tree` at
    /// `offset >= min_offset`, with the same transid filter as
    /// [`next_extent`](Self::next_extent).
    fn next_extent_in_file(
        &self,
        tree: RootId,
        ino: InodeNum,
        min_offset: u64,
        min_transid: u64,
    ) -> Result<Option<ExtentItem>>;

    /// Smallest root objectid `>= min_root` that has a root backref, or
    /// `None` when exhausted. The filesystem tree root has no backref
    /// and is never returned here.
    fn next_root_backref(&self, min_root: u64) -> Result<Option<RootBackref>>;

    /// All backrefs naming `root`, in tree order.
    fn root_backrefs(&self, root: RootId) -> Result<Vec<RootBackref>>;
}

// ── In-memory implementation ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct MemExtent {
    kind: ExtentKind,
    bytenr: u64,
    logical_bytes: u64,
    generation: u64,
    /// Transid of the metadata page holding the item. Usually equal to
    /// `generation`, but an unrelated edit can rewrite the page.
    page_transid: u64,
}

#[derive(Debug, Default)]
struct MemSubvol {
    flags: u64,
    /// Backref into the parent, absent for the filesystem tree root.
    backref: Option<(RootId, u64, String)>,
    extents: BTreeMap<(u64, u64), MemExtent>,
}

#[derive(Debug)]
struct MemState {
    transid: u64,
    subvols: BTreeMap<u64, MemSubvol>,
    next_bytenr: u64,
    fail_searches: u32,
}

/// In-memory [`TreeSearch`] implementation.
///
/// Holds a mutable picture of one filesystem: a global transid, a set
/// of subvolumes with flags and backrefs, and per-subvolume extent
/// items. Mutators may be called while crawlers are live, mirroring a
/// filesystem that changes under the daemon.
#[derive(Debug)]
pub struct MemoryTree {
    block_size: u64,
    state: Mutex<MemState>,
}

impl MemoryTree {
    /// Create a tree with the filesystem root present and transid 1.
    #[must_use]
    pub fn new(block_size: u64) -> Self {
        let mut subvols = BTreeMap::new();
        subvols.insert(FS_TREE_OBJECTID, MemSubvol::default());
        Self {
            block_size,
            state: Mutex::new(MemState {
                transid: 1,
                subvols,
                next_bytenr: 1 << 20,
                fail_searches: 0,
            }),
        }
    }

    pub fn set_transid(&self, transid: u64) {
        self.state.lock().transid = transid;
    }

    pub fn bump_transid(&self, delta: u64) {
        self.state.lock().transid += delta;
    }

    /// Add a writable subvolume rooted directly under the filesystem tree.
    pub fn add_subvol(&self, root: RootId, name: &str) {
        self.add_subvol_at(
            root,
            RootId(FS_TREE_OBJECTID),
            sweep_types::FIRST_FREE_OBJECTID,
            name,
            0,
        );
    }

    /// Add a read-only subvolume rooted directly under the filesystem tree.
    pub fn add_subvol_ro(&self, root: RootId, name: &str) {
        self.add_subvol_at(
            root,
            RootId(FS_TREE_OBJECTID),
            sweep_types::FIRST_FREE_OBJECTID,
            name,
            ROOT_SUBVOL_RDONLY,
        );
    }

    /// Add a subvolume with an explicit parent backref and flags.
    pub fn add_subvol_at(&self, root: RootId, parent: RootId, dirid: u64, name: &str, flags: u64) {
        let mut state = self.state.lock();
        state.subvols.insert(
            root.0,
            MemSubvol {
                flags,
                backref: Some((parent, dirid, name.to_owned())),
                extents: BTreeMap::new(),
            },
        );
    }

    /// Drop a subvolume entirely (as if deleted).
    pub fn remove_subvol(&self, root: RootId) {
        self.state.lock().subvols.remove(&root.0);
    }

    pub fn set_subvol_flags(&self, root: RootId, flags: u64) {
        if let Some(subvol) = self.state.lock().subvols.get_mut(&root.0) {
            subvol.flags = flags;
        }
    }

    /// Add a regular extent reference; the physical address is assigned
    /// automatically and the page transid equals the item generation.
    pub fn add_extent(&self, root: RootId, ino: u64, offset: u64, len: u64, generation: u64) {
        let bytenr = {
            let mut state = self.state.lock();
            let bytenr = state.next_bytenr;
            state.next_bytenr += len.max(self.block_size);
            bytenr
        };
        self.add_extent_raw(root, ino, offset, ExtentKind::Regular, bytenr, len, generation, generation);
    }

    /// Add a hole reference (`bytenr == 0`).
    pub fn add_hole(&self, root: RootId, ino: u64, offset: u64, len: u64, generation: u64) {
        self.add_extent_raw(root, ino, offset, ExtentKind::Regular, 0, len, generation, generation);
    }

    pub fn add_inline(&self, root: RootId, ino: u64, offset: u64, len: u64, generation: u64) {
        self.add_extent_raw(root, ino, offset, ExtentKind::Inline, 0, len, generation, generation);
    }

    pub fn add_prealloc(&self, root: RootId, ino: u64, offset: u64, len: u64, generation: u64) {
        let bytenr = {
            let mut state = self.state.lock();
            let bytenr = state.next_bytenr;
            state.next_bytenr += len.max(self.block_size);
            bytenr
        };
        self.add_extent_raw(root, ino, offset, ExtentKind::Prealloc, bytenr, len, generation, generation);
    }

    /// Full-control insert, including a page transid different from the
    /// item generation (an old item on a freshly rewritten page).
    #[expect(clippy::too_many_arguments)]
    pub fn add_extent_raw(
        &self,
        root: RootId,
        ino: u64,
        offset: u64,
        kind: ExtentKind,
        bytenr: u64,
        logical_bytes: u64,
        generation: u64,
        page_transid: u64,
    ) {
        let mut state = self.state.lock();
        if let Some(subvol) = state.subvols.get_mut(&root.0) {
            subvol.extents.insert(
                (ino, offset),
                MemExtent {
                    kind,
                    bytenr,
                    logical_bytes,
                    generation,
                    page_transid,
                },
            );
        }
    }

    /// Make the next `n` searches fail with a transient error.
    pub fn fail_searches(&self, n: u32) {
        self.state.lock().fail_searches = n;
    }

    fn check_injected_failure(&self, state: &mut MemState, root: RootId) -> Result<()> {
        if state.fail_searches > 0 {
            state.fail_searches -= 1;
            return Err(SweepError::Search {
                root: root.0,
                detail: "injected search failure".to_owned(),
            });
        }
        Ok(())
    }

    fn item_from(entry: (&(u64, u64), &MemExtent)) -> ExtentItem {
        let (&(ino, offset), ext) = entry;
        ExtentItem {
            objectid: ino,
            offset,
            kind: ext.kind,
            bytenr: ext.bytenr,
            logical_bytes: ext.logical_bytes,
            generation: ext.generation,
        }
    }
}

impl TreeSearch for MemoryTree {
    fn block_size(&self) -> u64 {
        self.block_size
    }

    fn root_item(&self, root: RootId) -> Result<Option<RootInfo>> {
        let state = self.state.lock();
        if root.0 == sweep_types::EXTENT_TREE_OBJECTID {
            return Ok(Some(RootInfo {
                transid: state.transid,
                flags: 0,
            }));
        }
        Ok(state.subvols.get(&root.0).map(|subvol| RootInfo {
            transid: state.transid,
            flags: subvol.flags,
        }))
    }

    fn next_extent(
        &self,
        tree: RootId,
        min_objectid: u64,
        min_transid: u64,
    ) -> Result<Option<ExtentItem>> {
        let mut state = self.state.lock();
        self.check_injected_failure(&mut state, tree)?;
        let Some(subvol) = state.subvols.get(&tree.0) else {
            return Err(SweepError::NotFound(format!("subvol {tree}")));
        };
        Ok(subvol
            .extents
            .range((min_objectid, 0)..)
            .find(|(_, ext)| ext.page_transid >= min_transid)
            .map(Self::item_from))
    }

    fn next_extent_in_file(
        &self,
        tree: RootId,
        ino: InodeNum,
        min_offset: u64,
        min_transid: u64,
    ) -> Result<Option<ExtentItem>> {
        let mut state = self.state.lock();
        self.check_injected_failure(&mut state, tree)?;
        let Some(subvol) = state.subvols.get(&tree.0) else {
            return Err(SweepError::NotFound(format!("subvol {tree}")));
        };
        Ok(subvol
            .extents
            .range((ino.0, min_offset)..=(ino.0, u64::MAX))
            .find(|(_, ext)| ext.page_transid >= min_transid)
            .map(Self::item_from))
    }

    fn next_root_backref(&self, min_root: u64) -> Result<Option<RootBackref>> {
        let state = self.state.lock();
        Ok(state
            .subvols
            .range(min_root..)
            .find_map(|(&root, subvol)| {
                subvol.backref.as_ref().map(|(parent, dirid, name)| RootBackref {
                    root: RootId(root),
                    parent: *parent,
                    dirid: *dirid,
                    name: name.clone(),
                })
            }))
    }

    fn root_backrefs(&self, root: RootId) -> Result<Vec<RootBackref>> {
        let state = self.state.lock();
        Ok(state
            .subvols
            .get(&root.0)
            .and_then(|subvol| subvol.backref.as_ref())
            .map(|(parent, dirid, name)| RootBackref {
                root,
                parent: *parent,
                dirid: *dirid,
                name: name.clone(),
            })
            .into_iter()
            .collect())
    }
}
