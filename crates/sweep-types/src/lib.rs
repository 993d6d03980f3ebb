#![forbid(unsafe_code)]
//! Core data types shared across the sweep workspace: subvolume and
//! inode identifiers, the per-subvolume crawl cursor, file ranges, and
//! decoded extent-data items.

use serde::{Deserialize, Serialize};
use std::fmt;

// ── Well-known tree objectids ───────────────────────────────────────────────

/// Objectid of the root tree (holds root items and backrefs).
pub const ROOT_TREE_OBJECTID: u64 = 1;
/// Objectid of the extent tree; its root item carries the current transid.
pub const EXTENT_TREE_OBJECTID: u64 = 2;
/// Objectid of the default filesystem tree (the top-level subvolume).
pub const FS_TREE_OBJECTID: u64 = 5;
/// First objectid available for regular inodes; also the inode number of
/// every subvolume's root directory.
pub const FIRST_FREE_OBJECTID: u64 = 256;

/// Item type of extent-data entries in a subvolume tree.
pub const EXTENT_DATA_KEY: u8 = 108;
/// Item type of root items in the root tree.
pub const ROOT_ITEM_KEY: u8 = 132;
/// Item type of root backrefs in the root tree.
pub const ROOT_BACKREF_KEY: u8 = 144;

/// Root-item flag marking a subvolume read-only.
pub const ROOT_SUBVOL_RDONLY: u64 = 1;

/// Offset sentinel a crawler's end-cursor is parked at once an inode has
/// been handed to a worker. Chosen so that adding one block size cannot
/// wrap even at the largest supported offsets.
pub const OFFSET_EOF_SENTINEL: u64 = u64::MAX - 65536 + 1;

// ── Identifiers ─────────────────────────────────────────────────────────────

/// Subvolume identifier (a root objectid).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct RootId(pub u64);

impl fmt::Display for RootId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Inode number within one subvolume.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct InodeNum(pub u64);

impl fmt::Display for InodeNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A file identified filesystem-wide: subvolume plus inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileId {
    pub root: RootId,
    pub ino: InodeNum,
}

impl FileId {
    #[must_use]
    pub fn new(root: RootId, ino: InodeNum) -> Self {
        Self { root, ino }
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.root, self.ino)
    }
}

// ── File ranges ─────────────────────────────────────────────────────────────

/// A half-open byte range `[begin, end)` within one file, the unit of
/// work handed to the dedupe engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileRange {
    pub fid: FileId,
    pub begin: u64,
    pub end: u64,
}

impl FileRange {
    /// Build a range. `begin` must be strictly below `end`.
    #[must_use]
    pub fn new(fid: FileId, begin: u64, end: u64) -> Self {
        debug_assert!(begin < end, "empty file range {begin}..{end}");
        Self { fid, begin, end }
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.end - self.begin
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.end <= self.begin
    }
}

impl fmt::Display for FileRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:#x}..{:#x}", self.fid, self.begin, self.end)
    }
}

// ── Extent items ────────────────────────────────────────────────────────────

/// Decoded type of an extent-data item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtentKind {
    Inline,
    Regular,
    Prealloc,
    /// Unrecognised on-disk type byte, counted and skipped.
    Other(u8),
}

impl ExtentKind {
    #[must_use]
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Inline,
            1 => Self::Regular,
            2 => Self::Prealloc,
            other => Self::Other(other),
        }
    }
}

/// One decoded extent-data item from a tree search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentItem {
    /// Inode number the item belongs to.
    pub objectid: u64,
    /// Logical byte offset of the reference within the file.
    pub offset: u64,
    pub kind: ExtentKind,
    /// Physical start of the referenced extent; zero marks a hole.
    pub bytenr: u64,
    /// Logical length of the reference in bytes.
    pub logical_bytes: u64,
    /// Generation of the extent item itself (not of the metadata page
    /// that carried it).
    pub generation: u64,
}

impl ExtentItem {
    /// The file range this item covers in its inode.
    #[must_use]
    pub fn range_in(&self, root: RootId) -> FileRange {
        FileRange::new(
            FileId::new(root, InodeNum(self.objectid)),
            self.offset,
            self.offset + self.logical_bytes,
        )
    }
}

// ── Crawl cursor ────────────────────────────────────────────────────────────

/// Per-subvolume crawl cursor: where the next tree search resumes, and
/// the generation window `[min_transid, max_transid)` the pass covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CrawlState {
    pub root: RootId,
    /// Next inode to visit; zero means before any inode.
    pub objectid: u64,
    /// Byte offset cursor within that inode.
    pub offset: u64,
    pub min_transid: u64,
    pub max_transid: u64,
    /// Wall-clock seconds when the current window was opened. Advisory.
    pub started: u64,
}

impl CrawlState {
    #[must_use]
    pub fn new(root: RootId, min_transid: u64, max_transid: u64, started: u64) -> Self {
        Self {
            root,
            objectid: 0,
            offset: 0,
            min_transid,
            max_transid,
            started,
        }
    }

    /// True once the window covers nothing (`max <= min`).
    #[must_use]
    pub fn window_is_empty(&self) -> bool {
        self.max_transid <= self.min_transid
    }
}

/// Total order: `(min_transid, max_transid, objectid, offset, root)`,
/// the basis of the progress tracker's safe-resume computation. Note
/// `started` does not participate.
impl Ord for CrawlState {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (
            self.min_transid,
            self.max_transid,
            self.objectid,
            self.offset,
            self.root,
        )
            .cmp(&(
                other.min_transid,
                other.max_transid,
                other.objectid,
                other.offset,
                other.root,
            ))
    }
}

impl PartialOrd for CrawlState {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for CrawlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "crawl {}:{} offset {:#x} transid {}..{} started {}",
            self.root, self.objectid, self.offset, self.min_transid, self.max_transid, self.started
        )
    }
}
