//! Per-inode crawl worker.
//!
//! A [`FileCrawl`] is created for every range the scheduler pops. The
//! crawler cursor has already jumped past the whole inode; this worker
//! walks the inode's extent items one at a time, yielding to the task
//! queue between extents, and moves its progress hold forward only for
//! ranges the deduper fully completed.

use crate::context::{RetryHandle, ScanContext};
use crate::counters::ScanCounters;
use crate::task::TaskPool;
use parking_lot::Mutex;
use std::sync::Arc;
use sweep_crawl::Crawler;
use sweep_progress::ProgressHolder;
use sweep_types::{CrawlState, ExtentKind, FileId, FileRange, InodeNum, RootId};
use tracing::{debug, trace, warn};

struct WorkerState {
    /// Next offset to fetch within the inode.
    offset: u64,
    /// Progress hold; starts at the crawl-state snapshot and moves to
    /// the start cursor of each completed range.
    hold: ProgressHolder<CrawlState>,
}

/// One inode's worth of crawl work.
pub(crate) struct FileCrawl {
    ctx: Arc<ScanContext>,
    counters: Arc<ScanCounters>,
    pool: TaskPool,
    crawler: Arc<Crawler>,
    /// Crawl-state snapshot at creation; carries the transid window.
    state: CrawlState,
    root: RootId,
    ino: InodeNum,
    ws: Mutex<WorkerState>,
}

impl FileCrawl {
    pub(crate) fn new(
        ctx: Arc<ScanContext>,
        counters: Arc<ScanCounters>,
        pool: TaskPool,
        crawler: Arc<Crawler>,
        state: CrawlState,
        range: FileRange,
    ) -> Arc<Self> {
        let hold = crawler.hold_state(state);
        Arc::new(Self {
            ctx,
            counters,
            pool,
            crawler,
            state,
            root: range.fid.root,
            ino: range.fid.ino,
            ws: Mutex::new(WorkerState {
                offset: range.begin,
                hold,
            }),
        })
    }

    pub(crate) fn task_name(&self) -> String {
        format!("crawl_{}_{}", self.root, self.ino)
    }

    /// Submit this worker to the pool.
    pub(crate) fn submit(self: &Arc<Self>) {
        let task = Arc::clone(self);
        self.pool
            .spawn(self.task_name(), Box::new(move || task.crawl_one_extent()));
    }

    /// One unit of work: one extent item. Returns true to be run again.
    pub(crate) fn crawl_one_extent(self: &Arc<Self>) -> bool {
        // Only one worker dedupes an inode at a time; snapshots make the
        // same inode number appear in many subvols at once, so this
        // lock is keyed on the inode number alone.
        let retry: RetryHandle = {
            let task = Arc::clone(self);
            Box::new(move || task.submit())
        };
        let Some(_inode_guard) = self.ctx.locks.try_lock(self.ino, retry) else {
            ScanCounters::bump(&self.counters.inode_deferred);
            // Not rescheduling ourselves; the lock's release will.
            return false;
        };

        let item = {
            let mut ws = self.ws.lock();
            let item = match self.ctx.tree.next_extent_in_file(
                self.root,
                self.ino,
                ws.offset,
                self.state.min_transid,
            ) {
                Ok(Some(item)) => item,
                Ok(None) => return false,
                Err(err) => {
                    // The file or subvol vanished, or its metadata is
                    // unreadable. Routine; stop walking this inode.
                    debug!(
                        target: "sweep::worker",
                        root = %self.root, ino = %self.ino, %err,
                        "extent walk ended early"
                    );
                    return false;
                }
            };
            // Always advance, whatever the item turns out to be.
            ws.offset = item.offset.saturating_add(self.ctx.tree.block_size());
            item
        };

        // The tree search filters on metadata-page transid; the dedupe
        // window applies to the item's own generation. An old page can
        // surface young items and vice versa.
        if item.generation < self.state.min_transid {
            ScanCounters::bump(&self.counters.gen_low);
            return true;
        }
        if item.generation >= self.state.max_transid {
            ScanCounters::bump(&self.counters.gen_high);
            return true;
        }

        match item.kind {
            ExtentKind::Inline => {
                // TODO: convert inline extents to out-of-line dup extents.
                ScanCounters::bump(&self.counters.inline_skipped);
            }
            ExtentKind::Other(raw) => {
                debug!(
                    target: "sweep::worker",
                    root = %self.root, ino = %self.ino, raw,
                    "unhandled extent type"
                );
                ScanCounters::bump(&self.counters.unknown_type);
            }
            ExtentKind::Regular | ExtentKind::Prealloc => {
                if item.kind == ExtentKind::Prealloc {
                    ScanCounters::bump(&self.counters.prealloc);
                }
                if item.bytenr == 0 {
                    ScanCounters::bump(&self.counters.hole_skipped);
                } else {
                    self.scan_candidate(&item.range_in(self.root));
                }
            }
        }
        true
    }

    fn scan_candidate(&self, range: &FileRange) {
        let fid = FileId::new(self.root, self.ino);
        if self.ctx.blacklist.is_blacklisted(fid) {
            ScanCounters::bump(&self.counters.blacklisted);
            return;
        }

        trace!(target: "sweep::worker", %range, "offering range");
        let mut completed_state = self.state;
        completed_state.objectid = self.ino.0;
        completed_state.offset = range.begin;
        let new_hold = self.crawler.hold_state(completed_state);

        ScanCounters::bump(&self.counters.pushed);
        let again = match self.ctx.deduper.scan_forward(range) {
            Ok(again) => again,
            Err(err) => {
                // Corrupt or deleted files are routine; count and let
                // the cursor move on.
                warn!(target: "sweep::worker", %range, %err, "dedupe failed");
                ScanCounters::bump(&self.counters.dedupe_errors);
                false
            }
        };
        if again {
            // Keep the previous hold so the range is re-offered after a
            // restart or the next window.
            ScanCounters::bump(&self.counters.retry);
        } else {
            self.ws.lock().hold = new_hold;
        }
    }
}
