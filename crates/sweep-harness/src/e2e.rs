//! End-to-end scenarios over the in-memory filesystem: cold start,
//! scheduling order, window filtering, the send workaround, restart
//! safety, and membership churn. Everything runs on the inline task
//! pool, so each test drives the exact interleaving it asserts on.

use crate::Scenario;
use std::sync::Arc;
use sweep_roots::parse_states;
use sweep_sched::ScanModeKind;
use sweep_tree::MemoryTree;
use sweep_types::{CrawlState, FileId, FileRange, InodeNum, RootId};

fn tree_with_subvol(transid: u64, root: u64) -> Arc<MemoryTree> {
    let tree = Arc::new(MemoryTree::new(4096));
    tree.set_transid(transid);
    tree.add_subvol(RootId(root), &format!("vol{root}"));
    tree
}

fn range(root: u64, ino: u64, begin: u64, end: u64) -> FileRange {
    FileRange::new(FileId::new(RootId(root), InodeNum(ino)), begin, end)
}

/// Cold start with one subvolume holding one 4 KiB extent: the range
/// reaches the deduper, the progress begin lands on its start cursor,
/// and writeback persists that cursor.
#[test]
fn cold_start_delivers_and_persists() {
    let tree = tree_with_subvol(10, 256);
    tree.add_extent(RootId(256), 300, 0, 4096, 7);

    let scenario = Scenario::new(tree);
    scenario.startup();
    scenario.roots.transid_tick().expect("tick");

    // Step the pool by hand: first the scan task pops the range and
    // spawns the worker, then the worker's first iteration dedupes it.
    assert!(scenario.roots.pool().run_one(), "scan task");
    assert!(scenario.roots.pool().run_one(), "worker task");
    assert_eq!(scenario.deduper.delivered(), vec![range(256, 300, 0, 4096)]);

    // The worker completed the range: its hold now pins the range's
    // starting cursor as the safe resume point.
    let crawler = scenario.roots.crawler(RootId(256)).expect("crawler");
    let begin = crawler.state_begin();
    assert_eq!(
        (begin.objectid, begin.offset, begin.min_transid, begin.max_transid),
        (300, 0, 0, 10)
    );

    scenario.roots.state_save().expect("save");
    let data = std::fs::read_to_string(scenario.state_file()).expect("state file");
    let (records, repairs) = parse_states(&data).expect("parse");
    assert_eq!(repairs.total(), 0);
    let record: Vec<_> = records
        .iter()
        .filter(|state| state.root == RootId(256))
        .collect();
    assert_eq!(record.len(), 1);
    assert_eq!(
        (record[0].objectid, record[0].offset, record[0].min_transid, record[0].max_transid),
        (300, 0, 0, 10)
    );

    // Drain the rest; the subvolume is exhausted and the scan idles.
    scenario.roots.pool().drain();
    assert_eq!(scenario.deduper.delivered().len(), 1);
    assert!(!scenario.roots.crawl_roots());
}

/// LOCKSTEP visits (ino 100, root 257), (ino 100, root 258),
/// (ino 200, root 257), (ino 200, root 258) in exactly that order.
#[test]
fn lockstep_orders_by_inode_across_subvols() {
    let tree = Arc::new(MemoryTree::new(4096));
    tree.set_transid(10);
    for root in [257, 258] {
        tree.add_subvol(RootId(root), &format!("vol{root}"));
        tree.add_extent(RootId(root), 100, 0, 4096, 5);
        tree.add_extent(RootId(root), 200, 0, 4096, 5);
    }

    let scenario = Scenario::with_config(tree, |config| {
        config.scan_mode = ScanModeKind::Lockstep;
    });
    scenario.startup();
    scenario.tick_and_drain();

    assert_eq!(
        scenario.deduper.delivered_files(),
        vec![(257, 100), (258, 100), (257, 200), (258, 200)]
    );
}

/// An extent whose generation sits below the window is skipped without
/// a deduper call, the cursor still advances, and the scan then idles.
#[test]
fn out_of_window_extent_is_skipped() {
    let tree = tree_with_subvol(10, 256);
    // Item generation 3 on a metadata page at transid 9: the page-level
    // search surfaces it inside the [5, 10) window, the item filter
    // drops it.
    tree.add_extent_raw(
        RootId(256),
        300,
        0,
        sweep_types::ExtentKind::Regular,
        1 << 20,
        4096,
        3,
        9,
    );

    let scenario = Scenario::new(tree);
    scenario.startup();
    scenario.roots.insert_root(CrawlState::new(RootId(256), 5, 10, 0));
    scenario.roots.insert_new_crawl().expect("refresh");
    scenario.roots.spawn_scan_task();
    scenario.roots.pool().drain();

    assert!(scenario.deduper.delivered().is_empty());
    let counters = scenario.roots.counters();
    assert_eq!(counters.gen_low, 1);
    assert_eq!(counters.batches, 1);
    assert!(!scenario.roots.crawl_roots(), "window exhausted");
}

/// Generations at or above the window ceiling belong to a future
/// window and are skipped too.
#[test]
fn above_window_extent_is_skipped() {
    let tree = tree_with_subvol(10, 256);
    tree.add_extent(RootId(256), 300, 0, 4096, 12);

    let scenario = Scenario::new(tree);
    scenario.startup();
    scenario.roots.insert_root(CrawlState::new(RootId(256), 5, 10, 0));
    scenario.roots.insert_new_crawl().expect("refresh");
    scenario.roots.spawn_scan_task();
    scenario.roots.pool().drain();

    assert!(scenario.deduper.delivered().is_empty());
    assert_eq!(scenario.roots.counters().gen_high, 1);
}

/// A read-only subvolume under the send workaround is never popped,
/// does not hold back `transid_min`, and its window ceiling catches up
/// to the filesystem generation on the first tick, then stays put.
#[test]
fn send_workaround_isolates_read_only_subvol() {
    let tree = tree_with_subvol(10, 256);
    tree.add_extent(RootId(256), 300, 0, 4096, 5);
    tree.add_subvol_ro(RootId(260), "snap");
    tree.add_extent(RootId(260), 300, 0, 4096, 5);

    let scenario = Scenario::with_config(tree, |config| {
        config.workaround_btrfs_send = true;
    });
    scenario.startup();
    scenario.tick_and_drain();

    // Only the writable subvolume produced work.
    assert_eq!(scenario.deduper.delivered_files(), vec![(256, 300)]);

    let ro_state = scenario
        .roots
        .crawler(RootId(260))
        .expect("crawler")
        .state_end();
    assert_eq!(ro_state.max_transid, 10);
    assert_eq!(ro_state.objectid, 0);

    // Another tick at the same generation: frozen.
    scenario.tick_and_drain();
    let ro_state = scenario
        .roots
        .crawler(RootId(260))
        .expect("crawler")
        .state_end();
    assert_eq!(ro_state.max_transid, 10);

    // The read-only crawler does not drag the fleet minimum.
    assert_eq!(scenario.roots.transid_min().expect("transid_min"), 0);
}

/// Kill the daemon while `scan_forward` is in flight: the state flushed
/// at that instant points at the in-flight range, and the restarted
/// daemon re-delivers the same range, not a later one.
#[test]
fn restart_mid_scan_redelivers_in_flight_range() {
    let tree = tree_with_subvol(10, 256);
    tree.add_extent(RootId(256), 300, 0, 4096, 7);

    let scenario = Scenario::new(tree);
    scenario.startup();

    // Flush state from inside scan_forward, exactly what the writeback
    // thread could observe mid-call; then never complete the range.
    let target = range(256, 300, 0, 4096);
    scenario.deduper.script_retry(target, u32::MAX);
    {
        let roots = Arc::clone(&scenario.roots);
        scenario.deduper.set_hook(move |_| {
            roots.state_save().expect("mid-flight save");
        });
    }
    scenario.tick_and_drain();
    assert_eq!(scenario.deduper.delivered(), vec![target]);

    // "Kill" the daemon: drop everything unflushed and rewire.
    let scenario = scenario.restart();
    scenario.startup();
    let resumed = scenario
        .roots
        .crawler(RootId(256))
        .expect("crawler")
        .state_end();
    assert_eq!((resumed.objectid, resumed.offset), (300, 0));

    scenario.tick_and_drain();
    assert_eq!(scenario.deduper.delivered(), vec![target]);
}

/// Membership churn: vanished subvolumes lose their crawlers, new ones
/// gain them, and the map is never emptied.
#[test]
fn membership_churn_updates_the_map() {
    let tree = Arc::new(MemoryTree::new(4096));
    tree.set_transid(10);
    for root in [256, 257, 258] {
        tree.add_subvol(RootId(root), &format!("vol{root}"));
    }

    let scenario = Scenario::new(tree);
    scenario.startup();
    scenario.tick_and_drain();
    assert_eq!(
        scenario.roots.subvols(),
        vec![RootId(5), RootId(256), RootId(257), RootId(258)]
    );

    scenario.tree.remove_subvol(RootId(257));
    scenario.tree.remove_subvol(RootId(258));
    scenario.tree.add_subvol(RootId(259), "vol259");
    scenario.tree.set_transid(11);
    scenario.tick_and_drain();
    assert_eq!(
        scenario.roots.subvols(),
        vec![RootId(5), RootId(256), RootId(259)]
    );
}

/// A contended inode lock defers the worker; releasing the lock
/// re-arms it through the retry handle and the range is delivered.
#[test]
fn contended_inode_lock_rearms_worker() {
    let tree = tree_with_subvol(10, 256);
    tree.add_extent(RootId(256), 300, 0, 4096, 5);

    let scenario = Scenario::new(tree);
    scenario.startup();

    let guard = scenario.locks.hold_for_test(300);
    scenario.tick_and_drain();
    assert!(scenario.deduper.delivered().is_empty());
    assert_eq!(scenario.locks.contended(), 1);
    assert_eq!(scenario.roots.counters().inode_deferred, 1);

    // Dropping the guard fires the retry, which re-queues the worker.
    drop(guard);
    scenario.roots.pool().drain();
    assert_eq!(scenario.deduper.delivered_files(), vec![(256, 300)]);
}

/// Blacklisted files are counted and never offered to the deduper.
#[test]
fn blacklisted_file_is_not_offered() {
    let tree = tree_with_subvol(10, 256);
    tree.add_extent(RootId(256), 300, 0, 4096, 5);
    tree.add_extent(RootId(256), 301, 0, 4096, 5);

    let scenario = Scenario::new(tree);
    scenario
        .blacklist
        .add(FileId::new(RootId(256), InodeNum(300)));
    scenario.startup();
    scenario.tick_and_drain();

    assert_eq!(scenario.deduper.delivered_files(), vec![(256, 301)]);
    assert_eq!(scenario.roots.counters().blacklisted, 1);
}

/// Holes, inline extents, and preallocated extents follow the item-type
/// policy: only prealloc and real regular extents reach the deduper.
#[test]
fn item_type_policy_filters_candidates() {
    let tree = tree_with_subvol(10, 256);
    tree.add_inline(RootId(256), 300, 0, 200, 5);
    tree.add_hole(RootId(256), 301, 0, 4096, 5);
    tree.add_prealloc(RootId(256), 302, 0, 4096, 5);
    tree.add_extent(RootId(256), 303, 0, 4096, 5);

    let scenario = Scenario::new(tree);
    scenario.startup();
    scenario.tick_and_drain();

    assert_eq!(scenario.deduper.delivered_files(), vec![(256, 302), (256, 303)]);
    let counters = scenario.roots.counters();
    assert_eq!(counters.inline_skipped, 1);
    assert_eq!(counters.hole_skipped, 1);
    assert_eq!(counters.prealloc, 1);
    assert_eq!(counters.pushed, 2);
}

/// A deduper failure on one extent is swallowed: the cursor advances
/// and later extents are still delivered.
#[test]
fn deduper_error_does_not_stall_the_crawl() {
    let tree = tree_with_subvol(10, 256);
    tree.add_extent(RootId(256), 300, 0, 4096, 5);
    tree.add_extent(RootId(256), 300, 4096, 4096, 5);

    let scenario = Scenario::new(tree);
    scenario.deduper.fail_on(range(256, 300, 0, 4096));
    scenario.startup();
    scenario.tick_and_drain();

    assert_eq!(
        scenario.deduper.delivered(),
        vec![range(256, 300, 0, 4096), range(256, 300, 4096, 8192)]
    );
    assert_eq!(scenario.roots.counters().dedupe_errors, 1);
}

/// A new window opens when the filesystem generation moves, and only
/// the new data is delivered on the second pass.
#[test]
fn second_window_picks_up_only_new_data() {
    let tree = tree_with_subvol(10, 256);
    tree.add_extent(RootId(256), 300, 0, 4096, 7);

    let scenario = Scenario::new(tree);
    scenario.startup();
    scenario.tick_and_drain();
    assert_eq!(scenario.deduper.delivered_files(), vec![(256, 300)]);

    // New data lands at generation 11.
    scenario.tree.add_extent(RootId(256), 400, 0, 4096, 11);
    scenario.tree.set_transid(12);
    scenario.tick_and_drain();

    assert_eq!(
        scenario.deduper.delivered_files(),
        vec![(256, 300), (256, 400)]
    );
    let state = scenario
        .roots
        .crawler(RootId(256))
        .expect("crawler")
        .state_end();
    assert_eq!((state.min_transid, state.max_transid), (10, 12));
}
