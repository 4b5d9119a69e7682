//! Transaction Lifecycle Tests
//!
//! Handles, commits, checkpoint writeback, and log reclamation on the
//! classic commit path.

use std::sync::Arc;

use parking_lot::Mutex;

use ringjournal::prelude::*;

use crate::common;

// ============================================================================
// Basic Commits
// ============================================================================

#[test]
fn committed_transaction_is_replayable() {
    let (dev, journal) = common::build_journal(common::test_config());
    let tid = common::commit_blocks(&journal, &[(10, 0xaa), (11, 0xbb)]);

    let txns = common::scan_log(&dev.durable_image(), journal.config());
    assert_eq!(txns.len(), 1);
    assert_eq!(txns[0].tid, tid);

    let state = common::replay_state(&txns);
    assert_eq!(state[&10], vec![0xaa; 512]);
    assert_eq!(state[&11], vec![0xbb; 512]);
    journal.shutdown().unwrap();
}

#[test]
fn sequential_commits_replay_in_order() {
    let (dev, journal) = common::build_journal(common::test_config());
    let t1 = common::commit_blocks(&journal, &[(10, 1)]);
    let t2 = common::commit_blocks(&journal, &[(11, 2)]);
    let t3 = common::commit_blocks(&journal, &[(10, 3)]);
    assert!(t2.after(t1));
    assert!(t3.after(t2));

    let txns = common::scan_log(&dev.durable_image(), journal.config());
    assert_eq!(txns.len(), 3);
    assert_eq!(txns[0].tid, t1);
    assert_eq!(txns[2].tid, t3);

    // the later update to block 10 wins
    let state = common::replay_state(&txns);
    assert_eq!(state[&10], vec![3; 512]);
    assert_eq!(state[&11], vec![2; 512]);
    journal.shutdown().unwrap();
}

#[test]
fn repeated_updates_log_one_copy() {
    let (dev, journal) = common::build_journal(common::test_config());
    let buf = journal.journal_buffer(42, vec![0u8; 512]);

    let mut handle = journal.start_handle(1).unwrap();
    handle.dirty_metadata(&buf).unwrap();
    buf.write_data(|d| d.fill(1));
    handle.finish().unwrap();

    let mut handle = journal.start_handle(1).unwrap();
    handle.dirty_metadata(&buf).unwrap();
    buf.write_data(|d| d.fill(2));
    handle.finish().unwrap();

    journal.commit_and_wait().unwrap();

    let txns = common::scan_log(&dev.durable_image(), journal.config());
    assert_eq!(txns.len(), 1);
    assert_eq!(txns[0].blocks.len(), 1);
    assert_eq!(txns[0].blocks[&42], vec![2; 512]);
    // one descriptor plus one data block
    assert_eq!(journal.stats().total.blocks_logged, 2);
    journal.shutdown().unwrap();
}

// ============================================================================
// Updates Racing a Commit
// ============================================================================

#[test]
fn update_during_commit_lands_in_successor() {
    let (dev, journal) = common::build_deferred_journal(common::test_config());
    let buf = journal.journal_buffer(7, vec![0u8; 512]);

    let mut handle = journal.start_handle(1).unwrap();
    let t1 = handle.tid();
    handle.dirty_metadata(&buf).unwrap();
    buf.write_data(|d| d.fill(0xa1));
    handle.finish().unwrap();

    assert_eq!(journal.start_commit(), Some(t1));
    common::wait_until(|| dev.pending_count() > 0, "first commit to start writing");

    // the committing transaction has frozen its snapshot; this update
    // belongs to the next transaction
    let mut handle = journal.start_handle(1).unwrap();
    let t2 = handle.tid();
    assert_ne!(t1, t2);
    handle.dirty_metadata(&buf).unwrap();
    buf.write_data(|d| d.fill(0xa2));
    handle.finish().unwrap();

    let _completer = common::spawn_completer(&dev);
    journal.wait_commit(t1).unwrap();
    journal.commit_and_wait().unwrap();

    let txns = common::scan_log(&dev.durable_image(), journal.config());
    assert_eq!(txns.len(), 2);
    assert_eq!(txns[0].blocks[&7], vec![0xa1; 512]);
    assert_eq!(txns[1].blocks[&7], vec![0xa2; 512]);
    assert_eq!(common::replay_state(&txns)[&7], vec![0xa2; 512]);
    journal.shutdown().unwrap();
}

// ============================================================================
// Checkpoint and Reclamation
// ============================================================================

#[test]
fn writeback_reclaims_the_log() {
    let (dev, journal) = common::build_journal(common::test_config());
    let free_before = journal.free_blocks();
    common::commit_blocks(&journal, &[(5, 1)]);
    assert!(journal.free_blocks() < free_before);

    let targets = journal.checkpoint_targets();
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].blocknr(), 5);
    for buf in &targets {
        journal.buffer_written_back(buf);
    }

    let freed = journal.reclaim_space().unwrap();
    assert!(freed > 0);
    assert_eq!(journal.free_blocks(), free_before);

    // the log is marked empty again; nothing left to replay
    let txns = common::scan_log(&dev.durable_image(), journal.config());
    assert!(txns.is_empty());
    journal.shutdown().unwrap();
}

#[test]
fn log_wraps_and_reuses_reclaimed_blocks() {
    let mut config = common::test_config();
    config.last_block = 17; // 16 log blocks, each commit takes 4
    let (_dev, journal) = common::build_journal(config);

    for i in 0..10u64 {
        common::commit_blocks(&journal, &[(100 + 2 * i, i as u8), (101 + 2 * i, i as u8)]);
        for buf in journal.checkpoint_targets() {
            journal.buffer_written_back(&buf);
        }
        journal.reclaim_space().unwrap();
    }
    assert_eq!(journal.free_blocks(), journal.config().log_len());
    journal.shutdown().unwrap();
}

// ============================================================================
// Callbacks and Statistics
// ============================================================================

#[test]
fn commit_callback_sees_each_tid_once() {
    let (_dev, journal) = common::build_journal(common::test_config());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    journal.set_commit_callback(Box::new(move |tid, aborted| {
        assert!(!aborted);
        sink.lock().push(tid);
    }));

    let t1 = common::commit_blocks(&journal, &[(1, 1)]);
    let t2 = common::commit_blocks(&journal, &[(2, 2)]);
    assert_eq!(*seen.lock(), vec![t1, t2]);
    journal.shutdown().unwrap();
}

#[test]
fn fast_commit_cleanup_runs_before_commit_callback() {
    let (_dev, journal) = common::build_journal(common::test_config());
    let order = Arc::new(Mutex::new(Vec::new()));
    let cleanup_sink = Arc::clone(&order);
    journal.set_fast_commit_cleanup(Box::new(move |tid| {
        cleanup_sink.lock().push(("cleanup", tid));
    }));
    let commit_sink = Arc::clone(&order);
    journal.set_commit_callback(Box::new(move |tid, _aborted| {
        commit_sink.lock().push(("commit", tid));
    }));

    let tid = common::commit_blocks(&journal, &[(7, 7)]);
    assert_eq!(*order.lock(), vec![("cleanup", tid), ("commit", tid)]);
    journal.shutdown().unwrap();
}

#[test]
fn stats_accumulate_across_commits() {
    let (_dev, journal) = common::build_journal(common::test_config());
    common::commit_blocks(&journal, &[(1, 1), (2, 2)]);
    common::commit_blocks(&journal, &[(3, 3)]);

    let stats = journal.stats();
    assert_eq!(stats.commits, 2);
    assert_eq!(stats.total.blocks, 3);
    assert!(stats.total.handle_count >= 2);
    assert!(stats.average_commit_time_ns > 0);
    journal.shutdown().unwrap();
}

// ============================================================================
// File-Backed Device
// ============================================================================

#[test]
fn file_backed_journal_persists_log_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("journal.img");
    let dev = Arc::new(FileBlockDevice::open(&path, 512).unwrap());
    let log_dev: Arc<dyn BlockDevice> = dev.clone();
    let journal = Journal::create(log_dev, common::test_config()).unwrap();

    common::commit_blocks(&journal, &[(10, 0xcd)]);

    // superblock at 0, then descriptor, data, commit record
    let data = dev.read_block(2).unwrap();
    assert_eq!(data, vec![0xcd; 512]);
    journal.shutdown().unwrap();
}
