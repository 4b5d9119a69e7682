//! Credit Accounting and Space Tests
//!
//! Handles reserve log space up front; the journal must refuse work it
//! cannot fit and recover once checkpointing frees the tail.

use ringjournal::prelude::*;

use crate::common;

// ============================================================================
// Handle Reservations
// ============================================================================

#[test]
fn oversized_reservations_are_rejected() {
    let (_dev, journal) = common::build_journal(common::test_config());
    let limit = journal.max_handle_credits();
    assert!(journal.start_handle(limit).is_ok());
    assert!(matches!(
        journal.start_handle(limit + 1),
        Err(JournalError::LogFull { .. })
    ));
    journal.shutdown().unwrap();
}

#[test]
fn dirtying_beyond_the_reservation_fails() {
    let (_dev, journal) = common::build_journal(common::test_config());
    let a = journal.journal_buffer(1, vec![0u8; 512]);
    let b = journal.journal_buffer(2, vec![0u8; 512]);

    let mut handle = journal.start_handle(1).unwrap();
    handle.dirty_metadata(&a).unwrap();
    assert!(matches!(
        handle.dirty_metadata(&b),
        Err(JournalError::LogFull { .. })
    ));
    handle.finish().unwrap();
    journal.shutdown().unwrap();
}

#[test]
fn reserved_buffer_keeps_its_credit_when_dirtied() {
    let (dev, journal) = common::build_journal(common::test_config());
    let buf = journal.journal_buffer(9, vec![0u8; 512]);

    let mut handle = journal.start_handle(1).unwrap();
    handle.reserve_buffer(&buf).unwrap();
    // dirtying the reservation must not need a second credit
    handle.dirty_metadata(&buf).unwrap();
    buf.write_data(|d| d.fill(0x77));
    handle.finish().unwrap();
    journal.commit_and_wait().unwrap();

    let txns = common::scan_log(&dev.durable_image(), journal.config());
    assert_eq!(txns[0].blocks[&9], vec![0x77; 512]);
    journal.shutdown().unwrap();
}

#[test]
fn untouched_reservations_are_dropped_at_commit() {
    let (dev, journal) = common::build_journal(common::test_config());
    let buf = journal.journal_buffer(9, vec![0u8; 512]);
    let free_before = journal.free_blocks();

    let mut handle = journal.start_handle(1).unwrap();
    handle.reserve_buffer(&buf).unwrap();
    handle.finish().unwrap();
    journal.commit_and_wait().unwrap();

    // only the commit record hit the log
    assert_eq!(free_before - journal.free_blocks(), 1);
    let txns = common::scan_log(&dev.durable_image(), journal.config());
    assert_eq!(txns.len(), 1);
    assert!(txns[0].blocks.is_empty());
    journal.shutdown().unwrap();
}

#[test]
fn forget_cancels_a_pending_log_write() {
    let (dev, journal) = common::build_journal(common::test_config());
    let buf = journal.journal_buffer(9, vec![1u8; 512]);

    let mut handle = journal.start_handle(1).unwrap();
    handle.dirty_metadata(&buf).unwrap();
    handle.forget(&buf).unwrap();
    handle.finish().unwrap();
    journal.commit_and_wait().unwrap();

    let txns = common::scan_log(&dev.durable_image(), journal.config());
    assert_eq!(txns.len(), 1);
    assert!(txns[0].blocks.is_empty());
    // a forgotten block is never checkpointed
    assert!(journal.checkpoint_targets().is_empty());
    journal.shutdown().unwrap();
}

#[test]
fn overlapping_reservations_never_outgrow_the_log() {
    let mut config = common::test_config();
    config.last_block = 17; // 16 log blocks
    let (dev, journal) = common::build_journal(config);

    common::commit_blocks(&journal, &[(30, 1), (31, 1), (32, 1)]);
    common::commit_blocks(&journal, &[(33, 2), (34, 2)]);
    assert_eq!(journal.free_blocks(), 7);

    // a full reservation fits on its own
    let mut handle = journal.start_handle(4).unwrap();
    let tid = handle.tid();
    for i in 0..4u64 {
        let buf = journal.journal_buffer(40 + i, vec![3u8; 512]);
        handle.dirty_metadata(&buf).unwrap();
    }
    handle.finish().unwrap();

    // a second full reservation does not fit alongside the first: the
    // journal commits the running transaction instead of over-admitting,
    // and with the tail still pinned the handle is refused cleanly
    assert!(matches!(
        journal.start_handle(4),
        Err(JournalError::LogFull { .. })
    ));
    journal.wait_commit(tid).unwrap();
    assert!(!journal.is_aborted());
    let txns = common::scan_log(&dev.durable_image(), journal.config());
    assert_eq!(txns.len(), 3);

    // checkpoint writeback reopens the log
    for buf in journal.checkpoint_targets() {
        journal.buffer_written_back(&buf);
    }
    journal.reclaim_space().unwrap();
    let handle = journal.start_handle(4).unwrap();
    handle.finish().unwrap();
    journal.shutdown().unwrap();
}

// ============================================================================
// Log Exhaustion
// ============================================================================

#[test]
fn log_fills_without_writeback_and_recovers_after() {
    let mut config = common::test_config();
    config.last_block = 17; // 16 log blocks
    let (_dev, journal) = common::build_journal(config);

    let mut filled = None;
    for i in 0..16u64 {
        match journal.start_handle(1) {
            Ok(mut handle) => {
                let buf = journal.journal_buffer(50 + i, vec![i as u8; 512]);
                handle.dirty_metadata(&buf).unwrap();
                handle.finish().unwrap();
                journal.commit_and_wait().unwrap();
            }
            Err(e) => {
                filled = Some(e);
                break;
            }
        }
    }
    assert!(matches!(filled, Some(JournalError::LogFull { .. })));

    // writeback frees the tail and handles start again
    for buf in journal.checkpoint_targets() {
        journal.buffer_written_back(&buf);
    }
    journal.reclaim_space().unwrap();
    let handle = journal.start_handle(1).unwrap();
    handle.finish().unwrap();
    journal.shutdown().unwrap();
}
