//! Ordered Data Mode Tests
//!
//! File data never enters the log; commit starts its writeback and
//! waits for it before sealing, so committed metadata cannot point at
//! unwritten data.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use ringjournal::prelude::*;

use crate::common;

#[derive(Default)]
struct TrackingBuffers {
    submits: Mutex<Vec<(u64, u64)>>,
    waits: Mutex<Vec<(u64, u64)>>,
    fail_submit: AtomicBool,
}

impl DataBuffers for TrackingBuffers {
    fn submit_range(&self, start: u64, end: u64) -> io::Result<()> {
        self.submits.lock().push((start, end));
        if self.fail_submit.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "writeback failed"));
        }
        Ok(())
    }

    fn wait_range(&self, start: u64, end: u64) -> io::Result<()> {
        self.waits.lock().push((start, end));
        Ok(())
    }
}

// ============================================================================
// Ordering
// ============================================================================

#[test]
fn ordered_data_is_flushed_before_the_commit_seals() {
    let log_mem = Arc::new(MemBlockDevice::new(512));
    let data_mem = Arc::new(MemBlockDevice::new(512));
    let log_dev: Arc<dyn BlockDevice> = log_mem.clone();
    let data_dev: Arc<dyn BlockDevice> = data_mem.clone();
    let journal = Journal::with_data_device(log_dev, data_dev, common::test_config()).unwrap();

    let backing = Arc::new(TrackingBuffers::default());
    let hooks: Arc<dyn DataBuffers> = backing.clone();
    let inode = JournalInode::new(hooks, true, true);

    let buf = journal.journal_buffer(10, vec![1u8; 512]);
    let mut handle = journal.start_handle(1).unwrap();
    handle.dirty_metadata(&buf).unwrap();
    handle.add_inode(&inode);
    inode.extend_dirty_range(0, 4096);
    handle.finish().unwrap();
    journal.commit_and_wait().unwrap();

    assert_eq!(*backing.submits.lock(), vec![(0, 4096)]);
    assert_eq!(*backing.waits.lock(), vec![(0, 4096)]);
    // the filesystem device cache was flushed before the record went out
    assert_eq!(data_mem.flush_count(), 1);
    journal.shutdown().unwrap();
}

#[test]
fn clean_inodes_trigger_no_data_flush() {
    let log_mem = Arc::new(MemBlockDevice::new(512));
    let data_mem = Arc::new(MemBlockDevice::new(512));
    let log_dev: Arc<dyn BlockDevice> = log_mem.clone();
    let data_dev: Arc<dyn BlockDevice> = data_mem.clone();
    let journal = Journal::with_data_device(log_dev, data_dev, common::test_config()).unwrap();

    common::commit_blocks(&journal, &[(10, 1)]);
    assert_eq!(data_mem.flush_count(), 0);
    journal.shutdown().unwrap();
}

// ============================================================================
// Error Policy
// ============================================================================

#[test]
fn writeback_failure_aborts_when_configured() {
    let mut config = common::test_config();
    config.abort_on_data_error = true;
    let (_dev, journal) = common::build_journal(config);

    let backing = Arc::new(TrackingBuffers::default());
    backing.fail_submit.store(true, Ordering::SeqCst);
    let hooks: Arc<dyn DataBuffers> = backing.clone();
    let inode = JournalInode::new(hooks, true, true);

    let mut handle = journal.start_handle(1).unwrap();
    let buf = journal.journal_buffer(10, vec![1u8; 512]);
    handle.dirty_metadata(&buf).unwrap();
    handle.add_inode(&inode);
    inode.extend_dirty_range(0, 512);
    handle.finish().unwrap();

    assert!(matches!(
        journal.commit_and_wait(),
        Err(JournalError::Aborted)
    ));
    let _ = journal.shutdown();
}

#[test]
fn writeback_failure_is_tolerated_by_default() {
    let (_dev, journal) = common::build_journal(common::test_config());

    let backing = Arc::new(TrackingBuffers::default());
    backing.fail_submit.store(true, Ordering::SeqCst);
    let hooks: Arc<dyn DataBuffers> = backing.clone();
    let inode = JournalInode::new(hooks, true, true);

    let mut handle = journal.start_handle(1).unwrap();
    let buf = journal.journal_buffer(10, vec![1u8; 512]);
    handle.dirty_metadata(&buf).unwrap();
    handle.add_inode(&inode);
    inode.extend_dirty_range(0, 512);
    handle.finish().unwrap();

    journal.commit_and_wait().unwrap();
    assert!(!journal.is_aborted());
    journal.shutdown().unwrap();
}
