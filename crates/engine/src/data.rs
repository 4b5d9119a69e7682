//! Ordered-mode data writeback
//!
//! File data is never written into the log; the journal only orders it.
//! Each file participating in ordered mode registers a [`JournalInode`]
//! whose backing implements [`DataBuffers`]. During commit the engine
//! starts writeback of every attached inode's dirty range, and before
//! the commit record goes out it waits for that writeback, so committed
//! metadata never points at unwritten data.
//!
//! Writeback failures are reported to the transaction waiter; whether
//! they also abort the journal is a config decision
//! (`abort_on_data_error`).

use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use ringjournal_core::Tid;

use crate::transaction::Transaction;

/// Backing store hooks for one file's data pages.
pub trait DataBuffers: Send + Sync {
    /// Start writeback of dirty data in `[start, end)` (byte offsets).
    /// Must not block on completion.
    fn submit_range(&self, start: u64, end: u64) -> io::Result<()>;

    /// Block until previously submitted writeback of `[start, end)` has
    /// completed, reporting any write error.
    fn wait_range(&self, start: u64, end: u64) -> io::Result<()>;
}

struct InodeState {
    /// Transaction this inode's data belongs to, if any.
    transaction: Option<Tid>,
    /// Set when a later transaction touches the file while the first is
    /// still committing; the inode migrates at commit end.
    next_transaction: Option<Tid>,
    /// Dirty byte range accumulated since the last commit.
    dirty: Option<(u64, u64)>,
    /// Range submitted by the commit in progress, waited on later.
    submitted: Option<(u64, u64)>,
}

/// One file participating in ordered data mode.
pub struct JournalInode {
    backing: Arc<dyn DataBuffers>,
    write_data: bool,
    wait_data: bool,
    state: Mutex<InodeState>,
}

impl JournalInode {
    /// Register a file. `write_data` controls whether commit starts its
    /// writeback; `wait_data` whether commit waits for it. Ordered mode
    /// sets both; writeback-managed-elsewhere setups may only wait.
    pub fn new(backing: Arc<dyn DataBuffers>, write_data: bool, wait_data: bool) -> Arc<Self> {
        Arc::new(JournalInode {
            backing,
            write_data,
            wait_data,
            state: Mutex::new(InodeState {
                transaction: None,
                next_transaction: None,
                dirty: None,
                submitted: None,
            }),
        })
    }

    /// Record newly dirtied data in `[start, end)`.
    pub fn extend_dirty_range(&self, start: u64, end: u64) {
        debug_assert!(start <= end);
        let mut state = self.state.lock();
        state.dirty = Some(match state.dirty {
            Some((s, e)) => (s.min(start), e.max(end)),
            None => (start, end),
        });
    }

    /// Attach to transaction `tid`. Returns true when the caller should
    /// add the inode to that transaction's inode list; false when it is
    /// already attached (to this transaction, or to an earlier one that
    /// will hand it over at commit).
    pub(crate) fn attach(&self, tid: Tid) -> bool {
        let mut state = self.state.lock();
        match state.transaction {
            None => {
                state.transaction = Some(tid);
                true
            }
            Some(t) if t == tid => false,
            Some(_) => {
                state.next_transaction = Some(tid);
                false
            }
        }
    }

    /// Detach from `tid` at commit end. Returns the successor tid when a
    /// later transaction dirtied the file mid-commit and the inode must
    /// move to its list.
    pub(crate) fn detach(&self, tid: Tid) -> Option<Tid> {
        let mut state = self.state.lock();
        debug_assert_eq!(state.transaction, Some(tid));
        state.transaction = state.next_transaction.take();
        state.transaction
    }

    fn take_dirty(&self) -> Option<(u64, u64)> {
        let mut state = self.state.lock();
        let range = state.dirty.take();
        state.submitted = range;
        range
    }

    fn take_submitted(&self) -> Option<(u64, u64)> {
        self.state.lock().submitted.take()
    }
}

/// Start writeback for every inode attached to `txn`. Returns the first
/// error and whether any writeback was started (which decides if the
/// filesystem device needs a pre-commit flush).
pub(crate) fn submit_data_buffers(txn: &Transaction) -> (Option<io::Error>, bool) {
    let inodes: Vec<Arc<JournalInode>> = txn.lists.lock().inodes.clone();
    let mut first_err = None;
    let mut any = false;
    for inode in inodes {
        if !inode.write_data {
            continue;
        }
        let Some((start, end)) = inode.take_dirty() else {
            continue;
        };
        any = true;
        if let Err(e) = inode.backing.submit_range(start, end) {
            warn!(tid = %txn.tid(), error = %e, "data writeback submit failed");
            if first_err.is_none() {
                first_err = Some(e);
            }
        }
    }
    (first_err, any)
}

/// Wait for the writeback started by [`submit_data_buffers`]. Returns
/// the first error.
pub(crate) fn wait_data_buffers(txn: &Transaction) -> Option<io::Error> {
    let inodes: Vec<Arc<JournalInode>> = txn.lists.lock().inodes.clone();
    let mut first_err = None;
    for inode in inodes {
        if !inode.wait_data {
            continue;
        }
        let Some((start, end)) = inode.take_submitted() else {
            continue;
        };
        if let Err(e) = inode.backing.wait_range(start, end) {
            warn!(tid = %txn.tid(), error = %e, "data writeback wait failed");
            if first_err.is_none() {
                first_err = Some(e);
            }
        }
    }
    first_err
}
