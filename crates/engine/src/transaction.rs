//! Transactions and handles
//!
//! A [`Transaction`] batches every filesystem update made while it was
//! running. Updates join through a [`Handle`], which reserves log
//! credits up front; the commit state machine later drains the handle
//! count to zero, snapshots the dirtied buffers, and walks the
//! transaction through the states in [`TxState`].
//!
//! Buffer membership is tracked by owned lists under one mutex per
//! transaction. A buffer is on at most one list of at most one
//! transaction; the checkpoint machinery has its own list.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::trace;

use ringjournal_core::{JournalError, LogBlock, Result, Tid};
use ringjournal_device::IoRequest;

use crate::buffer::{BufferList, Claim, JournalBuffer};
use crate::data::JournalInode;
use crate::journal::Journal;
use crate::stats::RunStats;

/// Commit state machine states, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TxState {
    /// Accepting new handles.
    Running,
    /// No new handles; draining the ones in flight.
    Locked,
    /// Atomic switchover: reserved buffers dropped, revoke epoch swapped.
    Switch,
    /// Data writeback submitted; a successor transaction may run.
    Flush,
    /// Log blocks being written.
    Commit,
    /// Waiting on data-device durability.
    CommitDflush,
    /// Waiting on log durability.
    CommitJflush,
    /// Running commit callbacks and checkpoint insertion.
    CommitCallback,
    /// Fully processed; lives on only via its checkpoint list.
    Finished,
}

/// Buffer and inode lists owned by a transaction.
#[derive(Default)]
pub(crate) struct TxLists {
    /// Dirty metadata to be logged, in dirtying order.
    pub buffers: Vec<Arc<JournalBuffer>>,
    /// Reserved but never dirtied; dropped at switchover.
    pub reserved: Vec<Arc<JournalBuffer>>,
    /// Log writes in flight.
    pub shadow: Vec<Arc<JournalBuffer>>,
    /// To be released (not checkpointed) once the commit is durable.
    pub forget: Vec<Arc<JournalBuffer>>,
    /// Files with ordered data attached to this transaction.
    pub inodes: Vec<Arc<JournalInode>>,
}

/// Dispatch-to-flush hand-off for the pipelined commit path: everything
/// the flush stage needs to finish a transaction whose writes are
/// dispatched but not yet complete.
#[derive(Default)]
pub(crate) struct Carry {
    /// Data blocks written into the log, submission order.
    pub io: Vec<(Arc<JournalBuffer>, IoRequest)>,
    /// Descriptor blocks, submission order.
    pub log: Vec<IoRequest>,
    /// The commit record write.
    pub commit_record: Option<IoRequest>,
    /// Pending tail advance `(first_tid, block, freed)` applied once the
    /// transaction is durable.
    pub update_tail: Option<(Tid, LogBlock, u64)>,
}

pub(crate) struct Timing {
    pub started: Instant,
    pub requested: Option<Instant>,
    pub locked: Option<Instant>,
    pub flushing: Option<Instant>,
    pub logging: Option<Instant>,
}

/// One journal transaction.
pub struct Transaction {
    tid: Tid,
    state: Mutex<TxState>,
    pub(crate) lists: Mutex<TxLists>,
    /// Log blocks reserved by live handles and not yet consumed by the
    /// commit writer. Never negative.
    pub(crate) outstanding_credits: AtomicI64,
    /// Handles currently attached.
    pub(crate) updates: AtomicUsize,
    pub(crate) handle_count: AtomicU64,
    /// Older in-flight versions of buffers this transaction dirtied;
    /// commit waits for zero before locking down.
    pub(crate) conflict_count: Arc<AtomicUsize>,
    /// Ordered data was submitted; the data device needs a flush before
    /// the commit record.
    pub(crate) need_data_flush: AtomicBool,
    /// First log block this transaction wrote.
    pub(crate) log_start: AtomicU64,
    pub(crate) timing: Mutex<Timing>,
    pub(crate) stats: Mutex<RunStats>,
    pub(crate) carry: Mutex<Carry>,
    /// Buffers whose home writeback this transaction still owes.
    pub(crate) checkpoint: Mutex<Vec<Arc<JournalBuffer>>>,
}

impl Transaction {
    pub(crate) fn new(tid: Tid) -> Arc<Self> {
        Arc::new(Transaction {
            tid,
            state: Mutex::new(TxState::Running),
            lists: Mutex::new(TxLists::default()),
            outstanding_credits: AtomicI64::new(0),
            updates: AtomicUsize::new(0),
            handle_count: AtomicU64::new(0),
            conflict_count: Arc::new(AtomicUsize::new(0)),
            need_data_flush: AtomicBool::new(false),
            log_start: AtomicU64::new(0),
            timing: Mutex::new(Timing {
                started: Instant::now(),
                requested: None,
                locked: None,
                flushing: None,
                logging: None,
            }),
            stats: Mutex::new(RunStats::default()),
            carry: Mutex::new(Carry::default()),
            checkpoint: Mutex::new(Vec::new()),
        })
    }

    /// This transaction's id.
    pub fn tid(&self) -> Tid {
        self.tid
    }

    /// Current commit state.
    pub fn state(&self) -> TxState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, next: TxState) {
        let mut state = self.state.lock();
        debug_assert!(next >= *state, "commit state may only advance");
        trace!(tid = %self.tid, ?next, "transaction state");
        *state = next;
    }

    /// File `buf` on one of this transaction's lists.
    pub(crate) fn file_buffer(&self, buf: &Arc<JournalBuffer>, list: BufferList) {
        let mut lists = self.lists.lock();
        let target = match list {
            BufferList::Buffers => &mut lists.buffers,
            BufferList::Reserved => &mut lists.reserved,
            BufferList::Shadow => &mut lists.shadow,
            BufferList::Forget => &mut lists.forget,
            BufferList::None => unreachable!("file to None is unfile"),
        };
        target.push(Arc::clone(buf));
        buf.file(list, self.tid);
    }

    /// Move `buf` between two of this transaction's lists.
    pub(crate) fn refile_buffer(&self, buf: &Arc<JournalBuffer>, from: BufferList, to: BufferList) {
        {
            let mut lists = self.lists.lock();
            let source = match from {
                BufferList::Buffers => &mut lists.buffers,
                BufferList::Reserved => &mut lists.reserved,
                BufferList::Shadow => &mut lists.shadow,
                BufferList::Forget => &mut lists.forget,
                BufferList::None => unreachable!(),
            };
            if let Some(pos) = source.iter().position(|b| Arc::ptr_eq(b, buf)) {
                source.remove(pos);
            }
        }
        self.file_buffer(buf, to);
    }

    /// Remove `buf` from whichever of this transaction's lists holds it.
    pub(crate) fn unfile_buffer(&self, buf: &Arc<JournalBuffer>) {
        let mut lists = self.lists.lock();
        let lists = &mut *lists;
        for source in [
            &mut lists.buffers,
            &mut lists.reserved,
            &mut lists.shadow,
            &mut lists.forget,
        ] {
            if let Some(pos) = source.iter().position(|b| Arc::ptr_eq(b, buf)) {
                source.remove(pos);
                break;
            }
        }
        buf.unfile();
    }

    /// Consume one reserved log credit for a block about to be logged.
    /// The counter must never go negative; a violation means handle
    /// accounting is broken and the journal cannot trust its space math.
    pub(crate) fn consume_credit(&self) -> Result<()> {
        let left = self.outstanding_credits.fetch_sub(1, Ordering::SeqCst) - 1;
        if left < 0 {
            self.outstanding_credits.fetch_add(1, Ordering::SeqCst);
            return Err(JournalError::LogFull {
                requested: 1,
                free: 0,
            });
        }
        Ok(())
    }

    /// Return unused credits (handle finished early, or reserved buffers
    /// dropped at switchover).
    pub(crate) fn return_credits(&self, n: i64) {
        let left = self.outstanding_credits.fetch_sub(n, Ordering::SeqCst) - n;
        debug_assert!(left >= 0, "credit accounting went negative");
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("tid", &self.tid)
            .field("state", &self.state())
            .field("updates", &self.updates.load(Ordering::SeqCst))
            .field(
                "outstanding_credits",
                &self.outstanding_credits.load(Ordering::SeqCst),
            )
            .finish()
    }
}

/// A caller's ticket into the running transaction.
///
/// Dropping a handle finishes it; [`Handle::finish`] does the same but
/// surfaces whether the journal aborted underneath it.
pub struct Handle {
    journal: Arc<Journal>,
    txn: Arc<Transaction>,
    credits: u64,
    used: u64,
    done: bool,
}

impl Handle {
    pub(crate) fn new(journal: Arc<Journal>, txn: Arc<Transaction>, credits: u64) -> Self {
        txn.outstanding_credits
            .fetch_add(credits as i64, Ordering::SeqCst);
        txn.updates.fetch_add(1, Ordering::SeqCst);
        txn.handle_count.fetch_add(1, Ordering::SeqCst);
        Handle {
            journal,
            txn,
            credits,
            used: 0,
            done: false,
        }
    }

    /// Transaction this handle joined.
    pub fn tid(&self) -> Tid {
        self.txn.tid()
    }

    /// Declare `buf` dirty metadata of this transaction: claims a
    /// version slot, consumes a log credit, and files the buffer for
    /// logging. Idempotent per transaction.
    pub fn dirty_metadata(&mut self, buf: &Arc<JournalBuffer>) -> Result<()> {
        self.journal.check_aborted()?;
        // a reserved buffer being dirtied keeps the credit it already
        // holds
        let reserved = buf.filed_on() == (BufferList::Reserved, Some(self.txn.tid()));
        if !reserved && self.used == self.credits {
            return Err(JournalError::LogFull {
                requested: 1,
                free: 0,
            });
        }
        // the claim is the source of truth for membership; an older
        // transaction's commit may have rewritten the list marker
        match buf.claim_version(self.txn.tid(), &self.txn.conflict_count)? {
            Claim::Already => return Ok(()),
            Claim::New { conflicts } if conflicts > 0 => {
                trace!(
                    tid = %self.txn.tid(),
                    block = buf.blocknr(),
                    conflicts,
                    "buffer has in-flight older versions"
                );
            }
            Claim::New { .. } => {}
        }
        if reserved {
            self.txn
                .refile_buffer(buf, BufferList::Reserved, BufferList::Buffers);
        } else {
            self.used += 1;
            self.txn.file_buffer(buf, BufferList::Buffers);
        }
        buf.set_journal_dirty(true);
        self.txn.stats.lock().blocks += 1;
        Ok(())
    }

    /// Reserve `buf` for possible later dirtying without snapshotting
    /// it. Reserved buffers are dropped at commit switchover if never
    /// dirtied.
    pub fn reserve_buffer(&mut self, buf: &Arc<JournalBuffer>) -> Result<()> {
        self.journal.check_aborted()?;
        let filed = buf.filed_on();
        if filed.1 == Some(self.txn.tid()) && filed.0 != BufferList::None {
            return Ok(());
        }
        if self.used == self.credits {
            return Err(JournalError::LogFull {
                requested: 1,
                free: 0,
            });
        }
        self.used += 1;
        self.txn.file_buffer(buf, BufferList::Reserved);
        Ok(())
    }

    /// The block was deleted: make sure it is never checkpointed. If it
    /// was dirtied by this transaction the pending log write is
    /// cancelled and the credit returned.
    pub fn forget(&mut self, buf: &Arc<JournalBuffer>) -> Result<()> {
        self.journal.check_aborted()?;
        buf.mark_freed();
        buf.set_journal_dirty(false);
        match buf.filed_on() {
            (BufferList::Buffers, Some(tid)) if tid == self.txn.tid() => {
                self.txn
                    .refile_buffer(buf, BufferList::Buffers, BufferList::Forget);
                self.used = self.used.saturating_sub(1);
            }
            (BufferList::Reserved, Some(tid)) if tid == self.txn.tid() => {
                self.txn.unfile_buffer(buf);
                self.used = self.used.saturating_sub(1);
            }
            // owned by an older transaction (committing or checkpointed):
            // the freed flag makes its checkpoint processing drop it
            _ => {}
        }
        Ok(())
    }

    /// Attach a file's ordered data to this transaction.
    pub fn add_inode(&self, inode: &Arc<JournalInode>) {
        if inode.attach(self.txn.tid()) {
            self.txn.lists.lock().inodes.push(Arc::clone(inode));
        }
    }

    /// Finish the handle, returning unused credits to the transaction.
    /// Reports an abort that happened while the handle was open.
    pub fn finish(mut self) -> Result<()> {
        self.finish_inner();
        self.journal.check_aborted()
    }

    fn finish_inner(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        self.txn.return_credits((self.credits - self.used) as i64);
        let remaining = self.txn.updates.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 {
            self.journal.note_updates_drained();
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.finish_inner();
    }
}
