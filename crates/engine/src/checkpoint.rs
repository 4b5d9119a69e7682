//! Checkpointing and log-space reclamation
//!
//! A committed transaction's buffers are not done with the journal: the
//! log copy must stay until each buffer is written back to its home
//! location. Transactions that still owe writebacks live on the
//! checkpoint ring, oldest first; the on-disk tail can only advance past
//! a transaction once it leaves the ring.
//!
//! Forget-list processing is also where buffer versions retire, which
//! is what unblocks younger transactions waiting out version conflicts.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::trace;

use ringjournal_core::Tid;

use crate::buffer::JournalBuffer;
use crate::journal::Journal;
use crate::transaction::{Transaction, TxState};

/// Drain the transaction's forget list, retiring each buffer's version
/// and deciding its afterlife: dropped when freed, checkpointed while
/// its home copy is stale. Runs as the commit-callback phase; late
/// arrivals on the forget list are picked up by the re-check each
/// iteration.
pub(crate) fn process_transaction(journal: &Arc<Journal>, txn: &Arc<Transaction>) {
    let mut released = false;
    loop {
        let Some(buf) = txn.lists.lock().forget.pop() else {
            break;
        };
        retire_buffer(journal, txn, &buf);
        released = true;
    }
    if released {
        journal.note_conflicts_released();
    }

    if !txn.checkpoint.lock().is_empty() {
        journal.lists.lock().checkpoint.push_back(Arc::clone(txn));
        trace!(tid = %txn.tid(), "transaction checkpointed");
    }
}

fn retire_buffer(journal: &Journal, txn: &Transaction, buf: &Arc<JournalBuffer>) {
    for waiter in buf.release_version(txn.tid()) {
        waiter.fetch_sub(1, Ordering::SeqCst);
    }
    buf.unfile();

    // supersede the copy an older transaction was checkpointing
    if let Some(old_tid) = buf.checkpoint_tid() {
        if let Some(old) = checkpoint_transaction(journal, old_tid) {
            old.checkpoint.lock().retain(|b| !Arc::ptr_eq(b, buf));
        }
        buf.set_checkpoint_tid(None);
    }

    if buf.is_freed() || journal.is_aborted() {
        buf.set_journal_dirty(false);
        return;
    }
    if buf.is_journal_dirty() {
        buf.set_checkpoint_tid(Some(txn.tid()));
        txn.checkpoint.lock().push(Arc::clone(buf));
    }
}

fn checkpoint_transaction(journal: &Journal, tid: Tid) -> Option<Arc<Transaction>> {
    journal
        .lists
        .lock()
        .checkpoint
        .iter()
        .find(|t| t.tid() == tid)
        .cloned()
}

/// Drop written-back buffers from every checkpoint list, then pop
/// fully-clean transactions from the front of the ring. Only the front
/// may leave: the tail moves in tid order.
pub(crate) fn clean_checkpoint_list(journal: &Journal) {
    let txns: Vec<Arc<Transaction>> = journal.lists.lock().checkpoint.iter().cloned().collect();
    for txn in txns {
        txn.checkpoint.lock().retain(|buf| {
            if buf.is_journal_dirty() {
                true
            } else {
                buf.set_checkpoint_tid(None);
                false
            }
        });
    }

    let mut lists = journal.lists.lock();
    while let Some(front) = lists.checkpoint.front() {
        if front.state() == TxState::Finished && front.checkpoint.lock().is_empty() {
            let tid = front.tid();
            lists.checkpoint.pop_front();
            trace!(%tid, "checkpoint transaction retired");
        } else {
            break;
        }
    }
}

/// Buffers still awaiting home writeback, oldest transaction first.
pub(crate) fn checkpoint_targets(journal: &Journal) -> Vec<Arc<JournalBuffer>> {
    let txns: Vec<Arc<Transaction>> = journal.lists.lock().checkpoint.iter().cloned().collect();
    let mut targets = Vec::new();
    for txn in txns {
        targets.extend(txn.checkpoint.lock().iter().cloned());
    }
    targets
}
