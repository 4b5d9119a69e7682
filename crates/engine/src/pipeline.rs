//! Pipelined barrier commit
//!
//! Splits the commit into two stages so transaction N+1 can start
//! writing while transaction N waits for the disk:
//!
//! - The *dispatch* stage runs on the commit worker. It performs the
//!   same lockdown, switchover, and log writing as the classic path but
//!   waits only for each write to be *dispatched* to an order-preserving
//!   transport, then queues the transaction for flushing and returns.
//!   `commit_sequence` advances here.
//! - The *flush* stage runs on the flush worker, strictly FIFO. It waits
//!   for write completions, issues the device cache flush, applies the
//!   pending tail advance, and runs checkpoint insertion. `flush_
//!   sequence` advances here, and only a flush makes a transaction
//!   durable.
//!
//! Cache flushes may be compounded: only every Nth transaction flushes,
//! except that the last queued transaction always does, so no committed
//! transaction waits for durability indefinitely.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::checkpoint;
use crate::commit::{self, LogOutput, ERRNO_IO};
use crate::journal::Journal;
use crate::transaction::{Transaction, TxState};

/// Dispatch stage: everything up to "all log writes are on the wire".
pub(crate) fn dispatch_transaction(journal: &Arc<Journal>) {
    let txn = { journal.state.read().running.clone() };
    let Some(txn) = txn else {
        // request for a transaction that no longer exists: confirm it
        let mut waits = journal.waits.lock();
        waits.commit_sequence = waits.commit_request;
        journal.done_commit.notify_all();
        return;
    };
    let tid = txn.tid();
    debug!(%tid, "dispatch starting");

    commit::lock_down(journal, &txn);
    commit::switchover(journal, &txn);
    commit::start_flush(journal, &txn);
    if let Err(e) = journal.ensure_log_marked_dirty() {
        error!(%tid, error = %e, "superblock update failed");
        journal.abort(ERRNO_IO);
    }
    let output = commit::write_log_blocks(journal, &txn);
    commit::finish_data_buffers(journal, &txn);

    txn.set_state(TxState::CommitDflush);
    if txn.need_data_flush.load(Ordering::SeqCst) && journal.config().barrier {
        if let Some(dev) = journal.data_device() {
            if let Err(e) = dev.flush() {
                commit::handle_data_error(journal, e);
            }
        }
    }

    // the commit record goes out with the batch; the flush stage checks
    // that it actually made it
    let mut record = None;
    if !journal.is_aborted() {
        match commit::write_commit_record(journal, &txn, output.crc) {
            Ok(r) => record = Some(r),
            Err(e) => {
                error!(%tid, error = %e, "commit record submission failed");
                journal.abort(ERRNO_IO);
            }
        }
    }

    // dispatch waits only: completions belong to the flush stage
    for (_, request) in &output.io {
        request.wait_dispatched();
    }
    for request in &output.log {
        request.wait_dispatched();
    }
    if let Some(record) = &record {
        record.wait_dispatched();
    }

    {
        let mut carry = txn.carry.lock();
        carry.io = output.io;
        carry.log = output.log;
        carry.commit_record = record;
        carry.update_tail = journal.tail_advance_candidate();
    }

    // queue for flushing before giving up the committing slot, so the
    // transaction is always visible to tail computation
    {
        let mut lists = journal.lists.lock();
        lists.flushing.push_back(Arc::clone(&txn));
        journal.flush_queue_cond.notify_all();
    }
    {
        let mut state = journal.state.write();
        state.committing = None;
    }

    journal.run_commit_callback(tid);
    journal.advance_commit_sequence(tid);
    debug!(%tid, "dispatch finished");
}

/// Flush stage: completion waits, the cache flush, tail advance, and
/// checkpoint insertion for the oldest dispatched transaction.
pub(crate) fn flush_transaction(journal: &Arc<Journal>, txn: &Arc<Transaction>) {
    let tid = txn.tid();
    debug!(%tid, "flush starting");
    let carry = std::mem::take(&mut *txn.carry.lock());

    let output = LogOutput {
        io: carry.io,
        log: carry.log,
        crc: 0,
        blocks_logged: 0,
    };
    let mut failed = commit::wait_io_completion(txn, &output).is_some();
    if let Some(record) = &carry.commit_record {
        if let Err(e) = record.wait_completed() {
            warn!(%tid, error = %e, "commit record write failed");
            failed = true;
        }
    }
    txn.set_state(TxState::CommitJflush);
    journal.advance_transfer_sequence(tid);
    if failed {
        journal.abort(ERRNO_IO);
    }

    if !journal.is_aborted() {
        if journal.config().barrier {
            let queue_drained = journal.lists.lock().flushing.len() <= 1;
            let interval = journal.config().compound_flush_interval;
            if queue_drained || tid.raw() % interval == 0 {
                match journal.device().flush() {
                    Ok(()) => journal.advance_flush_sequence(tid),
                    Err(e) => {
                        error!(%tid, error = %e, "journal device flush failed");
                        journal.abort(ERRNO_IO);
                    }
                }
            }
        } else {
            journal.advance_flush_sequence(tid);
        }
    }

    if !journal.is_aborted() {
        if let Some((first_tid, block, _)) = carry.update_tail {
            if let Err(e) = journal.update_log_tail(first_tid, block) {
                warn!(error = %e, "log tail update failed");
            }
        }
    }

    commit::finish_transaction(journal, txn);
    journal.run_flush_callback(tid);

    {
        let mut lists = journal.lists.lock();
        let popped = lists.flushing.pop_front();
        debug_assert!(popped.is_some_and(|t| Arc::ptr_eq(&t, txn)));
    }
    checkpoint::clean_checkpoint_list(journal);
    debug!(%tid, "flush finished");
}
