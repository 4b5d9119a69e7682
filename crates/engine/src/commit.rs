//! Commit state machine, classic path
//!
//! Walks a transaction from `Running` to `Finished`: lock down handles,
//! drop reserved buffers, snapshot dirty metadata into the log as
//! descriptor batches, seal with a commit record, and hand the buffers
//! to the checkpoint machinery. The phase helpers are shared with the
//! pipelined path in [`pipeline`], which reorders the waiting but not
//! the writing.
//!
//! A batch is one descriptor block followed by its data blocks. The
//! batch closes when the descriptor runs out of tag space or the
//! per-transaction buffer budget is reached; the final block of the
//! final batch carries a barrier fence on transports that do not
//! preserve submission order on their own.
//!
//! [`pipeline`]: crate::pipeline

use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, error, warn};

use ringjournal_core::checksum;
use ringjournal_core::features::ChecksumVersion;
use ringjournal_core::layout::{
    self, BlockTag, CommitBlock, JournalHeader, BLOCKTYPE_DESCRIPTOR, CHECKSUM_SIZE_CRC32,
    CHECKSUM_TYPE_CRC32, HEADER_BYTES, TAG_FLAG_ESCAPE, TAG_FLAG_LAST_TAG, TAG_FLAG_SAME_UUID,
    UUID_BYTES,
};
use ringjournal_core::{LogBlock, Result};
use ringjournal_device::{IoRequest, WriteFlags};

use crate::buffer::{BufferList, JournalBuffer};
use crate::checkpoint;
use crate::data;
use crate::journal::Journal;
use crate::transaction::{Transaction, TxState};

/// Errno recorded in the superblock when a log write fails.
pub(crate) const ERRNO_IO: i32 = -5;

/// Everything the log writer submitted for one transaction.
#[derive(Default)]
pub(crate) struct LogOutput {
    /// Frozen data blocks, submission order.
    pub io: Vec<(Arc<JournalBuffer>, IoRequest)>,
    /// Descriptor blocks, submission order.
    pub log: Vec<IoRequest>,
    /// Rolling transaction checksum (v1).
    pub crc: u32,
    pub blocks_logged: u64,
}

struct PendingTag {
    blocknr: u64,
    escaped: bool,
    checksum: u32,
}

struct BatchEntry {
    log_block: LogBlock,
    image: Vec<u8>,
    buf: Arc<JournalBuffer>,
}

/// Builds and submits descriptor batches for one transaction.
struct LogWriter<'a> {
    journal: &'a Arc<Journal>,
    txn: &'a Arc<Transaction>,
    descriptor_block: Option<LogBlock>,
    tags: Vec<PendingTag>,
    entries: Vec<BatchEntry>,
    space_left: usize,
    output: LogOutput,
}

impl<'a> LogWriter<'a> {
    fn new(journal: &'a Arc<Journal>, txn: &'a Arc<Transaction>) -> Self {
        LogWriter {
            journal,
            txn,
            descriptor_block: None,
            tags: Vec::new(),
            entries: Vec::new(),
            space_left: 0,
            output: LogOutput {
                crc: checksum::TX_CHECKSUM_SEED,
                ..LogOutput::default()
            },
        }
    }

    /// Tag space one more entry would need (the first tag also carries
    /// the journal UUID).
    fn tag_space(&self) -> usize {
        let features = self.journal.features();
        if self.tags.is_empty() {
            features.tag_bytes() + UUID_BYTES
        } else {
            features.tag_bytes()
        }
    }

    /// Snapshot `buf` into the log: allocates a log block, consumes a
    /// credit, moves the buffer to the shadow list, and queues the tag.
    fn add(&mut self, buf: &Arc<JournalBuffer>) -> Result<()> {
        let config = self.journal.config();
        if self.descriptor_block.is_none() {
            self.descriptor_block = Some(self.journal.next_log_block()?);
            self.space_left =
                config.block_size - HEADER_BYTES - self.journal.features().csum_tail_bytes();
        }

        let log_block = self.journal.next_log_block()?;
        self.txn.consume_credit()?;

        let tid = self.txn.tid();
        let (image, escaped) = buf.freeze(tid);
        self.txn
            .refile_buffer(buf, BufferList::Buffers, BufferList::Shadow);

        let checksum = if self.journal.features().checksum.is_v2_or_v3() {
            checksum::tag_checksum(self.journal.csum_seed(), tid, &image)
        } else {
            0
        };
        self.space_left -= self.tag_space();
        self.tags.push(PendingTag {
            blocknr: buf.blocknr(),
            escaped,
            checksum,
        });
        self.entries.push(BatchEntry {
            log_block,
            image,
            buf: Arc::clone(buf),
        });

        let full = self.entries.len() == config.max_transaction_buffers
            || self.space_left < self.tag_space() + self.journal.features().csum_tail_bytes();
        if full {
            self.close_batch(false);
        }
        Ok(())
    }

    /// Serialize the descriptor and submit the batch. `last_batch` puts
    /// the barrier fence on the final data block when the transport
    /// needs one.
    fn close_batch(&mut self, last_batch: bool) {
        let Some(descriptor_block) = self.descriptor_block.take() else {
            return;
        };
        let journal = self.journal;
        let config = journal.config();
        let features = journal.features();
        let tid = self.txn.tid();

        let mut block = vec![0u8; config.block_size];
        JournalHeader::new(BLOCKTYPE_DESCRIPTOR, tid).encode_into(&mut block);
        let mut offset = HEADER_BYTES;
        let count = self.tags.len();
        for (i, tag) in self.tags.drain(..).enumerate() {
            let mut flags = 0u16;
            if tag.escaped {
                flags |= TAG_FLAG_ESCAPE;
            }
            if i > 0 {
                flags |= TAG_FLAG_SAME_UUID;
            }
            if i + 1 == count {
                flags |= TAG_FLAG_LAST_TAG;
            }
            BlockTag {
                blocknr: tag.blocknr,
                flags,
                checksum: tag.checksum,
            }
            .encode_into(&mut block[offset..], features);
            offset += features.tag_bytes();
            if i == 0 {
                block[offset..offset + UUID_BYTES].copy_from_slice(journal.uuid());
                offset += UUID_BYTES;
            }
        }
        if features.checksum.is_v2_or_v3() {
            let csum = checksum::block_checksum(journal.csum_seed(), &block);
            layout::write_descriptor_tail(&mut block, csum);
        }
        if features.checksum == ChecksumVersion::V1 {
            self.output.crc = checksum::tx_rolling(self.output.crc, &block);
            for entry in &self.entries {
                self.output.crc = checksum::tx_rolling(self.output.crc, &entry.image);
            }
        }

        let request = journal
            .device()
            .submit_write(descriptor_block, block, WriteFlags::ordered());
        self.output.log.push(request);
        self.output.blocks_logged += 1;

        let fifo = journal.device().fifo_ordered();
        let count = self.entries.len();
        for (i, entry) in self.entries.drain(..).enumerate() {
            let flags = if last_batch && i + 1 == count && !fifo {
                WriteFlags::barrier()
            } else {
                WriteFlags::ordered()
            };
            let request = journal
                .device()
                .submit_write(entry.log_block, entry.image, flags);
            self.output.io.push((entry.buf, request));
            self.output.blocks_logged += 1;
        }
    }

    fn finish(mut self) -> LogOutput {
        self.close_batch(true);
        self.output
    }
}

/// Lock the transaction: no new handles, wait out in-flight handles and
/// older buffer versions.
pub(crate) fn lock_down(journal: &Journal, txn: &Arc<Transaction>) {
    txn.set_state(TxState::Locked);
    let now = Instant::now();
    {
        let timing = txn.timing.lock();
        let mut stats = txn.stats.lock();
        stats.running = now - timing.started;
        if let Some(requested) = timing.requested {
            stats.request_delay = now - requested;
        }
    }
    txn.timing.lock().locked = Some(now);

    journal.wait_conflicts_cleared(txn);
    journal.wait_updates_drained(txn);
    txn.stats.lock().handle_count = txn.handle_count.load(Ordering::SeqCst);
}

/// Atomic switchover: drop never-dirtied reservations and swap the
/// revocation epoch.
pub(crate) fn switchover(journal: &Journal, txn: &Arc<Transaction>) {
    txn.set_state(TxState::Switch);
    let reserved = std::mem::take(&mut txn.lists.lock().reserved);
    for buf in &reserved {
        buf.unfile();
    }
    txn.return_credits(reserved.len() as i64);
    journal.revoke_epoch.fetch_add(1, Ordering::SeqCst);
}

/// Move the transaction into its flush phase: it stops being the
/// running transaction (a successor may start), records where its log
/// writes will begin, and submits ordered data writeback.
pub(crate) fn start_flush(journal: &Journal, txn: &Arc<Transaction>) {
    txn.set_state(TxState::Flush);
    {
        let mut state = journal.state.write();
        debug_assert!(state.committing.is_none());
        txn.log_start.store(state.head, Ordering::SeqCst);
        state.committing = Some(Arc::clone(txn));
        state.running = None;
    }
    journal.notify_running_changed();
    {
        let now = Instant::now();
        let mut timing = txn.timing.lock();
        if let Some(locked) = timing.locked {
            txn.stats.lock().locked = now - locked;
        }
        timing.flushing = Some(now);
    }

    let (err, submitted) = data::submit_data_buffers(txn);
    if submitted {
        txn.need_data_flush.store(true, Ordering::SeqCst);
    }
    if let Some(e) = err {
        handle_data_error(journal, e);
    }
}

pub(crate) fn handle_data_error(journal: &Journal, err: io::Error) {
    if journal.config().abort_on_data_error {
        error!(error = %err, "data writeback failed, aborting journal");
        journal.abort(ERRNO_IO);
    }
}

/// Write every dirty buffer to the log as descriptor batches. On a log
/// write failure the journal aborts and the unwritten remainder moves
/// to the forget list for release.
pub(crate) fn write_log_blocks(journal: &Arc<Journal>, txn: &Arc<Transaction>) -> LogOutput {
    txn.set_state(TxState::Commit);
    {
        let now = Instant::now();
        let mut timing = txn.timing.lock();
        if let Some(flushing) = timing.flushing {
            txn.stats.lock().flushing = now - flushing;
        }
        timing.logging = Some(now);
    }

    let mut writer = LogWriter::new(journal, txn);
    loop {
        if journal.is_aborted() {
            break;
        }
        let Some(buf) = txn.lists.lock().buffers.first().cloned() else {
            break;
        };
        if let Err(e) = writer.add(&buf) {
            error!(tid = %txn.tid(), error = %e, "log write failed");
            journal.abort(ERRNO_IO);
            break;
        }
    }
    let output = writer.finish();

    // abort path: release the unwritten remainder through the forget
    // machinery
    if journal.is_aborted() {
        loop {
            let Some(buf) = txn.lists.lock().buffers.first().cloned() else {
                break;
            };
            txn.refile_buffer(&buf, BufferList::Buffers, BufferList::Forget);
        }
    }
    txn.stats.lock().blocks_logged = output.blocks_logged;
    output
}

/// Wait for the ordered data submitted at flush start, then migrate
/// inodes dirtied again mid-commit to the successor transaction.
pub(crate) fn finish_data_buffers(journal: &Journal, txn: &Arc<Transaction>) {
    if let Some(e) = data::wait_data_buffers(txn) {
        handle_data_error(journal, e);
    }
    let inodes = std::mem::take(&mut txn.lists.lock().inodes);
    for inode in inodes {
        if let Some(next) = inode.detach(txn.tid()) {
            let state = journal.state.read();
            match &state.running {
                Some(successor) if successor.tid() == next => {
                    successor.lists.lock().inodes.push(inode);
                }
                _ => debug_assert!(false, "inode handed to a transaction that is not running"),
            }
        }
    }
}

/// Build and submit the commit record. Under v1 the rolling crc rides in
/// it; under v2/v3 it carries a whole-block checksum.
pub(crate) fn write_commit_record(
    journal: &Journal,
    txn: &Transaction,
    crc: u32,
) -> Result<IoRequest> {
    let block_nr = journal.next_log_block()?;
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let mut record = CommitBlock {
        sequence: txn.tid(),
        chksum_type: 0,
        chksum_size: 0,
        checksum: 0,
        commit_sec: now.as_secs(),
        commit_nsec: now.subsec_nanos(),
    };
    if journal.features().checksum == ChecksumVersion::V1 {
        record.chksum_type = CHECKSUM_TYPE_CRC32;
        record.chksum_size = CHECKSUM_SIZE_CRC32;
        record.checksum = crc;
    }
    let mut block = vec![0u8; journal.config().block_size];
    record.encode_into(&mut block);
    if journal.features().checksum.is_v2_or_v3() {
        record.checksum = checksum::block_checksum(journal.csum_seed(), &block);
        record.encode_into(&mut block);
    }

    let flags = if journal.device().fifo_ordered() {
        WriteFlags::ordered()
    } else {
        WriteFlags::barrier()
    };
    Ok(journal.device().submit_write(block_nr, block, flags))
}

/// Wait out the frozen-data writes, newest first, moving each buffer
/// from shadow to forget. Returns the first I/O error.
pub(crate) fn wait_io_completion(txn: &Arc<Transaction>, output: &LogOutput) -> Option<io::Error> {
    let mut first_err = None;
    for (buf, request) in output.io.iter().rev() {
        if let Err(e) = request.wait_completed() {
            warn!(block = buf.blocknr(), error = %e, "log data write failed");
            if first_err.is_none() {
                first_err = Some(e);
            }
        }
        txn.refile_buffer(buf, BufferList::Shadow, BufferList::Forget);
    }
    for request in output.log.iter().rev() {
        if let Err(e) = request.wait_completed() {
            if first_err.is_none() {
                first_err = Some(e);
            }
        }
    }
    first_err
}

/// Checkpoint insertion, callbacks, and bookkeeping shared by the tail
/// of both commit paths.
pub(crate) fn finish_transaction(journal: &Arc<Journal>, txn: &Arc<Transaction>) {
    txn.set_state(TxState::CommitCallback);
    journal.run_fast_commit_cleanup(txn.tid());
    checkpoint::process_transaction(journal, txn);

    let now = Instant::now();
    {
        let timing = txn.timing.lock();
        let mut stats = txn.stats.lock();
        if let Some(logging) = timing.logging {
            stats.logging = now - logging;
        }
        if let Some(locked) = timing.locked {
            journal.record_commit_time((now - locked).as_nanos() as u64);
        }
    }
    journal.stats.lock().absorb(&txn.stats.lock());
    txn.set_state(TxState::Finished);
}

/// The classic commit path: write, wait, seal, checkpoint; durable when
/// it returns.
pub(crate) fn commit_transaction(journal: &Arc<Journal>) {
    let txn = { journal.state.read().running.clone() };
    let Some(txn) = txn else {
        // request for a transaction that no longer exists: confirm it
        let mut waits = journal.waits.lock();
        waits.commit_sequence = waits.commit_request;
        journal.done_commit.notify_all();
        return;
    };
    let tid = txn.tid();
    debug!(%tid, "commit starting");

    lock_down(journal, &txn);
    switchover(journal, &txn);
    start_flush(journal, &txn);
    if let Err(e) = journal.ensure_log_marked_dirty() {
        error!(%tid, error = %e, "superblock update failed");
        journal.abort(ERRNO_IO);
    }
    let output = write_log_blocks(journal, &txn);
    finish_data_buffers(journal, &txn);

    txn.set_state(TxState::CommitDflush);
    if txn.need_data_flush.load(Ordering::SeqCst) && journal.config().barrier {
        if let Some(dev) = journal.data_device() {
            if let Err(e) = dev.flush() {
                handle_data_error(journal, e);
            }
        }
    }

    // async commit: the record races the data blocks; its checksum makes
    // that safe for replay
    let mut record = None;
    if journal.features().async_commit && !journal.is_aborted() {
        match write_commit_record(journal, &txn, output.crc) {
            Ok(r) => record = Some(r),
            Err(e) => {
                error!(%tid, error = %e, "commit record submission failed");
                journal.abort(ERRNO_IO);
            }
        }
    }

    if wait_io_completion(&txn, &output).is_some() {
        journal.abort(ERRNO_IO);
    }

    txn.set_state(TxState::CommitJflush);
    if record.is_none() && !journal.is_aborted() {
        match write_commit_record(journal, &txn, output.crc) {
            Ok(r) => record = Some(r),
            Err(e) => {
                error!(%tid, error = %e, "commit record submission failed");
                journal.abort(ERRNO_IO);
            }
        }
    }
    if let Some(record) = &record {
        if let Err(e) = record.wait_completed() {
            error!(%tid, error = %e, "commit record write failed");
            journal.abort(ERRNO_IO);
        }
    }
    if journal.config().barrier && !journal.is_aborted() {
        if let Err(e) = journal.device().flush() {
            error!(%tid, error = %e, "journal device flush failed");
            journal.abort(ERRNO_IO);
        }
    }

    if !journal.is_aborted() {
        if let Some((first_tid, block, _)) = journal.tail_advance_candidate() {
            if let Err(e) = journal.update_log_tail(first_tid, block) {
                warn!(error = %e, "log tail update failed");
            }
        }
    }

    finish_transaction(journal, &txn);
    journal.run_commit_callback(tid);
    {
        let mut state = journal.state.write();
        state.committing = None;
    }
    journal.advance_commit_sequence(tid);
    debug!(%tid, "commit finished");
}
