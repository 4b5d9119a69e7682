//! The journal instance
//!
//! Owns the circular log region, the running/committing transaction
//! slots, the background workers, and the sequence numbers durability
//! waiters sleep on. The commit state machine itself lives in
//! [`commit`] and [`pipeline`]; this module provides the shared state
//! they drive.
//!
//! Three sequence numbers order the outside world's waits:
//! - `commit_sequence`: the newest transaction whose commit (classic) or
//!   dispatch (pipelined) has finished;
//! - `transfer_sequence`: pipelined only, newest transaction whose log
//!   writes have all completed;
//! - `flush_sequence`: newest transaction covered by a device cache
//!   flush, i.e. actually durable.
//!
//! [`commit`]: crate::commit
//! [`pipeline`]: crate::pipeline

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use ringjournal_core::checksum;
use ringjournal_core::layout::Superblock;
use ringjournal_core::{
    BlockNr, JournalConfig, JournalError, JournalFeatures, LogBlock, Result, Tid,
};
use ringjournal_device::{BlockDevice, WriteFlags};

use crate::buffer::JournalBuffer;
use crate::stats::JournalStats;
use crate::transaction::{Handle, Transaction, TxState};
use crate::{checkpoint, commit, pipeline};

type CommitCallback = Box<dyn Fn(Tid, bool) + Send + Sync>;
type TidCallback = Box<dyn Fn(Tid) + Send + Sync>;

pub(crate) struct JournalState {
    /// Transaction currently accepting handles.
    pub running: Option<Arc<Transaction>>,
    /// Transaction in its commit (or dispatch) phase.
    pub committing: Option<Arc<Transaction>>,
    /// Next transaction id to hand out.
    pub sequence: Tid,
    /// Next log block to allocate.
    pub head: LogBlock,
    /// Free blocks in the log.
    pub free: u64,
    /// Oldest log block still needed, mirrored in the superblock.
    pub tail_block: LogBlock,
    /// Sequence of the oldest transaction still expected in the log.
    pub tail_sequence: Tid,
    /// The on-disk superblock says `start == 0` (log empty). The first
    /// commit must rewrite it before any log block lands, or a crash
    /// would make replay skip the log entirely.
    pub sb_empty: bool,
    /// Sticky error recorded at abort.
    pub errno: i32,
}

pub(crate) struct WaitState {
    pub commit_request: Tid,
    pub commit_sequence: Tid,
    pub transfer_sequence: Tid,
    pub flush_sequence: Tid,
    pub aborted: bool,
    /// Bumped whenever the running slot changes; handle starters use it
    /// to sleep without losing wakeups.
    pub running_generation: u64,
}

#[derive(Default)]
pub(crate) struct JournalLists {
    /// Transactions whose buffers still await home writeback, oldest
    /// first.
    pub checkpoint: VecDeque<Arc<Transaction>>,
    /// Dispatched transactions queued for the flush stage, FIFO.
    pub flushing: VecDeque<Arc<Transaction>>,
}

/// A write-ahead block journal.
pub struct Journal {
    config: JournalConfig,
    device: Arc<dyn BlockDevice>,
    data_device: Option<Arc<dyn BlockDevice>>,
    uuid: [u8; 16],
    csum_seed: u32,
    pub(crate) state: RwLock<JournalState>,
    pub(crate) lists: Mutex<JournalLists>,
    pub(crate) waits: Mutex<WaitState>,
    /// Wakes the commit worker.
    pub(crate) wake_commit: Condvar,
    /// Broadcast when any of the three sequences advances or the journal
    /// aborts. Paired with `waits`.
    pub(crate) done_commit: Condvar,
    /// Broadcast when the running slot changes. Paired with `waits`.
    pub(crate) txn_unlocked: Condvar,
    /// Broadcast when a transaction's handle count drains to zero.
    /// Paired with `waits`.
    pub(crate) updates_drained: Condvar,
    /// Broadcast when buffer versions retire and conflict counters drop.
    /// Paired with `waits`.
    pub(crate) conflicts_cleared: Condvar,
    /// Wakes the flush worker. Paired with `lists`.
    pub(crate) flush_queue_cond: Condvar,
    /// Serializes tail advances and their superblock writes.
    checkpoint_mutex: Mutex<()>,
    shutdown: AtomicBool,
    pub(crate) stats: Mutex<JournalStats>,
    average_commit_time_ns: AtomicU64,
    /// Epoch counter swapped at every commit switchover; revocation
    /// tables hang off this.
    pub(crate) revoke_epoch: AtomicU64,
    commit_callback: Mutex<Option<CommitCallback>>,
    flush_callback: Mutex<Option<TidCallback>>,
    fast_commit_cleanup: Mutex<Option<TidCallback>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Journal {
    /// Create a fresh journal on `device` and start its workers. The
    /// superblock is written at `first_block - 1` and the circular log
    /// occupies `[first_block, last_block)`.
    pub fn create(device: Arc<dyn BlockDevice>, config: JournalConfig) -> Result<Arc<Journal>> {
        Journal::build(device, None, config)
    }

    /// As [`Journal::create`], with a separate filesystem device whose
    /// cache must be flushed before commit records when ordered data was
    /// written.
    pub fn with_data_device(
        device: Arc<dyn BlockDevice>,
        data_device: Arc<dyn BlockDevice>,
        config: JournalConfig,
    ) -> Result<Arc<Journal>> {
        Journal::build(device, Some(data_device), config)
    }

    fn build(
        device: Arc<dyn BlockDevice>,
        data_device: Option<Arc<dyn BlockDevice>>,
        config: JournalConfig,
    ) -> Result<Arc<Journal>> {
        if config.block_size != device.block_size() {
            return Err(JournalError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "journal block size does not match the device",
            )));
        }
        if config.first_block < 1 || config.last_block <= config.first_block + 4 {
            return Err(JournalError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "journal region too small",
            )));
        }
        if config.max_buffer_versions < 1 || config.compound_flush_interval < 1 {
            return Err(JournalError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "invalid journal tunables",
            )));
        }

        let uuid = *Uuid::new_v4().as_bytes();
        let journal = Arc::new(Journal {
            csum_seed: checksum::seed_from_uuid(&uuid),
            uuid,
            state: RwLock::new(JournalState {
                running: None,
                committing: None,
                sequence: Tid(1),
                head: config.first_block,
                free: config.log_len(),
                tail_block: config.first_block,
                tail_sequence: Tid(1),
                sb_empty: true,
                errno: 0,
            }),
            lists: Mutex::new(JournalLists::default()),
            waits: Mutex::new(WaitState {
                commit_request: Tid(0),
                commit_sequence: Tid(0),
                transfer_sequence: Tid(0),
                flush_sequence: Tid(0),
                aborted: false,
                running_generation: 0,
            }),
            wake_commit: Condvar::new(),
            done_commit: Condvar::new(),
            txn_unlocked: Condvar::new(),
            updates_drained: Condvar::new(),
            conflicts_cleared: Condvar::new(),
            flush_queue_cond: Condvar::new(),
            checkpoint_mutex: Mutex::new(()),
            shutdown: AtomicBool::new(false),
            stats: Mutex::new(JournalStats::default()),
            average_commit_time_ns: AtomicU64::new(0),
            revoke_epoch: AtomicU64::new(0),
            commit_callback: Mutex::new(None),
            flush_callback: Mutex::new(None),
            fast_commit_cleanup: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            device,
            data_device,
            config,
        });

        journal.write_superblock(0, Tid(1), 0)?;

        let mut workers = journal.workers.lock();
        let j = Arc::clone(&journal);
        workers.push(
            thread::Builder::new()
                .name("ringjournal-commit".into())
                .spawn(move || commit_worker(j))
                .map_err(JournalError::Io)?,
        );
        if journal.config.pipelined {
            let j = Arc::clone(&journal);
            workers.push(
                thread::Builder::new()
                    .name("ringjournal-flush".into())
                    .spawn(move || flush_worker(j))
                    .map_err(JournalError::Io)?,
            );
        }
        drop(workers);

        info!(
            first = journal.config.first_block,
            last = journal.config.last_block,
            pipelined = journal.config.pipelined,
            "journal created"
        );
        Ok(journal)
    }

    pub fn config(&self) -> &JournalConfig {
        &self.config
    }

    pub(crate) fn features(&self) -> &JournalFeatures {
        &self.config.features
    }

    pub(crate) fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    pub(crate) fn data_device(&self) -> Option<&Arc<dyn BlockDevice>> {
        self.data_device.as_ref()
    }

    pub(crate) fn csum_seed(&self) -> u32 {
        self.csum_seed
    }

    pub(crate) fn uuid(&self) -> &[u8; 16] {
        &self.uuid
    }

    /// Wrap a metadata block for journaling, sized to this journal's
    /// version bound.
    pub fn journal_buffer(&self, blocknr: BlockNr, data: Vec<u8>) -> Arc<JournalBuffer> {
        JournalBuffer::new(blocknr, data, self.config.max_buffer_versions)
    }

    /// Largest credit reservation a single handle may make: a quarter of
    /// the log, so no transaction can starve its own commit of space.
    pub fn max_handle_credits(&self) -> u64 {
        (self.config.log_len() / 4).max(1)
    }

    /// Join the running transaction (starting one if needed), reserving
    /// `credits` log blocks.
    pub fn start_handle(self: &Arc<Self>, credits: u64) -> Result<Handle> {
        if credits == 0 || credits > self.max_handle_credits() {
            return Err(JournalError::LogFull {
                requested: credits,
                free: self.max_handle_credits(),
            });
        }
        let mut reclaimed = false;
        loop {
            self.check_aborted()?;
            if self.shutdown.load(Ordering::SeqCst) {
                return Err(JournalError::ReadOnly);
            }

            let gen = self.waits.lock().running_generation;
            let mut blocked = false;
            {
                let mut state = self.state.write();
                // credits already reserved by the running transaction
                // occupy log space just as surely as this request, and a
                // committing transaction's reservation has not been
                // charged against `free` yet
                let reserved = |txn: &Arc<Transaction>| {
                    txn.outstanding_credits.load(Ordering::SeqCst).max(0) as u64
                };
                let outstanding = state.running.as_ref().map(&reserved).unwrap_or(0);
                let committing = state.committing.as_ref().map(&reserved).unwrap_or(0);
                let needed = credits + outstanding;
                // one descriptor per full tag batch, plus the commit record
                let overhead = 2 + needed / 16;
                if state.free < needed + overhead + committing {
                    if outstanding > 0 {
                        // commit the running transaction to recycle its
                        // reservation, then retry admission
                        let tid = state.running.as_ref().map(|txn| txn.tid());
                        drop(state);
                        if let Some(tid) = tid {
                            self.request_commit(tid);
                        }
                        blocked = true;
                    } else if reclaimed {
                        return Err(JournalError::LogFull {
                            requested: needed + overhead + committing,
                            free: state.free,
                        });
                    }
                } else {
                    match &state.running {
                        Some(txn) if txn.state() == TxState::Running => {
                            let txn = Arc::clone(txn);
                            drop(state);
                            let handle = Handle::new(Arc::clone(self), txn, credits);
                            self.maybe_request_commit(&handle);
                            return Ok(handle);
                        }
                        Some(_) => blocked = true,
                        None => {
                            let tid = state.sequence;
                            state.sequence = tid.next();
                            let txn = Transaction::new(tid);
                            state.running = Some(Arc::clone(&txn));
                            drop(state);
                            debug!(%tid, "transaction started");
                            return Ok(Handle::new(Arc::clone(self), txn, credits));
                        }
                    }
                }
            }

            if blocked {
                // the running transaction is locking down or committing
                // out from under us; sleep until the slot changes
                let mut waits = self.waits.lock();
                while waits.running_generation == gen && !waits.aborted {
                    self.txn_unlocked.wait(&mut waits);
                }
            } else {
                // out of log space: reclaim what checkpointing allows, once
                reclaimed = true;
                self.reclaim_space()?;
            }
        }
    }

    /// Request a commit when the running transaction has grown past the
    /// per-transaction credit budget.
    fn maybe_request_commit(&self, handle: &Handle) {
        let oversized = {
            let state = self.state.read();
            state.running.as_ref().is_some_and(|txn| {
                txn.tid() == handle.tid()
                    && txn.outstanding_credits.load(Ordering::SeqCst)
                        > self.max_handle_credits() as i64
            })
        };
        if oversized {
            self.request_commit(handle.tid());
        }
    }

    /// Ask for the running transaction to commit. Returns its tid, or
    /// `None` when there is nothing to commit.
    pub fn start_commit(&self) -> Option<Tid> {
        let state = self.state.read();
        let txn = state.running.as_ref()?;
        let tid = txn.tid();
        {
            let mut timing = txn.timing.lock();
            if timing.requested.is_none() {
                timing.requested = Some(Instant::now());
            }
        }
        drop(state);
        self.request_commit(tid);
        Some(tid)
    }

    pub(crate) fn request_commit(&self, tid: Tid) {
        let mut waits = self.waits.lock();
        if tid.after(waits.commit_request) {
            waits.commit_request = tid;
            self.wake_commit.notify_all();
        }
    }

    /// Block until transaction `tid` is durable: committed in classic
    /// mode, flushed in pipelined mode.
    pub fn wait_commit(&self, tid: Tid) -> Result<()> {
        let mut waits = self.waits.lock();
        loop {
            // aborted wins even when the sequence advanced past tid
            if waits.aborted {
                return Err(JournalError::Aborted);
            }
            let covered = if self.config.pipelined {
                waits.flush_sequence.at_or_after(tid)
            } else {
                waits.commit_sequence.at_or_after(tid)
            };
            if covered {
                return Ok(());
            }
            self.done_commit.wait(&mut waits);
        }
    }

    /// Block until transaction `tid` has finished its dispatch stage
    /// (its log writes are all submitted). In classic mode this is the
    /// same as [`Journal::wait_commit`].
    pub fn wait_dispatch(&self, tid: Tid) -> Result<()> {
        let mut waits = self.waits.lock();
        loop {
            if waits.aborted {
                return Err(JournalError::Aborted);
            }
            if waits.commit_sequence.at_or_after(tid) {
                return Ok(());
            }
            self.done_commit.wait(&mut waits);
        }
    }

    /// Commit the running transaction and wait for durability.
    pub fn commit_and_wait(&self) -> Result<Option<Tid>> {
        match self.start_commit() {
            Some(tid) => {
                self.wait_commit(tid)?;
                Ok(Some(tid))
            }
            None => Ok(None),
        }
    }

    /// Commit the running transaction and wait only for its dispatch
    /// stage: the log writes are on the wire but not necessarily
    /// durable. The asynchronous counterpart of
    /// [`Journal::commit_and_wait`]; confirm durability later with
    /// [`Journal::wait_commit`].
    pub fn dispatch_commit(&self) -> Result<Option<Tid>> {
        match self.start_commit() {
            Some(tid) => {
                self.wait_dispatch(tid)?;
                Ok(Some(tid))
            }
            None => Ok(None),
        }
    }

    /// Kill the journal: every subsequent operation fails with
    /// [`JournalError::Aborted`]. The error number is recorded in the
    /// superblock for the next mount, best effort.
    pub fn abort(&self, errno: i32) {
        {
            let mut waits = self.waits.lock();
            if waits.aborted {
                return;
            }
            waits.aborted = true;
            self.done_commit.notify_all();
            self.txn_unlocked.notify_all();
            self.updates_drained.notify_all();
            self.conflicts_cleared.notify_all();
            self.wake_commit.notify_all();
        }
        let (tail_block, tail_sequence) = {
            let mut state = self.state.write();
            state.errno = errno;
            (state.tail_block, state.tail_sequence)
        };
        tracing::error!(errno, "journal aborted");
        let _ = self.write_superblock(tail_block, tail_sequence, errno);
    }

    pub fn is_aborted(&self) -> bool {
        self.waits.lock().aborted
    }

    pub(crate) fn check_aborted(&self) -> Result<()> {
        if self.is_aborted() {
            return Err(JournalError::Aborted);
        }
        Ok(())
    }

    /// Commit callback, invoked with the tid and the journal's aborted
    /// flag once a transaction's commit (classic) or dispatch
    /// (pipelined) stage finishes.
    pub fn set_commit_callback(&self, cb: CommitCallback) {
        *self.commit_callback.lock() = Some(cb);
    }

    /// Flush callback, pipelined mode: invoked once a transaction's
    /// flush stage finishes.
    pub fn set_flush_callback(&self, cb: TidCallback) {
        *self.flush_callback.lock() = Some(cb);
    }

    /// Cleanup hook for clients keeping per-transaction side state,
    /// invoked during the callback phase before the transaction
    /// finishes.
    pub fn set_fast_commit_cleanup(&self, cb: TidCallback) {
        *self.fast_commit_cleanup.lock() = Some(cb);
    }

    pub(crate) fn run_commit_callback(&self, tid: Tid) {
        if let Some(cb) = self.commit_callback.lock().as_ref() {
            cb(tid, self.is_aborted());
        }
    }

    pub(crate) fn run_flush_callback(&self, tid: Tid) {
        if let Some(cb) = self.flush_callback.lock().as_ref() {
            cb(tid);
        }
    }

    pub(crate) fn run_fast_commit_cleanup(&self, tid: Tid) {
        if let Some(cb) = self.fast_commit_cleanup.lock().as_ref() {
            cb(tid);
        }
    }

    /// Journal-wide commit statistics.
    pub fn stats(&self) -> JournalStats {
        let mut stats = *self.stats.lock();
        stats.average_commit_time_ns = self.average_commit_time_ns.load(Ordering::SeqCst);
        stats
    }

    pub(crate) fn record_commit_time(&self, ns: u64) {
        let avg = self.average_commit_time_ns.load(Ordering::SeqCst);
        self.average_commit_time_ns
            .store(crate::stats::weighted_commit_time(ns, avg), Ordering::SeqCst);
    }

    /// The client finished writing `buf` back to its home location; the
    /// checkpoint machinery may now forget it.
    pub fn buffer_written_back(&self, buf: &Arc<JournalBuffer>) {
        buf.set_journal_dirty(false);
    }

    /// Buffers whose home writeback the journal is still waiting on,
    /// oldest transaction first. The client writes these back and calls
    /// [`Journal::buffer_written_back`] for each.
    pub fn checkpoint_targets(&self) -> Vec<Arc<JournalBuffer>> {
        checkpoint::checkpoint_targets(self)
    }

    /// Drop written-back buffers from the checkpoint lists and advance
    /// the on-disk tail when enough of the log is reclaimable. Returns
    /// the number of blocks freed.
    pub fn reclaim_space(&self) -> Result<u64> {
        checkpoint::clean_checkpoint_list(self);
        self.maybe_advance_tail()
    }

    /// Blocks free in the circular log.
    pub fn free_blocks(&self) -> u64 {
        self.state.read().free
    }

    /// Stop the workers and mark the log clean. The journal is read-only
    /// afterwards.
    pub fn shutdown(&self) -> Result<()> {
        let _ = self.commit_and_wait();

        // drain the flush pipeline
        if self.config.pipelined && !self.is_aborted() {
            let mut waits = self.waits.lock();
            while waits.flush_sequence != waits.commit_sequence && !waits.aborted {
                self.done_commit.wait(&mut waits);
            }
        }

        self.shutdown.store(true, Ordering::SeqCst);
        {
            let _waits = self.waits.lock();
            self.wake_commit.notify_all();
        }
        {
            let _lists = self.lists.lock();
            self.flush_queue_cond.notify_all();
        }
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.join();
        }

        if !self.is_aborted() {
            checkpoint::clean_checkpoint_list(self);
            self.maybe_advance_tail()?;
        }
        info!("journal shut down");
        Ok(())
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Allocate the next block of the circular log.
    pub(crate) fn next_log_block(&self) -> Result<LogBlock> {
        let mut state = self.state.write();
        if state.free == 0 {
            return Err(JournalError::LogFull {
                requested: 1,
                free: 0,
            });
        }
        state.free -= 1;
        let block = state.head;
        state.head += 1;
        if state.head == self.config.last_block {
            state.head = self.config.first_block;
        }
        Ok(block)
    }

    /// Oldest transaction still needing its log blocks: `(tid, first log
    /// block)`. `None` when the log is logically empty.
    pub(crate) fn log_tail_candidate(&self) -> Option<(Tid, LogBlock)> {
        let lists = self.lists.lock();
        if let Some(txn) = lists.checkpoint.front() {
            return Some((txn.tid(), txn.log_start.load(Ordering::SeqCst)));
        }
        if let Some(txn) = lists.flushing.front() {
            return Some((txn.tid(), txn.log_start.load(Ordering::SeqCst)));
        }
        drop(lists);
        let state = self.state.read();
        if let Some(txn) = &state.committing {
            return Some((txn.tid(), txn.log_start.load(Ordering::SeqCst)));
        }
        state
            .running
            .as_ref()
            .map(|txn| (txn.tid(), state.head))
    }

    /// Distance from the current tail to `block`, going forward around
    /// the ring.
    pub(crate) fn blocks_to_free(&self, block: LogBlock) -> u64 {
        let state = self.state.read();
        let len = self.config.log_len();
        (block + len - state.tail_block) % len
    }

    /// Pending tail advance for a finishing transaction, or `None` when
    /// the tail already points at it or too little would be freed.
    pub(crate) fn tail_advance_candidate(&self) -> Option<(Tid, LogBlock, u64)> {
        let (tid, block) = self.log_tail_candidate()?;
        let state = self.state.read();
        if state.tail_sequence == tid {
            return None;
        }
        drop(state);
        let freed = self.blocks_to_free(block);
        if freed < self.config.min_reclaim_blocks {
            return None;
        }
        Some((tid, block, freed))
    }

    /// Advance the on-disk tail to `(tid, block)`, then account the
    /// freed blocks. The superblock write must be durable before the
    /// in-memory tail moves, or a crash could replay into reused
    /// blocks. A candidate computed before the tail last moved is
    /// stale and ignored; the tail only goes forward.
    pub(crate) fn update_log_tail(&self, tid: Tid, block: LogBlock) -> Result<u64> {
        let _guard = self.checkpoint_mutex.lock();
        if !tid.after(self.state.read().tail_sequence) {
            return Ok(0);
        }
        let freed = self.blocks_to_free(block);
        self.write_superblock(block, tid, 0)?;
        let mut state = self.state.write();
        state.tail_block = block;
        state.tail_sequence = tid;
        state.sb_empty = false;
        state.free += freed;
        debug!(%tid, block, freed, "log tail advanced");
        Ok(freed)
    }

    fn maybe_advance_tail(&self) -> Result<u64> {
        match self.log_tail_candidate() {
            Some((tid, block)) => {
                let skip = {
                    let state = self.state.read();
                    state.tail_sequence == tid
                };
                if skip {
                    return Ok(0);
                }
                let freed = self.blocks_to_free(block);
                if freed < self.config.min_reclaim_blocks {
                    return Ok(0);
                }
                self.update_log_tail(tid, block)
            }
            None => {
                // log is empty: fold the whole ring back into the free pool
                let _guard = self.checkpoint_mutex.lock();
                let (head, sequence, already_clean) = {
                    let state = self.state.read();
                    (state.head, state.sequence, state.free == self.config.log_len())
                };
                if already_clean {
                    return Ok(0);
                }
                self.write_superblock(0, sequence, 0)?;
                let mut state = self.state.write();
                state.tail_block = head;
                state.tail_sequence = sequence;
                state.sb_empty = true;
                let freed = self.config.log_len() - state.free;
                state.free = self.config.log_len();
                Ok(freed)
            }
        }
    }

    /// Make the on-disk superblock point at the live tail before the
    /// first log block of a commit lands. No-op once the log is marked
    /// non-empty.
    pub(crate) fn ensure_log_marked_dirty(&self) -> Result<()> {
        let (needed, tail_block, tail_sequence) = {
            let state = self.state.read();
            (state.sb_empty, state.tail_block, state.tail_sequence)
        };
        if !needed {
            return Ok(());
        }
        self.write_superblock(tail_block, tail_sequence, 0)?;
        self.state.write().sb_empty = false;
        Ok(())
    }

    /// Write the superblock below the log region. `start == 0` marks the
    /// log empty.
    pub(crate) fn write_superblock(&self, start: LogBlock, sequence: Tid, errno: i32) -> Result<()> {
        let mut sb = Superblock {
            block_size: self.config.block_size as u32,
            max_len: self.config.last_block as u32,
            first: self.config.first_block as u32,
            sequence,
            start: start as u32,
            errno,
            uuid: self.uuid,
            checksum: 0,
        };
        let mut block = vec![0u8; self.config.block_size];
        sb.encode_into(&mut block);
        if self.features().checksum.is_v2_or_v3() {
            sb.checksum = checksum::block_checksum(self.csum_seed, &block);
            sb.encode_into(&mut block);
        }
        let request =
            self.device
                .submit_write(self.config.first_block - 1, block, WriteFlags::sync());
        request.wait_completed()?;
        if self.config.barrier {
            self.device.flush()?;
        }
        Ok(())
    }

    /// Wake anyone waiting for the running slot to change.
    pub(crate) fn notify_running_changed(&self) {
        let mut waits = self.waits.lock();
        waits.running_generation += 1;
        self.txn_unlocked.notify_all();
    }

    pub(crate) fn note_updates_drained(&self) {
        let _waits = self.waits.lock();
        self.updates_drained.notify_all();
    }

    pub(crate) fn note_conflicts_released(&self) {
        let _waits = self.waits.lock();
        self.conflicts_cleared.notify_all();
    }

    pub(crate) fn advance_commit_sequence(&self, tid: Tid) {
        let mut waits = self.waits.lock();
        waits.commit_sequence = tid;
        if !self.config.pipelined {
            // classic commit is durable when it finishes
            waits.transfer_sequence = tid;
            waits.flush_sequence = tid;
        }
        self.done_commit.notify_all();
    }

    pub(crate) fn advance_transfer_sequence(&self, tid: Tid) {
        let mut waits = self.waits.lock();
        waits.transfer_sequence = tid;
        self.done_commit.notify_all();
    }

    pub(crate) fn advance_flush_sequence(&self, tid: Tid) {
        let mut waits = self.waits.lock();
        waits.flush_sequence = tid;
        self.done_commit.notify_all();
    }

    /// Wait until every older in-flight version of this transaction's
    /// buffers has retired.
    pub(crate) fn wait_conflicts_cleared(&self, txn: &Transaction) {
        loop {
            if txn.conflict_count.load(Ordering::SeqCst) == 0 {
                return;
            }
            let mut waits = self.waits.lock();
            if txn.conflict_count.load(Ordering::SeqCst) == 0 || waits.aborted {
                return;
            }
            self.conflicts_cleared.wait(&mut waits);
        }
    }

    /// Wait until every handle attached to `txn` has finished.
    pub(crate) fn wait_updates_drained(&self, txn: &Transaction) {
        loop {
            if txn.updates.load(Ordering::SeqCst) == 0 {
                return;
            }
            let mut waits = self.waits.lock();
            if txn.updates.load(Ordering::SeqCst) == 0 {
                return;
            }
            self.updates_drained.wait(&mut waits);
        }
    }
}

fn commit_worker(journal: Arc<Journal>) {
    loop {
        {
            let mut waits = journal.waits.lock();
            while !waits.commit_request.after(waits.commit_sequence) {
                if journal.is_shutdown() {
                    return;
                }
                journal.wake_commit.wait(&mut waits);
            }
        }
        if journal.config.pipelined {
            pipeline::dispatch_transaction(&journal);
        } else {
            commit::commit_transaction(&journal);
        }
    }
}

fn flush_worker(journal: Arc<Journal>) {
    loop {
        let txn = {
            let mut lists = journal.lists.lock();
            loop {
                if let Some(txn) = lists.flushing.front().cloned() {
                    break txn;
                }
                if journal.is_shutdown() {
                    return;
                }
                journal.flush_queue_cond.wait(&mut lists);
            }
        };
        pipeline::flush_transaction(&journal, &txn);
    }
}
