//! In-memory block device for tests
//!
//! Captures the exact submission order of writes, counts cache flushes,
//! injects write failures, and can defer completions so a test can hold
//! a transaction in its flush stage while another dispatches. The
//! "durable image" is snapshotted at each flush, which is what a
//! simulated crash leaves behind.

use std::collections::{HashMap, VecDeque};
use std::io;

use parking_lot::Mutex;
use tracing::trace;

use ringjournal_core::BlockNr;

use crate::request::IoRequest;
use crate::{BlockDevice, WriteFlags};

/// One captured write, in submission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    /// 1-based submission sequence number.
    pub seq: usize,
    /// Target block.
    pub block: BlockNr,
    /// Flags the engine attached.
    pub flags: WriteFlags,
}

struct PendingWrite {
    block: BlockNr,
    data: Vec<u8>,
    request: IoRequest,
    fail: bool,
}

#[derive(Default)]
struct MemState {
    blocks: HashMap<BlockNr, Vec<u8>>,
    durable: HashMap<BlockNr, Vec<u8>>,
    log: Vec<WriteRecord>,
    pending: VecDeque<PendingWrite>,
    submitted: usize,
    flushes: usize,
    fail_nth: Option<usize>,
    fail_blocks: Vec<BlockNr>,
}

/// In-memory [`BlockDevice`] with fault injection.
pub struct MemBlockDevice {
    block_size: usize,
    fifo: bool,
    deferred: bool,
    state: Mutex<MemState>,
}

impl MemBlockDevice {
    /// Device that completes writes at submission time.
    pub fn new(block_size: usize) -> Self {
        MemBlockDevice {
            block_size,
            fifo: true,
            deferred: false,
            state: Mutex::new(MemState::default()),
        }
    }

    /// Device that holds ordered and barrier write completions until the
    /// test releases them with [`complete_next`] / [`complete_all`].
    /// Plain synchronous writes (the superblock) still complete at
    /// submission.
    ///
    /// [`complete_next`]: MemBlockDevice::complete_next
    /// [`complete_all`]: MemBlockDevice::complete_all
    pub fn with_deferred_completion(block_size: usize) -> Self {
        MemBlockDevice {
            deferred: true,
            ..MemBlockDevice::new(block_size)
        }
    }

    /// Report the transport as not order-preserving, so the engine tags
    /// final commit-batch blocks with a barrier fence.
    pub fn without_fifo_ordering(mut self) -> Self {
        self.fifo = false;
        self
    }

    /// Fail the nth submitted write (1-based).
    pub fn fail_nth_write(&self, n: usize) {
        self.state.lock().fail_nth = Some(n);
    }

    /// Fail every write targeting `block`.
    pub fn fail_block(&self, block: BlockNr) {
        self.state.lock().fail_blocks.push(block);
    }

    /// Complete the oldest held write. Returns false when none are held.
    pub fn complete_next(&self) -> bool {
        let pending = self.state.lock().pending.pop_front();
        match pending {
            Some(write) => {
                self.apply(write);
                true
            }
            None => false,
        }
    }

    /// Complete every held write, oldest first.
    pub fn complete_all(&self) {
        while self.complete_next() {}
    }

    /// Writes currently held back.
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// All writes in submission order.
    pub fn write_log(&self) -> Vec<WriteRecord> {
        self.state.lock().log.clone()
    }

    /// Number of cache flushes issued.
    pub fn flush_count(&self) -> usize {
        self.state.lock().flushes
    }

    /// Contents as of the last cache flush: what a crash would leave.
    pub fn durable_image(&self) -> HashMap<BlockNr, Vec<u8>> {
        self.state.lock().durable.clone()
    }

    /// Contents including completed-but-unflushed writes.
    pub fn current_image(&self) -> HashMap<BlockNr, Vec<u8>> {
        self.state.lock().blocks.clone()
    }

    /// Overwrite a byte of a completed block in place, bypassing the
    /// write path. For checksum corruption tests.
    pub fn corrupt_byte(&self, block: BlockNr, offset: usize) {
        let mut state = self.state.lock();
        if let Some(data) = state.blocks.get_mut(&block) {
            data[offset] ^= 0xff;
        }
        if let Some(data) = state.durable.get_mut(&block) {
            data[offset] ^= 0xff;
        }
    }

    fn apply(&self, write: PendingWrite) {
        if write.fail {
            trace!(block = write.block, "injected write failure");
            write.request.complete(Err(io::Error::new(
                io::ErrorKind::Other,
                format!("injected failure at block {}", write.block),
            )));
            return;
        }
        self.state.lock().blocks.insert(write.block, write.data);
        write.request.complete(Ok(()));
    }
}

impl BlockDevice for MemBlockDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn submit_write(&self, block: BlockNr, data: Vec<u8>, flags: WriteFlags) -> IoRequest {
        debug_assert_eq!(data.len(), self.block_size);
        let request = IoRequest::new();
        let fail;
        {
            let mut state = self.state.lock();
            state.submitted += 1;
            let seq = state.submitted;
            fail = state.fail_nth == Some(seq) || state.fail_blocks.contains(&block);
            state.log.push(WriteRecord { seq, block, flags });
            if self.deferred && (flags.ordered || flags.barrier) {
                state.pending.push_back(PendingWrite {
                    block,
                    data,
                    request: request.clone(),
                    fail,
                });
                request.mark_dispatched();
                return request;
            }
        }
        request.mark_dispatched();
        self.apply(PendingWrite {
            block,
            data,
            request: request.clone(),
            fail,
        });
        request
    }

    fn flush(&self) -> io::Result<()> {
        let mut state = self.state.lock();
        state.flushes += 1;
        state.durable = state.blocks.clone();
        Ok(())
    }

    fn read_block(&self, block: BlockNr) -> io::Result<Vec<u8>> {
        let state = self.state.lock();
        Ok(state
            .blocks
            .get(&block)
            .cloned()
            .unwrap_or_else(|| vec![0u8; self.block_size]))
    }

    fn fifo_ordered(&self) -> bool {
        self.fifo
    }
}
