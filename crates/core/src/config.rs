//! Journal configuration
//!
//! Everything tunable about a journal instance lives here. The engine
//! treats the config as immutable after open.

use crate::features::JournalFeatures;
use serde::{Deserialize, Serialize};

/// Configuration for a journal instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalConfig {
    /// Block size in bytes for both the journal and the filesystem it
    /// protects.
    pub block_size: usize,
    /// First usable block of the circular log region (the superblock sits
    /// below this).
    pub first_block: u64,
    /// One past the last usable block of the log region.
    pub last_block: u64,
    /// Maximum metadata buffers per descriptor batch (one descriptor block
    /// plus up to this many data blocks are submitted as one I/O burst).
    pub max_transaction_buffers: usize,
    /// Issue device cache flushes at commit boundaries.
    pub barrier: bool,
    /// Escalate data-writeback errors to a journal abort instead of only
    /// reporting them to the waiter.
    pub abort_on_data_error: bool,
    /// Run the two-stage pipelined commit path (dispatch + flush workers)
    /// instead of the classic flush-and-wait path.
    pub pipelined: bool,
    /// In pipelined mode, issue the device flush only every Nth
    /// transaction (a flush is always issued when the flush queue drains).
    /// 1 means flush every transaction.
    pub compound_flush_interval: u32,
    /// Maximum concurrent in-flight versions of a single buffer. Slots are
    /// indexed by `tid % max_buffer_versions`; exceeding this bound is a
    /// hard error, never a silent overwrite.
    pub max_buffer_versions: usize,
    /// Minimum number of freed blocks before the on-disk tail is advanced;
    /// below this the superblock rewrite is not worth it.
    pub min_reclaim_blocks: u64,
    /// On-disk compatibility features.
    pub features: JournalFeatures,
}

impl Default for JournalConfig {
    fn default() -> Self {
        JournalConfig {
            block_size: 4096,
            first_block: 1,
            last_block: 1024,
            max_transaction_buffers: 64,
            barrier: true,
            abort_on_data_error: false,
            pipelined: false,
            compound_flush_interval: 1,
            max_buffer_versions: 4,
            min_reclaim_blocks: 64,
            features: JournalFeatures::default(),
        }
    }
}

impl JournalConfig {
    /// Total number of blocks in the circular log region.
    pub fn log_len(&self) -> u64 {
        self.last_block - self.first_block
    }
}
