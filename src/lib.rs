//! # ringjournal
//!
//! Write-ahead-log transaction commit engine with a circular block
//! journal.
//!
//! Filesystem-style clients batch metadata updates into transactions
//! through handles; the engine snapshots the dirtied blocks into the
//! journal as descriptor batches sealed by a commit record, recycles
//! log space as blocks are written back home, and optionally pipelines
//! commits into overlapping dispatch and flush stages.
//!
//! ## Quick Start
//!
//! ```ignore
//! use ringjournal::prelude::*;
//! use std::sync::Arc;
//!
//! let device = Arc::new(FileBlockDevice::open("journal.img".as_ref(), 4096)?);
//! let journal = Journal::create(device, JournalConfig::default())?;
//!
//! // batch an update
//! let buf = journal.journal_buffer(42, block_contents);
//! let mut handle = journal.start_handle(1)?;
//! handle.dirty_metadata(&buf)?;
//! buf.write_data(|data| data[0] = 0xff);
//! handle.finish()?;
//!
//! // make it durable
//! journal.commit_and_wait()?;
//!
//! // later: write the block home and let the log reclaim it
//! journal.buffer_written_back(&buf);
//! journal.reclaim_space()?;
//!
//! journal.shutdown()?;
//! ```
//!
//! ## Crates
//!
//! - `ringjournal-core`: on-disk formats, checksums, configuration
//! - `ringjournal-device`: the block device abstraction and transports
//! - `ringjournal-engine`: transactions, the commit state machine, the
//!   pipelined barrier path, checkpointing

pub mod prelude;

pub use ringjournal_core::{checksum, layout};
pub use ringjournal_core::{
    ChecksumVersion, JournalConfig, JournalError, JournalFeatures, Result, Tid,
};
pub use ringjournal_device::{BlockDevice, FileBlockDevice, MemBlockDevice, WriteFlags};
pub use ringjournal_engine::{
    DataBuffers, Handle, Journal, JournalBuffer, JournalInode, JournalStats, TxState,
};
