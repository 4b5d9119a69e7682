//! Transaction commit engine for the ringjournal write-ahead log
//!
//! The engine batches filesystem updates into transactions, writes each
//! transaction into a circular block journal as descriptor batches
//! sealed by a commit record, and recycles log space as buffers reach
//! their home locations:
//!
//! - [`journal`]: the journal instance, its workers, and the public API
//! - [`transaction`]: transactions, handles, and credit accounting
//! - [`buffer`]: versioned metadata buffers with in-flight snapshots
//! - [`data`]: ordered-mode data writeback hooks
//! - [`stats`]: per-transaction and journal-wide commit statistics
//!
//! Two commit paths share one set of phase helpers: the classic path
//! (write, wait, seal, durable on return) and the pipelined barrier
//! path, where a dispatch stage overlaps transaction N+1's log writes
//! with transaction N's disk waits and a strictly FIFO flush stage
//! provides durability.

pub mod buffer;
pub mod data;
pub mod journal;
pub mod stats;
pub mod transaction;

mod checkpoint;
mod commit;
mod pipeline;

pub use buffer::{BufferList, Claim, JournalBuffer};
pub use data::{DataBuffers, JournalInode};
pub use journal::Journal;
pub use stats::{JournalStats, RunStats};
pub use transaction::{Handle, Transaction, TxState};
