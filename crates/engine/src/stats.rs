//! Commit statistics
//!
//! Each transaction carries a [`RunStats`] filled in as the commit state
//! machine walks it through its phases; the journal aggregates them into
//! a [`JournalStats`] snapshot readable at any time.

use std::time::Duration;

/// Per-transaction timing and volume counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct RunStats {
    /// Delay between the commit request and the commit actually starting.
    pub request_delay: Duration,
    /// Time the transaction spent accepting handles.
    pub running: Duration,
    /// Time spent locked, draining handles and conflicts.
    pub locked: Duration,
    /// Time spent flushing data buffers.
    pub flushing: Duration,
    /// Time spent writing and waiting on log blocks.
    pub logging: Duration,
    /// Handles that joined the transaction.
    pub handle_count: u64,
    /// Metadata buffers the transaction dirtied.
    pub blocks: u64,
    /// Blocks actually written to the log, descriptors included.
    pub blocks_logged: u64,
}

/// Journal-wide aggregates across committed transactions.
#[derive(Debug, Default, Clone, Copy)]
pub struct JournalStats {
    /// Transactions committed.
    pub commits: u64,
    /// Sums of the per-transaction counters.
    pub total: RunStats,
    /// Weighted average commit time, nanoseconds.
    pub average_commit_time_ns: u64,
}

impl JournalStats {
    /// Fold one committed transaction's counters into the aggregates.
    pub fn absorb(&mut self, run: &RunStats) {
        self.commits += 1;
        self.total.request_delay += run.request_delay;
        self.total.running += run.running;
        self.total.locked += run.locked;
        self.total.flushing += run.flushing;
        self.total.logging += run.logging;
        self.total.handle_count += run.handle_count;
        self.total.blocks += run.blocks;
        self.total.blocks_logged += run.blocks_logged;
    }
}

/// Weighted moving average used for the journal's commit-time estimate:
/// the new sample counts for a quarter, history for three.
pub fn weighted_commit_time(sample_ns: u64, average_ns: u64) -> u64 {
    if average_ns == 0 {
        sample_ns
    } else {
        (sample_ns + 3 * average_ns) / 4
    }
}
