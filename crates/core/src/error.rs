//! Journal error taxonomy
//!
//! Fatal log-write failures abort the whole journal: once aborted, every
//! subsequent request fails with [`JournalError::Aborted`] until the log
//! is replayed and remounted. Ordered-data writeback failures stay with
//! the backing that observed them and only become [`JournalError::
//! Aborted`] when the journal is configured to escalate. List and lock
//! bookkeeping errors are impossible by construction and are asserted,
//! not returned.

use thiserror::Error;

/// Result alias used across the journal crates.
pub type Result<T> = std::result::Result<T, JournalError>;

/// Errors surfaced by journal operations.
#[derive(Debug, Error)]
pub enum JournalError {
    /// Device I/O failure. On a log write this is journal-fatal.
    #[error("journal I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The journal has been aborted; no further log writes are attempted.
    #[error("journal aborted")]
    Aborted,

    /// The journal is read-only or shut down; the request was rejected
    /// before touching the log.
    #[error("journal is read-only")]
    ReadOnly,

    /// The circular log has no room for the requested reservation.
    #[error("journal log full: requested {requested} blocks, {free} free")]
    LogFull {
        /// Blocks the caller asked to reserve.
        requested: u64,
        /// Blocks currently free in the log.
        free: u64,
    },

    /// More than the configured number of concurrent versions of one
    /// buffer are in flight. The bound is `JournalConfig::
    /// max_buffer_versions`; we fail loudly rather than overwrite a live
    /// snapshot.
    #[error("buffer {block} has {live} in-flight versions, max {max}")]
    VersionOverflow {
        /// Home block number of the buffer.
        block: u64,
        /// Versions currently in flight.
        live: usize,
        /// Configured bound.
        max: usize,
    },

    /// A checksum did not verify (detected by the read-side scanner).
    #[error("checksum mismatch on journal block {block}")]
    ChecksumMismatch {
        /// Journal block whose checksum failed.
        block: u64,
    },
}

impl JournalError {
    /// True when the error means the whole journal is dead.
    pub fn is_fatal(&self) -> bool {
        matches!(self, JournalError::Io(_) | JournalError::Aborted)
    }
}
