//! Convenient imports for ringjournal.
//!
//! Re-exports the types most clients need:
//!
//! ```ignore
//! use ringjournal::prelude::*;
//!
//! let journal = Journal::create(device, JournalConfig::default())?;
//! ```

// Journal entry points
pub use ringjournal_engine::{Handle, Journal, JournalBuffer};

// Ordered data hooks
pub use ringjournal_engine::{DataBuffers, JournalInode};

// Configuration and features
pub use ringjournal_core::{ChecksumVersion, JournalConfig, JournalFeatures};

// Error handling
pub use ringjournal_core::{JournalError, Result};

// Transaction ids
pub use ringjournal_core::Tid;

// Device transports
pub use ringjournal_device::{BlockDevice, FileBlockDevice, MemBlockDevice};
