//! Block device abstraction for the journal
//!
//! The commit engine never talks to files directly; it submits block
//! writes through [`BlockDevice`] and tracks each one with an
//! [`IoRequest`] that distinguishes *dispatched* (handed to the
//! transport) from *completed* (durably written or failed). The
//! pipelined commit path waits only for dispatch; the flush stage waits
//! for completion.
//!
//! Two implementations:
//! - [`FileBlockDevice`]: a file-backed device with a single FIFO writer
//!   thread, so writes reach the medium in submission order.
//! - [`MemBlockDevice`]: an in-memory device for tests, with write-order
//!   capture, fault injection, deferred completion, and a crash image
//!   snapshotted at each cache flush.

mod file;
mod mem;
mod request;

pub use file::FileBlockDevice;
pub use mem::{MemBlockDevice, WriteRecord};
pub use request::{IoFailure, IoRequest};

use ringjournal_core::BlockNr;

/// Hints attached to a submitted write, mirroring the request flags the
/// commit engine cares about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteFlags {
    /// Must not be reordered against other ordered writes.
    pub ordered: bool,
    /// Ordering fence: everything submitted before this write must reach
    /// the medium first. Used for the final block of a commit batch on
    /// transports without native FIFO ordering.
    pub barrier: bool,
}

impl WriteFlags {
    /// Plain synchronous write.
    pub fn sync() -> Self {
        WriteFlags::default()
    }

    /// Ordered write.
    pub fn ordered() -> Self {
        WriteFlags {
            ordered: true,
            barrier: false,
        }
    }

    /// Ordered write with a barrier fence.
    pub fn barrier() -> Self {
        WriteFlags {
            ordered: true,
            barrier: true,
        }
    }
}

/// A block-granular storage transport.
///
/// Writes are asynchronous: `submit_write` returns once the request is
/// dispatched; durability is observed through the returned
/// [`IoRequest`] and, where barriers are configured, [`flush`].
///
/// [`flush`]: BlockDevice::flush
pub trait BlockDevice: Send + Sync {
    /// Device block size in bytes.
    fn block_size(&self) -> usize;

    /// Queue a write of `data` at `block`. The returned request is
    /// already dispatched when this returns.
    fn submit_write(&self, block: BlockNr, data: Vec<u8>, flags: WriteFlags) -> IoRequest;

    /// Issue a cache-flush to the device: every completed write is on
    /// stable media when this returns.
    fn flush(&self) -> std::io::Result<()>;

    /// Read a single block (used by verification tooling, not the commit
    /// path).
    fn read_block(&self, block: BlockNr) -> std::io::Result<Vec<u8>>;

    /// Whether the transport preserves submission order by itself. When
    /// false, the engine tags the final block of each commit with a
    /// barrier fence.
    fn fifo_ordered(&self) -> bool;
}
