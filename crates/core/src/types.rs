//! Transaction ids and block addresses
//!
//! Transaction ids are 32-bit sequence numbers that wrap; comparisons use
//! sequence arithmetic so a journal that lives long enough to wrap keeps
//! ordering correctly across the discontinuity.

use serde::{Deserialize, Serialize};

/// Monotonically increasing transaction identifier.
///
/// Stored on disk as a big-endian `u32` in every journal block header.
/// Ordering uses wrapping sequence arithmetic, not plain integer
/// comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tid(pub u32);

impl Tid {
    /// The successor tid, wrapping at `u32::MAX`.
    pub fn next(self) -> Tid {
        Tid(self.0.wrapping_add(1))
    }

    /// Sequence-arithmetic `self > other`.
    pub fn after(self, other: Tid) -> bool {
        (self.0.wrapping_sub(other.0) as i32) > 0
    }

    /// Sequence-arithmetic `self >= other`.
    pub fn at_or_after(self, other: Tid) -> bool {
        (self.0.wrapping_sub(other.0) as i32) >= 0
    }

    /// Raw sequence value as written to disk.
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for Tid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Physical block number on the backing device (home location of a
/// metadata buffer, or an absolute journal block).
pub type BlockNr = u64;

/// Logical position inside the circular journal region `[first, last)`.
pub type LogBlock = u64;
