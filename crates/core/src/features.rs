//! On-disk compatibility feature flags
//!
//! These mirror the incompat/compat bits a journal superblock advertises.
//! The engine consults them to pick the tag format, checksum scheme, and
//! commit-record submission order.

use serde::{Deserialize, Serialize};

/// Which checksum scheme the journal uses.
///
/// - `None`: no checksums anywhere.
/// - `V1`: a single rolling crc over every block written by the
///   transaction, stored in the commit record (legacy scheme).
/// - `V2`: per-tag 16-bit checksums seeded with the transaction id, plus
///   whole-block checksums on descriptor/commit blocks.
/// - `V3`: as V2 but tags are the wide 16-byte form with a full 32-bit
///   per-tag checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChecksumVersion {
    None,
    V1,
    V2,
    V3,
}

impl ChecksumVersion {
    /// True for V2 or V3 (the schemes with per-tag and per-block sums).
    pub fn is_v2_or_v3(self) -> bool {
        matches!(self, ChecksumVersion::V2 | ChecksumVersion::V3)
    }
}

/// Feature flags consumed by the commit engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalFeatures {
    /// Checksum scheme in effect.
    pub checksum: ChecksumVersion,
    /// 64-bit block addressing: tags carry the high half of the block
    /// number.
    pub block_64bit: bool,
    /// Submit the commit record concurrently with the transaction's data
    /// blocks instead of strictly after them.
    pub async_commit: bool,
}

impl Default for JournalFeatures {
    fn default() -> Self {
        JournalFeatures {
            checksum: ChecksumVersion::None,
            block_64bit: false,
            async_commit: false,
        }
    }
}

impl JournalFeatures {
    /// Size in bytes of one descriptor tag under these features.
    pub fn tag_bytes(&self) -> usize {
        if self.checksum == ChecksumVersion::V3 {
            crate::layout::TAG3_BYTES
        } else if self.block_64bit {
            crate::layout::TAG_BYTES_64
        } else {
            crate::layout::TAG_BYTES_32
        }
    }

    /// Size of the per-block checksum tail on descriptor blocks, zero when
    /// whole-block checksums are off.
    pub fn csum_tail_bytes(&self) -> usize {
        if self.checksum.is_v2_or_v3() {
            crate::layout::BLOCK_TAIL_BYTES
        } else {
            0
        }
    }
}
