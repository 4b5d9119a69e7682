//! Checksum engine
//!
//! Three crc32 roles, all feature-gated:
//! - the legacy rolling transaction sum folded over every block the
//!   transaction writes to the log, stored in the commit record (v1);
//! - per-tag sums over `tid || block contents`, so a tag can never be
//!   paired with the wrong data block (v2/v3);
//! - whole-block sums on descriptor blocks, the commit record, and the
//!   superblock, computed with the checksum field zeroed (v2/v3).
//!
//! The per-journal seed is derived from the journal UUID so logs from
//! different instances never validate against each other.

use byteorder::{BigEndian, ByteOrder};
use crc32fast::Hasher;

use crate::types::Tid;

/// Initial value of the rolling transaction checksum.
pub const TX_CHECKSUM_SEED: u32 = !0;

/// Derive the per-journal checksum seed from the journal UUID.
pub fn seed_from_uuid(uuid: &[u8; 16]) -> u32 {
    fold(!0, uuid)
}

/// Continue a crc32 from `seed` over `data`.
pub fn fold(seed: u32, data: &[u8]) -> u32 {
    let mut hasher = Hasher::new_with_initial(seed);
    hasher.update(data);
    hasher.finalize()
}

/// Fold one written block into the rolling transaction checksum (legacy
/// checksum feature).
pub fn tx_rolling(sum: u32, block: &[u8]) -> u32 {
    fold(sum, block)
}

/// Per-tag checksum: crc over the journal seed, the big-endian tid, then
/// the block contents. The tid binds the tag to its transaction so a
/// stale block from an earlier pass around the circular log cannot be
/// replayed against a newer tag.
pub fn tag_checksum(seed: u32, tid: Tid, block: &[u8]) -> u32 {
    let mut seq = [0u8; 4];
    BigEndian::write_u32(&mut seq, tid.raw());
    let sum = fold(seed, &seq);
    fold(sum, block)
}

/// Whole-block checksum for descriptor/commit/superblock blocks. The
/// caller zeroes the block's checksum field first.
pub fn block_checksum(seed: u32, block: &[u8]) -> u32 {
    fold(seed, block)
}
