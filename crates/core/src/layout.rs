//! Bit-exact on-disk block formats
//!
//! Every journal block starts with a 12-byte header. Descriptor blocks
//! carry an array of tags naming the home location of each following data
//! block; a commit block seals the transaction. All integers are
//! big-endian.
//!
//! Serialization lives here, away from the commit machinery, so the wire
//! format can be audited (and decoded by the test-side scanner) in one
//! place.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{JournalError, Result};
use crate::features::{ChecksumVersion, JournalFeatures};
use crate::types::{BlockNr, Tid};

/// Magic number identifying every journal block.
pub const JOURNAL_MAGIC: u32 = 0xc03b_3998;

/// Block type: descriptor block.
pub const BLOCKTYPE_DESCRIPTOR: u32 = 1;
/// Block type: commit record.
pub const BLOCKTYPE_COMMIT: u32 = 2;
/// Block type: journal superblock.
pub const BLOCKTYPE_SUPERBLOCK: u32 = 4;

/// Size of the common journal block header.
pub const HEADER_BYTES: usize = 12;
/// Short tag, 32-bit block addressing.
pub const TAG_BYTES_32: usize = 8;
/// Short tag plus the high half of a 64-bit block number.
pub const TAG_BYTES_64: usize = 12;
/// Wide tag used by checksum v3 (always carries the high half and a
/// 32-bit checksum).
pub const TAG3_BYTES: usize = 16;
/// Per-block checksum tail on descriptor blocks.
pub const BLOCK_TAIL_BYTES: usize = 4;
/// Journal instance UUID following the first tag of each descriptor.
pub const UUID_BYTES: usize = 16;

/// Tag flag: the data block's leading magic bytes were zeroed on disk.
pub const TAG_FLAG_ESCAPE: u16 = 0x1;
/// Tag flag: same UUID as the previous tag (UUID omitted).
pub const TAG_FLAG_SAME_UUID: u16 = 0x2;
/// Tag flag: block was deleted by this transaction (reserved).
pub const TAG_FLAG_DELETED: u16 = 0x4;
/// Tag flag: final tag in this descriptor block.
pub const TAG_FLAG_LAST_TAG: u16 = 0x8;

/// Checksum type byte stored in the commit record (crc32).
pub const CHECKSUM_TYPE_CRC32: u8 = 1;
/// Checksum size byte stored in the commit record.
pub const CHECKSUM_SIZE_CRC32: u8 = 4;

/// Byte layout of the commit block body (after the common header).
const COMMIT_CHKSUM_TYPE_OFF: usize = 12;
const COMMIT_CHKSUM_SIZE_OFF: usize = 13;
const COMMIT_CHKSUM_OFF: usize = 16;
const COMMIT_SEC_OFF: usize = 48;
const COMMIT_NSEC_OFF: usize = 56;
/// Total meaningful bytes of a commit block.
pub const COMMIT_BLOCK_BYTES: usize = 60;

/// Common header at the start of every journal block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalHeader {
    /// Always [`JOURNAL_MAGIC`].
    pub magic: u32,
    /// One of the `BLOCKTYPE_*` constants.
    pub blocktype: u32,
    /// Transaction id the block belongs to.
    pub sequence: Tid,
}

impl JournalHeader {
    pub fn new(blocktype: u32, sequence: Tid) -> Self {
        JournalHeader {
            magic: JOURNAL_MAGIC,
            blocktype,
            sequence,
        }
    }

    /// Encode into the first [`HEADER_BYTES`] of `buf`.
    pub fn encode_into(&self, buf: &mut [u8]) {
        BigEndian::write_u32(&mut buf[0..4], self.magic);
        BigEndian::write_u32(&mut buf[4..8], self.blocktype);
        BigEndian::write_u32(&mut buf[8..12], self.sequence.raw());
    }

    /// Decode from the first [`HEADER_BYTES`] of `buf`. Fails when the
    /// magic does not match.
    pub fn decode_from(buf: &[u8]) -> Result<Self> {
        let magic = BigEndian::read_u32(&buf[0..4]);
        if magic != JOURNAL_MAGIC {
            return Err(JournalError::ChecksumMismatch { block: 0 });
        }
        Ok(JournalHeader {
            magic,
            blocktype: BigEndian::read_u32(&buf[4..8]),
            sequence: Tid(BigEndian::read_u32(&buf[8..12])),
        })
    }
}

/// One descriptor tag: names the home block of the next data block in the
/// log and carries its per-tag checksum when checksums v2/v3 are on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockTag {
    /// Home block number on the filesystem device.
    pub blocknr: BlockNr,
    /// `TAG_FLAG_*` bits.
    pub flags: u16,
    /// Per-tag checksum; 16 meaningful bits under v2, 32 under v3.
    pub checksum: u32,
}

impl BlockTag {
    /// Encode into `buf` using the tag format selected by `features`.
    /// `buf` must be at least `features.tag_bytes()` long.
    pub fn encode_into(&self, buf: &mut [u8], features: &JournalFeatures) {
        if features.checksum == ChecksumVersion::V3 {
            BigEndian::write_u32(&mut buf[0..4], self.blocknr as u32);
            BigEndian::write_u32(&mut buf[4..8], self.flags as u32);
            BigEndian::write_u32(&mut buf[8..12], ((self.blocknr >> 31) >> 1) as u32);
            BigEndian::write_u32(&mut buf[12..16], self.checksum);
        } else {
            BigEndian::write_u32(&mut buf[0..4], self.blocknr as u32);
            BigEndian::write_u16(&mut buf[4..6], self.checksum as u16);
            BigEndian::write_u16(&mut buf[6..8], self.flags);
            if features.block_64bit {
                BigEndian::write_u32(&mut buf[8..12], ((self.blocknr >> 31) >> 1) as u32);
            }
        }
    }

    /// Decode a tag written by [`BlockTag::encode_into`].
    pub fn decode_from(buf: &[u8], features: &JournalFeatures) -> Self {
        if features.checksum == ChecksumVersion::V3 {
            let low = BigEndian::read_u32(&buf[0..4]) as u64;
            let flags = BigEndian::read_u32(&buf[4..8]) as u16;
            let high = BigEndian::read_u32(&buf[8..12]) as u64;
            let checksum = BigEndian::read_u32(&buf[12..16]);
            BlockTag {
                blocknr: (high << 32) | low,
                flags,
                checksum,
            }
        } else {
            let low = BigEndian::read_u32(&buf[0..4]) as u64;
            let checksum = BigEndian::read_u16(&buf[4..6]) as u32;
            let flags = BigEndian::read_u16(&buf[6..8]);
            let high = if features.block_64bit {
                BigEndian::read_u32(&buf[8..12]) as u64
            } else {
                0
            };
            BlockTag {
                blocknr: (high << 32) | low,
                flags,
                checksum,
            }
        }
    }
}

/// Commit record: the single block whose presence makes the transaction
/// replayable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitBlock {
    /// Transaction this record seals.
    pub sequence: Tid,
    /// Checksum type byte (0 when no legacy checksum is carried).
    pub chksum_type: u8,
    /// Checksum size byte.
    pub chksum_size: u8,
    /// Checksum value (rolling transaction crc under v1, whole-block crc
    /// under v2/v3).
    pub checksum: u32,
    /// Commit wall-clock seconds.
    pub commit_sec: u64,
    /// Commit wall-clock nanoseconds.
    pub commit_nsec: u32,
}

impl CommitBlock {
    /// Encode into a zeroed block-sized buffer.
    pub fn encode_into(&self, buf: &mut [u8]) {
        JournalHeader::new(BLOCKTYPE_COMMIT, self.sequence).encode_into(buf);
        buf[COMMIT_CHKSUM_TYPE_OFF] = self.chksum_type;
        buf[COMMIT_CHKSUM_SIZE_OFF] = self.chksum_size;
        BigEndian::write_u32(
            &mut buf[COMMIT_CHKSUM_OFF..COMMIT_CHKSUM_OFF + 4],
            self.checksum,
        );
        BigEndian::write_u64(&mut buf[COMMIT_SEC_OFF..COMMIT_SEC_OFF + 8], self.commit_sec);
        BigEndian::write_u32(
            &mut buf[COMMIT_NSEC_OFF..COMMIT_NSEC_OFF + 4],
            self.commit_nsec,
        );
    }

    /// Decode from a commit block. Fails on bad magic or block type.
    pub fn decode_from(buf: &[u8]) -> Result<Self> {
        let header = JournalHeader::decode_from(buf)?;
        if header.blocktype != BLOCKTYPE_COMMIT {
            return Err(JournalError::ChecksumMismatch { block: 0 });
        }
        Ok(CommitBlock {
            sequence: header.sequence,
            chksum_type: buf[COMMIT_CHKSUM_TYPE_OFF],
            chksum_size: buf[COMMIT_CHKSUM_SIZE_OFF],
            checksum: BigEndian::read_u32(&buf[COMMIT_CHKSUM_OFF..COMMIT_CHKSUM_OFF + 4]),
            commit_sec: BigEndian::read_u64(&buf[COMMIT_SEC_OFF..COMMIT_SEC_OFF + 8]),
            commit_nsec: BigEndian::read_u32(&buf[COMMIT_NSEC_OFF..COMMIT_NSEC_OFF + 4]),
        })
    }

    /// Zero the checksum field in place (done before computing the
    /// whole-block checksum under v2/v3).
    pub fn zero_checksum_field(buf: &mut [u8]) {
        buf[COMMIT_CHKSUM_TYPE_OFF] = 0;
        buf[COMMIT_CHKSUM_SIZE_OFF] = 0;
        BigEndian::write_u32(&mut buf[COMMIT_CHKSUM_OFF..COMMIT_CHKSUM_OFF + 4], 0);
    }
}

/// Journal superblock: records the log geometry and, for tail
/// reclamation, the sequence and start block of the oldest transaction
/// still expected in the log. `start == 0` means the log is empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    /// Journal block size.
    pub block_size: u32,
    /// Total blocks in the journal, including the superblock.
    pub max_len: u32,
    /// First usable log block.
    pub first: u32,
    /// Sequence of the first transaction expected in the log.
    pub sequence: Tid,
    /// Block of the start of the log, zero when empty.
    pub start: u32,
    /// Sticky error carried for a dead journal.
    pub errno: i32,
    /// Journal instance UUID.
    pub uuid: [u8; UUID_BYTES],
    /// Whole-block checksum (v2/v3 only, zero otherwise).
    pub checksum: u32,
}

const SB_BLOCKSIZE_OFF: usize = 12;
const SB_MAXLEN_OFF: usize = 16;
const SB_FIRST_OFF: usize = 20;
const SB_SEQUENCE_OFF: usize = 24;
const SB_START_OFF: usize = 28;
const SB_ERRNO_OFF: usize = 32;
const SB_UUID_OFF: usize = 36;
const SB_CHECKSUM_OFF: usize = 52;
/// Total meaningful bytes of a superblock.
pub const SUPERBLOCK_BYTES: usize = 56;

impl Superblock {
    /// Encode into a zeroed block-sized buffer. The sequence field of the
    /// common header mirrors `self.sequence`.
    pub fn encode_into(&self, buf: &mut [u8]) {
        JournalHeader::new(BLOCKTYPE_SUPERBLOCK, self.sequence).encode_into(buf);
        BigEndian::write_u32(&mut buf[SB_BLOCKSIZE_OFF..SB_BLOCKSIZE_OFF + 4], self.block_size);
        BigEndian::write_u32(&mut buf[SB_MAXLEN_OFF..SB_MAXLEN_OFF + 4], self.max_len);
        BigEndian::write_u32(&mut buf[SB_FIRST_OFF..SB_FIRST_OFF + 4], self.first);
        BigEndian::write_u32(&mut buf[SB_SEQUENCE_OFF..SB_SEQUENCE_OFF + 4], self.sequence.raw());
        BigEndian::write_u32(&mut buf[SB_START_OFF..SB_START_OFF + 4], self.start);
        BigEndian::write_i32(&mut buf[SB_ERRNO_OFF..SB_ERRNO_OFF + 4], self.errno);
        buf[SB_UUID_OFF..SB_UUID_OFF + UUID_BYTES].copy_from_slice(&self.uuid);
        BigEndian::write_u32(&mut buf[SB_CHECKSUM_OFF..SB_CHECKSUM_OFF + 4], self.checksum);
    }

    /// Decode a superblock written by [`Superblock::encode_into`].
    pub fn decode_from(buf: &[u8]) -> Result<Self> {
        let header = JournalHeader::decode_from(buf)?;
        if header.blocktype != BLOCKTYPE_SUPERBLOCK {
            return Err(JournalError::ChecksumMismatch { block: 0 });
        }
        let mut uuid = [0u8; UUID_BYTES];
        uuid.copy_from_slice(&buf[SB_UUID_OFF..SB_UUID_OFF + UUID_BYTES]);
        Ok(Superblock {
            block_size: BigEndian::read_u32(&buf[SB_BLOCKSIZE_OFF..SB_BLOCKSIZE_OFF + 4]),
            max_len: BigEndian::read_u32(&buf[SB_MAXLEN_OFF..SB_MAXLEN_OFF + 4]),
            first: BigEndian::read_u32(&buf[SB_FIRST_OFF..SB_FIRST_OFF + 4]),
            sequence: Tid(BigEndian::read_u32(&buf[SB_SEQUENCE_OFF..SB_SEQUENCE_OFF + 4])),
            start: BigEndian::read_u32(&buf[SB_START_OFF..SB_START_OFF + 4]),
            errno: BigEndian::read_i32(&buf[SB_ERRNO_OFF..SB_ERRNO_OFF + 4]),
            uuid,
            checksum: BigEndian::read_u32(&buf[SB_CHECKSUM_OFF..SB_CHECKSUM_OFF + 4]),
        })
    }

    /// Zero the checksum field in place before checksumming.
    pub fn zero_checksum_field(buf: &mut [u8]) {
        BigEndian::write_u32(&mut buf[SB_CHECKSUM_OFF..SB_CHECKSUM_OFF + 4], 0);
    }
}

/// Does this data block need escaping? True when its first word collides
/// with the journal magic, which would make replay mistake it for a
/// control block.
pub fn needs_escape(data: &[u8]) -> bool {
    data.len() >= 4 && BigEndian::read_u32(&data[0..4]) == JOURNAL_MAGIC
}

/// Zero the leading magic word of an escaped block (the tag's escape flag
/// tells replay to restore it).
pub fn apply_escape(data: &mut [u8]) {
    BigEndian::write_u32(&mut data[0..4], 0);
}

/// Zero the checksum field of a descriptor block's tail in place.
pub fn zero_descriptor_tail(buf: &mut [u8]) {
    let len = buf.len();
    BigEndian::write_u32(&mut buf[len - BLOCK_TAIL_BYTES..], 0);
}

/// Write the descriptor tail checksum into the last four bytes.
pub fn write_descriptor_tail(buf: &mut [u8], checksum: u32) {
    let len = buf.len();
    BigEndian::write_u32(&mut buf[len - BLOCK_TAIL_BYTES..], checksum);
}

/// Read the descriptor tail checksum from the last four bytes.
pub fn read_descriptor_tail(buf: &[u8]) -> u32 {
    BigEndian::read_u32(&buf[buf.len() - BLOCK_TAIL_BYTES..])
}
