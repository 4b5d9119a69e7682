//! Checksum and Escape Coverage
//!
//! Each checksum scheme must seal good transactions and make corrupted
//! ones unreplayable; magic-prefixed data blocks must round-trip through
//! escaping.

use byteorder::{BigEndian, ByteOrder};

use ringjournal::layout::{self, CommitBlock};
use ringjournal::prelude::*;

use crate::common;

/// A data block whose first word collides with the journal magic.
fn magic_payload(block_size: usize) -> Vec<u8> {
    let mut data = vec![0x5au8; block_size];
    BigEndian::write_u32(&mut data[0..4], layout::JOURNAL_MAGIC);
    data
}

fn commit_two_blocks(version: ChecksumVersion) {
    let mut config = common::test_config();
    config.features.checksum = version;
    let (dev, journal) = common::build_journal(config);

    let plain = journal.journal_buffer(100, vec![0x33; 512]);
    let magic = journal.journal_buffer(101, magic_payload(512));
    let mut handle = journal.start_handle(2).unwrap();
    handle.dirty_metadata(&plain).unwrap();
    handle.dirty_metadata(&magic).unwrap();
    handle.finish().unwrap();
    let tid = journal.commit_and_wait().unwrap().unwrap();

    let image = dev.durable_image();
    // descriptor at 1, data at 2 and 3: the escaped copy must not carry
    // the magic on disk
    assert_eq!(BigEndian::read_u32(&image[&3][0..4]), 0);

    let txns = common::scan_log(&image, journal.config());
    assert_eq!(txns.len(), 1);
    assert_eq!(txns[0].tid, tid);
    assert_eq!(txns[0].blocks[&100], vec![0x33; 512]);
    assert_eq!(txns[0].blocks[&101], magic_payload(512));
    journal.shutdown().unwrap();
}

// ============================================================================
// Sealing Under Each Scheme
// ============================================================================

#[test]
fn no_checksums_seal_and_replay() {
    commit_two_blocks(ChecksumVersion::None);
}

#[test]
fn v1_rolling_checksum_seals_and_replays() {
    commit_two_blocks(ChecksumVersion::V1);
}

#[test]
fn v2_tag_checksums_seal_and_replay() {
    commit_two_blocks(ChecksumVersion::V2);
}

#[test]
fn v3_wide_tags_seal_and_replay() {
    commit_two_blocks(ChecksumVersion::V3);
}

#[test]
fn v1_commit_record_carries_the_rolling_crc() {
    let mut config = common::test_config();
    config.features.checksum = ChecksumVersion::V1;
    let (dev, journal) = common::build_journal(config);
    common::commit_blocks(&journal, &[(100, 0x44)]);

    // recompute descriptor-then-data with a plain crc32 and compare
    let image = dev.durable_image();
    let mut crc = !0u32;
    for block in [1u64, 2] {
        let mut hasher = crc32fast::Hasher::new_with_initial(crc);
        hasher.update(&image[&block]);
        crc = hasher.finalize();
    }
    let record = CommitBlock::decode_from(&image[&3]).unwrap();
    assert_eq!(record.checksum, crc);
    journal.shutdown().unwrap();
}

#[test]
fn async_commit_record_still_replays() {
    let mut config = common::test_config();
    config.features.checksum = ChecksumVersion::V1;
    config.features.async_commit = true;
    let (dev, journal) = common::build_journal(config);
    let tid = common::commit_blocks(&journal, &[(100, 5), (101, 6)]);

    let txns = common::scan_log(&dev.durable_image(), journal.config());
    assert_eq!(txns.len(), 1);
    assert_eq!(txns[0].tid, tid);
    assert_eq!(txns[0].blocks.len(), 2);
    journal.shutdown().unwrap();
}

// ============================================================================
// Corruption Detection
// ============================================================================

#[test]
fn v1_corrupt_data_block_fails_the_rolling_crc() {
    let mut config = common::test_config();
    config.features.checksum = ChecksumVersion::V1;
    let (dev, journal) = common::build_journal(config);
    let t1 = common::commit_blocks(&journal, &[(10, 1)]);
    common::commit_blocks(&journal, &[(11, 2), (12, 3)]);

    // t2's first data block sits at 5 (descriptor 4, data 5 and 6)
    dev.corrupt_byte(5, 100);
    let txns = common::scan_log(&dev.durable_image(), journal.config());
    assert_eq!(txns.len(), 1);
    assert_eq!(txns[0].tid, t1);
    journal.shutdown().unwrap();
}

#[test]
fn v2_corrupt_data_block_fails_its_tag() {
    let mut config = common::test_config();
    config.features.checksum = ChecksumVersion::V2;
    let (dev, journal) = common::build_journal(config);
    let t1 = common::commit_blocks(&journal, &[(10, 1)]);
    common::commit_blocks(&journal, &[(11, 2)]);

    dev.corrupt_byte(5, 7);
    let txns = common::scan_log(&dev.durable_image(), journal.config());
    assert_eq!(txns.len(), 1);
    assert_eq!(txns[0].tid, t1);
    journal.shutdown().unwrap();
}

#[test]
fn v3_corrupt_descriptor_fails_its_block_checksum() {
    let mut config = common::test_config();
    config.features.checksum = ChecksumVersion::V3;
    let (dev, journal) = common::build_journal(config);
    let t1 = common::commit_blocks(&journal, &[(10, 1)]);
    common::commit_blocks(&journal, &[(11, 2)]);

    // flip a byte inside t2's descriptor tag area
    dev.corrupt_byte(4, 20);
    let txns = common::scan_log(&dev.durable_image(), journal.config());
    assert_eq!(txns.len(), 1);
    assert_eq!(txns[0].tid, t1);
    journal.shutdown().unwrap();
}

// ============================================================================
// Descriptor Batching
// ============================================================================

#[test]
fn oversized_transactions_split_into_batches() {
    let mut config = common::test_config();
    config.features.checksum = ChecksumVersion::V2;
    config.max_transaction_buffers = 4;
    let (dev, journal) = common::build_journal(config);

    // ten buffers, batch size four: three descriptor batches
    let writes: Vec<(u64, u8)> = (0..10).map(|i| (200 + i, i as u8)).collect();
    let mut handle = journal.start_handle(10).unwrap();
    for &(blocknr, fill) in &writes {
        let buf = journal.journal_buffer(blocknr, vec![fill; 512]);
        handle.dirty_metadata(&buf).unwrap();
    }
    let tid = handle.tid();
    handle.finish().unwrap();
    assert_eq!(journal.commit_and_wait().unwrap(), Some(tid));

    let txns = common::scan_log(&dev.durable_image(), journal.config());
    assert_eq!(txns.len(), 1);
    assert_eq!(txns[0].tid, tid);
    assert_eq!(txns[0].blocks.len(), 10);
    for &(blocknr, fill) in &writes {
        assert_eq!(txns[0].blocks[&blocknr], vec![fill; 512]);
    }
    // ten data blocks behind three descriptors
    assert_eq!(journal.stats().total.blocks_logged, 13);
    journal.shutdown().unwrap();
}
