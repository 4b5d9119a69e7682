//! Shared test support: journal builders and a replay-side log scanner.
//!
//! The scanner reads a device image the way crash recovery would: start
//! at the superblock's tail, follow descriptor chains, verify every
//! checksum, and stop at the first block that does not belong. Tests
//! feed it `MemBlockDevice::durable_image()` to see exactly what a
//! crash at the last cache flush would leave replayable.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder};

use ringjournal::prelude::*;
use ringjournal_core::checksum;
use ringjournal_core::layout::{
    self, BlockTag, CommitBlock, JournalHeader, Superblock, BLOCKTYPE_COMMIT,
    BLOCKTYPE_DESCRIPTOR, CHECKSUM_TYPE_CRC32, HEADER_BYTES, TAG_FLAG_ESCAPE, TAG_FLAG_LAST_TAG,
    TAG_FLAG_SAME_UUID, UUID_BYTES,
};

pub type Image = HashMap<u64, Vec<u8>>;

/// A journal config sized for tests: small blocks, small ring, eager
/// tail reclamation.
pub fn test_config() -> JournalConfig {
    JournalConfig {
        block_size: 512,
        first_block: 1,
        last_block: 257,
        min_reclaim_blocks: 1,
        ..Default::default()
    }
}

/// Route engine tracing to the test harness output. Safe to call from
/// every test; only the first call installs the subscriber.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn build_journal(config: JournalConfig) -> (Arc<MemBlockDevice>, Arc<Journal>) {
    init_tracing();
    let dev = Arc::new(MemBlockDevice::new(config.block_size));
    let log_dev: Arc<dyn BlockDevice> = dev.clone();
    let journal = Journal::create(log_dev, config).unwrap();
    (dev, journal)
}

pub fn build_deferred_journal(config: JournalConfig) -> (Arc<MemBlockDevice>, Arc<Journal>) {
    init_tracing();
    let dev = Arc::new(MemBlockDevice::with_deferred_completion(config.block_size));
    let log_dev: Arc<dyn BlockDevice> = dev.clone();
    let journal = Journal::create(log_dev, config).unwrap();
    (dev, journal)
}

/// Dirty one buffer per `(home block, fill byte)` pair in a single
/// transaction and commit it to durability.
pub fn commit_blocks(journal: &Arc<Journal>, writes: &[(u64, u8)]) -> Tid {
    let mut handle = journal.start_handle(writes.len() as u64).unwrap();
    for &(blocknr, fill) in writes {
        let buf = journal.journal_buffer(blocknr, vec![fill; journal.config().block_size]);
        handle.dirty_metadata(&buf).unwrap();
    }
    let tid = handle.tid();
    handle.finish().unwrap();
    journal.commit_and_wait().unwrap();
    tid
}

/// Poll `predicate` until it holds or the timeout trips.
pub fn wait_until<F: Fn() -> bool>(predicate: F, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !predicate() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

/// Background thread that completes deferred writes as they appear,
/// simulating an asynchronous disk. Stops on drop.
pub struct Completer {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

pub fn spawn_completer(dev: &Arc<MemBlockDevice>) -> Completer {
    let stop = Arc::new(AtomicBool::new(false));
    let dev = Arc::clone(dev);
    let flag = Arc::clone(&stop);
    let handle = thread::spawn(move || {
        while !flag.load(Ordering::SeqCst) {
            if !dev.complete_next() {
                thread::sleep(Duration::from_millis(1));
            }
        }
        dev.complete_all();
    });
    Completer {
        stop,
        handle: Some(handle),
    }
}

impl Drop for Completer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// One transaction the scanner found fully sealed and checksum-clean.
#[derive(Debug)]
pub struct ReplayedTransaction {
    pub tid: Tid,
    /// Home block number to replayable contents (escapes undone).
    pub blocks: HashMap<u64, Vec<u8>>,
}

/// Scan a journal image the way replay would. Returns every transaction
/// that is complete, sealed by a valid commit record, and free of
/// checksum mismatches; scanning stops at the first block that breaks
/// the chain.
pub fn scan_log(image: &Image, config: &JournalConfig) -> Vec<ReplayedTransaction> {
    let features = &config.features;
    let Some(sb_raw) = image.get(&(config.first_block - 1)) else {
        return Vec::new();
    };
    let Ok(sb) = Superblock::decode_from(sb_raw) else {
        return Vec::new();
    };
    if sb.start == 0 {
        return Vec::new();
    }
    let seed = checksum::seed_from_uuid(&sb.uuid);
    let advance = |b: u64| {
        if b + 1 == config.last_block {
            config.first_block
        } else {
            b + 1
        }
    };

    let mut txns = Vec::new();
    let mut next = sb.start as u64;
    let mut expected = sb.sequence;
    let mut pending: HashMap<u64, Vec<u8>> = HashMap::new();
    let mut crc = checksum::TX_CHECKSUM_SEED;

    loop {
        let Some(raw) = image.get(&next) else {
            return txns;
        };
        let Ok(header) = JournalHeader::decode_from(raw) else {
            return txns;
        };
        if header.sequence != expected {
            return txns;
        }
        match header.blocktype {
            BLOCKTYPE_DESCRIPTOR => {
                if features.checksum.is_v2_or_v3() {
                    let mut copy = raw.clone();
                    let stored = layout::read_descriptor_tail(&copy);
                    layout::zero_descriptor_tail(&mut copy);
                    if checksum::block_checksum(seed, &copy) != stored {
                        return txns;
                    }
                }
                if matches!(features.checksum, ChecksumVersion::V1) {
                    crc = checksum::tx_rolling(crc, raw);
                }

                let tags = parse_tags(raw, features);
                let mut data_block = advance(next);
                for tag in tags {
                    let Some(data) = image.get(&data_block) else {
                        return txns;
                    };
                    if features.checksum.is_v2_or_v3() {
                        let want = checksum::tag_checksum(seed, expected, data);
                        let want = if features.checksum == ChecksumVersion::V2 {
                            want & 0xffff
                        } else {
                            want
                        };
                        if want != tag.checksum {
                            return txns;
                        }
                    }
                    if matches!(features.checksum, ChecksumVersion::V1) {
                        crc = checksum::tx_rolling(crc, data);
                    }
                    let mut contents = data.clone();
                    if tag.flags & TAG_FLAG_ESCAPE != 0 {
                        BigEndian::write_u32(&mut contents[0..4], layout::JOURNAL_MAGIC);
                    }
                    pending.insert(tag.blocknr, contents);
                    data_block = advance(data_block);
                }
                next = data_block;
            }
            BLOCKTYPE_COMMIT => {
                let Ok(record) = CommitBlock::decode_from(raw) else {
                    return txns;
                };
                let valid = match features.checksum {
                    ChecksumVersion::None => true,
                    ChecksumVersion::V1 => {
                        record.chksum_type == CHECKSUM_TYPE_CRC32 && record.checksum == crc
                    }
                    ChecksumVersion::V2 | ChecksumVersion::V3 => {
                        let mut copy = raw.clone();
                        CommitBlock::zero_checksum_field(&mut copy);
                        checksum::block_checksum(seed, &copy) == record.checksum
                    }
                };
                if !valid {
                    return txns;
                }
                txns.push(ReplayedTransaction {
                    tid: expected,
                    blocks: std::mem::take(&mut pending),
                });
                crc = checksum::TX_CHECKSUM_SEED;
                expected = expected.next();
                next = advance(next);
            }
            _ => return txns,
        }
    }
}

fn parse_tags(descriptor: &[u8], features: &JournalFeatures) -> Vec<BlockTag> {
    let mut tags = Vec::new();
    let mut offset = HEADER_BYTES;
    loop {
        if offset + features.tag_bytes() > descriptor.len() {
            break;
        }
        let tag = BlockTag::decode_from(&descriptor[offset..], features);
        offset += features.tag_bytes();
        if tag.flags & TAG_FLAG_SAME_UUID == 0 {
            offset += UUID_BYTES;
        }
        let last = tag.flags & TAG_FLAG_LAST_TAG != 0;
        tags.push(tag);
        if last {
            break;
        }
    }
    tags
}

/// Fold the scanned transactions into the filesystem state replay would
/// produce: later transactions overwrite earlier ones.
pub fn replay_state(txns: &[ReplayedTransaction]) -> HashMap<u64, Vec<u8>> {
    let mut state = HashMap::new();
    for txn in txns {
        for (blocknr, contents) in &txn.blocks {
            state.insert(*blocknr, contents.clone());
        }
    }
    state
}
