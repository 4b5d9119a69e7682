//! Versioned journal buffers
//!
//! A [`JournalBuffer`] is the journal's view of one metadata block: its
//! current contents, which transaction list it is filed on, and a small
//! table of in-flight *versions*. Each transaction that dirties the
//! buffer claims a version slot (indexed by `tid % max_buffer_versions`)
//! and later freezes a snapshot of the contents into it for the log
//! write. Slots stay live until the owning transaction's flush stage
//! releases them, so several transactions can have distinct snapshots of
//! the same buffer in flight at once.
//!
//! Claiming a slot whose previous owner is still live is a hard
//! [`VersionOverflow`] error; overwriting an in-flight snapshot would
//! corrupt the log.
//!
//! [`VersionOverflow`]: JournalError::VersionOverflow

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use ringjournal_core::layout;
use ringjournal_core::{BlockNr, JournalError, Result, Tid};

/// Which transaction list a buffer is currently filed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferList {
    /// Not on any list.
    None,
    /// Dirty metadata awaiting logging.
    Buffers,
    /// To be dropped at commit (deleted or superseded).
    Forget,
    /// Log write in flight for this buffer's frozen snapshot.
    Shadow,
    /// Reserved by a handle but never dirtied.
    Reserved,
}

/// Outcome of [`JournalBuffer::claim_version`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// This transaction already owns the slot.
    Already,
    /// Fresh claim; `conflicts` older live versions were registered.
    New { conflicts: usize },
}

/// One in-flight version of the buffer's contents.
struct Version {
    tid: Tid,
    live: bool,
    escaped: bool,
    /// Snapshot written (or being written) to the log.
    frozen: Option<Vec<u8>>,
    /// Previous snapshot that reached the log, kept until superseded.
    committed: Option<Vec<u8>>,
    /// Conflict counters of younger transactions waiting for this
    /// version to retire.
    waiters: Vec<Arc<AtomicUsize>>,
}

struct BufferState {
    list: BufferList,
    list_tid: Option<Tid>,
    /// Transaction whose checkpoint list holds this buffer, if any.
    checkpoint_tid: Option<Tid>,
    /// The on-disk home copy is stale; the buffer must not leave the
    /// checkpoint machinery until written back.
    journal_dirty: bool,
    /// The block was deleted; drop instead of checkpointing.
    freed: bool,
}

/// A metadata block tracked by the journal.
pub struct JournalBuffer {
    blocknr: BlockNr,
    data: Mutex<Vec<u8>>,
    state: Mutex<BufferState>,
    versions: Mutex<Vec<Option<Version>>>,
}

impl JournalBuffer {
    /// Track a block. `max_versions` bounds concurrent in-flight
    /// snapshots and normally comes from the journal config.
    pub fn new(blocknr: BlockNr, data: Vec<u8>, max_versions: usize) -> Arc<Self> {
        debug_assert!(max_versions >= 1);
        let mut versions = Vec::with_capacity(max_versions);
        versions.resize_with(max_versions, || None);
        Arc::new(JournalBuffer {
            blocknr,
            data: Mutex::new(data),
            state: Mutex::new(BufferState {
                list: BufferList::None,
                list_tid: None,
                checkpoint_tid: None,
                journal_dirty: false,
                freed: false,
            }),
            versions: Mutex::new(versions),
        })
    }

    /// Home block number on the filesystem device.
    pub fn blocknr(&self) -> BlockNr {
        self.blocknr
    }

    /// Mutate the buffer contents. Callers hold a handle that has claimed
    /// a version, so the running transaction will snapshot the result.
    pub fn write_data<F: FnOnce(&mut [u8])>(&self, f: F) {
        f(&mut self.data.lock());
    }

    /// Read the current (uncommitted) contents.
    pub fn read_data(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// Claim the version slot for `tid`. For every *other* live version
    /// found, registers `conflict` as a waiter and bumps it, so the
    /// claiming transaction's commit can wait for those versions to
    /// retire.
    pub fn claim_version(&self, tid: Tid, conflict: &Arc<AtomicUsize>) -> Result<Claim> {
        // lock order: data, then versions (freeze does the same)
        let data = self.data.lock();
        let mut versions = self.versions.lock();
        let max = versions.len();
        let slot = tid.raw() as usize % max;

        if let Some(v) = &versions[slot] {
            if v.live {
                if v.tid == tid {
                    return Ok(Claim::Already);
                }
                let live = versions.iter().flatten().filter(|v| v.live).count();
                return Err(JournalError::VersionOverflow {
                    block: self.blocknr,
                    live,
                    max,
                });
            }
        }
        versions[slot] = Some(Version {
            tid,
            live: true,
            escaped: false,
            frozen: None,
            committed: None,
            waiters: Vec::new(),
        });

        let mut conflicts = 0;
        for v in versions.iter_mut().flatten() {
            if v.live && v.tid != tid {
                // snapshot the older version before the claimer can
                // modify the contents it is due to log
                if v.frozen.is_none() {
                    let (image, escaped) = escape_image(&data);
                    v.escaped = escaped;
                    v.frozen = Some(image);
                }
                v.waiters.push(Arc::clone(conflict));
                conflicts += 1;
            }
        }
        conflict.fetch_add(conflicts, Ordering::SeqCst);
        Ok(Claim::New { conflicts })
    }

    /// Snapshot the current contents into `tid`'s version slot for the
    /// log write, escaping the leading magic word if needed. If a
    /// conflicting claim already made the snapshot, that one is used.
    /// Returns the log image and whether it was escaped.
    pub fn freeze(&self, tid: Tid) -> (Vec<u8>, bool) {
        let data = self.data.lock();
        let mut versions = self.versions.lock();
        let slot = tid.raw() as usize % versions.len();
        let v = versions[slot]
            .as_mut()
            .filter(|v| v.live && v.tid == tid)
            .expect("freeze without a claimed version");
        if let Some(image) = &v.frozen {
            return (image.clone(), v.escaped);
        }
        let (image, escaped) = escape_image(&data);
        v.escaped = escaped;
        v.frozen = Some(image.clone());
        (image, escaped)
    }

    /// Retire `tid`'s version: the log write is durable and the buffer
    /// has moved to the checkpoint machinery. The frozen snapshot
    /// becomes the committed one; the previous committed snapshot is
    /// dropped. Returns the conflict counters to decrement, which the
    /// caller does outside the buffer lock before waking conflict
    /// waiters.
    pub fn release_version(&self, tid: Tid) -> Vec<Arc<AtomicUsize>> {
        let mut versions = self.versions.lock();
        let slot = tid.raw() as usize % versions.len();
        match versions[slot].as_mut() {
            Some(v) if v.tid == tid && v.live => {
                v.live = false;
                v.committed = v.frozen.take();
                std::mem::take(&mut v.waiters)
            }
            _ => Vec::new(),
        }
    }

    /// Versions currently in flight.
    pub fn live_versions(&self) -> usize {
        self.versions
            .lock()
            .iter()
            .flatten()
            .filter(|v| v.live)
            .count()
    }

    /// The committed snapshot for `tid`, if its version retired with one.
    pub fn committed_snapshot(&self, tid: Tid) -> Option<Vec<u8>> {
        let versions = self.versions.lock();
        let slot = tid.raw() as usize % versions.len();
        versions[slot]
            .as_ref()
            .filter(|v| v.tid == tid)
            .and_then(|v| v.committed.clone())
    }

    pub(crate) fn file(&self, list: BufferList, tid: Tid) {
        let mut state = self.state.lock();
        state.list = list;
        state.list_tid = Some(tid);
    }

    pub(crate) fn unfile(&self) {
        let mut state = self.state.lock();
        state.list = BufferList::None;
        state.list_tid = None;
    }

    /// The list this buffer is filed on and the owning transaction.
    pub fn filed_on(&self) -> (BufferList, Option<Tid>) {
        let state = self.state.lock();
        (state.list, state.list_tid)
    }

    pub(crate) fn set_journal_dirty(&self, dirty: bool) {
        self.state.lock().journal_dirty = dirty;
    }

    /// True while the on-disk home copy is stale.
    pub fn is_journal_dirty(&self) -> bool {
        self.state.lock().journal_dirty
    }

    pub(crate) fn mark_freed(&self) {
        self.state.lock().freed = true;
    }

    pub(crate) fn is_freed(&self) -> bool {
        self.state.lock().freed
    }

    pub(crate) fn set_checkpoint_tid(&self, tid: Option<Tid>) {
        self.state.lock().checkpoint_tid = tid;
    }

    pub(crate) fn checkpoint_tid(&self) -> Option<Tid> {
        self.state.lock().checkpoint_tid
    }
}

fn escape_image(data: &[u8]) -> (Vec<u8>, bool) {
    let mut image = data.to_vec();
    let escaped = layout::needs_escape(&image);
    if escaped {
        layout::apply_escape(&mut image);
    }
    (image, escaped)
}

impl std::fmt::Debug for JournalBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (list, tid) = self.filed_on();
        f.debug_struct("JournalBuffer")
            .field("blocknr", &self.blocknr)
            .field("list", &list)
            .field("list_tid", &tid)
            .field("live_versions", &self.live_versions())
            .finish()
    }
}
