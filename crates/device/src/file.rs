//! File-backed block device
//!
//! A single writer thread drains a FIFO queue, so writes reach the file
//! in submission order and the transport reports itself as natively
//! ordered. `flush` queues behind every prior write and then calls
//! `sync_data`, which is the cache-flush primitive the commit engine
//! relies on for barriers.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::debug;

use ringjournal_core::BlockNr;

use crate::request::IoRequest;
use crate::{BlockDevice, WriteFlags};

enum Job {
    Write {
        block: BlockNr,
        data: Vec<u8>,
        request: IoRequest,
    },
    Flush {
        ack: mpsc::Sender<io::Result<()>>,
    },
    Shutdown,
}

/// Block device backed by a regular file.
pub struct FileBlockDevice {
    block_size: usize,
    queue: Mutex<mpsc::Sender<Job>>,
    reader: Mutex<File>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl FileBlockDevice {
    /// Open (or create) the backing file. The file grows on demand as
    /// blocks are written.
    pub fn open(path: &Path, block_size: usize) -> io::Result<Self> {
        let writer = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let reader = OpenOptions::new().read(true).open(path)?;
        let (tx, rx) = mpsc::channel();
        let worker = thread::Builder::new()
            .name("ringjournal-dev".into())
            .spawn(move || Self::run_worker(writer, rx, block_size))?;
        Ok(FileBlockDevice {
            block_size,
            queue: Mutex::new(tx),
            reader: Mutex::new(reader),
            worker: Mutex::new(Some(worker)),
        })
    }

    fn run_worker(mut file: File, rx: mpsc::Receiver<Job>, block_size: usize) {
        while let Ok(job) = rx.recv() {
            match job {
                Job::Write {
                    block,
                    data,
                    request,
                } => {
                    let result = Self::write_block(&mut file, block, &data, block_size);
                    if let Err(ref e) = result {
                        debug!(block, error = %e, "block write failed");
                    }
                    request.complete(result);
                }
                Job::Flush { ack } => {
                    let _ = ack.send(file.sync_data());
                }
                Job::Shutdown => break,
            }
        }
    }

    fn write_block(
        file: &mut File,
        block: BlockNr,
        data: &[u8],
        block_size: usize,
    ) -> io::Result<()> {
        file.seek(SeekFrom::Start(block * block_size as u64))?;
        file.write_all(data)?;
        Ok(())
    }
}

impl BlockDevice for FileBlockDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn submit_write(&self, block: BlockNr, data: Vec<u8>, _flags: WriteFlags) -> IoRequest {
        debug_assert_eq!(data.len(), self.block_size);
        let request = IoRequest::new();
        let send = self.queue.lock().send(Job::Write {
            block,
            data,
            request: request.clone(),
        });
        match send {
            // Queued to an order-preserving transport: that is dispatch.
            Ok(()) => request.mark_dispatched(),
            Err(_) => request.complete(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "device writer thread is gone",
            ))),
        }
        request
    }

    fn flush(&self) -> io::Result<()> {
        let (tx, rx) = mpsc::channel();
        self.queue
            .lock()
            .send(Job::Flush { ack: tx })
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "device writer thread is gone"))?;
        rx.recv()
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "device writer thread is gone"))?
    }

    fn read_block(&self, block: BlockNr) -> io::Result<Vec<u8>> {
        let mut file = self.reader.lock();
        file.seek(SeekFrom::Start(block * self.block_size as u64))?;
        let mut buf = vec![0u8; self.block_size];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn fifo_ordered(&self) -> bool {
        true
    }
}

impl Drop for FileBlockDevice {
    fn drop(&mut self) {
        let _ = self.queue.lock().send(Job::Shutdown);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}
