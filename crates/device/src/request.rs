//! Per-write I/O tracking
//!
//! An [`IoRequest`] is the engine's view of one submitted block write.
//! It advances through two gates: dispatched (accepted by the transport)
//! and completed (written or failed). Waiters block on a condvar and are
//! woken by broadcast, since both the commit and flush stages may wait
//! on the same request.

use std::io;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// Cloneable description of a failed write, convertible back to
/// `std::io::Error` for propagation.
#[derive(Debug, Clone)]
pub struct IoFailure {
    /// The underlying error kind.
    pub kind: io::ErrorKind,
    /// Human-readable context.
    pub message: String,
}

impl IoFailure {
    pub fn from_io(err: &io::Error) -> Self {
        IoFailure {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    pub fn to_io(&self) -> io::Error {
        io::Error::new(self.kind, self.message.clone())
    }
}

#[derive(Debug, Default)]
struct IoState {
    dispatched: bool,
    completion: Option<Result<(), IoFailure>>,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<IoState>,
    cond: Condvar,
}

/// Handle to one in-flight block write.
#[derive(Debug, Clone, Default)]
pub struct IoRequest {
    shared: Arc<Shared>,
}

impl IoRequest {
    pub fn new() -> Self {
        IoRequest::default()
    }

    /// Mark the request as accepted by the transport and wake dispatch
    /// waiters.
    pub fn mark_dispatched(&self) {
        let mut state = self.shared.state.lock();
        state.dispatched = true;
        self.shared.cond.notify_all();
    }

    /// Record the final outcome and wake all waiters. Completion implies
    /// dispatch.
    pub fn complete(&self, result: io::Result<()>) {
        let mut state = self.shared.state.lock();
        state.dispatched = true;
        state.completion = Some(result.map_err(|e| IoFailure::from_io(&e)));
        self.shared.cond.notify_all();
    }

    /// Block until the request has been dispatched.
    pub fn wait_dispatched(&self) {
        let mut state = self.shared.state.lock();
        while !state.dispatched {
            self.shared.cond.wait(&mut state);
        }
    }

    /// Block until the request has completed, then cross-check the
    /// uptodate marker: a completion without a recorded success is an
    /// I/O error, never silently treated as written.
    pub fn wait_completed(&self) -> io::Result<()> {
        let mut state = self.shared.state.lock();
        loop {
            match &state.completion {
                Some(Ok(())) => return Ok(()),
                Some(Err(failure)) => return Err(failure.to_io()),
                None => self.shared.cond.wait(&mut state),
            }
        }
    }

    /// Non-blocking: has the write completed successfully?
    pub fn is_uptodate(&self) -> bool {
        matches!(self.shared.state.lock().completion, Some(Ok(())))
    }
}
