//! Pipelined Commit Integration Tests
//!
//! The two-stage dispatch/flush path: stage overlap, strict FIFO
//! flushing, compound cache flushes, and write-ordering fences.

#[path = "../common/mod.rs"]
mod common;
