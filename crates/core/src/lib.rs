//! Core types for the ringjournal commit engine
//!
//! This crate defines the fundamental vocabulary shared by the device and
//! engine crates:
//! - [`types`]: transaction ids and sequence arithmetic
//! - [`features`]: on-disk compatibility feature flags
//! - [`config`]: journal configuration
//! - [`error`]: the journal error taxonomy
//! - [`layout`]: bit-exact on-disk block formats
//! - [`checksum`]: crc32 checksum engine for tags, blocks, and transactions
//!
//! Nothing in this crate does I/O; serialization is kept separate from
//! operational logic so the wire format stays easy to audit.

pub mod checksum;
pub mod config;
pub mod error;
pub mod features;
pub mod layout;
pub mod types;

pub use config::JournalConfig;
pub use error::{JournalError, Result};
pub use features::{ChecksumVersion, JournalFeatures};
pub use types::{BlockNr, LogBlock, Tid};
