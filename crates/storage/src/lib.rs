//! Storage layer for nestdb
//!
//! This crate implements the physical key-value primitive:
//! - StorageHandle: sorted string keys → opaque bytes, the only interface
//!   upper layers see
//! - KeyRange / Scan: bounded, paged, restartable range scans
//! - MemoryStore: BTreeMap with RwLock
//! - FileStore: append log with CRC-framed records and an exclusive file lock
//! - StorageBackend: creates physical handles by database name

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod file;
pub mod handle;
pub mod memory;
pub mod range;

pub use backend::{FileBackend, MemoryBackend, StorageBackend};
pub use file::FileStore;
pub use handle::{Scan, StorageHandle, DEFAULT_SCAN_PAGE};
pub use memory::MemoryStore;
pub use range::KeyRange;
