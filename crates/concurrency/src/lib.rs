//! Concurrency layer for nestdb
//!
//! This crate implements named-resource locking:
//! - LockName: hierarchical resource names (prefix relation decides conflicts)
//! - LockManager: acquire/release contract shared by local and remote managers
//! - LocalLockManager: condvar-backed lock table for one process
//! - LockManagerExt: `with_exclusive` / `with_shared` critical sections
//!
//! The remote manager that forwards to the owning process lives in
//! `nestdb-multiplex`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod local;
pub mod lock;

pub use local::{LocalLockManager, LockStats};
pub use lock::{LockGuard, LockManager, LockManagerExt, LockMode, LockName, LockTicket};
