//! nestdb - embedded document store with secondary indexes
//!
//! Documents live in named repositories. Each repository keeps any number of
//! secondary indexes over field paths, supporting exact lookups and range or
//! array predicates. Several processes can share one database: the first to
//! open a directory owns the physical stores, the rest forward to it over a
//! Unix socket, and critical sections are enforced by the owner's lock
//! manager.
//!
//! # Quick Start
//!
//! ```ignore
//! use nestdb::{document_from_json, Database, IndexDefinition, Predicate};
//! use serde_json::json;
//!
//! let db = Database::open("/path/to/data")?;
//! let users = db.repository("users", vec![IndexDefinition::new("age", "info.age")?])?;
//!
//! users.insert(document_from_json(json!({"name": "David", "info": {"age": 40}})))?;
//! let adults = users.query("age", &Predicate::new().gte(35))?;
//! ```
//!
//! # Worker processes
//!
//! Start a child with [`Multiplexer::worker_command`]; its own
//! `Database::open` on the same directory then attaches to the owner.

pub use nestdb_concurrency::{
    LocalLockManager, LockGuard, LockManager, LockManagerExt, LockMode, LockName,
};
pub use nestdb_core::{
    document_from_json, Document, Entity, EntityId, Error, ErrorKind, FieldPath, Result, Value,
};
pub use nestdb_engine::{
    BackendKind, Database, Index, IndexDefinition, IndexState, NestConfig, Predicate, Repository,
};
pub use nestdb_multiplex::{Multiplexer, MultiplexerConfig, ProcessRole, OWNER_SOCKET_ENV};
pub use nestdb_storage::{FileBackend, KeyRange, MemoryBackend, StorageBackend, StorageHandle};
