//! Document repositories and secondary indexes for nestdb
//!
//! This crate sits on top of the multiplexer:
//! - Database: data directory, config and owner/worker startup
//! - Repository: entity CRUD with index maintenance
//! - Index: forward/backward maps, exact lookups and predicate queries
//!
//! Everything here reaches storage and locks through a
//! [`Multiplexer`](nestdb_multiplex::Multiplexer), so the same code runs in
//! the owner process and in workers.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod database;
pub mod index;
pub mod repository;

pub use config::{BackendKind, NestConfig, CONFIG_FILE_NAME};
pub use database::Database;
pub use index::{region_names, Index, IndexDefinition, IndexState, Predicate};
pub use repository::{data_region, Repository};
