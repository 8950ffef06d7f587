//! Core types for nestdb
//!
//! This crate defines the foundational types used throughout the system:
//! - Value / Document: tagged tree for entity fields
//! - FieldPath / Resolved: dot-path traversal with an explicit absent variant
//! - EntityId / Entity: generated identifiers and persisted documents
//! - encoding: order-preserving index key encoding
//! - Error: error type shared by every crate

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod encoding;
pub mod entity;
pub mod error;
pub mod path;
pub mod value;

pub use entity::{Entity, EntityId, ID_FIELD};
pub use error::{Error, ErrorKind, Result};
pub use path::{FieldPath, Resolved};
pub use value::{document_from_json, Document, Value};
