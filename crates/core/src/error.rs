//! Error types for nestdb
//!
//! This module defines the error type shared by every crate in the workspace.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! Every variant maps to an [`ErrorKind`] so that errors raised inside the
//! owner process can cross the inter-process channel and be rebuilt on the
//! caller's side with the same classification.

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Result type alias for nestdb operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for nestdb
#[derive(Debug, Error)]
pub enum Error {
    /// Edit or delete addressed an entity that does not exist
    #[error("Entity not found: {0}")]
    NotFound(String),

    /// A field value cannot be turned into an index key
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// The owning process cannot be reached
    #[error("Connection error: {0}")]
    Connection(String),

    /// A message could not be framed or exceeded the size bound
    #[error("Transport error: {0}")]
    Transport(String),

    /// Underlying storage failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O error (file operations, sockets, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Configuration could not be read or is invalid
    #[error("Config error: {0}")]
    Config(String),

    /// Field path could not be parsed
    #[error("Invalid field path: {0}")]
    InvalidPath(String),

    /// Caller supplied an unusable argument
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Handle was used after its last close
    #[error("Handle closed: {0}")]
    Closed(String),
}

/// Wire-stable classification of [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// See [`Error::NotFound`]
    NotFound,
    /// See [`Error::Encoding`]
    Encoding,
    /// See [`Error::Connection`]
    Connection,
    /// See [`Error::Transport`]
    Transport,
    /// See [`Error::Storage`]
    Storage,
    /// See [`Error::Io`]
    Io,
    /// See [`Error::Serialization`]
    Serialization,
    /// See [`Error::Corruption`]
    Corruption,
    /// See [`Error::Config`]
    Config,
    /// See [`Error::InvalidPath`]
    InvalidPath,
    /// See [`Error::InvalidInput`]
    InvalidInput,
    /// See [`Error::Closed`]
    Closed,
}

impl Error {
    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Error::Storage(msg.into())
    }

    /// Create an encoding error
    pub fn encoding(msg: impl Into<String>) -> Self {
        Error::Encoding(msg.into())
    }

    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Error::Connection(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Error::Transport(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    /// Classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Encoding(_) => ErrorKind::Encoding,
            Error::Connection(_) => ErrorKind::Connection,
            Error::Transport(_) => ErrorKind::Transport,
            Error::Storage(_) => ErrorKind::Storage,
            Error::Io(_) => ErrorKind::Io,
            Error::Serialization(_) => ErrorKind::Serialization,
            Error::Corruption(_) => ErrorKind::Corruption,
            Error::Config(_) => ErrorKind::Config,
            Error::InvalidPath(_) => ErrorKind::InvalidPath,
            Error::InvalidInput(_) => ErrorKind::InvalidInput,
            Error::Closed(_) => ErrorKind::Closed,
        }
    }

    /// Message without the `Display` prefix, used when shipping errors over the wire
    pub fn message(&self) -> String {
        match self {
            Error::Io(e) => e.to_string(),
            Error::NotFound(m)
            | Error::Encoding(m)
            | Error::Connection(m)
            | Error::Transport(m)
            | Error::Storage(m)
            | Error::Serialization(m)
            | Error::Corruption(m)
            | Error::Config(m)
            | Error::InvalidPath(m)
            | Error::InvalidInput(m)
            | Error::Closed(m) => m.clone(),
        }
    }

    /// Rebuild an error received from another process
    pub fn from_kind(kind: ErrorKind, message: String) -> Self {
        match kind {
            ErrorKind::NotFound => Error::NotFound(message),
            ErrorKind::Encoding => Error::Encoding(message),
            ErrorKind::Connection => Error::Connection(message),
            ErrorKind::Transport => Error::Transport(message),
            ErrorKind::Storage => Error::Storage(message),
            ErrorKind::Io => Error::Io(io::Error::new(io::ErrorKind::Other, message)),
            ErrorKind::Serialization => Error::Serialization(message),
            ErrorKind::Corruption => Error::Corruption(message),
            ErrorKind::Config => Error::Config(message),
            ErrorKind::InvalidPath => Error::InvalidPath(message),
            ErrorKind::InvalidInput => Error::InvalidInput(message),
            ErrorKind::Closed => Error::Closed(message),
        }
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
