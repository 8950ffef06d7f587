//! Cross-process storage multiplexer for nestdb
//!
//! Lets several processes share one logical database through a single
//! owning process:
//! - protocol: length-prefixed MessagePack frames and the call vocabulary
//! - channel: Unix socket server with named channel handlers, pooled client
//! - remote: `StorageHandle` and `LockManager` stubs that forward to the owner
//! - multiplexer: role selection, reference-counted opens, process-wide install

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod multiplexer;
pub mod protocol;
pub mod remote;
mod service;

pub use channel::{ChannelClient, ChannelHandler, ChannelServer};
pub use multiplexer::{Multiplexer, MultiplexerConfig, ProcessRole, StoreRef, OWNER_SOCKET_ENV};
pub use protocol::{Call, Envelope, Reply, DEFAULT_MAX_MESSAGE_SIZE};
pub use remote::{RemoteLockManager, RemoteStore};
