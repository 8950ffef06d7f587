//! Wire protocol between workers and the owning process
//!
//! ## Frame Format
//!
//! ```text
//! ┌──────────────────┬──────────────────────────────┐
//! │ Length (4 bytes) │ MessagePack payload          │
//! │ u32, big-endian  │ Envelope or Reply            │
//! └──────────────────┴──────────────────────────────┘
//! ```
//!
//! A connection carries strictly alternating request/reply frames: the client
//! writes one [`Envelope`], the server answers one [`Reply`]. Payloads larger
//! than the configured maximum are refused by the sender before anything is
//! written, and by the receiver as soon as it reads the length prefix.

use std::io::{self, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use nestdb_concurrency::{LockMode, LockTicket};
use nestdb_core::{Error, ErrorKind, Result};
use nestdb_storage::KeyRange;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Default upper bound on a single frame payload (16 MiB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Channel serving claims and releases of physical stores
pub const DIRECTORY_CHANNEL: &str = "directory";

/// Channel serving the owner's lock table
pub const LOCKS_CHANNEL: &str = "locks";

/// Channel name for the physical store `name`
pub fn store_channel(name: &str) -> String {
    format!("store/{}", name)
}

/// A request addressed to a named channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Target channel
    pub channel: String,
    /// Operation to run
    pub call: Call,
}

/// Operations a channel can be asked to perform
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Call {
    /// Directory: take a reference on a store, opening it if needed
    Claim {
        /// Database name
        name: String,
    },
    /// Directory: drop a reference taken by `Claim`
    Release {
        /// Database name
        name: String,
    },
    /// Store: read one key
    Get {
        /// Key
        key: String,
    },
    /// Store: write one key
    Put {
        /// Key
        key: String,
        /// Value bytes
        value: Vec<u8>,
    },
    /// Store: remove one key
    Delete {
        /// Key
        key: String,
    },
    /// Store: read several keys
    GetMany {
        /// Keys, in the order results should come back
        keys: Vec<String>,
    },
    /// Store: remove everything
    Clear,
    /// Store: one page of a range scan
    ScanPage {
        /// Bounds
        range: KeyRange,
        /// Maximum entries
        limit: usize,
    },
    /// Locks: block until granted
    Acquire {
        /// Lock name segments
        name: Vec<String>,
        /// Access mode
        mode: LockMode,
    },
    /// Locks: release a ticket
    Unlock {
        /// Ticket returned by `Acquire`
        ticket: LockTicket,
    },
    /// Any channel: liveness check
    Ping,
}

/// Result of a [`Call`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Reply {
    /// Completed with nothing to return
    Done,
    /// Channel bound to a claimed store
    Channel(String),
    /// Single optional value
    Value(Option<Vec<u8>>),
    /// Key-value entries
    Entries(Vec<(String, Vec<u8>)>),
    /// Granted lock
    Ticket(LockTicket),
    /// Answer to `Ping`
    Pong,
    /// The call failed on the owner
    Failed {
        /// Error classification
        kind: ErrorKind,
        /// Error message
        message: String,
    },
}

impl Reply {
    /// Wire form of an owner-side error
    pub fn failed(err: &Error) -> Self {
        Reply::Failed {
            kind: err.kind(),
            message: err.message(),
        }
    }

    /// Turn `Failed` back into an error
    pub fn into_result(self) -> Result<Reply> {
        match self {
            Reply::Failed { kind, message } => Err(Error::from_kind(kind, message)),
            other => Ok(other),
        }
    }
}

/// Error for a reply variant the caller did not expect
pub fn unexpected(reply: &Reply, wanted: &str) -> Error {
    Error::transport(format!("expected {} reply, got {:?}", wanted, reply))
}

/// Serialize `msg` into a complete frame, refusing payloads over `max`
pub fn encode_frame<T: Serialize>(msg: &T, max: usize) -> Result<Vec<u8>> {
    let payload = rmp_serde::to_vec(msg)?;
    check_len(payload.len(), max)?;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.write_u32::<BigEndian>(payload.len() as u32)?;
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Write a pre-encoded frame
pub fn send_frame<W: Write>(writer: &mut W, frame: &[u8]) -> Result<()> {
    writer
        .write_all(frame)
        .and_then(|_| writer.flush())
        .map_err(|e| Error::connection(format!("write failed: {}", e)))
}

/// Encode and write `msg`
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, msg: &T, max: usize) -> Result<()> {
    let frame = encode_frame(msg, max)?;
    send_frame(writer, &frame)
}

/// Read one frame. `Ok(None)` means the peer closed the connection between
/// frames.
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R, max: usize) -> Result<Option<T>> {
    let len = match reader.read_u32::<BigEndian>() {
        Ok(len) => len as usize,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::connection(format!("read failed: {}", e))),
    };
    check_len(len, max)?;
    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .map_err(|e| Error::connection(format!("connection closed mid-frame: {}", e)))?;
    Ok(Some(rmp_serde::from_slice(&payload)?))
}

fn check_len(len: usize, max: usize) -> Result<()> {
    if len > max || len > u32::MAX as usize {
        return Err(Error::transport(format!(
            "message of {} bytes exceeds limit of {} bytes",
            len, max
        )));
    }
    Ok(())
}
