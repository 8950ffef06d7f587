//! FileStore: append-log storage handle
//!
//! Every mutation is appended to a single log file; the full key space is
//! kept in a `BTreeMap` rebuilt by replaying the log on open.
//!
//! # Record Layout
//!
//! ```text
//! ┌─────────────────┬─────────┬──────────────┬─────────┬───────────┬──────────┐
//! │ Length (4 bytes)│ Op (1)  │ Key len (4)  │ Key     │ Value     │ CRC32 (4)│
//! └─────────────────┴─────────┴──────────────┴─────────┴───────────┴──────────┘
//! ```
//!
//! The length field covers everything after itself, CRC included. The CRC
//! covers op, key length, key and value. A torn or corrupt tail is truncated
//! on open; everything before it is kept.
//!
//! The store is exclusive-open: a `.lock` file next to the log is locked with
//! `fs2` for as long as the store is open, so a second process opening the
//! same file fails instead of interleaving writes.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use crc32fast::Hasher;
use fs2::FileExt;
use nestdb_core::{Error, Result};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::handle::StorageHandle;
use crate::memory::scan_sorted;
use crate::range::KeyRange;

const OP_PUT: u8 = 1;
const OP_DELETE: u8 = 2;

/// Minimum dead records before compaction is considered
const COMPACT_MIN_GARBAGE: usize = 1024;

/// Append-log backed sorted store
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    state: RwLock<Option<OpenLog>>,
}

#[derive(Debug)]
struct OpenLog {
    data: BTreeMap<String, Vec<u8>>,
    file: File,
    lock: File,
    /// Records in the log that no longer describe a live entry
    garbage: usize,
}

impl FileStore {
    /// Store backed by the log at `path`; nothing is touched until `open`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: RwLock::new(None),
        }
    }

    /// Log file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    fn closed(&self) -> Error {
        Error::Closed(self.path.display().to_string())
    }

    /// Rewrite the log with only live entries
    pub fn compact(&self) -> Result<()> {
        let mut guard = self.state.write();
        let log = guard.as_mut().ok_or_else(|| self.closed())?;
        self.rewrite(log)
    }

    fn rewrite(&self, log: &mut OpenLog) -> Result<()> {
        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".compact");
        let tmp_path = PathBuf::from(tmp_name);
        {
            let mut tmp = File::create(&tmp_path)?;
            let mut buf = Vec::new();
            for (key, value) in &log.data {
                buf.extend_from_slice(&encode_record(OP_PUT, key, value)?);
            }
            tmp.write_all(&buf)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        log.file = OpenOptions::new().append(true).read(true).open(&self.path)?;
        let before = log.garbage;
        log.garbage = 0;
        info!(
            target: "nestdb::storage",
            path = %self.path.display(),
            live = log.data.len(),
            dropped = before,
            "Compacted log"
        );
        Ok(())
    }

    fn append(&self, log: &mut OpenLog, op: u8, key: &str, value: &[u8]) -> Result<()> {
        let record = encode_record(op, key, value)?;
        log.file.write_all(&record)?;
        log.file.flush()?;
        Ok(())
    }

    /// Compact once dead records outnumber live ones; `log.data` must
    /// already reflect the last appended record
    fn maybe_compact(&self, log: &mut OpenLog) -> Result<()> {
        if log.garbage >= COMPACT_MIN_GARBAGE && log.garbage > log.data.len() {
            self.rewrite(log)?;
        }
        Ok(())
    }
}

impl StorageHandle for FileStore {
    fn open(&self) -> Result<()> {
        let mut guard = self.state.write();
        if guard.is_some() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(self.lock_path())?;
        lock.try_lock_exclusive().map_err(|_| {
            Error::storage(format!(
                "store at '{}' is already in use by another process",
                self.path.display()
            ))
        })?;

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .append(true)
            .open(&self.path)?;
        let mut bytes = Vec::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut bytes)?;

        let replay = replay(&bytes);
        if replay.valid_len < bytes.len() {
            warn!(
                target: "nestdb::storage",
                path = %self.path.display(),
                kept = replay.valid_len,
                dropped = bytes.len() - replay.valid_len,
                "Truncating torn log tail"
            );
            file.set_len(replay.valid_len as u64)?;
        }

        info!(
            target: "nestdb::storage",
            path = %self.path.display(),
            entries = replay.data.len(),
            "Opened file store"
        );
        *guard = Some(OpenLog {
            data: replay.data,
            file,
            lock,
            garbage: replay.garbage,
        });
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut guard = self.state.write();
        if let Some(mut log) = guard.take() {
            log.file.sync_all()?;
            log.lock.unlock()?;
            debug!(target: "nestdb::storage", path = %self.path.display(), "Closed file store");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state.read().is_some()
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let guard = self.state.read();
        let log = guard.as_ref().ok_or_else(|| self.closed())?;
        Ok(log.data.get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut guard = self.state.write();
        let log = guard.as_mut().ok_or_else(|| self.closed())?;
        self.append(log, OP_PUT, key, value)?;
        if log.data.insert(key.to_string(), value.to_vec()).is_some() {
            log.garbage += 1;
        }
        self.maybe_compact(log)
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut guard = self.state.write();
        let log = guard.as_mut().ok_or_else(|| self.closed())?;
        if !log.data.contains_key(key) {
            return Ok(());
        }
        self.append(log, OP_DELETE, key, &[])?;
        log.data.remove(key);
        // the tombstone and the record it shadows are both dead
        log.garbage += 2;
        self.maybe_compact(log)
    }

    fn get_many(&self, keys: &[String]) -> Result<Vec<(String, Vec<u8>)>> {
        let guard = self.state.read();
        let log = guard.as_ref().ok_or_else(|| self.closed())?;
        Ok(keys
            .iter()
            .filter_map(|k| log.data.get(k).map(|v| (k.clone(), v.clone())))
            .collect())
    }

    fn clear(&self) -> Result<()> {
        let mut guard = self.state.write();
        let log = guard.as_mut().ok_or_else(|| self.closed())?;
        log.file.set_len(0)?;
        log.data.clear();
        log.garbage = 0;
        Ok(())
    }

    fn scan_page(&self, range: &KeyRange, limit: usize) -> Result<Vec<(String, Vec<u8>)>> {
        let guard = self.state.read();
        let log = guard.as_ref().ok_or_else(|| self.closed())?;
        Ok(scan_sorted(&log.data, range, limit))
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        if let Err(e) = StorageHandle::close(self) {
            warn!(target: "nestdb::storage", error = %e, "Failed to close file store on drop");
        }
    }
}

fn encode_record(op: u8, key: &str, value: &[u8]) -> Result<Vec<u8>> {
    let key_len = u32::try_from(key.len())
        .map_err(|_| Error::invalid_input("key longer than 4 GiB"))?;
    let mut body = Vec::with_capacity(5 + key.len() + value.len());
    body.push(op);
    body.write_u32::<LittleEndian>(key_len)?;
    body.extend_from_slice(key.as_bytes());
    body.extend_from_slice(value);

    let crc = compute_crc(&body);
    let total = u32::try_from(body.len() + 4)
        .map_err(|_| Error::invalid_input("record larger than 4 GiB"))?;
    let mut record = Vec::with_capacity(8 + body.len());
    record.write_u32::<LittleEndian>(total)?;
    record.extend_from_slice(&body);
    record.write_u32::<LittleEndian>(crc)?;
    Ok(record)
}

fn compute_crc(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

struct Replay {
    data: BTreeMap<String, Vec<u8>>,
    valid_len: usize,
    garbage: usize,
}

/// Apply every intact record; stop at the first torn or corrupt one
fn replay(bytes: &[u8]) -> Replay {
    let mut data = BTreeMap::new();
    let mut garbage = 0;
    let mut pos = 0;
    while let Some((op, key, value, consumed)) = decode_record(&bytes[pos..]) {
        match op {
            OP_PUT => {
                if data.insert(key, value).is_some() {
                    garbage += 1;
                }
            }
            _ => {
                data.remove(&key);
                garbage += 2;
            }
        }
        pos += consumed;
    }
    Replay {
        data,
        valid_len: pos,
        garbage,
    }
}

fn decode_record(bytes: &[u8]) -> Option<(u8, String, Vec<u8>, usize)> {
    if bytes.len() < 4 {
        return None;
    }
    let total = LittleEndian::read_u32(&bytes[0..4]) as usize;
    // op (1) + key len (4) + crc (4)
    if total < 9 || bytes.len() < 4 + total {
        return None;
    }
    let body = &bytes[4..4 + total - 4];
    let stored_crc = LittleEndian::read_u32(&bytes[4 + total - 4..4 + total]);
    if compute_crc(body) != stored_crc {
        return None;
    }
    let op = body[0];
    if op != OP_PUT && op != OP_DELETE {
        return None;
    }
    let key_len = LittleEndian::read_u32(&body[1..5]) as usize;
    if body.len() < 5 + key_len {
        return None;
    }
    let key = String::from_utf8(body[5..5 + key_len].to_vec()).ok()?;
    let value = body[5 + key_len..].to_vec();
    Some((op, key, value, 4 + total))
}
