//! MemoryStore: BTreeMap-backed storage handle
//!
//! Uses:
//! - `BTreeMap<String, Vec<u8>>` for ordered key storage
//! - `parking_lot::RwLock` for thread-safe access
//!
//! Contents survive `close`/`open` cycles for the lifetime of the value, so a
//! [`MemoryBackend`](crate::backend::MemoryBackend) can hand the same store
//! out again after its last logical holder released it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use nestdb_core::{Error, Result};
use parking_lot::RwLock;

use crate::handle::StorageHandle;
use crate::range::KeyRange;

/// In-memory sorted store
#[derive(Debug)]
pub struct MemoryStore {
    name: String,
    data: RwLock<BTreeMap<String, Vec<u8>>>,
    open: AtomicBool,
}

impl MemoryStore {
    /// Create a closed, empty store
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: RwLock::new(BTreeMap::new()),
            open: AtomicBool::new(false),
        }
    }

    /// Store name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// True if the store holds no entries
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::Closed(self.name.clone()))
        }
    }
}

impl StorageHandle for MemoryStore {
    fn open(&self) -> Result<()> {
        self.open.store(true, Ordering::Release);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::Release);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        Ok(self.data.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.data.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.ensure_open()?;
        self.data.write().remove(key);
        Ok(())
    }

    fn get_many(&self, keys: &[String]) -> Result<Vec<(String, Vec<u8>)>> {
        self.ensure_open()?;
        let data = self.data.read();
        Ok(keys
            .iter()
            .filter_map(|k| data.get(k).map(|v| (k.clone(), v.clone())))
            .collect())
    }

    fn clear(&self) -> Result<()> {
        self.ensure_open()?;
        self.data.write().clear();
        Ok(())
    }

    fn scan_page(&self, range: &KeyRange, limit: usize) -> Result<Vec<(String, Vec<u8>)>> {
        self.ensure_open()?;
        Ok(scan_sorted(&self.data.read(), range, limit))
    }
}

/// Page of `map` entries within `range`
///
/// Shared with the file store, which keeps the same in-memory index.
pub(crate) fn scan_sorted(
    map: &BTreeMap<String, Vec<u8>>,
    range: &KeyRange,
    limit: usize,
) -> Vec<(String, Vec<u8>)> {
    if range.is_empty() || limit == 0 {
        return Vec::new();
    }
    map.range::<str, _>((range.lower(), range.upper()))
        .filter(|(k, _)| range.contains(k))
        .take(limit)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
