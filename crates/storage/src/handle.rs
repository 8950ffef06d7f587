//! Storage handle abstraction and lazy scans
//!
//! [`StorageHandle`] is the narrow interface every physical key-value store
//! implements: sorted string keys, opaque byte values. Upper layers (the
//! multiplexer, indexes, repositories) only ever talk to this trait, so an
//! in-process store and a proxy to another process are interchangeable.
//!
//! Thread safety: all methods must be safe to call concurrently from
//! multiple threads (requires Send + Sync).

use std::collections::VecDeque;

use nestdb_core::Result;

use crate::range::KeyRange;

/// Entries fetched per page by [`Scan`] unless configured otherwise
pub const DEFAULT_SCAN_PAGE: usize = 256;

/// Sorted key-value store
pub trait StorageHandle: Send + Sync {
    /// Open the physical store
    fn open(&self) -> Result<()>;

    /// Close the physical store
    fn close(&self) -> Result<()>;

    /// Whether the store is currently open
    fn is_open(&self) -> bool;

    /// Value for `key`, or `None`
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Insert or overwrite `key`
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Remove `key`; absent keys are not an error
    fn delete(&self, key: &str) -> Result<()>;

    /// Entries for `keys` in request order; absent keys are omitted
    fn get_many(&self, keys: &[String]) -> Result<Vec<(String, Vec<u8>)>>;

    /// Remove every entry
    fn clear(&self) -> Result<()>;

    /// Up to `limit` entries within `range`, in ascending key order
    fn scan_page(&self, range: &KeyRange, limit: usize) -> Result<Vec<(String, Vec<u8>)>>;

    /// Lazy scan over `range` with the default page size
    fn scan(&self, range: KeyRange) -> Scan<'_>
    where
        Self: Sized,
    {
        Scan::new(self, range)
    }
}

impl dyn StorageHandle + '_ {
    /// Lazy scan over `range` with the default page size
    pub fn scan(&self, range: KeyRange) -> Scan<'_> {
        Scan::new(self, range)
    }
}

/// Restartable lazy sequence over a range scan.
///
/// Entries are pulled from the handle one page at a time, so a scan over a
/// remote store never needs a single unbounded message. `restart` rewinds to
/// the beginning of the range; `close` drops buffered entries and ends the
/// sequence.
pub struct Scan<'a> {
    handle: &'a dyn StorageHandle,
    range: KeyRange,
    cursor: KeyRange,
    page_size: usize,
    buffer: VecDeque<(String, Vec<u8>)>,
    exhausted: bool,
}

impl<'a> Scan<'a> {
    /// Scan `range` on `handle` with the default page size
    pub fn new(handle: &'a dyn StorageHandle, range: KeyRange) -> Self {
        Self::with_page_size(handle, range, DEFAULT_SCAN_PAGE)
    }

    /// Scan `range` on `handle`, fetching `page_size` entries per round trip
    pub fn with_page_size(handle: &'a dyn StorageHandle, range: KeyRange, page_size: usize) -> Self {
        let exhausted = range.is_empty();
        Scan {
            handle,
            cursor: range.clone(),
            range,
            page_size: page_size.max(1),
            buffer: VecDeque::new(),
            exhausted,
        }
    }

    /// Rewind to the start of the range
    pub fn restart(&mut self) {
        self.cursor = self.range.clone();
        self.buffer.clear();
        self.exhausted = self.range.is_empty();
    }

    /// Release buffered entries and end the sequence
    pub fn close(&mut self) {
        self.buffer.clear();
        self.exhausted = true;
    }

    fn fill(&mut self) -> Result<()> {
        let page = self.handle.scan_page(&self.cursor, self.page_size)?;
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        if let Some((last, _)) = page.last() {
            self.cursor = self.range.resume_after(last);
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl Iterator for Scan<'_> {
    type Item = Result<(String, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fill() {
                self.close();
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}
