//! Physical store factories
//!
//! A [`StorageBackend`] turns a database name into a physical
//! [`StorageHandle`]. Only the owning process ever calls it; everyone else
//! reaches the handle through the multiplexer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nestdb_core::Result;
use parking_lot::Mutex;

use crate::file::FileStore;
use crate::handle::StorageHandle;
use crate::memory::MemoryStore;

/// Extension of log files created by [`FileBackend`]
pub const FILE_EXTENSION: &str = "nest";

/// Creates physical handles by database name
pub trait StorageBackend: Send + Sync {
    /// Handle for `name`, not yet opened
    fn create(&self, name: &str) -> Result<Arc<dyn StorageHandle>>;

    /// Human-readable description for logs
    fn describe(&self) -> String;
}

/// Process-local stores that live as long as the backend
#[derive(Debug, Default)]
pub struct MemoryBackend {
    stores: Mutex<HashMap<String, Arc<MemoryStore>>>,
}

impl MemoryBackend {
    /// Create an empty backend
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryBackend {
    fn create(&self, name: &str) -> Result<Arc<dyn StorageHandle>> {
        let store = self
            .stores
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryStore::new(name)))
            .clone();
        Ok(store)
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// One append-log file per database name under a directory
#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    /// Backend rooted at `dir`; the directory is created on first open
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Root directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Log file path for `name`
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", file_stem(name), FILE_EXTENSION))
    }
}

impl StorageBackend for FileBackend {
    fn create(&self, name: &str) -> Result<Arc<dyn StorageHandle>> {
        Ok(Arc::new(FileStore::new(self.path_for(name))))
    }

    fn describe(&self) -> String {
        format!("file:{}", self.dir.display())
    }
}

/// File-system safe stem for a database name
fn file_stem(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_memory_backend_returns_same_store() {
        let backend = MemoryBackend::new();
        let a = backend.create("users.data").unwrap();
        a.open().unwrap();
        a.put("k", b"v").unwrap();
        a.close().unwrap();

        let b = backend.create("users.data").unwrap();
        b.open().unwrap();
        assert_eq!(b.get("k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_file_backend_paths_are_sanitized() {
        let backend = FileBackend::new("/tmp/x");
        assert_eq!(
            backend.path_for("users/data:1"),
            PathBuf::from("/tmp/x/users_data_1.nest")
        );
        assert_eq!(
            backend.path_for("users.index.ab12.forward"),
            PathBuf::from("/tmp/x/users.index.ab12.forward.nest")
        );
    }

    #[test]
    fn test_file_backend_creates_dir_on_open() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::new(dir.path().join("nested").join("db"));
        let handle = backend.create("users.data").unwrap();
        handle.open().unwrap();
        handle.put("a", b"1").unwrap();
        handle.close().unwrap();
        assert!(backend.path_for("users.data").exists());
    }
}
