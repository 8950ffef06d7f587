//! Secondary indexes over entity field paths
//!
//! Each index owns two stores:
//!
//! ```text
//! <repo>.index.<xxh3(path)>.forward    encoded value -> [id, id, ...]  (insertion order)
//! <repo>.index.<xxh3(path)>.backward   id -> encoded value
//!                                      ~state -> "ready" | "stale"
//! ```
//!
//! Lock names are scoped under `<repo>/index/<name>`; single-bucket
//! operations lock `<repo>/index/<name>/<encoded value>`, whole-index
//! operations (rebuild, clear, scans) lock the parent, so a rebuild excludes
//! every bucket operation without knowing the buckets.
//!
//! Read operations live here; mutations are on the crate-private
//! [`IndexMaintenance`](maintenance::IndexMaintenance) trait so only the
//! repository can change index contents.

mod maintenance;
pub mod predicate;

pub(crate) use maintenance::IndexMaintenance;

use std::fmt;
use std::sync::Arc;

use nestdb_concurrency::{LockManager, LockManagerExt, LockName};
use nestdb_core::encoding::encode_value;
use nestdb_core::{EntityId, Error, FieldPath, Result, Value};
use nestdb_multiplex::{Multiplexer, StoreRef};
use nestdb_storage::{KeyRange, Scan, StorageHandle};
use parking_lot::RwLock;
use xxhash_rust::xxh3::xxh3_64;

pub use predicate::{CompiledPredicate, Predicate};

/// Backward-map key holding the persisted state marker
pub(crate) const STATE_KEY: &str = "~state";
pub(crate) const STATE_READY: &[u8] = b"ready";
pub(crate) const STATE_STALE: &[u8] = b"stale";

/// Name and field path of an index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDefinition {
    name: String,
    path: FieldPath,
}

impl IndexDefinition {
    /// Index called `name` over the dot-separated `path`
    pub fn new(name: impl Into<String>, path: &str) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::invalid_input("index name must not be empty"));
        }
        Ok(Self {
            name,
            path: FieldPath::parse(path)?,
        })
    }

    /// Index name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Indexed field path
    pub fn path(&self) -> &FieldPath {
        &self.path
    }
}

/// In-memory lifecycle of an index in this process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    /// Persisted state not yet checked
    Uninitialized,
    /// A rebuild is running or did not finish
    Rebuilding,
    /// Forward and backward maps can be used
    Ready,
}

impl fmt::Display for IndexState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IndexState::Uninitialized => "uninitialized",
            IndexState::Rebuilding => "rebuilding",
            IndexState::Ready => "ready",
        };
        f.write_str(s)
    }
}

/// Store names for an index of repository `repo` over `path`
pub fn region_names(repo: &str, path: &FieldPath) -> (String, String) {
    let hash = xxh3_64(path.to_string().as_bytes());
    (
        format!("{}.index.{:016x}.forward", repo, hash),
        format!("{}.index.{:016x}.backward", repo, hash),
    )
}

/// One secondary index
pub struct Index {
    definition: IndexDefinition,
    forward: StoreRef,
    backward: StoreRef,
    locks: Arc<dyn LockManager>,
    lock_root: LockName,
    state: RwLock<IndexState>,
    scan_page: usize,
}

impl Index {
    /// Open the stores behind `definition` for repository `repo`.
    ///
    /// The index starts `Uninitialized`; the repository brings it to `Ready`.
    pub(crate) fn open(
        mux: &Multiplexer,
        repo: &str,
        definition: IndexDefinition,
        scan_page: usize,
    ) -> Result<Self> {
        let (forward_name, backward_name) = region_names(repo, &definition.path);
        let forward = mux.open(forward_name)?;
        let backward = mux.open(backward_name)?;
        let lock_root = LockName::new([repo, "index", definition.name.as_str()]);
        Ok(Self {
            definition,
            forward,
            backward,
            locks: mux.locks(),
            lock_root,
            state: RwLock::new(IndexState::Uninitialized),
            scan_page,
        })
    }

    /// Index name
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// Indexed field path
    pub fn path(&self) -> &FieldPath {
        &self.definition.path
    }

    /// Lifecycle state in this process
    pub fn state(&self) -> IndexState {
        *self.state.read()
    }

    /// Ids filed under exactly `value`, in insertion order
    pub fn lookup_exact(&self, value: &Value) -> Result<Vec<EntityId>> {
        let key = encode_value(value)?;
        self.lookup_key(&key)
    }

    /// Ids of entities where the path resolves to nothing
    pub fn lookup_missing(&self) -> Result<Vec<EntityId>> {
        self.lookup_key(nestdb_core::encoding::undefined_key())
    }

    /// Every indexed id, grouped by bucket in key order
    pub fn lookup_all(&self) -> Result<Vec<EntityId>> {
        self.locks.with_shared(&self.lock_root, || {
            self.require_ready()?;
            let mut ids = Vec::new();
            for entry in self.scan_forward(KeyRange::all()) {
                let (_, bytes) = entry?;
                ids.extend(decode_bucket(&bytes)?);
            }
            Ok(ids)
        })
    }

    /// Ids in every bucket satisfying `predicate`, buckets in key order
    pub fn query(&self, predicate: &Predicate) -> Result<Vec<EntityId>> {
        let compiled = predicate.compile()?;
        self.locks.with_shared(&self.lock_root, || {
            self.require_ready()?;
            let mut ids = Vec::new();
            for entry in self.scan_forward(compiled.scan_range().clone()) {
                let (key, bytes) = entry?;
                if compiled.matches(&key) {
                    ids.extend(decode_bucket(&bytes)?);
                }
            }
            Ok(ids)
        })
    }

    /// Number of distinct indexed values
    pub fn len(&self) -> Result<usize> {
        self.locks.with_shared(&self.lock_root, || {
            self.require_ready()?;
            let mut n = 0;
            for entry in self.scan_forward(KeyRange::all()) {
                entry?;
                n += 1;
            }
            Ok(n)
        })
    }

    /// True when nothing is indexed
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Release the index stores
    pub(crate) fn close(&self) -> Result<()> {
        self.forward.close()?;
        self.backward.close()
    }

    fn lookup_key(&self, key: &str) -> Result<Vec<EntityId>> {
        self.locks.with_shared(&self.bucket_lock(key), || {
            self.require_ready()?;
            self.read_bucket(key)
        })
    }

    fn bucket_lock(&self, key: &str) -> LockName {
        self.lock_root.child(key)
    }

    fn require_ready(&self) -> Result<()> {
        match self.state() {
            IndexState::Ready => Ok(()),
            other => Err(Error::invalid_input(format!(
                "index '{}' is {}",
                self.definition.name, other
            ))),
        }
    }

    fn scan_forward(&self, range: KeyRange) -> Scan<'_> {
        Scan::with_page_size(&self.forward, range, self.scan_page)
    }

    fn read_bucket(&self, key: &str) -> Result<Vec<EntityId>> {
        match self.forward.get(key)? {
            Some(bytes) => decode_bucket(&bytes),
            None => Ok(Vec::new()),
        }
    }
}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Index")
            .field("name", &self.definition.name)
            .field("path", &self.definition.path.to_string())
            .field("state", &self.state())
            .finish()
    }
}

fn decode_bucket(bytes: &[u8]) -> Result<Vec<EntityId>> {
    let ids: Vec<EntityId> = rmp_serde::from_slice(bytes)?;
    Ok(ids)
}

fn encode_bucket(ids: &[EntityId]) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec(ids)?)
}
