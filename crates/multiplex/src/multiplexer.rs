//! One physical owner per database, shared by every process
//!
//! ## Roles
//!
//! A process started with `NESTDB_OWNER_SOCKET` in its environment is a
//! worker of the owner listening on that socket; any other process is an
//! owner. The owner creates physical handles through its
//! [`StorageBackend`] and serves them over [`ChannelServer`]; workers reach
//! them through [`RemoteStore`] stubs.
//!
//! ## Reference counting
//!
//! Each process keeps a table of open names with a count. The physical open
//! (owner) or directory claim (worker) happens on 0→1, the physical close or
//! release on 1→0. A worker's claim is itself one reference in the owner's
//! table, so the physical store stays open while any process uses it.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use nestdb_concurrency::{LocalLockManager, LockManager};
use nestdb_core::{Error, Result};
use nestdb_storage::{KeyRange, StorageBackend, StorageHandle};
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::channel::{ChannelClient, ChannelServer};
use crate::protocol::{
    store_channel, Call, Reply, DEFAULT_MAX_MESSAGE_SIZE, DIRECTORY_CHANNEL, LOCKS_CHANNEL,
};
use crate::remote::{RemoteLockManager, RemoteStore};
use crate::service::{DirectoryService, LockService, StoreService};

/// Environment variable naming the owner socket of a spawned worker
pub const OWNER_SOCKET_ENV: &str = "NESTDB_OWNER_SOCKET";

static GLOBAL: OnceCell<Multiplexer> = OnceCell::new();

/// Which side of the channel this process is on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    /// Holds the physical handles and serves them
    Owner,
    /// Forwards every storage call to the owner
    Worker,
}

impl ProcessRole {
    /// Role implied by the environment, with the owner socket for workers
    pub fn detect() -> (ProcessRole, Option<PathBuf>) {
        match std::env::var_os(OWNER_SOCKET_ENV) {
            Some(socket) if !socket.is_empty() => (ProcessRole::Worker, Some(PathBuf::from(socket))),
            _ => (ProcessRole::Owner, None),
        }
    }
}

/// Endpoint settings
#[derive(Debug, Clone)]
pub struct MultiplexerConfig {
    /// Socket the owner listens on
    pub socket_path: PathBuf,
    /// Largest frame payload either side will send or accept
    pub max_message_size: usize,
}

impl MultiplexerConfig {
    /// Settings for `socket_path` with the default message limit
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

struct Slot {
    handle: Arc<dyn StorageHandle>,
    refs: usize,
}

enum Endpoint {
    Owner {
        server: ChannelServer,
        backend: Arc<dyn StorageBackend>,
        locks: Arc<LocalLockManager>,
    },
    Worker {
        client: Arc<ChannelClient>,
        locks: Arc<RemoteLockManager>,
    },
}

pub(crate) struct MuxInner {
    endpoint: Endpoint,
    slots: Mutex<HashMap<String, Slot>>,
}

impl MuxInner {
    fn role(&self) -> ProcessRole {
        match self.endpoint {
            Endpoint::Owner { .. } => ProcessRole::Owner,
            Endpoint::Worker { .. } => ProcessRole::Worker,
        }
    }

    /// Take a reference on `name`, opening it on the first one
    pub(crate) fn retain(&self, name: &str) -> Result<Arc<dyn StorageHandle>> {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(name) {
            slot.refs += 1;
            debug!(target: "nestdb::mux", name, refs = slot.refs, "Retained store");
            return Ok(Arc::clone(&slot.handle));
        }

        let handle: Arc<dyn StorageHandle> = match &self.endpoint {
            Endpoint::Owner { backend, .. } => backend.create(name)?,
            Endpoint::Worker { client, .. } => Arc::new(RemoteStore::new(name, Arc::clone(client))),
        };
        handle.open()?;
        if let Endpoint::Owner { server, .. } = &self.endpoint {
            server.register_handler(
                store_channel(name),
                Arc::new(StoreService::new(Arc::clone(&handle))),
            );
        }
        info!(target: "nestdb::mux", name, role = ?self.role(), "Opened store");
        slots.insert(
            name.to_string(),
            Slot {
                handle: Arc::clone(&handle),
                refs: 1,
            },
        );
        Ok(handle)
    }

    /// Drop a reference on `name`, closing it with the last one
    pub(crate) fn release(&self, name: &str) -> Result<()> {
        let mut slots = self.slots.lock();
        let slot = slots
            .get_mut(name)
            .ok_or_else(|| Error::Closed(format!("{} is not open", name)))?;
        slot.refs -= 1;
        if slot.refs > 0 {
            debug!(target: "nestdb::mux", name, refs = slot.refs, "Released store");
            return Ok(());
        }
        let Some(slot) = slots.remove(name) else {
            return Ok(());
        };
        if let Endpoint::Owner { server, .. } = &self.endpoint {
            server.unregister_handler(&store_channel(name));
        }
        slot.handle.close()?;
        info!(target: "nestdb::mux", name, role = ?self.role(), "Closed store");
        Ok(())
    }

    fn refs(&self, name: &str) -> usize {
        self.slots.lock().get(name).map_or(0, |slot| slot.refs)
    }
}

impl Drop for MuxInner {
    fn drop(&mut self) {
        if let Endpoint::Owner { server, .. } = &self.endpoint {
            server.shutdown();
        }
        for (name, slot) in self.slots.get_mut().drain() {
            warn!(target: "nestdb::mux", name = %name, refs = slot.refs, "Closing store still in use");
            if let Err(e) = slot.handle.close() {
                warn!(target: "nestdb::mux", name = %name, error = %e, "Close failed");
            }
        }
    }
}

/// Shares physical stores between threads and processes.
///
/// Cloning is cheap; clones share one endpoint and one open table.
#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<MuxInner>,
}

impl Multiplexer {
    /// Owner or worker, as the environment dictates.
    ///
    /// Workers connect to the socket named by `NESTDB_OWNER_SOCKET`; owners
    /// bind `config.socket_path`.
    pub fn start(backend: Arc<dyn StorageBackend>, config: MultiplexerConfig) -> Result<Self> {
        match ProcessRole::detect() {
            (ProcessRole::Worker, Some(socket)) => Self::worker(MultiplexerConfig {
                socket_path: socket,
                ..config
            }),
            _ => Self::owner(backend, config),
        }
    }

    /// Serve physical stores from `backend` on `config.socket_path`
    pub fn owner(backend: Arc<dyn StorageBackend>, config: MultiplexerConfig) -> Result<Self> {
        let server = ChannelServer::bind(&config.socket_path, config.max_message_size)?;
        let locks = Arc::new(LocalLockManager::new());
        info!(
            target: "nestdb::mux",
            socket = %config.socket_path.display(),
            backend = %backend.describe(),
            "Starting as owner"
        );
        let inner = Arc::new(MuxInner {
            endpoint: Endpoint::Owner {
                server,
                backend,
                locks: Arc::clone(&locks),
            },
            slots: Mutex::new(HashMap::new()),
        });
        if let Endpoint::Owner { server, .. } = &inner.endpoint {
            server.register_handler(
                DIRECTORY_CHANNEL,
                Arc::new(DirectoryService::new(Arc::downgrade(&inner))),
            );
            server.register_handler(LOCKS_CHANNEL, Arc::new(LockService::new(locks)));
        }
        Ok(Self { inner })
    }

    /// Forward to the owner listening on `config.socket_path`
    pub fn worker(config: MultiplexerConfig) -> Result<Self> {
        let client = Arc::new(ChannelClient::connect(
            &config.socket_path,
            config.max_message_size,
        )?);
        match client.call(DIRECTORY_CHANNEL, Call::Ping)? {
            Reply::Pong => {}
            other => return Err(crate::protocol::unexpected(&other, "Pong")),
        }
        info!(target: "nestdb::mux", socket = %config.socket_path.display(), "Starting as worker");
        let locks = Arc::new(RemoteLockManager::new(Arc::clone(&client)));
        Ok(Self {
            inner: Arc::new(MuxInner {
                endpoint: Endpoint::Worker { client, locks },
                slots: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Make `self` the process-wide instance; fails if one is installed
    pub fn install(self) -> Result<Self> {
        GLOBAL
            .set(self.clone())
            .map_err(|_| Error::invalid_input("a process-wide multiplexer is already installed"))?;
        Ok(self)
    }

    /// Process-wide instance, if installed
    pub fn global() -> Option<Self> {
        GLOBAL.get().cloned()
    }

    /// This process's role
    pub fn role(&self) -> ProcessRole {
        self.inner.role()
    }

    /// Owner socket
    pub fn socket_path(&self) -> &Path {
        match &self.inner.endpoint {
            Endpoint::Owner { server, .. } => server.socket_path(),
            Endpoint::Worker { client, .. } => client.socket_path(),
        }
    }

    /// Lock manager enforced in the owner process
    pub fn locks(&self) -> Arc<dyn LockManager> {
        match &self.inner.endpoint {
            Endpoint::Owner { locks, .. } => Arc::clone(locks) as Arc<dyn LockManager>,
            Endpoint::Worker { locks, .. } => Arc::clone(locks) as Arc<dyn LockManager>,
        }
    }

    /// Unopened reference to `name`
    pub fn store(&self, name: impl Into<String>) -> StoreRef {
        StoreRef {
            name: name.into(),
            mux: Arc::clone(&self.inner),
            handle: RwLock::new(None),
        }
    }

    /// Opened reference to `name`
    pub fn open(&self, name: impl Into<String>) -> Result<StoreRef> {
        let store = self.store(name);
        store.open()?;
        Ok(store)
    }

    /// References this process holds on `name`
    pub fn open_count(&self, name: &str) -> usize {
        self.inner.refs(name)
    }

    /// Command that starts `program` as a worker of this owner
    pub fn worker_command(&self, program: impl AsRef<OsStr>) -> Command {
        let mut command = Command::new(program);
        command.env(OWNER_SOCKET_ENV, self.socket_path());
        command
    }

    /// Stop serving workers. Owner only; a no-op for workers.
    pub fn shutdown(&self) {
        if let Endpoint::Owner { server, .. } = &self.inner.endpoint {
            server.shutdown();
        }
    }
}

/// One logical open of a store.
///
/// `open` takes a reference in the process table and `close` (or drop) gives
/// it back. Data operations on a closed reference fail with `Closed`.
pub struct StoreRef {
    name: String,
    mux: Arc<MuxInner>,
    handle: RwLock<Option<Arc<dyn StorageHandle>>>,
}

impl StoreRef {
    /// Database name
    pub fn name(&self) -> &str {
        &self.name
    }

    fn handle(&self) -> Result<Arc<dyn StorageHandle>> {
        self.handle
            .read()
            .clone()
            .ok_or_else(|| Error::Closed(self.name.clone()))
    }
}

impl StorageHandle for StoreRef {
    fn open(&self) -> Result<()> {
        let mut handle = self.handle.write();
        if handle.is_none() {
            *handle = Some(self.mux.retain(&self.name)?);
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut handle = self.handle.write();
        if handle.take().is_some() {
            self.mux.release(&self.name)?;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.handle.read().is_some()
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.handle()?.get(key)
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.handle()?.put(key, value)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.handle()?.delete(key)
    }

    fn get_many(&self, keys: &[String]) -> Result<Vec<(String, Vec<u8>)>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        self.handle()?.get_many(keys)
    }

    fn clear(&self) -> Result<()> {
        self.handle()?.clear()
    }

    fn scan_page(&self, range: &KeyRange, limit: usize) -> Result<Vec<(String, Vec<u8>)>> {
        self.handle()?.scan_page(range, limit)
    }
}

impl Drop for StoreRef {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(target: "nestdb::mux", name = %self.name, error = %e, "Failed to close store on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nestdb_storage::MemoryBackend;
    use tempfile::TempDir;

    fn owner(dir: &TempDir) -> (Multiplexer, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let mux = Multiplexer::owner(
            backend.clone(),
            MultiplexerConfig::new(dir.path().join("owner.sock")),
        )
        .unwrap();
        (mux, backend)
    }

    #[test]
    fn test_physical_open_once_per_name() {
        let dir = TempDir::new().unwrap();
        let (mux, backend) = owner(&dir);
        let physical = backend.create("users.data").unwrap();

        let a = mux.open("users.data").unwrap();
        let b = mux.open("users.data").unwrap();
        assert_eq!(mux.open_count("users.data"), 2);
        assert!(physical.is_open());

        a.put("k", b"v").unwrap();
        assert_eq!(b.get("k").unwrap(), Some(b"v".to_vec()));

        a.close().unwrap();
        assert!(physical.is_open());
        assert!(matches!(a.get("k"), Err(Error::Closed(_))));

        b.close().unwrap();
        assert_eq!(mux.open_count("users.data"), 0);
        assert!(!physical.is_open());
    }

    #[test]
    fn test_close_is_idempotent_per_ref() {
        let dir = TempDir::new().unwrap();
        let (mux, _) = owner(&dir);
        let a = mux.open("x").unwrap();
        let _b = mux.open("x").unwrap();
        a.close().unwrap();
        a.close().unwrap();
        assert_eq!(mux.open_count("x"), 1);
    }

    #[test]
    fn test_drop_releases_reference() {
        let dir = TempDir::new().unwrap();
        let (mux, _) = owner(&dir);
        {
            let _a = mux.open("x").unwrap();
            assert_eq!(mux.open_count("x"), 1);
        }
        assert_eq!(mux.open_count("x"), 0);
    }

    #[test]
    fn test_store_channel_registered_while_open() {
        let dir = TempDir::new().unwrap();
        let (mux, _) = owner(&dir);
        let a = mux.open("x").unwrap();
        match &mux.inner.endpoint {
            Endpoint::Owner { server, .. } => assert!(server.has_handler("store/x")),
            Endpoint::Worker { .. } => unreachable!(),
        }
        a.close().unwrap();
        match &mux.inner.endpoint {
            Endpoint::Owner { server, .. } => assert!(!server.has_handler("store/x")),
            Endpoint::Worker { .. } => unreachable!(),
        }
    }

    #[test]
    fn test_worker_command_sets_socket_env() {
        let dir = TempDir::new().unwrap();
        let (mux, _) = owner(&dir);
        let command = mux.worker_command("/bin/true");
        let env: Vec<_> = command.get_envs().collect();
        assert!(env
            .iter()
            .any(|(k, v)| *k == OWNER_SOCKET_ENV && v.map(Path::new) == Some(mux.socket_path())));
    }

    #[test]
    fn test_role_is_owner_without_env() {
        let dir = TempDir::new().unwrap();
        let (mux, _) = owner(&dir);
        assert_eq!(mux.role(), ProcessRole::Owner);
    }
}
