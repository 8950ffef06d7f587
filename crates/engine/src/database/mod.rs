//! Database struct and open logic
//!
//! A [`Database`] is a data directory plus the multiplexer that serves it.
//! The first process to open a directory becomes the owner: it holds the
//! physical stores and listens on the owner socket. Processes started with
//! `NESTDB_OWNER_SOCKET` (see [`Multiplexer::worker_command`]) become workers
//! and forward everything to the owner.

mod registry;

pub use registry::OPEN_DATABASES;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use nestdb_core::{Error, Result};
use nestdb_multiplex::{Multiplexer, MultiplexerConfig, ProcessRole};
use nestdb_storage::{FileBackend, MemoryBackend, StorageBackend};
use tracing::info;

use crate::config::{BackendKind, NestConfig, CONFIG_FILE_NAME};
use crate::index::IndexDefinition;
use crate::repository::Repository;

/// Embedded document database rooted at one directory
///
/// # Example
///
/// ```text
/// use nestdb_engine::{Database, IndexDefinition};
///
/// let db = Database::open("/path/to/data")?;
/// let users = db.repository("users", vec![IndexDefinition::new("age", "info.age")?])?;
/// ```
pub struct Database {
    data_dir: PathBuf,
    config: NestConfig,
    mux: Multiplexer,
}

impl Database {
    /// Open the database at `path`, reading `nestdb.toml` from it.
    ///
    /// A commented default config is written on first open.
    ///
    /// # Errors
    ///
    /// Fails if the directory cannot be created, the config is invalid, or
    /// the owner socket cannot be bound or reached.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Arc<Self>> {
        let data_dir = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir)?;

        let config_path = data_dir.join(CONFIG_FILE_NAME);
        NestConfig::write_default_if_missing(&config_path)?;
        let cfg = NestConfig::from_file(&config_path)?;

        Self::open_internal(&data_dir, cfg, false)
    }

    /// Open the database at `path` with an explicit configuration.
    ///
    /// When this process becomes the owner the config is written to
    /// `nestdb.toml` so later `open` calls pick it up.
    pub fn open_with_config<P: AsRef<Path>>(path: P, cfg: NestConfig) -> Result<Arc<Self>> {
        Self::open_internal(path.as_ref(), cfg, true)
    }

    fn open_internal(path: &Path, cfg: NestConfig, persist_config: bool) -> Result<Arc<Self>> {
        cfg.validate()?;
        std::fs::create_dir_all(path)?;
        let canonical_path = path.canonicalize()?;

        // held for the whole open so one thread binds the socket per directory
        let mut registry = OPEN_DATABASES.lock();
        if let Some(db) = registry.get(&canonical_path).and_then(|weak| weak.upgrade()) {
            info!(target: "nestdb::db", path = ?canonical_path, "Returning existing database instance");
            return Ok(db);
        }

        let mux_config = MultiplexerConfig {
            socket_path: cfg.socket_path_in(&canonical_path),
            max_message_size: cfg.max_message_size,
        };
        let mux = match ProcessRole::detect() {
            (ProcessRole::Worker, Some(socket)) => Multiplexer::worker(MultiplexerConfig {
                socket_path: socket,
                ..mux_config
            })?,
            _ => {
                let backend: Arc<dyn StorageBackend> = match cfg.backend_kind()? {
                    BackendKind::File => Arc::new(FileBackend::new(&canonical_path)),
                    BackendKind::Memory => Arc::new(MemoryBackend::new()),
                };
                let mux = Multiplexer::owner(backend, mux_config)?;
                if persist_config {
                    cfg.write_to_file(&canonical_path.join(CONFIG_FILE_NAME))?;
                }
                mux
            }
        };

        info!(
            target: "nestdb::db",
            path = ?canonical_path,
            role = ?mux.role(),
            backend = %cfg.backend,
            "Opened database"
        );
        let db = Arc::new(Database {
            data_dir: canonical_path.clone(),
            config: cfg,
            mux,
        });
        registry.insert(canonical_path, Arc::downgrade(&db));
        Ok(db)
    }

    /// Open repository `name` with the given indexes.
    ///
    /// Index definitions are not persisted; pass the same list on every open.
    /// Indexes not yet built are built from the stored entities.
    pub fn repository(
        &self,
        name: &str,
        indexes: Vec<IndexDefinition>,
    ) -> Result<Repository> {
        Repository::open(&self.mux, name, indexes, self.config.scan_page_size)
    }

    /// Multiplexer serving this database
    pub fn multiplexer(&self) -> &Multiplexer {
        &self.mux
    }

    /// Whether this process owns the physical stores
    pub fn role(&self) -> ProcessRole {
        self.mux.role()
    }

    /// Configuration in effect
    pub fn config(&self) -> &NestConfig {
        &self.config
    }

    /// Canonical data directory
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Owner socket workers connect to
    pub fn socket_path(&self) -> &Path {
        self.mux.socket_path()
    }

    /// Stop serving workers. Repositories in this process keep working
    /// against the owner's stores; workers fail with `Connection`.
    pub fn shutdown(&self) -> Result<()> {
        if self.role() != ProcessRole::Owner {
            return Err(Error::invalid_input("only the owner can shut down a database"));
        }
        self.mux.shutdown();
        info!(target: "nestdb::db", path = ?self.data_dir, "Stopped serving workers");
        Ok(())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("data_dir", &self.data_dir)
            .field("role", &self.role())
            .field("backend", &self.config.backend)
            .finish()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        let mut registry = OPEN_DATABASES.lock();
        // a newer instance may already be registered under the same path
        if registry
            .get(&self.data_dir)
            .is_some_and(|weak| weak.strong_count() == 0)
        {
            registry.remove(&self.data_dir);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nestdb_core::{document_from_json, Value};
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_open_writes_default_config() {
        let dir = TempDir::new().unwrap();
        let db = Database::open(dir.path()).unwrap();
        assert!(dir.path().join(CONFIG_FILE_NAME).exists());
        assert_eq!(db.role(), ProcessRole::Owner);
        assert_eq!(db.config(), &NestConfig::default());
        assert_eq!(db.socket_path(), db.data_dir().join("nestdb.sock"));
    }

    #[test]
    fn test_same_path_returns_same_instance() {
        let dir = TempDir::new().unwrap();
        let a = Database::open_with_config(dir.path(), NestConfig::memory()).unwrap();
        let b = Database::open(dir.path()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_reopen_after_drop_binds_again() {
        let dir = TempDir::new().unwrap();
        let first = Database::open_with_config(dir.path(), NestConfig::memory()).unwrap();
        drop(first);
        let second = Database::open_with_config(dir.path(), NestConfig::memory()).unwrap();
        assert_eq!(second.role(), ProcessRole::Owner);
    }

    #[test]
    fn test_open_with_config_persists_it() {
        let dir = TempDir::new().unwrap();
        let cfg = NestConfig {
            scan_page_size: 8,
            ..NestConfig::memory()
        };
        let db = Database::open_with_config(dir.path(), cfg.clone()).unwrap();
        assert_eq!(db.config(), &cfg);
        let on_disk = NestConfig::from_file(&dir.path().join(CONFIG_FILE_NAME)).unwrap();
        assert_eq!(on_disk, cfg);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let dir = TempDir::new().unwrap();
        let cfg = NestConfig {
            backend: "tape".into(),
            ..NestConfig::default()
        };
        assert!(matches!(
            Database::open_with_config(dir.path(), cfg),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_file_backend_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let id = {
            let db = Database::open(dir.path()).unwrap();
            let users = db
                .repository("users", vec![IndexDefinition::new("name", "name").unwrap()])
                .unwrap();
            let id = users.insert(document_from_json(json!({"name": "Ada"}))).unwrap();
            users.close().unwrap();
            id
        };

        let db = Database::open(dir.path()).unwrap();
        let users = db
            .repository("users", vec![IndexDefinition::new("name", "name").unwrap()])
            .unwrap();
        let found = users.find("name", &Value::from("Ada")).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id(), &id);
    }
}
