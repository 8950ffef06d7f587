//! Repositories: entity collections with secondary indexes
//!
//! A repository named `users` stores each entity in the `users.data` region
//! under its id, and keeps one [`Index`] per definition. All stores are
//! reached through the multiplexer, so owner and worker processes see one
//! logical repository.
//!
//! # Lock names
//!
//! | Name                      | Taken by                                  |
//! |---------------------------|-------------------------------------------|
//! | `<repo>/docs`             | `get`, `get_all`, `count`, `clear`, `remap_indexes`, open |
//! | `<repo>/docs/#insert`     | `insert`                                  |
//! | `<repo>/docs/<id>`        | `get_one`, `contains`, `edit`, `delete`   |
//!
//! Document locks are always taken before index locks, and index-backed
//! reads release the index lock before fetching entities.

use std::fmt;
use std::sync::Arc;

use nestdb_concurrency::{LockManager, LockManagerExt, LockName};
use nestdb_core::{Document, Entity, EntityId, Error, Result, Value};
use nestdb_multiplex::{Multiplexer, StoreRef};
use nestdb_storage::{KeyRange, Scan, StorageHandle};
use rustc_hash::FxHashSet;
use tracing::{debug, info, warn};

use crate::index::{Index, IndexDefinition, IndexMaintenance, Predicate};

const INSERT_SEGMENT: &str = "#insert";

/// Name of the data region of repository `name`
pub fn data_region(name: &str) -> String {
    format!("{}.data", name)
}

/// Collection of entities with secondary indexes
pub struct Repository {
    name: String,
    data: StoreRef,
    indexes: Vec<Index>,
    locks: Arc<dyn LockManager>,
    docs_lock: LockName,
    insert_lock: LockName,
    scan_page: usize,
}

impl Repository {
    /// Open repository `name` with the given indexes.
    ///
    /// Indexes whose persisted marker is not `ready` are rebuilt from the
    /// data region while the whole repository is held exclusively.
    pub fn open(
        mux: &Multiplexer,
        name: &str,
        definitions: Vec<IndexDefinition>,
        scan_page: usize,
    ) -> Result<Self> {
        if name.is_empty() || name.contains('.') {
            return Err(Error::invalid_input(format!(
                "repository name '{}' must be non-empty and contain no '.'",
                name
            )));
        }
        let mut seen = FxHashSet::default();
        for def in &definitions {
            if !seen.insert(def.name().to_string()) {
                return Err(Error::invalid_input(format!(
                    "duplicate index '{}' on repository '{}'",
                    def.name(),
                    name
                )));
            }
        }

        let data = mux.open(data_region(name))?;
        let indexes = definitions
            .into_iter()
            .map(|def| Index::open(mux, name, def, scan_page))
            .collect::<Result<Vec<_>>>()?;
        let docs_lock = LockName::new([name, "docs"]);
        let repo = Repository {
            name: name.to_string(),
            data,
            insert_lock: docs_lock.child(INSERT_SEGMENT),
            docs_lock,
            indexes,
            locks: mux.locks(),
            scan_page,
        };

        repo.locks.with_exclusive(&repo.docs_lock, || {
            let snapshot = || repo.snapshot();
            for index in &repo.indexes {
                index.ensure_ready(&snapshot)?;
            }
            Ok(())
        })?;
        info!(
            target: "nestdb::repo",
            repo = %repo.name,
            indexes = repo.indexes.len(),
            "Opened repository"
        );
        Ok(repo)
    }

    /// Repository name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read-only handle of index `name`
    pub fn index(&self, name: &str) -> Option<&Index> {
        self.indexes.iter().find(|index| index.name() == name)
    }

    /// All indexes, in definition order
    pub fn indexes(&self) -> &[Index] {
        &self.indexes
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Store `data` as a new entity and return its id.
    ///
    /// Every indexed value is encoded before anything is written, so an
    /// unindexable value fails with `Encoding` and leaves no trace.
    pub fn insert(&self, data: Document) -> Result<EntityId> {
        self.locks.with_exclusive(&self.insert_lock, || {
            let entity = Entity::new(EntityId::generate(), data);
            let keys = self.encode_all(&entity)?;
            self.write(&entity)?;
            self.maintain_all(|i, index| index.add_encoded(entity.id(), &keys[i]))?;
            debug!(target: "nestdb::repo", repo = %self.name, id = %entity.id(), "Inserted entity");
            let (id, _) = entity.into_parts();
            Ok(id)
        })
    }

    /// Shallow-merge `partial` into entity `id` and return the result.
    ///
    /// # Errors
    ///
    /// `NotFound` if `id` does not exist; `Encoding` if a merged value cannot
    /// be indexed (nothing is written in that case).
    pub fn edit(&self, id: &EntityId, partial: Document) -> Result<Entity> {
        self.locks.with_exclusive(&self.entity_lock(id), || {
            let mut entity = self
                .read(id)?
                .ok_or_else(|| Error::NotFound(id.to_string()))?;
            entity.merge(partial);
            let keys = self.encode_all(&entity)?;
            self.write(&entity)?;
            self.maintain_all(|i, index| {
                index.remove(id)?;
                index.add_encoded(id, &keys[i])
            })?;
            debug!(target: "nestdb::repo", repo = %self.name, id = %id, "Edited entity");
            Ok(entity)
        })
    }

    /// Remove entity `id`.
    ///
    /// # Errors
    ///
    /// `NotFound` if `id` does not exist.
    pub fn delete(&self, id: &EntityId) -> Result<()> {
        self.locks.with_exclusive(&self.entity_lock(id), || {
            if self.data.get(id.as_str())?.is_none() {
                return Err(Error::NotFound(id.to_string()));
            }
            self.data.delete(id.as_str())?;
            self.maintain_all(|_, index| index.remove(id))?;
            debug!(target: "nestdb::repo", repo = %self.name, id = %id, "Deleted entity");
            Ok(())
        })
    }

    /// Remove every entity and empty every index
    pub fn clear(&self) -> Result<()> {
        self.locks.with_exclusive(&self.docs_lock, || {
            self.data.clear()?;
            for index in &self.indexes {
                index.clear()?;
            }
            info!(target: "nestdb::repo", repo = %self.name, "Cleared repository");
            Ok(())
        })
    }

    /// Rebuild every index from the current contents
    pub fn remap_indexes(&self) -> Result<()> {
        self.locks.with_exclusive(&self.docs_lock, || {
            let entities = self.snapshot()?;
            for index in &self.indexes {
                index.rebuild(&entities)?;
            }
            Ok(())
        })
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Entity `id`, if present
    pub fn get_one(&self, id: &EntityId) -> Result<Option<Entity>> {
        self.locks
            .with_shared(&self.entity_lock(id), || self.read(id))
    }

    /// Entities for `ids` in request order; missing ids are omitted
    pub fn get(&self, ids: &[EntityId]) -> Result<Vec<Entity>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = ids.iter().map(|id| id.as_str().to_string()).collect();
        self.locks.with_shared(&self.docs_lock, || {
            self.data
                .get_many(&keys)?
                .into_iter()
                .map(|(key, bytes)| decode_entity(&key, &bytes))
                .collect()
        })
    }

    /// Every entity, in id order
    pub fn get_all(&self) -> Result<Vec<Entity>> {
        self.locks.with_shared(&self.docs_lock, || self.snapshot())
    }

    /// Number of stored entities
    pub fn count(&self) -> Result<usize> {
        self.locks.with_shared(&self.docs_lock, || {
            let mut n = 0;
            for entry in Scan::with_page_size(&self.data, KeyRange::all(), self.scan_page) {
                entry?;
                n += 1;
            }
            Ok(n)
        })
    }

    /// Whether entity `id` exists
    pub fn contains(&self, id: &EntityId) -> Result<bool> {
        self.locks.with_shared(&self.entity_lock(id), || {
            Ok(self.data.get(id.as_str())?.is_some())
        })
    }

    /// Entities whose value at the index path equals `value`
    pub fn find(&self, index: &str, value: &Value) -> Result<Vec<Entity>> {
        let ids = self.require_index(index)?.lookup_exact(value)?;
        self.get(&ids)
    }

    /// Entities where the index path resolves to nothing
    pub fn find_missing(&self, index: &str) -> Result<Vec<Entity>> {
        let ids = self.require_index(index)?.lookup_missing()?;
        self.get(&ids)
    }

    /// Every indexed entity, grouped by value in key order
    pub fn find_all(&self, index: &str) -> Result<Vec<Entity>> {
        let ids = self.require_index(index)?.lookup_all()?;
        self.get(&ids)
    }

    /// Entities whose indexed value satisfies `predicate`
    pub fn query(&self, index: &str, predicate: &Predicate) -> Result<Vec<Entity>> {
        let ids = self.require_index(index)?.query(predicate)?;
        self.get(&ids)
    }

    /// Release every store; further calls fail with `Closed`
    pub fn close(&self) -> Result<()> {
        for index in &self.indexes {
            index.close()?;
        }
        self.data.close()?;
        debug!(target: "nestdb::repo", repo = %self.name, "Closed repository");
        Ok(())
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn entity_lock(&self, id: &EntityId) -> LockName {
        self.docs_lock.child(id.as_str())
    }

    fn require_index(&self, name: &str) -> Result<&Index> {
        self.index(name).ok_or_else(|| {
            Error::invalid_input(format!(
                "repository '{}' has no index '{}'",
                self.name, name
            ))
        })
    }

    fn read(&self, id: &EntityId) -> Result<Option<Entity>> {
        self.data
            .get(id.as_str())?
            .map(|bytes| decode_entity(id.as_str(), &bytes))
            .transpose()
    }

    fn write(&self, entity: &Entity) -> Result<()> {
        let bytes = rmp_serde::to_vec(entity.data())?;
        self.data.put(entity.id().as_str(), &bytes)
    }

    fn encode_all(&self, entity: &Entity) -> Result<Vec<String>> {
        self.indexes
            .iter()
            .map(|index| index.encode_for(entity))
            .collect()
    }

    /// Caller holds a document lock
    fn snapshot(&self) -> Result<Vec<Entity>> {
        Scan::with_page_size(&self.data, KeyRange::all(), self.scan_page)
            .map(|entry| {
                let (key, bytes) = entry?;
                decode_entity(&key, &bytes)
            })
            .collect()
    }

    /// Apply `op` to every index after the primary write has landed.
    ///
    /// A failing index is flagged stale and the first error is returned once
    /// every index has been attempted.
    fn maintain_all<F>(&self, op: F) -> Result<()>
    where
        F: Fn(usize, &Index) -> Result<()>,
    {
        let mut first = None;
        for (i, index) in self.indexes.iter().enumerate() {
            if let Err(e) = op(i, index) {
                warn!(
                    target: "nestdb::repo",
                    repo = %self.name,
                    index = index.name(),
                    error = %e,
                    "Index maintenance failed"
                );
                if let Err(flag_err) = index.mark_stale() {
                    warn!(
                        target: "nestdb::repo",
                        repo = %self.name,
                        index = index.name(),
                        error = %flag_err,
                        "Could not flag index stale"
                    );
                }
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

impl fmt::Debug for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository")
            .field("name", &self.name)
            .field("indexes", &self.indexes)
            .finish()
    }
}

fn decode_entity(key: &str, bytes: &[u8]) -> Result<Entity> {
    let id = EntityId::parse(key)
        .map_err(|_| Error::Corruption(format!("data region holds non-id key '{}'", key)))?;
    let data: Document = rmp_serde::from_slice(bytes)?;
    Ok(Entity::new(id, data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::tests::{fixture, Fixture};
    use nestdb_core::document_from_json;
    use serde_json::json;

    fn doc(json: serde_json::Value) -> Document {
        document_from_json(json)
    }

    fn users(fx: &Fixture) -> Repository {
        Repository::open(
            &fx.mux,
            "users",
            vec![
                IndexDefinition::new("name", "name").unwrap(),
                IndexDefinition::new("age", "info.age").unwrap(),
            ],
            4,
        )
        .unwrap()
    }

    fn ids(entities: &[Entity]) -> Vec<EntityId> {
        entities.iter().map(|e| e.id().clone()).collect()
    }

    #[test]
    fn test_insert_and_get_one() {
        let fx = fixture();
        let repo = users(&fx);
        let id = repo.insert(doc(json!({"name": "David", "info": {"age": 35}}))).unwrap();
        let got = repo.get_one(&id).unwrap().unwrap();
        assert_eq!(got.id(), &id);
        assert_eq!(got.get("name"), Some(&Value::from("David")));
        assert_eq!(got.get("_id"), Some(&Value::from(id.as_str())));
        assert_eq!(repo.count().unwrap(), 1);
        assert!(repo.contains(&id).unwrap());
    }

    #[test]
    fn test_unindexable_insert_writes_nothing() {
        let fx = fixture();
        let repo = users(&fx);
        let mut data = Document::new();
        data.insert("name".into(), Value::Bytes(vec![0xff]));
        let err = repo.insert(data).unwrap_err();
        assert!(matches!(err, Error::Encoding(_)));
        assert_eq!(repo.count().unwrap(), 0);
        assert!(repo.index("name").unwrap().is_empty().unwrap());
    }

    #[test]
    fn test_get_omits_missing_and_keeps_order() {
        let fx = fixture();
        let repo = users(&fx);
        let a = repo.insert(doc(json!({"name": "a"}))).unwrap();
        let b = repo.insert(doc(json!({"name": "b"}))).unwrap();
        let ghost = EntityId::generate();
        let got = repo.get(&[b.clone(), ghost, a.clone()]).unwrap();
        assert_eq!(ids(&got), vec![b, a]);
        assert!(repo.get(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_edit_moves_index_entry() {
        let fx = fixture();
        let repo = users(&fx);
        let id = repo.insert(doc(json!({"name": "John", "info": {"age": 30}}))).unwrap();

        let edited = repo.edit(&id, doc(json!({"info": {"age": 31}}))).unwrap();
        assert_eq!(edited.get("name"), Some(&Value::from("John")));

        assert!(repo.find("age", &Value::from(30)).unwrap().is_empty());
        assert_eq!(ids(&repo.find("age", &Value::from(31)).unwrap()), vec![id.clone()]);
        assert_eq!(ids(&repo.find("name", &Value::from("John")).unwrap()), vec![id]);
    }

    #[test]
    fn test_edit_and_delete_missing_are_not_found() {
        let fx = fixture();
        let repo = users(&fx);
        let ghost = EntityId::generate();
        assert!(matches!(repo.edit(&ghost, Document::new()), Err(Error::NotFound(_))));
        assert!(matches!(repo.delete(&ghost), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_edit_with_unindexable_value_keeps_old_entity() {
        let fx = fixture();
        let repo = users(&fx);
        let id = repo.insert(doc(json!({"name": "Keep"}))).unwrap();
        let mut partial = Document::new();
        partial.insert("name".into(), Value::Bytes(vec![1]));
        assert!(matches!(repo.edit(&id, partial), Err(Error::Encoding(_))));
        let still = repo.get_one(&id).unwrap().unwrap();
        assert_eq!(still.get("name"), Some(&Value::from("Keep")));
        assert_eq!(repo.find("name", &Value::from("Keep")).unwrap().len(), 1);
    }

    #[test]
    fn test_delete_unindexes() {
        let fx = fixture();
        let repo = users(&fx);
        let a = repo.insert(doc(json!({"name": "x"}))).unwrap();
        let b = repo.insert(doc(json!({"name": "x"}))).unwrap();
        repo.delete(&a).unwrap();
        assert_eq!(repo.get_one(&a).unwrap(), None);
        assert_eq!(ids(&repo.find("name", &Value::from("x")).unwrap()), vec![b]);
    }

    #[test]
    fn test_missing_and_query() {
        let fx = fixture();
        let repo = users(&fx);
        let old = repo.insert(doc(json!({"name": "old", "info": {"age": 70}}))).unwrap();
        let young = repo.insert(doc(json!({"name": "young", "info": {"age": 20}}))).unwrap();
        let unknown = repo.insert(doc(json!({"name": "unknown"}))).unwrap();

        assert_eq!(ids(&repo.find_missing("age").unwrap()), vec![unknown]);
        assert_eq!(
            ids(&repo.query("age", &Predicate::new().gt(18).lt(65)).unwrap()),
            vec![young]
        );
        assert_eq!(ids(&repo.query("age", &Predicate::new().gte(65)).unwrap()), vec![old]);
        assert_eq!(repo.find_all("name").unwrap().len(), 3);
        assert!(matches!(
            repo.find("nope", &Value::Null),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_clear_empties_rows_and_indexes() {
        let fx = fixture();
        let repo = users(&fx);
        repo.insert(doc(json!({"name": "a"}))).unwrap();
        repo.clear().unwrap();
        assert_eq!(repo.count().unwrap(), 0);
        assert!(repo.find_all("name").unwrap().is_empty());
        repo.insert(doc(json!({"name": "b"}))).unwrap();
        assert_eq!(repo.find_all("name").unwrap().len(), 1);
    }

    #[test]
    fn test_new_index_over_existing_data_is_built_on_open() {
        let fx = fixture();
        let repo = users(&fx);
        let id = repo.insert(doc(json!({"name": "a", "city": "Oslo"}))).unwrap();

        let wider = Repository::open(
            &fx.mux,
            "users",
            vec![IndexDefinition::new("city", "city").unwrap()],
            4,
        )
        .unwrap();
        assert_eq!(ids(&wider.find("city", &Value::from("Oslo")).unwrap()), vec![id]);
    }

    #[test]
    fn test_remap_restores_consistency() {
        let fx = fixture();
        let repo = users(&fx);
        let id = repo.insert(doc(json!({"name": "a"}))).unwrap();
        // a write that bypasses the indexes
        let mut entity = repo.get_one(&id).unwrap().unwrap();
        entity.merge(doc(json!({"name": "b"})));
        repo.write(&entity).unwrap();
        assert_eq!(repo.find("name", &Value::from("a")).unwrap().len(), 1);

        repo.remap_indexes().unwrap();
        assert!(repo.find("name", &Value::from("a")).unwrap().is_empty());
        assert_eq!(repo.find("name", &Value::from("b")).unwrap().len(), 1);
    }

    #[test]
    fn test_open_rejects_duplicate_index_names() {
        let fx = fixture();
        let err = Repository::open(
            &fx.mux,
            "users",
            vec![
                IndexDefinition::new("n", "name").unwrap(),
                IndexDefinition::new("n", "other").unwrap(),
            ],
            4,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(Repository::open(&fx.mux, "a.b", vec![], 4).is_err());
    }

    #[test]
    fn test_closed_repository_fails() {
        let fx = fixture();
        let repo = users(&fx);
        repo.close().unwrap();
        assert!(matches!(repo.count(), Err(Error::Closed(_))));
    }
}
