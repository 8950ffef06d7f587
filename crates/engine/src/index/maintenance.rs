//! Index mutations, reachable only from the repository

use std::collections::BTreeMap;

use nestdb_concurrency::LockManagerExt;
use nestdb_core::encoding::encode;
use nestdb_core::{Entity, EntityId, Result};
use nestdb_storage::StorageHandle;
use tracing::{debug, info, warn};

use super::{
    encode_bucket, Index, IndexState, STATE_KEY, STATE_READY, STATE_STALE,
};

/// Mutating side of an [`Index`].
///
/// Callers must not hold a lock on the same index while calling these.
pub(crate) trait IndexMaintenance {
    /// Encoded value of `entity` at the index path
    fn encode_for(&self, entity: &Entity) -> Result<String>;

    /// File `entity` under its current value
    fn add(&self, entity: &Entity) -> Result<()>;

    /// File `id` under a precomputed encoded value
    fn add_encoded(&self, id: &EntityId, key: &str) -> Result<()>;

    /// Remove `id` from whatever bucket holds it; absent ids are a no-op
    fn remove(&self, id: &EntityId) -> Result<()>;

    /// Replace both maps with the contents derived from `entities`
    fn rebuild(&self, entities: &[Entity]) -> Result<()>;

    /// Empty both maps, leaving the index ready
    fn clear(&self) -> Result<()>;

    /// Rebuild from `snapshot` unless the persisted marker says ready
    fn ensure_ready(&self, snapshot: &dyn Fn() -> Result<Vec<Entity>>) -> Result<()>;

    /// Persist the stale marker so the next open rebuilds
    fn mark_stale(&self) -> Result<()>;
}

impl IndexMaintenance for Index {
    fn encode_for(&self, entity: &Entity) -> Result<String> {
        encode(entity.resolve(&self.definition.path))
    }

    fn add(&self, entity: &Entity) -> Result<()> {
        let key = self.encode_for(entity)?;
        self.add_encoded(entity.id(), &key)
    }

    fn add_encoded(&self, id: &EntityId, key: &str) -> Result<()> {
        self.locks.with_exclusive(&self.bucket_lock(key), || {
            self.require_ready()?;
            self.file_under(id, key)
        })
    }

    fn remove(&self, id: &EntityId) -> Result<()> {
        loop {
            let key = match self.backward.get(id.as_str())? {
                Some(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                None => return Ok(()),
            };
            let moved = self.locks.with_exclusive(&self.bucket_lock(&key), || {
                self.require_ready()?;
                // the entry may have moved between the unlocked read and the lock
                match self.backward.get(id.as_str())? {
                    None => return Ok(false),
                    Some(current) if current != key.as_bytes() => return Ok(true),
                    Some(_) => {}
                }
                let mut ids = self.read_bucket(&key)?;
                ids.retain(|existing| existing != id);
                if ids.is_empty() {
                    self.forward.delete(&key)?;
                } else {
                    self.forward.put(&key, &encode_bucket(&ids)?)?;
                }
                self.backward.delete(id.as_str())?;
                Ok(false)
            })?;
            if !moved {
                return Ok(());
            }
            debug!(target: "nestdb::index", index = %self.definition.name, id = %id, "Backward entry moved, retrying remove");
        }
    }

    fn rebuild(&self, entities: &[Entity]) -> Result<()> {
        self.locks.with_exclusive(&self.lock_root, || {
            *self.state.write() = IndexState::Rebuilding;
            info!(
                target: "nestdb::index",
                index = %self.definition.name,
                entities = entities.len(),
                "Rebuilding index"
            );
            let result = self.rebuild_locked(entities);
            *self.state.write() = match result {
                Ok(()) => IndexState::Ready,
                Err(_) => IndexState::Uninitialized,
            };
            result
        })
    }

    fn clear(&self) -> Result<()> {
        self.locks.with_exclusive(&self.lock_root, || {
            self.forward.clear()?;
            self.backward.clear()?;
            self.backward.put(STATE_KEY, STATE_READY)?;
            *self.state.write() = IndexState::Ready;
            debug!(target: "nestdb::index", index = %self.definition.name, "Cleared index");
            Ok(())
        })
    }

    fn ensure_ready(&self, snapshot: &dyn Fn() -> Result<Vec<Entity>>) -> Result<()> {
        let marker = self.backward.get(STATE_KEY)?;
        if marker.as_deref() == Some(STATE_READY) {
            *self.state.write() = IndexState::Ready;
            return Ok(());
        }
        if marker.is_some() {
            warn!(target: "nestdb::index", index = %self.definition.name, "Index flagged stale");
        }
        let entities = snapshot()?;
        self.rebuild(&entities)
    }

    fn mark_stale(&self) -> Result<()> {
        warn!(target: "nestdb::index", index = %self.definition.name, "Marking index stale");
        self.backward.put(STATE_KEY, STATE_STALE)
    }
}

impl Index {
    /// Append `id` to bucket `key` and point backward[id] at it.
    /// Caller holds the bucket or the whole index.
    fn file_under(&self, id: &EntityId, key: &str) -> Result<()> {
        let mut ids = self.read_bucket(key)?;
        if !ids.contains(id) {
            ids.push(id.clone());
            self.forward.put(key, &encode_bucket(&ids)?)?;
        }
        self.backward.put(id.as_str(), key.as_bytes())
    }

    fn rebuild_locked(&self, entities: &[Entity]) -> Result<()> {
        // encode everything first so an unindexable value leaves the maps untouched
        let mut buckets: BTreeMap<String, Vec<EntityId>> = BTreeMap::new();
        let mut backward = Vec::with_capacity(entities.len());
        for entity in entities {
            let key = self.encode_for(entity)?;
            let ids = buckets.entry(key.clone()).or_default();
            if !ids.contains(entity.id()) {
                ids.push(entity.id().clone());
            }
            backward.push((entity.id().clone(), key));
        }

        self.backward.put(STATE_KEY, STATE_STALE)?;
        self.forward.clear()?;
        self.backward.clear()?;
        for (key, ids) in &buckets {
            self.forward.put(key, &encode_bucket(ids)?)?;
        }
        for (id, key) in &backward {
            self.backward.put(id.as_str(), key.as_bytes())?;
        }
        self.backward.put(STATE_KEY, STATE_READY)?;
        info!(
            target: "nestdb::index",
            index = %self.definition.name,
            buckets = buckets.len(),
            "Index ready"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::tests::{entity, fixture, ready_index};
    use crate::index::{IndexDefinition, Predicate};
    use nestdb_core::{Entity, Value};
    use nestdb_storage::{KeyRange, Scan};
    use serde_json::json;

    fn dump(index: &Index) -> (Vec<(String, Vec<u8>)>, Vec<(String, Vec<u8>)>) {
        let forward = Scan::new(&index.forward, KeyRange::all())
            .collect::<Result<Vec<_>>>()
            .unwrap();
        let backward = Scan::new(&index.backward, KeyRange::all())
            .collect::<Result<Vec<_>>>()
            .unwrap();
        (forward, backward)
    }

    #[test]
    fn test_add_is_idempotent_per_id() {
        let fx = fixture();
        let index = ready_index(&fx, "name", "name");
        let e = entity(json!({"name": "David"}));
        index.add(&e).unwrap();
        index.add(&e).unwrap();
        assert_eq!(index.lookup_exact(&"David".into()).unwrap(), vec![e.id().clone()]);
    }

    #[test]
    fn test_remove_twice_is_harmless() {
        let fx = fixture();
        let index = ready_index(&fx, "name", "name");
        let a = entity(json!({"name": "David"}));
        let b = entity(json!({"name": "David"}));
        let c = entity(json!({"name": "John"}));
        for e in [&a, &b, &c] {
            index.add(e).unwrap();
        }

        index.remove(a.id()).unwrap();
        let after_first = dump(&index);
        index.remove(a.id()).unwrap();
        assert_eq!(dump(&index), after_first);

        assert_eq!(index.lookup_exact(&"David".into()).unwrap(), vec![b.id().clone()]);
        assert_eq!(index.lookup_exact(&"John".into()).unwrap(), vec![c.id().clone()]);
    }

    #[test]
    fn test_remove_last_id_deletes_bucket() {
        let fx = fixture();
        let index = ready_index(&fx, "name", "name");
        let a = entity(json!({"name": "Solo"}));
        index.add(&a).unwrap();
        assert_eq!(index.len().unwrap(), 1);
        index.remove(a.id()).unwrap();
        assert_eq!(index.len().unwrap(), 0);
        assert_eq!(index.forward.get("Solo").unwrap(), None);
    }

    #[test]
    fn test_rebuild_twice_yields_identical_maps() {
        let fx = fixture();
        let index = ready_index(&fx, "tags", "tags");
        let entities = vec![
            entity(json!({"tags": ["a", "b"]})),
            entity(json!({"tags": []})),
            entity(json!({"tags": ["a", "b"]})),
            entity(json!({"other": 1})),
        ];
        index.rebuild(&entities).unwrap();
        let first = dump(&index);
        index.rebuild(&entities).unwrap();
        assert_eq!(dump(&index), first);
        assert_eq!(index.state(), IndexState::Ready);
        assert_eq!(index.query(&Predicate::new().empty()).unwrap(), vec![entities[1].id().clone()]);
        assert_eq!(index.query(&Predicate::new().includes("b")).unwrap().len(), 2);
    }

    #[test]
    fn test_rebuild_with_unencodable_value_leaves_maps() {
        let fx = fixture();
        let index = ready_index(&fx, "blob", "blob");
        let ok = entity(json!({"blob": "text"}));
        index.add(&ok).unwrap();
        let before = dump(&index);

        let mut bad_doc = nestdb_core::Document::new();
        bad_doc.insert("blob".into(), Value::Bytes(vec![1, 2]));
        let bad = nestdb_core::Entity::new(EntityId::generate(), bad_doc);
        let err = index.rebuild(&[ok.clone(), bad]).unwrap_err();
        assert!(matches!(err, nestdb_core::Error::Encoding(_)));
        assert_eq!(dump(&index), before);
        assert_eq!(index.state(), IndexState::Uninitialized);
    }

    #[test]
    fn test_clear_empties_and_stays_ready() {
        let fx = fixture();
        let index = ready_index(&fx, "name", "name");
        index.add(&entity(json!({"name": "x"}))).unwrap();
        index.clear().unwrap();
        assert!(index.is_empty().unwrap());
        assert_eq!(index.state(), IndexState::Ready);
        assert_eq!(index.backward.get(STATE_KEY).unwrap(), Some(STATE_READY.to_vec()));
    }

    #[test]
    fn test_ensure_ready_honours_marker() {
        let fx = fixture();
        let e = entity(json!({"age": 5}));
        let snapshot_calls = std::cell::Cell::new(0);
        let snapshot = || -> Result<Vec<Entity>> {
            snapshot_calls.set(snapshot_calls.get() + 1);
            Ok(vec![e.clone()])
        };

        let def = IndexDefinition::new("age", "age").unwrap();
        let index = Index::open(&fx.mux, "users", def.clone(), 8).unwrap();
        index.ensure_ready(&snapshot).unwrap();
        assert_eq!(snapshot_calls.get(), 1);
        assert_eq!(index.lookup_exact(&Value::from(5)).unwrap(), vec![e.id().clone()]);

        // a second instance over the same stores trusts the ready marker
        let again = Index::open(&fx.mux, "users", def.clone(), 8).unwrap();
        again.ensure_ready(&snapshot).unwrap();
        assert_eq!(snapshot_calls.get(), 1);

        again.mark_stale().unwrap();
        let third = Index::open(&fx.mux, "users", def, 8).unwrap();
        third.ensure_ready(&snapshot).unwrap();
        assert_eq!(snapshot_calls.get(), 2);
    }

    #[test]
    fn test_remove_after_refile() {
        let fx = fixture();
        let index = ready_index(&fx, "n", "n");
        let e = entity(json!({"n": 1}));
        index.add(&e).unwrap();
        index.remove(e.id()).unwrap();

        let (id, mut doc) = e.into_parts();
        doc.insert("n".into(), Value::from(2));
        let refiled = nestdb_core::Entity::new(id, doc);
        index.add(&refiled).unwrap();
        assert_eq!(index.lookup_exact(&Value::from(1)).unwrap(), Vec::<EntityId>::new());
        assert_eq!(index.lookup_exact(&Value::from(2)).unwrap(), vec![refiled.id().clone()]);

        index.remove(refiled.id()).unwrap();
        assert!(index.lookup_all().unwrap().is_empty());
        assert_eq!(index.backward.get(refiled.id().as_str()).unwrap(), None);
    }
}
