//! Entities and their identifiers
//!
//! An entity is a document plus a system-assigned id. The id is also visible
//! inside the document under [`ID_FIELD`], so `_id` can be indexed and
//! resolved like any other field path.

use crate::error::{Error, Result};
use crate::path::{FieldPath, Resolved};
use crate::value::{Document, Value};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reserved field carrying the entity id
pub const ID_FIELD: &str = "_id";

/// Length of a hex-encoded id
pub const ID_LEN: usize = 32;

/// 128-bit random identifier, lowercase hex
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Generate a fresh random id
    ///
    /// Collisions are not checked; 128 random bits make them negligible.
    pub fn generate() -> Self {
        EntityId(format!("{:032x}", rand::random::<u128>()))
    }

    /// Validate and wrap an existing id string
    pub fn parse(s: &str) -> Result<Self> {
        let valid = s.len() == ID_LEN
            && s
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if valid {
            Ok(EntityId(s.to_string()))
        } else {
            Err(Error::invalid_input(format!("malformed entity id '{}'", s)))
        }
    }

    /// Id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for EntityId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Persisted document plus its id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    id: EntityId,
    data: Document,
}

impl Entity {
    /// Wrap a document, stamping the id into [`ID_FIELD`]
    pub fn new(id: EntityId, mut data: Document) -> Self {
        data.insert(ID_FIELD.to_string(), Value::String(id.0.clone()));
        Entity { id, data }
    }

    /// Entity id
    pub fn id(&self) -> &EntityId {
        &self.id
    }

    /// Full document, including [`ID_FIELD`]
    pub fn data(&self) -> &Document {
        &self.data
    }

    /// Top-level field lookup
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }

    /// Resolve a field path against the document
    pub fn resolve(&self, path: &FieldPath) -> Resolved<'_> {
        path.resolve(&self.data)
    }

    /// Shallow merge: top-level keys of `partial` replace existing keys wholesale.
    ///
    /// Keys absent from `partial` are kept. [`ID_FIELD`] cannot be overwritten.
    pub fn merge(&mut self, partial: Document) {
        for (key, value) in partial {
            if key == ID_FIELD {
                continue;
            }
            self.data.insert(key, value);
        }
    }

    /// Split into id and document
    pub fn into_parts(self) -> (EntityId, Document) {
        (self.id, self.data)
    }
}
