//! Dot-separated field paths into documents
//!
//! A path such as `info.age` walks object keys; a numeric segment such as
//! `tags.0` indexes into an array. Traversal never fails: a missing key, an
//! out-of-range index, or a scalar in the middle of the path resolves to
//! [`Resolved::Absent`], which stays distinct from a present `Null`.

use crate::error::{Error, Result};
use crate::value::{Document, Value};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Outcome of resolving a [`FieldPath`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Resolved<'a> {
    /// Path does not lead to a value
    Absent,
    /// Value found at the path (may be `Null`)
    Present(&'a Value),
}

impl<'a> Resolved<'a> {
    /// The value, if present
    pub fn value(self) -> Option<&'a Value> {
        match self {
            Resolved::Absent => None,
            Resolved::Present(v) => Some(v),
        }
    }

    /// True for [`Resolved::Absent`]
    pub fn is_absent(self) -> bool {
        matches!(self, Resolved::Absent)
    }
}

/// Parsed dot-separated field path
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    /// Parse a dot-separated path; empty segments are rejected
    pub fn parse(path: &str) -> Result<Self> {
        if path.is_empty() {
            return Err(Error::InvalidPath("empty path".to_string()));
        }
        let segments: Vec<String> = path.split('.').map(str::to_string).collect();
        if let Some(pos) = segments.iter().position(|s| s.is_empty()) {
            return Err(Error::InvalidPath(format!(
                "empty segment at position {} in '{}'",
                pos, path
            )));
        }
        Ok(FieldPath { segments })
    }

    /// Path segments in traversal order
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// First segment
    pub fn head(&self) -> &str {
        &self.segments[0]
    }

    /// Resolve the path against a document
    pub fn resolve<'a>(&self, doc: &'a Document) -> Resolved<'a> {
        let (first, rest) = match self.segments.split_first() {
            Some(split) => split,
            None => return Resolved::Absent,
        };
        let mut current = match doc.get(first) {
            Some(v) => v,
            None => return Resolved::Absent,
        };
        for segment in rest {
            let next = match current {
                Value::Object(map) => map.get(segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            };
            current = match next {
                Some(v) => v,
                None => return Resolved::Absent,
            };
        }
        Resolved::Present(current)
    }
}

impl FromStr for FieldPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        FieldPath::parse(s)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}
