//! Index query predicates
//!
//! A [`Predicate`] is a conjunction of conditions on the indexed value. It is
//! compiled once into encoded keys; the range conditions then narrow the
//! forward-map scan and every bucket key in that range is tested against the
//! whole conjunction.

use nestdb_core::encoding::{encode_element, encode_value, split_array, EMPTY_ARRAY};
use nestdb_core::{Result, Value};
use nestdb_storage::KeyRange;
use rustc_hash::FxHashSet;

/// Conjunction of conditions on an indexed value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Predicate {
    gt: Option<Value>,
    gte: Option<Value>,
    lt: Option<Value>,
    lte: Option<Value>,
    eq: Option<Value>,
    ne: Option<Value>,
    any_of: Option<Vec<Value>>,
    none_of: Option<Vec<Value>>,
    includes: Option<Value>,
    excludes: Option<Value>,
    empty: bool,
    not_empty: bool,
}

impl Predicate {
    /// Matches every bucket
    pub fn new() -> Self {
        Self::default()
    }

    /// Greater than `v`
    pub fn gt(mut self, v: impl Into<Value>) -> Self {
        self.gt = Some(v.into());
        self
    }

    /// Greater than or equal to `v`
    pub fn gte(mut self, v: impl Into<Value>) -> Self {
        self.gte = Some(v.into());
        self
    }

    /// Less than `v`
    pub fn lt(mut self, v: impl Into<Value>) -> Self {
        self.lt = Some(v.into());
        self
    }

    /// Less than or equal to `v`
    pub fn lte(mut self, v: impl Into<Value>) -> Self {
        self.lte = Some(v.into());
        self
    }

    /// Exactly `v`
    pub fn eq(mut self, v: impl Into<Value>) -> Self {
        self.eq = Some(v.into());
        self
    }

    /// Anything but `v`
    pub fn ne(mut self, v: impl Into<Value>) -> Self {
        self.ne = Some(v.into());
        self
    }

    /// One of `values` (`in`)
    pub fn any_of<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.any_of = Some(values.into_iter().map(Into::into).collect());
        self
    }

    /// None of `values` (`nin`)
    pub fn none_of<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.none_of = Some(values.into_iter().map(Into::into).collect());
        self
    }

    /// Array value has an element equal to `v`
    pub fn includes(mut self, v: impl Into<Value>) -> Self {
        self.includes = Some(v.into());
        self
    }

    /// Array value has no element equal to `v`
    pub fn excludes(mut self, v: impl Into<Value>) -> Self {
        self.excludes = Some(v.into());
        self
    }

    /// Array value is empty
    pub fn empty(mut self) -> Self {
        self.empty = true;
        self
    }

    /// Array value is not empty
    pub fn not_empty(mut self) -> Self {
        self.not_empty = true;
        self
    }

    /// Encode every operand. Fails with `Encoding` on unindexable operands.
    pub fn compile(&self) -> Result<CompiledPredicate> {
        let encode_opt = |v: &Option<Value>| v.as_ref().map(encode_value).transpose();
        let encode_set = |vs: &Option<Vec<Value>>| -> Result<Option<FxHashSet<String>>> {
            vs.as_ref()
                .map(|vs| vs.iter().map(encode_value).collect())
                .transpose()
        };
        Ok(CompiledPredicate {
            range: KeyRange {
                gt: encode_opt(&self.gt)?,
                gte: encode_opt(&self.gte)?,
                lt: encode_opt(&self.lt)?,
                lte: encode_opt(&self.lte)?,
                eq: encode_opt(&self.eq)?,
                ne: encode_opt(&self.ne)?,
            },
            any_of: encode_set(&self.any_of)?,
            none_of: encode_set(&self.none_of)?,
            includes: self.includes.as_ref().map(encode_element).transpose()?,
            excludes: self.excludes.as_ref().map(encode_element).transpose()?,
            empty: self.empty,
            not_empty: self.not_empty,
        })
    }
}

/// Predicate with every operand encoded
#[derive(Debug, Clone)]
pub struct CompiledPredicate {
    range: KeyRange,
    any_of: Option<FxHashSet<String>>,
    none_of: Option<FxHashSet<String>>,
    includes: Option<String>,
    excludes: Option<String>,
    empty: bool,
    not_empty: bool,
}

impl CompiledPredicate {
    /// Bounds for the forward-map scan
    pub fn scan_range(&self) -> &KeyRange {
        &self.range
    }

    /// Test one bucket key against the whole conjunction
    pub fn matches(&self, key: &str) -> bool {
        if !self.range.contains(key) {
            return false;
        }
        if let Some(set) = &self.any_of {
            if !set.contains(key) {
                return false;
            }
        }
        if let Some(set) = &self.none_of {
            if set.contains(key) {
                return false;
            }
        }
        if self.empty && key != EMPTY_ARRAY {
            return false;
        }
        if self.not_empty && key == EMPTY_ARRAY {
            return false;
        }
        if self.includes.is_some() || self.excludes.is_some() {
            let elements = split_array(key);
            if let Some(target) = &self.includes {
                if !elements.contains(&target.as_str()) {
                    return false;
                }
            }
            if let Some(target) = &self.excludes {
                if elements.contains(&target.as_str()) {
                    return false;
                }
            }
        }
        true
    }
}
