//! Key bounds for range scans
//!
//! A [`KeyRange`] is a conjunction of optional bounds on the raw stored key:
//! `gt`, `gte`, `lt`, `lte`, `eq`, `ne`. When several lower (or upper) bounds
//! are given, the strictest one wins.

use serde::{Deserialize, Serialize};
use std::ops::Bound;

/// Bounds on raw keys, all optional
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    /// Keys strictly greater than this
    pub gt: Option<String>,
    /// Keys greater than or equal to this
    pub gte: Option<String>,
    /// Keys strictly less than this
    pub lt: Option<String>,
    /// Keys less than or equal to this
    pub lte: Option<String>,
    /// Exactly this key
    pub eq: Option<String>,
    /// Any key but this one
    pub ne: Option<String>,
}

impl KeyRange {
    /// Unbounded range
    pub fn all() -> Self {
        Self::default()
    }

    /// Set the exclusive lower bound
    pub fn gt(mut self, key: impl Into<String>) -> Self {
        self.gt = Some(key.into());
        self
    }

    /// Set the inclusive lower bound
    pub fn gte(mut self, key: impl Into<String>) -> Self {
        self.gte = Some(key.into());
        self
    }

    /// Set the exclusive upper bound
    pub fn lt(mut self, key: impl Into<String>) -> Self {
        self.lt = Some(key.into());
        self
    }

    /// Set the inclusive upper bound
    pub fn lte(mut self, key: impl Into<String>) -> Self {
        self.lte = Some(key.into());
        self
    }

    /// Restrict to a single key
    pub fn eq(mut self, key: impl Into<String>) -> Self {
        self.eq = Some(key.into());
        self
    }

    /// Exclude a single key
    pub fn ne(mut self, key: impl Into<String>) -> Self {
        self.ne = Some(key.into());
        self
    }

    /// Check a key against every bound
    pub fn contains(&self, key: &str) -> bool {
        self.gt.as_deref().map_or(true, |b| key > b)
            && self.gte.as_deref().map_or(true, |b| key >= b)
            && self.lt.as_deref().map_or(true, |b| key < b)
            && self.lte.as_deref().map_or(true, |b| key <= b)
            && self.eq.as_deref().map_or(true, |b| key == b)
            && self.ne.as_deref().map_or(true, |b| key != b)
    }

    /// Strictest lower bound
    pub fn lower(&self) -> Bound<&str> {
        let mut bound = Bound::Unbounded;
        for candidate in [
            self.gte.as_deref().map(Bound::Included),
            self.eq.as_deref().map(Bound::Included),
            self.gt.as_deref().map(Bound::Excluded),
        ]
        .into_iter()
        .flatten()
        {
            bound = stricter_lower(bound, candidate);
        }
        bound
    }

    /// Strictest upper bound
    pub fn upper(&self) -> Bound<&str> {
        let mut bound = Bound::Unbounded;
        for candidate in [
            self.lte.as_deref().map(Bound::Included),
            self.eq.as_deref().map(Bound::Included),
            self.lt.as_deref().map(Bound::Excluded),
        ]
        .into_iter()
        .flatten()
        {
            bound = stricter_upper(bound, candidate);
        }
        bound
    }

    /// True when no key can satisfy the lower and upper bounds together
    pub fn is_empty(&self) -> bool {
        match (self.lower(), self.upper()) {
            (Bound::Included(lo), Bound::Included(hi)) => lo > hi,
            (Bound::Included(lo), Bound::Excluded(hi))
            | (Bound::Excluded(lo), Bound::Included(hi))
            | (Bound::Excluded(lo), Bound::Excluded(hi)) => lo >= hi,
            _ => false,
        }
    }

    /// Same range, restricted to keys after `last`; used to page through scans
    pub fn resume_after(&self, last: &str) -> KeyRange {
        let mut next = self.clone();
        next.gt = match self.gt.as_deref() {
            Some(existing) if existing > last => Some(existing.to_string()),
            _ => Some(last.to_string()),
        };
        next
    }
}

fn stricter_lower<'a>(a: Bound<&'a str>, b: Bound<&'a str>) -> Bound<&'a str> {
    match (a, b) {
        (Bound::Unbounded, other) | (other, Bound::Unbounded) => other,
        (x, y) => {
            let (kx, ky) = (bound_key(x), bound_key(y));
            if kx > ky {
                x
            } else if ky > kx {
                y
            } else if matches!(x, Bound::Excluded(_)) {
                x
            } else {
                y
            }
        }
    }
}

fn stricter_upper<'a>(a: Bound<&'a str>, b: Bound<&'a str>) -> Bound<&'a str> {
    match (a, b) {
        (Bound::Unbounded, other) | (other, Bound::Unbounded) => other,
        (x, y) => {
            let (kx, ky) = (bound_key(x), bound_key(y));
            if kx < ky {
                x
            } else if ky < kx {
                y
            } else if matches!(x, Bound::Excluded(_)) {
                x
            } else {
                y
            }
        }
    }
}

fn bound_key(bound: Bound<&str>) -> &str {
    match bound {
        Bound::Included(k) | Bound::Excluded(k) => k,
        Bound::Unbounded => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbounded_contains_everything() {
        let range = KeyRange::all();
        assert!(range.contains(""));
        assert!(range.contains("zzz"));
        assert!(!range.is_empty());
    }

    #[test]
    fn test_strictest_lower_wins() {
        let range = KeyRange::all().gte("b").gt("b");
        assert_eq!(range.lower(), Bound::Excluded("b"));
        let range = KeyRange::all().gte("c").gt("b");
        assert_eq!(range.lower(), Bound::Included("c"));
    }

    #[test]
    fn test_strictest_upper_wins() {
        let range = KeyRange::all().lte("m").lt("m");
        assert_eq!(range.upper(), Bound::Excluded("m"));
        let range = KeyRange::all().lte("k").lt("m");
        assert_eq!(range.upper(), Bound::Included("k"));
    }

    #[test]
    fn test_eq_and_ne() {
        let range = KeyRange::all().eq("a");
        assert!(range.contains("a"));
        assert!(!range.contains("b"));
        let range = KeyRange::all().ne("a");
        assert!(!range.contains("a"));
        assert!(range.contains("b"));
    }

    #[test]
    fn test_empty_detection() {
        assert!(KeyRange::all().gt("b").lt("b").is_empty());
        assert!(KeyRange::all().gte("c").lte("b").is_empty());
        assert!(!KeyRange::all().gte("b").lte("b").is_empty());
        assert!(KeyRange::all().eq("a").gt("a").is_empty());
    }

    #[test]
    fn test_resume_after_keeps_other_bounds() {
        let range = KeyRange::all().gte("a").lt("m");
        let next = range.resume_after("c");
        assert_eq!(next.lower(), Bound::Excluded("c"));
        assert_eq!(next.upper(), Bound::Excluded("m"));
        // never moves the lower bound backwards
        let range = KeyRange::all().gt("x");
        assert_eq!(range.resume_after("c").lower(), Bound::Excluded("x"));
    }
}
