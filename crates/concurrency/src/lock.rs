//! Named lock vocabulary shared by every lock manager
//!
//! Lock names are hierarchical: `users/docs` covers `users/docs/<id>`. Two
//! names conflict-relate when one is a prefix of the other (or they are
//! equal). An exclusive hold on a name therefore excludes every shared or
//! exclusive hold on its ancestors and descendants, which lets a whole-index
//! rebuild serialize against per-bucket updates without knowing the buckets.

use std::fmt;

use nestdb_core::Result;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::warn;

/// Hierarchical resource name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockName {
    segments: SmallVec<[String; 4]>,
}

impl LockName {
    /// Name made of `segments`, outermost first
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    /// Name one level below this one
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    /// Segments, outermost first
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// True if either name is a prefix of the other
    pub fn relates_to(&self, other: &LockName) -> bool {
        let n = self.segments.len().min(other.segments.len());
        self.segments[..n] == other.segments[..n]
    }
}

impl fmt::Display for LockName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("/"))
    }
}

/// Access mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockMode {
    /// Many holders at once; excluded only by exclusive holders and waiters
    Shared,
    /// Single holder; excludes every related holder
    Exclusive,
}

/// Receipt for a granted lock, handed back on release
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockTicket(pub u64);

/// Grants and releases named locks.
///
/// Re-entrancy is not supported: a thread that already holds a name must not
/// request a related name in a conflicting mode.
pub trait LockManager: Send + Sync {
    /// Block until `name` can be held in `mode`
    fn acquire(&self, name: &LockName, mode: LockMode) -> Result<LockTicket>;

    /// Release a previously granted lock
    fn release(&self, ticket: LockTicket) -> Result<()>;
}

/// Holds a lock until released or dropped
pub struct LockGuard<'a, L: LockManager + ?Sized> {
    manager: &'a L,
    ticket: Option<LockTicket>,
}

impl<L: LockManager + ?Sized> LockGuard<'_, L> {
    /// Release now, surfacing any release error
    pub fn release(mut self) -> Result<()> {
        match self.ticket.take() {
            Some(ticket) => self.manager.release(ticket),
            None => Ok(()),
        }
    }
}

impl<L: LockManager + ?Sized> Drop for LockGuard<'_, L> {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            if let Err(e) = self.manager.release(ticket) {
                warn!(target: "nestdb::lock", ticket = ticket.0, error = %e, "Failed to release lock on drop");
            }
        }
    }
}

/// Critical-section helpers available on every lock manager
pub trait LockManagerExt: LockManager {
    /// Acquire and wrap in a guard
    fn lock(&self, name: &LockName, mode: LockMode) -> Result<LockGuard<'_, Self>> {
        let ticket = self.acquire(name, mode)?;
        Ok(LockGuard {
            manager: self,
            ticket: Some(ticket),
        })
    }

    /// Run `f` while holding `name` exclusively
    fn with_exclusive<T, F>(&self, name: &LockName, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        with_lock(self, name, LockMode::Exclusive, f)
    }

    /// Run `f` while holding `name` in shared mode
    fn with_shared<T, F>(&self, name: &LockName, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        with_lock(self, name, LockMode::Shared, f)
    }
}

impl<L: LockManager + ?Sized> LockManagerExt for L {}

fn with_lock<L, T, F>(manager: &L, name: &LockName, mode: LockMode, f: F) -> Result<T>
where
    L: LockManager + ?Sized,
    F: FnOnce() -> Result<T>,
{
    let guard = manager.lock(name, mode)?;
    match f() {
        Ok(value) => {
            guard.release()?;
            Ok(value)
        }
        Err(e) => {
            if let Err(release_err) = guard.release() {
                warn!(
                    target: "nestdb::lock",
                    name = %name,
                    error = %release_err,
                    "Release failed after critical section error"
                );
            }
            Err(e)
        }
    }
}
