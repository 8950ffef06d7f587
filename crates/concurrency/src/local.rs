//! In-process lock manager
//!
//! A single lock table guarded by a `parking_lot::Mutex`, with a `Condvar`
//! broadcast on every release.
//!
//! ## Grant rules
//!
//! ```text
//! Exclusive(name, seq)  granted when
//!     no related holder (shared or exclusive)
//!     AND no related exclusive waiter with an earlier seq
//! Shared(name)          granted when
//!     no related exclusive holder
//!     AND no related exclusive waiter
//! ```
//!
//! Queued exclusive requests block new shared requests on related names, so a
//! stream of readers cannot starve a writer; related exclusive requests are
//! granted in arrival order.

use std::collections::BTreeMap;

use nestdb_core::{Error, Result};
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::lock::{LockManager, LockMode, LockName, LockTicket};

#[derive(Debug, Default)]
struct Holding {
    shared: usize,
    exclusive: bool,
}

#[derive(Debug, Default)]
struct LockTable {
    holders: FxHashMap<LockName, Holding>,
    tickets: FxHashMap<LockTicket, (LockName, LockMode)>,
    /// Waiting exclusive requests by arrival sequence
    exclusive_queue: BTreeMap<u64, LockName>,
    next_seq: u64,
    next_ticket: u64,
}

impl LockTable {
    fn exclusive_ready(&self, name: &LockName, seq: u64) -> bool {
        let blocked_by_holder = self
            .holders
            .iter()
            .any(|(held, h)| (h.exclusive || h.shared > 0) && held.relates_to(name));
        let blocked_by_queue = self
            .exclusive_queue
            .range(..seq)
            .any(|(_, queued)| queued.relates_to(name));
        !blocked_by_holder && !blocked_by_queue
    }

    fn shared_ready(&self, name: &LockName) -> bool {
        let blocked_by_holder = self
            .holders
            .iter()
            .any(|(held, h)| h.exclusive && held.relates_to(name));
        let blocked_by_queue = self
            .exclusive_queue
            .values()
            .any(|queued| queued.relates_to(name));
        !blocked_by_holder && !blocked_by_queue
    }

    fn grant(&mut self, name: &LockName, mode: LockMode) -> LockTicket {
        let holding = self.holders.entry(name.clone()).or_default();
        match mode {
            LockMode::Shared => holding.shared += 1,
            LockMode::Exclusive => holding.exclusive = true,
        }
        self.next_ticket += 1;
        let ticket = LockTicket(self.next_ticket);
        self.tickets.insert(ticket, (name.clone(), mode));
        ticket
    }
}

/// Snapshot of lock table occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockStats {
    /// Names with at least one holder
    pub held_names: usize,
    /// Granted tickets not yet released
    pub outstanding: usize,
    /// Exclusive requests waiting to be granted
    pub waiting_exclusive: usize,
}

/// Lock manager for threads of one process
#[derive(Debug, Default)]
pub struct LocalLockManager {
    table: Mutex<LockTable>,
    released: Condvar,
}

impl LocalLockManager {
    /// Create an empty lock table
    pub fn new() -> Self {
        Self::default()
    }

    /// Current occupancy
    pub fn stats(&self) -> LockStats {
        let table = self.table.lock();
        LockStats {
            held_names: table.holders.len(),
            outstanding: table.tickets.len(),
            waiting_exclusive: table.exclusive_queue.len(),
        }
    }
}

impl LockManager for LocalLockManager {
    fn acquire(&self, name: &LockName, mode: LockMode) -> Result<LockTicket> {
        let mut table = self.table.lock();
        match mode {
            LockMode::Exclusive => {
                let seq = table.next_seq;
                table.next_seq += 1;
                table.exclusive_queue.insert(seq, name.clone());
                if !table.exclusive_ready(name, seq) {
                    debug!(target: "nestdb::lock", name = %name, "Waiting for exclusive lock");
                    while !table.exclusive_ready(name, seq) {
                        self.released.wait(&mut table);
                    }
                }
                table.exclusive_queue.remove(&seq);
            }
            LockMode::Shared => {
                if !table.shared_ready(name) {
                    debug!(target: "nestdb::lock", name = %name, "Waiting for shared lock");
                    while !table.shared_ready(name) {
                        self.released.wait(&mut table);
                    }
                }
            }
        }
        let ticket = table.grant(name, mode);
        trace!(target: "nestdb::lock", name = %name, ?mode, ticket = ticket.0, "Granted");
        Ok(ticket)
    }

    fn release(&self, ticket: LockTicket) -> Result<()> {
        let mut table = self.table.lock();
        let (name, mode) = table
            .tickets
            .remove(&ticket)
            .ok_or_else(|| Error::invalid_input(format!("unknown lock ticket {}", ticket.0)))?;
        let now_idle = match table.holders.get_mut(&name) {
            Some(holding) => {
                match mode {
                    LockMode::Shared => holding.shared = holding.shared.saturating_sub(1),
                    LockMode::Exclusive => holding.exclusive = false,
                }
                holding.shared == 0 && !holding.exclusive
            }
            None => false,
        };
        if now_idle {
            table.holders.remove(&name);
        }
        drop(table);
        self.released.notify_all();
        trace!(target: "nestdb::lock", name = %name, ticket = ticket.0, "Released");
        Ok(())
    }
}
