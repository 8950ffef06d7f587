//! Client stubs that forward to the owning process
//!
//! [`RemoteStore`] is a [`StorageHandle`] whose `open`/`close` claim and
//! release the physical store through the owner's directory, and whose data
//! operations are calls on the `store/<name>` channel the claim returned.
//! [`RemoteLockManager`] forwards acquire/release to the owner's lock table.

use std::sync::Arc;

use nestdb_concurrency::{LockManager, LockMode, LockName, LockTicket};
use nestdb_core::{Error, Result};
use nestdb_storage::{KeyRange, StorageHandle};
use parking_lot::RwLock;
use tracing::debug;

use crate::channel::ChannelClient;
use crate::protocol::{unexpected, Call, Reply, DIRECTORY_CHANNEL, LOCKS_CHANNEL};

/// Store living in the owner process
pub struct RemoteStore {
    name: String,
    client: Arc<ChannelClient>,
    channel: RwLock<Option<String>>,
}

impl RemoteStore {
    /// Stub for `name`; nothing is claimed until `open`
    pub fn new(name: impl Into<String>, client: Arc<ChannelClient>) -> Self {
        Self {
            name: name.into(),
            client,
            channel: RwLock::new(None),
        }
    }

    /// Database name
    pub fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, call: Call) -> Result<Reply> {
        let channel = self
            .channel
            .read()
            .clone()
            .ok_or_else(|| Error::Closed(self.name.clone()))?;
        self.client.call(&channel, call)
    }
}

impl StorageHandle for RemoteStore {
    fn open(&self) -> Result<()> {
        let mut channel = self.channel.write();
        if channel.is_some() {
            return Ok(());
        }
        let reply = self.client.call(
            DIRECTORY_CHANNEL,
            Call::Claim {
                name: self.name.clone(),
            },
        )?;
        match reply {
            Reply::Channel(bound) => {
                debug!(target: "nestdb::mux", name = %self.name, channel = %bound, "Claimed remote store");
                *channel = Some(bound);
                Ok(())
            }
            other => Err(unexpected(&other, "Channel")),
        }
    }

    fn close(&self) -> Result<()> {
        let mut channel = self.channel.write();
        if channel.take().is_none() {
            return Ok(());
        }
        self.client.call(
            DIRECTORY_CHANNEL,
            Call::Release {
                name: self.name.clone(),
            },
        )?;
        debug!(target: "nestdb::mux", name = %self.name, "Released remote store");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.channel.read().is_some()
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.call(Call::Get { key: key.to_string() })? {
            Reply::Value(value) => Ok(value),
            other => Err(unexpected(&other, "Value")),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.call(Call::Put {
            key: key.to_string(),
            value: value.to_vec(),
        })
        .map(|_| ())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.call(Call::Delete { key: key.to_string() }).map(|_| ())
    }

    fn get_many(&self, keys: &[String]) -> Result<Vec<(String, Vec<u8>)>> {
        match self.call(Call::GetMany { keys: keys.to_vec() })? {
            Reply::Entries(entries) => Ok(entries),
            other => Err(unexpected(&other, "Entries")),
        }
    }

    fn clear(&self) -> Result<()> {
        self.call(Call::Clear).map(|_| ())
    }

    fn scan_page(&self, range: &KeyRange, limit: usize) -> Result<Vec<(String, Vec<u8>)>> {
        let call = Call::ScanPage {
            range: range.clone(),
            limit,
        };
        match self.call(call)? {
            Reply::Entries(entries) => Ok(entries),
            other => Err(unexpected(&other, "Entries")),
        }
    }
}

/// Lock manager whose table lives in the owner process
pub struct RemoteLockManager {
    client: Arc<ChannelClient>,
}

impl RemoteLockManager {
    /// Forward through `client`
    pub fn new(client: Arc<ChannelClient>) -> Self {
        Self { client }
    }
}

impl LockManager for RemoteLockManager {
    fn acquire(&self, name: &LockName, mode: LockMode) -> Result<LockTicket> {
        let call = Call::Acquire {
            name: name.segments().to_vec(),
            mode,
        };
        match self.client.call(LOCKS_CHANNEL, call)? {
            Reply::Ticket(ticket) => Ok(ticket),
            other => Err(unexpected(&other, "Ticket")),
        }
    }

    fn release(&self, ticket: LockTicket) -> Result<()> {
        self.client
            .call(LOCKS_CHANNEL, Call::Unlock { ticket })
            .map(|_| ())
    }
}
