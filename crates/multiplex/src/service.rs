//! Channel handlers run by the owning process

use std::sync::{Arc, Weak};

use nestdb_concurrency::{LocalLockManager, LockManager, LockName};
use nestdb_core::{Error, Result};
use nestdb_storage::StorageHandle;

use crate::channel::ChannelHandler;
use crate::multiplexer::MuxInner;
use crate::protocol::{store_channel, Call, Reply};

/// `directory`: claims and releases on behalf of workers
pub(crate) struct DirectoryService {
    mux: Weak<MuxInner>,
}

impl DirectoryService {
    pub(crate) fn new(mux: Weak<MuxInner>) -> Self {
        Self { mux }
    }
}

impl ChannelHandler for DirectoryService {
    fn handle(&self, call: Call) -> Result<Reply> {
        let mux = self
            .mux
            .upgrade()
            .ok_or_else(|| Error::connection("owner is shutting down"))?;
        match call {
            Call::Claim { name } => {
                mux.retain(&name)?;
                Ok(Reply::Channel(store_channel(&name)))
            }
            Call::Release { name } => {
                mux.release(&name)?;
                Ok(Reply::Done)
            }
            other => Err(Error::invalid_input(format!(
                "directory cannot serve {:?}",
                other
            ))),
        }
    }
}

/// `store/<name>`: data operations on one physical handle
pub(crate) struct StoreService {
    handle: Arc<dyn StorageHandle>,
}

impl StoreService {
    pub(crate) fn new(handle: Arc<dyn StorageHandle>) -> Self {
        Self { handle }
    }
}

impl ChannelHandler for StoreService {
    fn handle(&self, call: Call) -> Result<Reply> {
        match call {
            Call::Get { key } => Ok(Reply::Value(self.handle.get(&key)?)),
            Call::Put { key, value } => {
                self.handle.put(&key, &value)?;
                Ok(Reply::Done)
            }
            Call::Delete { key } => {
                self.handle.delete(&key)?;
                Ok(Reply::Done)
            }
            Call::GetMany { keys } => Ok(Reply::Entries(self.handle.get_many(&keys)?)),
            Call::Clear => {
                self.handle.clear()?;
                Ok(Reply::Done)
            }
            Call::ScanPage { range, limit } => {
                Ok(Reply::Entries(self.handle.scan_page(&range, limit)?))
            }
            other => Err(Error::invalid_input(format!("store cannot serve {:?}", other))),
        }
    }
}

/// `locks`: the owner's lock table
pub(crate) struct LockService {
    locks: Arc<LocalLockManager>,
}

impl LockService {
    pub(crate) fn new(locks: Arc<LocalLockManager>) -> Self {
        Self { locks }
    }
}

impl ChannelHandler for LockService {
    fn handle(&self, call: Call) -> Result<Reply> {
        match call {
            Call::Acquire { name, mode } => {
                let ticket = self.locks.acquire(&LockName::new(name), mode)?;
                Ok(Reply::Ticket(ticket))
            }
            Call::Unlock { ticket } => {
                self.locks.release(ticket)?;
                Ok(Reply::Done)
            }
            other => Err(Error::invalid_input(format!("locks cannot serve {:?}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nestdb_concurrency::LockMode;
    use nestdb_storage::{KeyRange, MemoryStore};

    #[test]
    fn test_store_service_maps_calls() {
        let store = Arc::new(MemoryStore::new("svc"));
        store.open().unwrap();
        let service = StoreService::new(store.clone());

        service
            .handle(Call::Put {
                key: "b".into(),
                value: b"2".to_vec(),
            })
            .unwrap();
        service
            .handle(Call::Put {
                key: "a".into(),
                value: b"1".to_vec(),
            })
            .unwrap();

        match service.handle(Call::Get { key: "a".into() }).unwrap() {
            Reply::Value(Some(v)) => assert_eq!(v, b"1"),
            other => panic!("unexpected {:?}", other),
        }
        match service
            .handle(Call::ScanPage {
                range: KeyRange::all(),
                limit: 1,
            })
            .unwrap()
        {
            Reply::Entries(entries) => assert_eq!(entries, vec![("a".to_string(), b"1".to_vec())]),
            other => panic!("unexpected {:?}", other),
        }
        assert!(service.handle(Call::Unlock { ticket: nestdb_concurrency::LockTicket(1) }).is_err());
    }

    #[test]
    fn test_lock_service_grants_and_releases() {
        let locks = Arc::new(LocalLockManager::new());
        let service = LockService::new(locks.clone());
        let reply = service
            .handle(Call::Acquire {
                name: vec!["r".into(), "docs".into()],
                mode: LockMode::Exclusive,
            })
            .unwrap();
        let ticket = match reply {
            Reply::Ticket(t) => t,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(locks.stats().outstanding, 1);
        service.handle(Call::Unlock { ticket }).unwrap();
        assert_eq!(locks.stats().outstanding, 0);
    }
}
