//! Owner/worker tests for nestdb-multiplex
//!
//! Both endpoints run inside the test process, talking over a real Unix
//! socket in a temporary directory. This exercises:
//!
//! 1. **Claims** - a worker open is one reference in the owner's table
//! 2. **Forwarding** - every storage call lands on the owner's physical store
//! 3. **Remote locks** - critical sections are enforced by the owner
//! 4. **Limits** - oversized messages fail with `Transport`
//! 5. **Owner loss** - calls after the owner stops fail with `Connection`

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use nestdb_concurrency::{LockManagerExt, LockMode, LockName};
use nestdb_core::Error;
use nestdb_multiplex::{Multiplexer, MultiplexerConfig, ProcessRole};
use nestdb_storage::{KeyRange, MemoryBackend, Scan, StorageBackend, StorageHandle};
use tempfile::TempDir;

// ============================================================================
// Test Helpers
// ============================================================================

struct Pair {
    owner: Multiplexer,
    worker: Multiplexer,
    backend: Arc<MemoryBackend>,
    _dir: TempDir,
}

fn pair_with_limit(max_message_size: usize) -> Pair {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let dir = TempDir::new().unwrap();
    let config = MultiplexerConfig {
        socket_path: dir.path().join("owner.sock"),
        max_message_size,
    };
    let backend = Arc::new(MemoryBackend::new());
    let owner = Multiplexer::owner(backend.clone(), config.clone()).unwrap();
    let worker = Multiplexer::worker(config).unwrap();
    Pair {
        owner,
        worker,
        backend,
        _dir: dir,
    }
}

fn pair() -> Pair {
    pair_with_limit(nestdb_multiplex::DEFAULT_MAX_MESSAGE_SIZE)
}

// ============================================================================
// Claims and reference counts
// ============================================================================

#[test]
fn test_worker_claim_counts_once_on_owner() {
    let p = pair();
    assert_eq!(p.worker.role(), ProcessRole::Worker);

    let w1 = p.worker.open("users.data").unwrap();
    let w2 = p.worker.open("users.data").unwrap();
    assert_eq!(p.worker.open_count("users.data"), 2);
    assert_eq!(p.owner.open_count("users.data"), 1);

    let o = p.owner.open("users.data").unwrap();
    assert_eq!(p.owner.open_count("users.data"), 2);

    w1.close().unwrap();
    assert_eq!(p.owner.open_count("users.data"), 2);
    w2.close().unwrap();
    assert_eq!(p.owner.open_count("users.data"), 1);

    o.close().unwrap();
    assert_eq!(p.owner.open_count("users.data"), 0);
    assert!(!p.backend.create("users.data").unwrap().is_open());
}

#[test]
fn test_worker_writes_visible_to_owner() {
    let p = pair();
    let w = p.worker.open("users.data").unwrap();
    w.put("a", b"1").unwrap();
    w.put("b", b"2").unwrap();
    w.delete("a").unwrap();

    let o = p.owner.open("users.data").unwrap();
    assert_eq!(o.get("a").unwrap(), None);
    assert_eq!(o.get("b").unwrap(), Some(b"2".to_vec()));

    o.put("c", b"3").unwrap();
    let got = w
        .get_many(&["c".to_string(), "missing".to_string(), "b".to_string()])
        .unwrap();
    assert_eq!(
        got,
        vec![
            ("c".to_string(), b"3".to_vec()),
            ("b".to_string(), b"2".to_vec())
        ]
    );

    w.clear().unwrap();
    assert_eq!(o.get("b").unwrap(), None);
}

#[test]
fn test_worker_scan_is_paged() {
    let p = pair();
    let w = p.worker.open("events").unwrap();
    for i in 0..25 {
        w.put(&format!("e{:03}", i), &[i as u8]).unwrap();
    }
    let keys: Vec<String> = Scan::with_page_size(&w, KeyRange::all().gte("e005").lt("e020"), 4)
        .map(|entry| entry.unwrap().0)
        .collect();
    assert_eq!(keys.len(), 15);
    assert_eq!(keys.first().map(String::as_str), Some("e005"));
    assert_eq!(keys.last().map(String::as_str), Some("e019"));
}

#[test]
fn test_closed_worker_ref_fails_locally() {
    let p = pair();
    let w = p.worker.store("x");
    assert!(matches!(w.get("k"), Err(Error::Closed(_))));
    w.open().unwrap();
    assert_eq!(w.get("k").unwrap(), None);
}

// ============================================================================
// Remote locks
// ============================================================================

#[test]
fn test_remote_lock_excludes_owner_thread() {
    let p = pair();
    let name = LockName::new(["users", "docs"]);
    let worker_locks = p.worker.locks();
    let guard = worker_locks.lock(&name, LockMode::Exclusive).unwrap();

    let entered = Arc::new(AtomicBool::new(false));
    let owner_thread = {
        let locks = p.owner.locks();
        let entered = Arc::clone(&entered);
        let name = name.child("abc");
        thread::spawn(move || {
            locks
                .with_exclusive(&name, || {
                    entered.store(true, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
        })
    };

    thread::sleep(Duration::from_millis(30));
    assert!(!entered.load(Ordering::SeqCst));
    guard.release().unwrap();
    owner_thread.join().unwrap();
    assert!(entered.load(Ordering::SeqCst));
}

#[test]
fn test_blocked_remote_acquire_does_not_stall_storage_calls() {
    let p = pair();
    let name = LockName::new(["r"]);
    let owner_locks = p.owner.locks();
    let held = owner_locks.lock(&name, LockMode::Exclusive).unwrap();

    let waiter = {
        let locks = p.worker.locks();
        let name = name.clone();
        thread::spawn(move || locks.with_shared(&name, || Ok(())))
    };
    thread::sleep(Duration::from_millis(20));

    // a pooled connection still serves this thread
    let w = p.worker.open("r.data").unwrap();
    w.put("k", b"v").unwrap();

    held.release().unwrap();
    waiter.join().unwrap().unwrap();
}

// ============================================================================
// Limits and owner loss
// ============================================================================

#[test]
fn test_oversized_put_is_transport_error() {
    let p = pair_with_limit(1024);
    let w = p.worker.open("blobs").unwrap();
    let err = w.put("big", &vec![0xAB; 8 * 1024]).unwrap_err();
    assert!(matches!(err, Error::Transport(_)));
    w.put("small", b"ok").unwrap();
    assert_eq!(w.get("small").unwrap(), Some(b"ok".to_vec()));
}

#[test]
fn test_calls_after_owner_shutdown_fail_with_connection() {
    let p = pair();
    let w = p.worker.open("users.data").unwrap();
    w.put("k", b"v").unwrap();

    p.owner.shutdown();
    assert!(matches!(w.get("k"), Err(Error::Connection(_))));
    assert!(matches!(
        p.worker.open("other"),
        Err(Error::Connection(_))
    ));
}

#[test]
fn test_worker_without_owner_fails_to_start() {
    let dir = TempDir::new().unwrap();
    let result = Multiplexer::worker(MultiplexerConfig::new(dir.path().join("none.sock")));
    assert!(matches!(result, Err(Error::Connection(_))));
}
