//! Two OS processes sharing one database
//!
//! The test re-runs its own binary as a worker: the child inherits
//! `NESTDB_OWNER_SOCKET` from [`Multiplexer::worker_command`] and the data
//! directory from `NESTDB_TEST_DIR`, opens the same database, and inserts
//! while the parent inserts too.

use std::collections::BTreeSet;
use std::process::Stdio;

use nestdb::{
    document_from_json, Database, EntityId, IndexDefinition, NestConfig, ProcessRole, Repository,
    Value, OWNER_SOCKET_ENV,
};
use serde_json::json;
use tempfile::TempDir;

const DIR_ENV: &str = "NESTDB_TEST_DIR";
const PER_PROCESS: usize = 5;

fn events(db: &Database) -> Repository {
    db.repository("events", vec![IndexDefinition::new("pid", "pid").unwrap()])
        .unwrap()
}

fn insert_batch(repo: &Repository) -> Vec<EntityId> {
    let pid = std::process::id();
    (0..PER_PROCESS)
        .map(|seq| {
            repo.insert(document_from_json(json!({"pid": pid, "seq": seq})))
                .unwrap()
        })
        .collect()
}

#[test]
fn two_processes_share_one_database() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    if std::env::var_os(OWNER_SOCKET_ENV).is_some() {
        let dir = std::env::var(DIR_ENV).unwrap();
        let db = Database::open(&dir).unwrap();
        assert_eq!(db.role(), ProcessRole::Worker);
        let repo = events(&db);
        insert_batch(&repo);
        repo.close().unwrap();
        return;
    }

    let dir = TempDir::new().unwrap();
    let db = Database::open_with_config(dir.path(), NestConfig::default()).unwrap();
    assert_eq!(db.role(), ProcessRole::Owner);
    let repo = events(&db);

    let mut child = db
        .multiplexer()
        .worker_command(std::env::current_exe().unwrap())
        .args(["--exact", "two_processes_share_one_database", "--test-threads=1"])
        .env(DIR_ENV, dir.path())
        .stdout(Stdio::null())
        .spawn()
        .unwrap();
    let ours = insert_batch(&repo);
    let status = child.wait().unwrap();
    assert!(status.success(), "worker exited with {}", status);

    let all = repo.get_all().unwrap();
    assert_eq!(all.len(), 2 * PER_PROCESS);
    let unique: BTreeSet<&EntityId> = all.iter().map(|e| e.id()).collect();
    assert_eq!(unique.len(), 2 * PER_PROCESS);

    let by_parent = repo.find("pid", &Value::from(std::process::id())).unwrap();
    let by_child = repo.find("pid", &Value::from(child.id())).unwrap();
    assert_eq!(by_parent.len(), PER_PROCESS);
    assert_eq!(by_child.len(), PER_PROCESS);
    let parent_ids: BTreeSet<EntityId> = by_parent.iter().map(|e| e.id().clone()).collect();
    assert_eq!(parent_ids, ours.into_iter().collect());
}
