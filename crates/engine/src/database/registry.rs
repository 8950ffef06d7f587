//! Process-wide registry of open databases
//!
//! Opening the same directory twice in one process returns the same
//! [`Database`], so the owner socket is bound once per directory. Entries are
//! weak and disappear when the last handle drops.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Weak;

use super::Database;

/// Global registry of open databases (canonical path -> weak reference)
pub static OPEN_DATABASES: Lazy<Mutex<HashMap<PathBuf, Weak<Database>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));
