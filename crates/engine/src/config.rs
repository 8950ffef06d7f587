//! Database configuration via `nestdb.toml`
//!
//! On first open a commented default `nestdb.toml` is written into the data
//! directory. To change settings, edit the file and reopen.

use std::path::{Path, PathBuf};

use nestdb_core::{Error, Result};
use nestdb_multiplex::DEFAULT_MAX_MESSAGE_SIZE;
use nestdb_storage::DEFAULT_SCAN_PAGE;
use serde::{Deserialize, Serialize};

/// Config file name placed in the database data directory.
pub const CONFIG_FILE_NAME: &str = "nestdb.toml";

/// Socket file name used when `socket_path` is not set
pub const DEFAULT_SOCKET_NAME: &str = "nestdb.sock";

/// Physical store selected by `backend`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// One append-log file per store under the data directory
    File,
    /// Stores live in the owner's memory and vanish with it
    Memory,
}

/// Database configuration loaded from `nestdb.toml`.
///
/// # Example
///
/// ```toml
/// backend = "file"
/// # socket_path = "/run/myapp/nestdb.sock"
/// max_message_size = 16777216
/// scan_page_size = 256
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NestConfig {
    /// `"file"` or `"memory"`
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Owner socket; defaults to `nestdb.sock` in the data directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,
    /// Largest inter-process message in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Entries fetched per round trip during scans
    #[serde(default = "default_scan_page_size")]
    pub scan_page_size: usize,
}

fn default_backend() -> String {
    "file".to_string()
}

fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

fn default_scan_page_size() -> usize {
    DEFAULT_SCAN_PAGE
}

impl Default for NestConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            socket_path: None,
            max_message_size: default_max_message_size(),
            scan_page_size: default_scan_page_size(),
        }
    }
}

impl NestConfig {
    /// In-memory stores, everything else default
    pub fn memory() -> Self {
        Self {
            backend: "memory".to_string(),
            ..Self::default()
        }
    }

    /// Parse the backend string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not `"file"` or `"memory"`.
    pub fn backend_kind(&self) -> Result<BackendKind> {
        match self.backend.as_str() {
            "file" => Ok(BackendKind::File),
            "memory" => Ok(BackendKind::Memory),
            other => Err(Error::Config(format!(
                "Invalid backend '{}' in nestdb.toml. Expected \"file\" or \"memory\".",
                other
            ))),
        }
    }

    /// Owner socket for a database rooted at `data_dir`
    pub fn socket_path_in(&self, data_dir: &Path) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(|| data_dir.join(DEFAULT_SOCKET_NAME))
    }

    /// Check every field
    pub fn validate(&self) -> Result<()> {
        self.backend_kind()?;
        if self.max_message_size < 1024 {
            return Err(Error::Config(format!(
                "max_message_size must be at least 1024 bytes, got {}",
                self.max_message_size
            )));
        }
        if self.max_message_size > u32::MAX as usize {
            return Err(Error::Config(format!(
                "max_message_size must fit a u32 length prefix, got {}",
                self.max_message_size
            )));
        }
        if self.scan_page_size == 0 {
            return Err(Error::Config("scan_page_size must be positive".to_string()));
        }
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# nestdb configuration
#
# Storage backend: "file" (default) or "memory"
#   "file"   = one append-log file per store in this directory
#   "memory" = stores live in the owning process and are lost when it exits
backend = "file"

# Socket the owning process listens on for worker processes.
# Defaults to nestdb.sock in this directory.
# socket_path = "/run/myapp/nestdb.sock"

# Largest message exchanged with the owning process, in bytes (default 16 MiB).
max_message_size = 16777216

# Entries fetched per round trip when scanning (default 256).
scan_page_size = 256
"#
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: NestConfig = toml::from_str(&content).map_err(|e| {
            Error::Config(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                Error::Config(format!(
                    "Failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            Error::Config(format!(
                "Failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }
}
