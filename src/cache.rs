//! On-disk token cache.
//!
//! Holds at most one entry in a single JSON file. Writes go to a temp file in
//! the same directory and are renamed over the target, so a concurrent reader
//! sees either the old file or the new one, never a partial write.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::CacheError;
use crate::token::TokenRecord;

/// The cache file contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub token: String,
    pub expiry: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl CacheEntry {
    pub fn from_record(record: &TokenRecord, updated: DateTime<Utc>) -> Self {
        Self {
            token: record.token.clone(),
            expiry: record.expiry,
            updated,
        }
    }

    /// Rebuild the in-memory record. `updated` stands in for the acquisition time.
    pub fn into_record(self) -> TokenRecord {
        TokenRecord {
            token: self.token,
            expiry: self.expiry,
            expiry_assumed: false,
            acquired_at: self.updated,
        }
    }
}

/// Single-entry token cache backed by a JSON file.
#[derive(Debug, Clone)]
pub struct TokenCache {
    path: PathBuf,
}

impl TokenCache {
    /// Cache at `~/.cache/tokenwarden/token.json`, or in the working
    /// directory when no cache directory is known.
    pub fn new() -> Self {
        let path = dirs::cache_dir()
            .map(|dir| dir.join("tokenwarden").join("token.json"))
            .unwrap_or_else(|| PathBuf::from(".tokenwarden_cache.json"));
        Self { path }
    }

    /// Create a cache at a custom file path.
    pub fn with_path(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the cached entry, `Ok(None)` when there is no cache file.
    pub fn load(&self) -> Result<Option<CacheEntry>, CacheError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(CacheError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let entry = serde_json::from_str(&content).map_err(|source| CacheError::Parse {
            path: self.path.clone(),
            source,
        })?;

        Ok(Some(entry))
    }

    /// Replace the cache file with `entry`.
    pub fn store(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        let write_err = |source| CacheError::Write {
            path: self.path.clone(),
            source,
        };

        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(write_err)?;

        let content = serde_json::to_string_pretty(entry)
            .map_err(|e| write_err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;

        let mut tmp = NamedTempFile::new_in(&dir).map_err(write_err)?;
        tmp.write_all(content.as_bytes()).map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;
        tmp.persist(&self.path).map_err(|e| write_err(e.error))?;

        Ok(())
    }

    /// Remove the cache file if present.
    pub fn clear(&self) -> Result<(), CacheError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CacheError::Write {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

impl Default for TokenCache {
    fn default() -> Self {
        Self::new()
    }
}
