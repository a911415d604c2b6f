//! Filesystem cache store.
//!
//! Each entry is two files named after the SHA256 of its key:
//!
//! ```text
//! <root>/<sha256(key)>.blob   archive bytes
//! <root>/<sha256(key)>.json   {"key": "...", "written_at": "...", "size": N}
//! ```
//!
//! Both are written to a temp file in `<root>` and renamed into place, blob
//! first, so a reader that can see the metadata can also see a complete blob.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::{CacheError, CacheStore, StoredEntry};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntryMeta {
    key: String,
    written_at: DateTime<Utc>,
    size: usize,
}

/// A [`CacheStore`] backed by a local directory.
#[derive(Debug, Clone)]
pub struct FsCacheStore {
    root: PathBuf,
}

impl FsCacheStore {
    /// Creates a store rooted at `root`. The directory is created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The store's root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn stem(key: &str) -> String {
        format!("{:x}", Sha256::digest(key.as_bytes()))
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.blob", Self::stem(key)))
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", Self::stem(key)))
    }

    fn write_atomic(&self, dest: &Path, bytes: &[u8]) -> Result<(), CacheError> {
        let mut tmp = NamedTempFile::new_in(&self.root)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(dest).map_err(|e| CacheError::Io(e.error))?;
        Ok(())
    }

    fn read_meta(path: &Path) -> Result<EntryMeta, CacheError> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| CacheError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, CacheError> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl CacheStore for FsCacheStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let blob = read_optional(&self.blob_path(key))?;
        if blob.is_some() {
            debug!("Cache hit for key '{}'", key);
        }
        Ok(blob)
    }

    fn put(&self, key: &str, blob: &[u8]) -> Result<(), CacheError> {
        std::fs::create_dir_all(&self.root)?;

        self.write_atomic(&self.blob_path(key), blob)?;

        let meta = EntryMeta {
            key: key.to_string(),
            written_at: Utc::now(),
            size: blob.len(),
        };
        let meta_json = serde_json::to_vec_pretty(&meta).map_err(|e| CacheError::Corrupt {
            path: self.meta_path(key),
            reason: e.to_string(),
        })?;
        self.write_atomic(&self.meta_path(key), &meta_json)?;

        debug!("Stored cache entry '{}' ({} bytes)", key, blob.len());
        Ok(())
    }

    fn get_by_prefix(&self, prefix: &str) -> Result<Option<StoredEntry>, CacheError> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut newest: Option<EntryMeta> = None;
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }

            let meta = match Self::read_meta(&path) {
                Ok(meta) => meta,
                Err(e) => {
                    warn!("Skipping unreadable cache metadata: {}", e);
                    continue;
                }
            };

            if !meta.key.starts_with(prefix) {
                continue;
            }

            let is_newer = newest.as_ref().is_none_or(|current| {
                (meta.written_at, &meta.key) > (current.written_at, &current.key)
            });
            if is_newer {
                newest = Some(meta);
            }
        }

        let Some(meta) = newest else {
            return Ok(None);
        };

        Ok(read_optional(&self.blob_path(&meta.key))?.map(|blob| StoredEntry {
            key: meta.key,
            blob,
        }))
    }
}
