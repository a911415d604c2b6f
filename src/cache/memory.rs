//! In-memory cache store, for tests and single-process runs.

use std::collections::HashMap;
use std::sync::Mutex;

use super::{CacheError, CacheStore, StoredEntry};

/// A [`CacheStore`] kept in process memory.
///
/// Write order is tracked with a sequence number so prefix lookups return
/// the most recent entry deterministically.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    next_seq: u64,
    entries: HashMap<String, (u64, Vec<u8>)>,
}

impl MemoryCacheStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.entries.len()).unwrap_or(0)
    }

    /// Returns true if nothing has been stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> CacheError {
    CacheError::Io(std::io::Error::other("cache store lock poisoned"))
}

impl CacheStore for MemoryCacheStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let inner = self.inner.lock().map_err(|_| poisoned())?;
        Ok(inner.entries.get(key).map(|(_, blob)| blob.clone()))
    }

    fn put(&self, key: &str, blob: &[u8]) -> Result<(), CacheError> {
        let mut inner = self.inner.lock().map_err(|_| poisoned())?;
        inner.next_seq += 1;
        let seq = inner.next_seq;
        inner.entries.insert(key.to_string(), (seq, blob.to_vec()));
        Ok(())
    }

    fn get_by_prefix(&self, prefix: &str) -> Result<Option<StoredEntry>, CacheError> {
        let inner = self.inner.lock().map_err(|_| poisoned())?;
        Ok(inner
            .entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .max_by_key(|(_, (seq, _))| *seq)
            .map(|(key, (_, blob))| StoredEntry {
                key: key.clone(),
                blob: blob.clone(),
            }))
    }
}
