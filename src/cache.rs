//! Dependency cache: key derivation, lookup and blob packing.
//!
//! Cache keys are derived from the *contents* of build descriptor files
//! (e.g. `pom.xml`), never their paths, and are shared by every job in a
//! matrix. A key looks like:
//!
//! ```text
//! linux-x86_64-maven-3f1c...e9   (platform - namespace - sha256)
//! └───────── prefix ─────────┘
//! ```
//!
//! Lookup prefers the exact key and falls back to the most recently written
//! entry under the prefix ("restore keys"). The cache is an optimization
//! only: every failure here is logged and degrades to a [`CacheLookup::Miss`].
//!
//! # Example
//!
//! ```no_run
//! use jobmatrix::cache::{lookup, CacheKeyResolver, CacheLookup, fs::FsCacheStore};
//! use std::path::PathBuf;
//!
//! let resolver = CacheKeyResolver::new("maven");
//! let key = resolver.resolve(&[PathBuf::from("pom.xml")])?;
//! let store = FsCacheStore::new("/var/cache/jobmatrix");
//!
//! match lookup(&store, &key) {
//!     CacheLookup::ExactHit(_) => println!("exact hit for {}", key),
//!     CacheLookup::PrefixHit { key, .. } => println!("warm start from {}", key),
//!     CacheLookup::Miss => println!("cold cache"),
//! }
//! # Ok::<(), jobmatrix::cache::CacheError>(())
//! ```

pub mod fs;
pub mod memory;

use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// Errors from cache key derivation or cache storage.
///
/// None of these ever fail a job; callers log them and carry on.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// No descriptor files were configured.
    #[error("no cache descriptors configured")]
    NoDescriptors,

    /// A descriptor file could not be read.
    #[error("failed to read descriptor {path}: {source}")]
    Descriptor {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Stored metadata could not be parsed.
    #[error("corrupt cache entry {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    /// Packing or unpacking a cache archive failed.
    #[error("cache archive error: {0}")]
    Archive(String),

    /// I/O error against the store.
    #[error("cache IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A resolved cache key together with its restore prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CacheKey {
    key: String,
    prefix: String,
}

impl CacheKey {
    /// The full key.
    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// The restore prefix (`<platform>-<namespace>-`).
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The content-hash portion of the key.
    pub fn hash(&self) -> &str {
        self.key.strip_prefix(&self.prefix).unwrap_or(&self.key)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

/// Derives [`CacheKey`]s from descriptor file contents.
#[derive(Debug, Clone)]
pub struct CacheKeyResolver {
    platform: String,
    namespace: String,
}

impl CacheKeyResolver {
    /// Creates a resolver for the host platform.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self::with_platform(host_platform(), namespace)
    }

    /// Creates a resolver for an explicit platform identifier.
    pub fn with_platform(platform: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            namespace: namespace.into(),
        }
    }

    /// The restore prefix shared by every key from this resolver.
    pub fn prefix(&self) -> String {
        format!("{}-{}-", self.platform, self.namespace)
    }

    /// Resolves the cache key for the given descriptor files.
    ///
    /// Each file is hashed on its own and the digests are folded in the
    /// given order, so renaming or moving a descriptor does not change
    /// the key while editing a single byte does.
    ///
    /// # Errors
    ///
    /// [`CacheError::NoDescriptors`] for an empty list, or
    /// [`CacheError::Descriptor`] if a file cannot be read.
    pub fn resolve(&self, descriptors: &[PathBuf]) -> Result<CacheKey, CacheError> {
        if descriptors.is_empty() {
            return Err(CacheError::NoDescriptors);
        }

        let mut hasher = Sha256::new();
        for path in descriptors {
            let digest = compute_file_hash(path)?;
            hasher.update(digest.as_bytes());
        }

        let prefix = self.prefix();
        let key = format!("{}{:x}", prefix, hasher.finalize());
        debug!("Resolved cache key {} from {} descriptor(s)", key, descriptors.len());

        Ok(CacheKey { key, prefix })
    }
}

/// `<os>-<arch>` of the running host.
pub fn host_platform() -> String {
    format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH)
}

/// Computes the SHA256 hash of a file as lowercase hex.
///
/// Reads the file in chunks to avoid loading large files entirely into memory.
pub fn compute_file_hash(path: &Path) -> Result<String, CacheError> {
    let descriptor_err = |source: std::io::Error| CacheError::Descriptor {
        path: path.to_path_buf(),
        source,
    };

    let mut file = std::fs::File::open(path).map_err(descriptor_err)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = file.read(&mut buffer).map_err(descriptor_err)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// An entry returned by a prefix lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub key: String,
    pub blob: Vec<u8>,
}

/// Storage for cache blobs.
///
/// Implementations must make `put` atomic per key: a concurrent reader sees
/// either the previous blob or the new one, never a partial write. Since
/// keys are content hashes, concurrent puts of the same key are equivalent
/// and the last one wins.
pub trait CacheStore: Send + Sync {
    /// Returns the blob stored under `key`, or `None` if there is none.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Stores `blob` under `key`.
    fn put(&self, key: &str, blob: &[u8]) -> Result<(), CacheError>;

    /// Returns the most recently written entry whose key starts with `prefix`.
    fn get_by_prefix(&self, prefix: &str) -> Result<Option<StoredEntry>, CacheError>;
}

/// Result of a cache lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    /// The exact key was present.
    ExactHit(Vec<u8>),
    /// Only an older entry under the same prefix was found.
    PrefixHit { key: String, blob: Vec<u8> },
    /// Nothing usable was found.
    Miss,
}

impl CacheLookup {
    /// The summary recorded on job results.
    pub fn outcome(&self) -> CacheOutcome {
        match self {
            CacheLookup::ExactHit(_) => CacheOutcome::ExactHit,
            CacheLookup::PrefixHit { .. } => CacheOutcome::PrefixHit,
            CacheLookup::Miss => CacheOutcome::Miss,
        }
    }

    /// The blob to restore, if any.
    pub fn blob(&self) -> Option<&[u8]> {
        match self {
            CacheLookup::ExactHit(blob) | CacheLookup::PrefixHit { blob, .. } => Some(blob),
            CacheLookup::Miss => None,
        }
    }
}

/// What happened to the cache for one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOutcome {
    ExactHit,
    PrefixHit,
    Miss,
    /// Caching is turned off for this run.
    #[default]
    Disabled,
    /// The key could not be resolved (e.g. missing descriptor).
    Unavailable,
}

impl fmt::Display for CacheOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CacheOutcome::ExactHit => "exact hit",
            CacheOutcome::PrefixHit => "prefix hit",
            CacheOutcome::Miss => "miss",
            CacheOutcome::Disabled => "disabled",
            CacheOutcome::Unavailable => "unavailable",
        };
        f.write_str(s)
    }
}

/// Looks up `key`, falling back to its prefix.
///
/// A prefix entry only counts if the rest of its key is a bare content
/// hash, so `maven-` never restores entries written under `maven-it-`.
/// Store errors are logged and treated as absent, so this never fails.
pub fn lookup(store: &dyn CacheStore, key: &CacheKey) -> CacheLookup {
    match store.get(key.as_str()) {
        Ok(Some(blob)) => return CacheLookup::ExactHit(blob),
        Ok(None) => {}
        Err(e) => warn!("Cache lookup for {} failed: {}", key, e),
    }

    match store.get_by_prefix(key.prefix()) {
        Ok(Some(entry)) if entry.key == key.as_str() => CacheLookup::ExactHit(entry.blob),
        Ok(Some(entry))
            if entry
                .key
                .strip_prefix(key.prefix())
                .is_some_and(is_content_hash) =>
        {
            CacheLookup::PrefixHit {
                key: entry.key,
                blob: entry.blob,
            }
        }
        Ok(Some(entry)) => {
            debug!("Ignoring {} under prefix {}", entry.key, key.prefix());
            CacheLookup::Miss
        }
        Ok(None) => CacheLookup::Miss,
        Err(e) => {
            warn!("Cache prefix lookup for {} failed: {}", key.prefix(), e);
            CacheLookup::Miss
        }
    }
}

fn is_content_hash(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Packs cache paths (relative to `root`) into a tar archive.
///
/// Paths that do not exist are skipped. Returns `None` if none exist.
pub fn pack(root: &Path, paths: &[PathBuf]) -> Result<Option<Vec<u8>>, CacheError> {
    let archive_err = |e: std::io::Error| CacheError::Archive(e.to_string());
    let mut builder = tar::Builder::new(Vec::new());
    let mut packed = 0;

    for rel in paths {
        let abs = root.join(rel);
        if abs.is_dir() {
            builder.append_dir_all(rel, &abs).map_err(archive_err)?;
        } else if abs.is_file() {
            builder.append_path_with_name(&abs, rel).map_err(archive_err)?;
        } else {
            debug!("Cache path {} does not exist, skipping", abs.display());
            continue;
        }
        packed += 1;
    }

    if packed == 0 {
        return Ok(None);
    }

    let blob = builder.into_inner().map_err(archive_err)?;
    Ok(Some(blob))
}

/// Unpacks a cache archive into `root`.
pub fn unpack(blob: &[u8], root: &Path) -> Result<(), CacheError> {
    let mut archive = tar::Archive::new(blob);
    archive
        .unpack(root)
        .map_err(|e| CacheError::Archive(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use memory::MemoryCacheStore;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_key_is_deterministic() {
        let dir = TempDir::new().unwrap();
        let pom = write(&dir, "pom.xml", "<project/>");
        let resolver = CacheKeyResolver::with_platform("linux-x86_64", "maven");

        let a = resolver.resolve(std::slice::from_ref(&pom)).unwrap();
        let b = resolver.resolve(&[pom]).unwrap();

        assert_eq!(a, b);
        assert!(a.as_str().starts_with("linux-x86_64-maven-"));
        assert_eq!(a.prefix(), "linux-x86_64-maven-");
        assert_eq!(a.hash().len(), 64);
        assert_eq!(a.as_str(), format!("{}{}", a.prefix(), a.hash()));
    }

    #[test]
    fn test_key_ignores_path() {
        let dir = TempDir::new().unwrap();
        let a = write(&dir, "pom.xml", "<project/>");
        let b = write(&dir, "other-pom.xml", "<project/>");
        let resolver = CacheKeyResolver::with_platform("linux-x86_64", "maven");

        assert_eq!(resolver.resolve(&[a]).unwrap(), resolver.resolve(&[b]).unwrap());
    }

    #[test]
    fn test_key_changes_with_one_byte() {
        let dir = TempDir::new().unwrap();
        let a = write(&dir, "a.xml", "<project/>");
        let b = write(&dir, "b.xml", "<project/ >");
        let resolver = CacheKeyResolver::with_platform("linux-x86_64", "maven");

        assert_ne!(resolver.resolve(&[a]).unwrap(), resolver.resolve(&[b]).unwrap());
    }

    #[test]
    fn test_key_depends_on_descriptor_order() {
        let dir = TempDir::new().unwrap();
        let a = write(&dir, "a.xml", "a");
        let b = write(&dir, "b.xml", "b");
        let resolver = CacheKeyResolver::with_platform("linux-x86_64", "maven");

        let ab = resolver.resolve(&[a.clone(), b.clone()]).unwrap();
        let ba = resolver.resolve(&[b, a]).unwrap();
        assert_ne!(ab, ba);
    }

    #[test]
    fn test_missing_descriptor_is_error() {
        let resolver = CacheKeyResolver::new("maven");
        let err = resolver
            .resolve(&[PathBuf::from("/nonexistent/pom.xml")])
            .unwrap_err();
        assert!(matches!(err, CacheError::Descriptor { .. }));

        assert!(matches!(
            resolver.resolve(&[]).unwrap_err(),
            CacheError::NoDescriptors
        ));
    }

    #[test]
    fn test_lookup_exact_prefix_and_miss() {
        let dir = TempDir::new().unwrap();
        let old = write(&dir, "old.xml", "v1");
        let new = write(&dir, "new.xml", "v2");
        let resolver = CacheKeyResolver::with_platform("linux-x86_64", "maven");
        let old_key = resolver.resolve(&[old]).unwrap();
        let new_key = resolver.resolve(&[new]).unwrap();

        let store = MemoryCacheStore::new();
        assert_eq!(lookup(&store, &new_key), CacheLookup::Miss);

        store.put(old_key.as_str(), b"deps-v1").unwrap();
        match lookup(&store, &new_key) {
            CacheLookup::PrefixHit { key, blob } => {
                assert_eq!(key, old_key.as_str());
                assert_eq!(blob, b"deps-v1");
            }
            other => panic!("expected prefix hit, got {:?}", other),
        }

        store.put(new_key.as_str(), b"deps-v2").unwrap();
        assert_eq!(
            lookup(&store, &new_key),
            CacheLookup::ExactHit(b"deps-v2".to_vec())
        );
    }

    #[test]
    fn test_lookup_ignores_other_namespace() {
        let dir = TempDir::new().unwrap();
        let pom = write(&dir, "pom.xml", "v1");
        let maven = CacheKeyResolver::with_platform("linux-x86_64", "maven")
            .resolve(std::slice::from_ref(&pom))
            .unwrap();
        let gradle = CacheKeyResolver::with_platform("linux-x86_64", "gradle")
            .resolve(&[pom])
            .unwrap();

        let store = MemoryCacheStore::new();
        store.put(gradle.as_str(), b"gradle").unwrap();
        assert_eq!(lookup(&store, &maven), CacheLookup::Miss);
    }

    #[test]
    fn test_lookup_ignores_longer_namespace() {
        let dir = TempDir::new().unwrap();
        let pom = write(&dir, "pom.xml", "v1");
        let maven = CacheKeyResolver::with_platform("linux-x86_64", "maven")
            .resolve(std::slice::from_ref(&pom))
            .unwrap();
        let maven_it = CacheKeyResolver::with_platform("linux-x86_64", "maven-it")
            .resolve(&[pom])
            .unwrap();
        assert!(maven_it.as_str().starts_with(maven.prefix()));

        let store = MemoryCacheStore::new();
        store.put(maven_it.as_str(), b"integration").unwrap();
        assert_eq!(lookup(&store, &maven), CacheLookup::Miss);
    }

    /// Store whose exact reads always fail.
    struct FailingGet(MemoryCacheStore);

    impl CacheStore for FailingGet {
        fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, CacheError> {
            Err(CacheError::Io(std::io::Error::other("disk error")))
        }

        fn put(&self, key: &str, blob: &[u8]) -> Result<(), CacheError> {
            self.0.put(key, blob)
        }

        fn get_by_prefix(&self, prefix: &str) -> Result<Option<StoredEntry>, CacheError> {
            self.0.get_by_prefix(prefix)
        }
    }

    #[test]
    fn test_prefix_entry_with_same_key_is_exact_hit() {
        let dir = TempDir::new().unwrap();
        let pom = write(&dir, "pom.xml", "v1");
        let key = CacheKeyResolver::with_platform("linux-x86_64", "maven")
            .resolve(&[pom])
            .unwrap();

        let store = FailingGet(MemoryCacheStore::new());
        store.put(key.as_str(), b"deps").unwrap();
        assert_eq!(lookup(&store, &key), CacheLookup::ExactHit(b"deps".to_vec()));
    }

    #[test]
    fn test_pack_and_unpack() {
        let src = TempDir::new().unwrap();
        std::fs::create_dir_all(src.path().join(".m2/repository/org")).unwrap();
        std::fs::write(src.path().join(".m2/repository/org/lib.jar"), b"jar").unwrap();
        std::fs::write(src.path().join("deps.lock"), b"lock").unwrap();

        let blob = pack(
            src.path(),
            &[
                PathBuf::from(".m2/repository"),
                PathBuf::from("deps.lock"),
                PathBuf::from("missing"),
            ],
        )
        .unwrap()
        .unwrap();

        let dst = TempDir::new().unwrap();
        unpack(&blob, dst.path()).unwrap();
        assert_eq!(
            std::fs::read(dst.path().join(".m2/repository/org/lib.jar")).unwrap(),
            b"jar"
        );
        assert_eq!(std::fs::read(dst.path().join("deps.lock")).unwrap(), b"lock");
    }

    #[test]
    fn test_pack_nothing() {
        let src = TempDir::new().unwrap();
        assert!(pack(src.path(), &[PathBuf::from("missing")]).unwrap().is_none());
    }
}
