//! Content-addressed asset storage.
//!
//! Assets are looked up by [`ContentHash`] across two layers: the bytes
//! embedded in the installed binary, and an on-disk cache directory whose
//! file names are the hashes of their contents. Embedded content wins since
//! it never needs a download.

use crate::error::{Result, UpdatesError};
use crate::manifest::ContentHash;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Where a resolved asset lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedAsset {
    /// Shipped inside the binary.
    Embedded(Bytes),
    /// Present in the local cache directory.
    Cached(PathBuf),
}

/// Two-layer asset store keyed by content hash.
///
/// Once a hash is present its content never changes. Recording the same
/// hash again is a no-op rather than an overwrite.
#[derive(Debug)]
pub struct AssetStore {
    embedded: HashMap<ContentHash, Bytes>,
    cache_dir: PathBuf,
    cached: RwLock<HashMap<ContentHash, PathBuf>>,
}

impl AssetStore {
    /// Create a store over `cache_dir` with a fixed set of embedded assets.
    ///
    /// The directory is created if it does not exist. Existing files are
    /// not indexed until [`AssetStore::scan_cache`] runs.
    pub fn new<P: AsRef<Path>>(cache_dir: P, embedded: HashMap<ContentHash, Bytes>) -> Result<Self> {
        let cache_dir = cache_dir.as_ref().to_path_buf();
        if !cache_dir.exists() {
            fs::create_dir_all(&cache_dir)?;
        }
        Ok(Self {
            embedded,
            cache_dir,
            cached: RwLock::new(HashMap::new()),
        })
    }

    /// Create a store whose embedded layer is built by hashing `blobs`.
    pub fn with_embedded_blobs<P, I>(cache_dir: P, blobs: I) -> Result<Self>
    where
        P: AsRef<Path>,
        I: IntoIterator<Item = Bytes>,
    {
        let embedded = blobs
            .into_iter()
            .map(|blob| (ContentHash::of(&blob), blob))
            .collect();
        Self::new(cache_dir, embedded)
    }

    /// Index content-addressed files already present in the cache directory.
    ///
    /// Files whose name is not a digest are ignored. Entries that cannot be
    /// read, or whose content no longer matches their name, are skipped with
    /// a warning. Returns the number of indexed assets.
    pub fn scan_cache(&self) -> Result<usize> {
        let mut found = HashMap::new();
        for entry in fs::read_dir(&self.cache_dir)? {
            let path = match entry {
                Ok(entry) => entry.path(),
                Err(err) => {
                    warn!(dir = %self.cache_dir.display(), %err, "skipping unreadable cache entry");
                    continue;
                }
            };
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Ok(expected) = ContentHash::parse(name) else {
                continue;
            };
            let actual = match ContentHash::of_file(&path) {
                Ok(actual) => actual,
                Err(err) => {
                    warn!(path = %path.display(), %err, "skipping unreadable cached asset");
                    continue;
                }
            };
            if actual != expected {
                warn!(path = %path.display(), %expected, %actual, "skipping corrupt cached asset");
                continue;
            }
            found.insert(expected, path);
        }

        let count = found.len();
        self.write_cached().extend(found);
        debug!(count, dir = %self.cache_dir.display(), "indexed asset cache");
        Ok(count)
    }

    /// Store `bytes` in the cache and return their hash.
    pub fn record(&self, bytes: &[u8]) -> Result<ContentHash> {
        let hash = ContentHash::of(bytes);
        self.insert(&hash, bytes)?;
        Ok(hash)
    }

    /// Store `bytes` only if they hash to `expected`.
    pub fn record_verified(&self, expected: &ContentHash, bytes: &[u8]) -> Result<()> {
        let actual = ContentHash::of(bytes);
        if &actual != expected {
            return Err(UpdatesError::HashMismatch {
                expected: expected.clone(),
                actual,
            });
        }
        self.insert(expected, bytes)
    }

    fn insert(&self, hash: &ContentHash, bytes: &[u8]) -> Result<()> {
        if self.contains(hash) {
            return Ok(());
        }

        let target = self.cache_dir.join(hash.as_str());
        let mut temp = NamedTempFile::new_in(&self.cache_dir)?;
        temp.write_all(bytes)?;
        temp.flush()?;
        temp.as_file().sync_all()?;
        temp.into_temp_path()
            .persist(&target)
            .map_err(|err| UpdatesError::Io(err.error))?;

        self.write_cached().insert(hash.clone(), target);
        debug!(%hash, size = bytes.len(), "recorded asset");
        Ok(())
    }

    /// Locate content by hash, embedded layer first.
    pub fn resolve(&self, hash: &ContentHash) -> Option<ResolvedAsset> {
        if let Some(bytes) = self.embedded.get(hash) {
            return Some(ResolvedAsset::Embedded(bytes.clone()));
        }
        self.read_cached().get(hash).cloned().map(ResolvedAsset::Cached)
    }

    /// Load the bytes behind `hash`, if present.
    pub fn read(&self, hash: &ContentHash) -> Result<Option<Bytes>> {
        match self.resolve(hash) {
            Some(ResolvedAsset::Embedded(bytes)) => Ok(Some(bytes)),
            Some(ResolvedAsset::Cached(path)) => Ok(Some(Bytes::from(fs::read(path)?))),
            None => Ok(None),
        }
    }

    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.embedded.contains_key(hash) || self.read_cached().contains_key(hash)
    }

    pub fn embedded_hashes(&self) -> HashSet<ContentHash> {
        self.embedded.keys().cloned().collect()
    }

    pub fn cached_hashes(&self) -> HashSet<ContentHash> {
        self.read_cached().keys().cloned().collect()
    }

    /// Hashes from `hashes` that neither layer holds.
    pub fn missing_from<'a, I>(&self, hashes: I) -> HashSet<ContentHash>
    where
        I: IntoIterator<Item = &'a ContentHash>,
    {
        hashes
            .into_iter()
            .filter(|hash| !self.contains(hash))
            .cloned()
            .collect()
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    // Entries are insert-only, so a poisoned map is still consistent.
    fn read_cached(&self) -> RwLockReadGuard<'_, HashMap<ContentHash, PathBuf>> {
        self.cached
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_cached(&self) -> RwLockWriteGuard<'_, HashMap<ContentHash, PathBuf>> {
        self.cached
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
