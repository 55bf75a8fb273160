//! Content identity cache keyed by path, validated by (mtime, size).
//!
//! Hashing a file means spawning `git hash-object`, which dominates the cost
//! of reconciling a large special repository. Most files do not change
//! between cycles, so the cache memoizes the blob hash and serves it back as
//! long as the stored modification time and size match exactly. Any mismatch
//! invalidates the entry unconditionally; there is no tolerance window.
//!
//! The cache is process-lifetime only and bounded naturally by working-tree
//! cardinality, so no eviction policy is configured.

use std::{
    path::{Path, PathBuf},
    time::SystemTime,
};

use moka::sync::Cache;

/// One memoized hash, valid only while mtime and size are unchanged.
#[derive(Debug, Clone)]
struct CacheEntry {
    hash: String,
    mod_time: SystemTime,
    size: u64,
}

/// Shared, independently constructible hash cache.
///
/// Cloning yields another handle onto the same underlying cache.
#[derive(Debug, Clone)]
pub struct HashCache {
    inner: Cache<PathBuf, CacheEntry>,
}

impl HashCache {
    pub fn new() -> Self {
        Self { inner: Cache::builder().build() }
    }

    /// Returns the cached hash iff the stored mtime and size match exactly.
    pub fn get(&self, path: &Path, mod_time: SystemTime, size: u64) -> Option<String> {
        self.inner
            .get(path)
            .filter(|e| e.mod_time == mod_time && e.size == size)
            .map(|e| e.hash)
    }

    /// Records a hash, overwriting any prior entry for the path.
    pub fn set(&self, path: &Path, hash: String, mod_time: SystemTime, size: u64) {
        self.inner
            .insert(path.to_path_buf(), CacheEntry { hash, mod_time, size });
    }

    /// Number of cached entries (flushes pending maintenance first).
    pub fn len(&self) -> u64 {
        self.inner.run_pending_tasks();
        self.inner.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HashCache {
    fn default() -> Self {
        Self::new()
    }
}
