//! Cache of open table readers

use super::TableReader;
use crate::types::FileNumber;
use crate::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

struct CacheEntry {
    reader: Arc<TableReader>,
    last_access: Instant,
}

/// Keeps table readers open across lookups
///
/// Entries idle longer than the TTL are dropped by `cleanup`; snapshots that
/// still hold the `Arc` keep the mapping alive until they release it.
pub struct TableCache {
    dir: PathBuf,
    entries: Mutex<HashMap<FileNumber, CacheEntry>>,
}

impl TableCache {
    /// Cache for table files under `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Directory the cached tables live in
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Get an open reader, opening and caching the file on first access
    pub fn get_reader(&self, file_number: FileNumber) -> Result<Arc<TableReader>> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&file_number) {
            entry.last_access = Instant::now();
            return Ok(entry.reader.clone());
        }
        let reader = Arc::new(TableReader::open(&self.dir, file_number)?);
        entries.insert(
            file_number,
            CacheEntry {
                reader: reader.clone(),
                last_access: Instant::now(),
            },
        );
        Ok(reader)
    }

    /// Drop the cached reader of a deleted file
    pub fn evict(&self, file_number: FileNumber) {
        self.entries.lock().remove(&file_number);
    }

    /// Drop readers idle longer than `ttl`
    pub fn cleanup(&self, ttl: Duration) {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.last_access.elapsed() < ttl);
        let dropped = before - entries.len();
        if dropped > 0 {
            debug!(dir = %self.dir.display(), dropped, "evicted idle table readers");
        }
    }

    /// Number of cached readers
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check if no reader is cached
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::table::TableBuilder;
    use tempfile::TempDir;

    #[test]
    fn test_cache_reuses_reader() {
        let dir = TempDir::new().unwrap();
        let mut builder = TableBuilder::new(dir.path(), 1).unwrap();
        builder.add(1, b"v").unwrap();
        builder.close().unwrap();

        let cache = TableCache::new(dir.path());
        let first = cache.get_reader(1).unwrap();
        let second = cache.get_reader(1).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_cleanup_drops_idle_readers() {
        let dir = TempDir::new().unwrap();
        let mut builder = TableBuilder::new(dir.path(), 1).unwrap();
        builder.add(1, b"v").unwrap();
        builder.close().unwrap();

        let cache = TableCache::new(dir.path());
        let held = cache.get_reader(1).unwrap();
        cache.cleanup(Duration::ZERO);
        assert!(cache.is_empty());
        // the held Arc keeps the mapping usable after eviction
        assert_eq!(held.get(1).unwrap(), b"v");
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let cache = TableCache::new(dir.path());
        assert!(cache.get_reader(42).is_err());
    }
}
