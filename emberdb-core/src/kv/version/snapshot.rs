//! Point-in-time read view of a family

use super::Version;
use crate::kv::table::{TableCache, TableReader};
use crate::{EmberError, Result};
use std::sync::Arc;

/// Immutable view over one family's files
///
/// Holding the snapshot pins its `Version`, which in turn protects the
/// underlying table files from obsolete-file deletion.
pub struct Snapshot {
    version: Arc<Version>,
    cache: Arc<TableCache>,
}

impl Snapshot {
    pub(crate) fn new(version: Arc<Version>, cache: Arc<TableCache>) -> Self {
        Self { version, cache }
    }

    /// The pinned version
    pub fn version(&self) -> &Arc<Version> {
        &self.version
    }

    /// Readers of every file that may contain the key, newest first
    pub fn find_readers(&self, key: u32) -> Result<Vec<Arc<TableReader>>> {
        let mut readers = Vec::new();
        for file in self.version.find_files(key) {
            readers.push(self.cache.get_reader(file.file_number)?);
        }
        Ok(readers)
    }

    /// Reader of one file pinned by this snapshot
    pub fn find_reader(&self, file_number: crate::types::FileNumber) -> Result<Arc<TableReader>> {
        self.cache.get_reader(file_number)
    }

    /// Readers of every file in the snapshot, newest first
    pub fn readers(&self) -> Result<Vec<Arc<TableReader>>> {
        let mut readers = Vec::new();
        for (_, file) in self.version.all_files() {
            readers.push(self.cache.get_reader(file.file_number)?);
        }
        Ok(readers)
    }

    /// Call `loader` with the value of `key` in every matching file
    ///
    /// A missing key in one file is skipped; any loader error aborts.
    pub fn load<F>(&self, key: u32, mut loader: F) -> Result<()>
    where
        F: FnMut(&[u8]) -> Result<()>,
    {
        for reader in self.find_readers(key)? {
            match reader.get(key) {
                Ok(value) => loader(value)?,
                Err(EmberError::KeyNotExist) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
