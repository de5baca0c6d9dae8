//! Levelled file metadata with MVCC read views
//!
//! A `Version` is an immutable array of levels, each a sorted list of file
//! metas. Mutations go through `EditLog` batches appended to the manifest;
//! the `VersionSet` applies them copy-on-write and hands out `Arc<Version>`
//! views that snapshots pin for as long as they live.

mod edit;
mod snapshot;

pub use edit::{read_manifest, EditLog, EditRecord, ManifestWriter, MANIFEST_FILE_NAME};
pub use snapshot::Snapshot;

use crate::kv::table::TableCache;
use crate::types::FileNumber;
use crate::Result;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{info, warn};

/// Number of levels a family carries
pub const NUM_LEVELS: usize = 7;

/// Metadata of one table file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub file_number: FileNumber,
    pub min_key: u32,
    pub max_key: u32,
    pub size: u64,
}

impl FileMeta {
    /// Check if the key falls inside this file's range
    pub fn contains(&self, key: u32) -> bool {
        self.min_key <= key && key <= self.max_key
    }

    /// Check if the key ranges overlap
    pub fn overlaps(&self, min_key: u32, max_key: u32) -> bool {
        self.min_key <= max_key && min_key <= self.max_key
    }
}

/// Immutable view of a family's levels
#[derive(Debug, Clone, Default)]
pub struct Version {
    levels: Vec<Vec<FileMeta>>,
}

impl Version {
    /// A version with no files
    pub fn empty() -> Self {
        Self {
            levels: vec![Vec::new(); NUM_LEVELS],
        }
    }

    /// Files of one level
    pub fn files(&self, level: usize) -> &[FileMeta] {
        &self.levels[level]
    }

    /// All files across levels, level order then file order
    pub fn all_files(&self) -> impl Iterator<Item = (usize, &FileMeta)> {
        self.levels
            .iter()
            .enumerate()
            .flat_map(|(level, files)| files.iter().map(move |file| (level, file)))
    }

    /// Candidate files for a point lookup, newest first
    pub fn find_files(&self, key: u32) -> Vec<FileMeta> {
        let mut found = Vec::new();
        // level 0 may overlap; scan newest first
        for file in self.levels[0].iter().rev() {
            if file.contains(key) {
                found.push(*file);
            }
        }
        for files in &self.levels[1..] {
            for file in files {
                if file.contains(key) {
                    found.push(*file);
                }
            }
        }
        found
    }

    /// Files of a level overlapping the key range
    pub fn overlapping_files(&self, level: usize, min_key: u32, max_key: u32) -> Vec<FileMeta> {
        self.levels[level]
            .iter()
            .filter(|file| file.overlaps(min_key, max_key))
            .copied()
            .collect()
    }

    /// File numbers referenced by this version
    pub fn live_files(&self) -> HashSet<FileNumber> {
        self.all_files().map(|(_, file)| file.file_number).collect()
    }

    /// Produce the version after applying one edit batch
    pub fn apply(&self, edit: &EditLog) -> Version {
        let mut next = self.clone();
        for record in &edit.records {
            match record {
                EditRecord::AddFile { level, file } => {
                    let files = &mut next.levels[*level];
                    files.push(*file);
                    if *level == 0 {
                        files.sort_by_key(|f| f.file_number);
                    } else {
                        files.sort_by_key(|f| f.min_key);
                    }
                }
                EditRecord::DeleteFile { level, file_number } => {
                    next.levels[*level].retain(|f| f.file_number != *file_number);
                }
                EditRecord::NextFileNumber(_) => {}
            }
        }
        next
    }
}

/// Owner of the current version and the manifest
pub struct VersionSet {
    dir: PathBuf,
    current: RwLock<Arc<Version>>,
    // every version ever published; pruned as snapshots drop them
    retained: Mutex<Vec<Weak<Version>>>,
    manifest: Mutex<ManifestWriter>,
    next_file_number: AtomicU64,
    pending_outputs: Mutex<HashSet<FileNumber>>,
}

impl VersionSet {
    /// Recover the version set from the family directory
    ///
    /// Replays the manifest, then rewrites it as a single checkpoint batch.
    pub fn recover(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let mut version = Version::empty();
        let mut next_file_number = 1u64;
        for edit in read_manifest(&dir)? {
            for record in &edit.records {
                if let EditRecord::NextFileNumber(n) = record {
                    next_file_number = next_file_number.max(*n);
                }
            }
            version = version.apply(&edit);
        }

        // checkpoint: one batch describing the recovered state
        let mut checkpoint = EditLog::new();
        for (level, file) in version.all_files() {
            checkpoint.add_file(level, *file);
        }
        checkpoint
            .records
            .push(EditRecord::NextFileNumber(next_file_number));
        let manifest = ManifestWriter::checkpoint(&dir, &checkpoint)?;

        Ok(Self {
            dir,
            current: RwLock::new(Arc::new(version)),
            retained: Mutex::new(Vec::new()),
            manifest: Mutex::new(manifest),
            next_file_number: AtomicU64::new(next_file_number),
            pending_outputs: Mutex::new(HashSet::new()),
        })
    }

    /// Current version
    pub fn current(&self) -> Arc<Version> {
        self.current.read().clone()
    }

    /// Allocate the next table file number
    pub fn next_file_number(&self) -> FileNumber {
        self.next_file_number.fetch_add(1, Ordering::AcqRel)
    }

    /// Track a file being written so obsolete-file GC spares it
    pub fn add_pending_output(&self, file_number: FileNumber) {
        self.pending_outputs.lock().insert(file_number);
    }

    /// Stop tracking a pending output
    pub fn remove_pending_output(&self, file_number: FileNumber) {
        self.pending_outputs.lock().remove(&file_number);
    }

    /// Apply and persist one edit batch
    pub fn commit(&self, mut edit: EditLog) -> Result<()> {
        edit.records.push(EditRecord::NextFileNumber(
            self.next_file_number.load(Ordering::Acquire),
        ));
        let mut manifest = self.manifest.lock();
        manifest.append(&edit)?;

        let mut current = self.current.write();
        let next = Arc::new(current.apply(&edit));
        self.retained.lock().push(Arc::downgrade(&current));
        *current = next;
        Ok(())
    }

    /// Delete table files no live version or pending output references
    pub fn delete_obsolete_files(&self, cache: &TableCache) {
        let mut live = self.current().live_files();
        {
            let mut retained = self.retained.lock();
            retained.retain(|weak| {
                if let Some(version) = weak.upgrade() {
                    live.extend(version.live_files());
                    true
                } else {
                    false
                }
            });
        }
        live.extend(self.pending_outputs.lock().iter().copied());

        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "list family dir failure");
                return;
            }
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(stem) = name.strip_suffix(".sst") else {
                continue;
            };
            let Ok(file_number) = stem.parse::<FileNumber>() else {
                continue;
            };
            if live.contains(&file_number) {
                continue;
            }
            if let Err(e) = std::fs::remove_file(entry.path()) {
                warn!(file = %name, error = %e, "remove obsolete table failure");
            } else {
                cache.evict(file_number);
                info!(dir = %self.dir.display(), file = %name, "removed obsolete table");
            }
        }
    }

    /// Family directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn meta(file_number: FileNumber, min_key: u32, max_key: u32) -> FileMeta {
        FileMeta {
            file_number,
            min_key,
            max_key,
            size: 10,
        }
    }

    #[test]
    fn test_commit_and_recover() {
        let dir = TempDir::new().unwrap();
        {
            let set = VersionSet::recover(dir.path()).unwrap();
            let n1 = set.next_file_number();
            let n2 = set.next_file_number();
            let mut edit = EditLog::new();
            edit.add_file(0, meta(n1, 0, 5));
            edit.add_file(0, meta(n2, 3, 9));
            set.commit(edit).unwrap();

            let mut edit = EditLog::new();
            edit.delete_file(0, n1);
            edit.add_file(1, meta(n1, 0, 5));
            set.commit(edit).unwrap();
        }

        let set = VersionSet::recover(dir.path()).unwrap();
        let version = set.current();
        assert_eq!(version.files(0), &[meta(2, 3, 9)]);
        assert_eq!(version.files(1), &[meta(1, 0, 5)]);
        // allocation resumes past recovered numbers
        assert!(set.next_file_number() >= 3);
    }

    #[test]
    fn test_find_files_newest_first_in_level0() {
        let mut version = Version::empty();
        let mut edit = EditLog::new();
        edit.add_file(0, meta(1, 0, 10));
        edit.add_file(0, meta(2, 5, 15));
        edit.add_file(1, meta(3, 0, 100));
        version = version.apply(&edit);

        let found = version.find_files(7);
        assert_eq!(
            found.iter().map(|f| f.file_number).collect::<Vec<_>>(),
            vec![2, 1, 3]
        );
        assert!(version.find_files(200).is_empty());
    }

    #[test]
    fn test_obsolete_file_protected_by_snapshot() {
        let dir = TempDir::new().unwrap();
        let set = VersionSet::recover(dir.path()).unwrap();
        let cache = TableCache::new(dir.path());

        // a real file on disk referenced only by the old version
        let n = set.next_file_number();
        let mut builder = crate::kv::table::TableBuilder::new(dir.path(), n).unwrap();
        builder.add(1, b"v").unwrap();
        builder.close().unwrap();

        let mut edit = EditLog::new();
        edit.add_file(0, meta(n, 1, 1));
        set.commit(edit).unwrap();

        let pinned = set.current();
        let mut edit = EditLog::new();
        edit.delete_file(0, n);
        set.commit(edit).unwrap();

        set.delete_obsolete_files(&cache);
        assert!(crate::kv::table::table_file_name(dir.path(), n).exists());

        drop(pinned);
        set.delete_obsolete_files(&cache);
        assert!(!crate::kv::table::table_file_name(dir.path(), n).exists());
    }
}
