//! KV family: one levelled collection of table files

use super::compaction::{pick_compaction, pick_rollup, MergerFactory, Rollup};
use super::compact_job::CompactJob;
use super::table::{TableBuilder, TableCache};
use super::version::{EditLog, FileMeta, Snapshot, VersionSet};
use crate::types::FileNumber;
use crate::{EmberError, Result};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Per-family build and compaction options
#[derive(Clone)]
pub struct FamilyOptions {
    /// Compaction output rollover size
    pub max_file_size: u64,
    /// Level-0 file count triggering compaction
    pub level0_compaction_threshold: usize,
    /// Merger used for duplicate keys during compaction
    pub merger: Arc<dyn MergerFactory>,
}

/// One family directory with its version set and reader cache
///
/// At most one write builder and one compaction job run per family at a time.
pub struct Family {
    name: String,
    dir: PathBuf,
    options: FamilyOptions,
    versions: VersionSet,
    cache: Arc<TableCache>,
    compacting: AtomicBool,
    broken: Mutex<HashSet<FileNumber>>,
}

impl Family {
    /// Open or create the family under the store directory
    pub fn open(store_dir: &Path, name: &str, options: FamilyOptions) -> Result<Arc<Self>> {
        let dir = store_dir.join(name);
        std::fs::create_dir_all(&dir)?;
        let versions = VersionSet::recover(&dir)?;
        let cache = Arc::new(TableCache::new(&dir));
        Ok(Arc::new(Self {
            name: name.to_string(),
            dir,
            options,
            versions,
            cache,
            compacting: AtomicBool::new(false),
            broken: Mutex::new(HashSet::new()),
        }))
    }

    /// Family name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Family directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Merger factory of this family
    pub fn merger_factory(&self) -> &Arc<dyn MergerFactory> {
        &self.options.merger
    }

    /// Compaction output rollover size
    pub fn max_file_size(&self) -> u64 {
        self.options.max_file_size
    }

    /// New builder with a fresh file number, tracked as a pending output
    pub fn new_table_builder(&self) -> Result<TableBuilder> {
        let file_number = self.versions.next_file_number();
        self.versions.add_pending_output(file_number);
        TableBuilder::new(&self.dir, file_number)
    }

    /// Stop tracking a pending output
    pub fn remove_pending_output(&self, file_number: FileNumber) {
        self.versions.remove_pending_output(file_number);
    }

    /// Commit one edit batch
    pub fn commit(&self, edit: EditLog) -> Result<()> {
        self.versions.commit(edit)
    }

    /// Install a freshly flushed table at level 0
    pub fn commit_flush(&self, built: super::table::BuiltTable) -> Result<()> {
        let mut edit = EditLog::new();
        edit.add_file(
            0,
            FileMeta {
                file_number: built.file_number,
                min_key: built.min_key,
                max_key: built.max_key,
                size: built.size,
            },
        );
        let result = self.versions.commit(edit);
        self.versions.remove_pending_output(built.file_number);
        result
    }

    /// Point-in-time read view
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(self.versions.current(), self.cache.clone())
    }

    /// Whether the planner would schedule a compaction now
    pub fn needs_compaction(&self) -> bool {
        pick_compaction(
            &self.versions.current(),
            self.options.level0_compaction_threshold,
            &self.broken.lock(),
        )
        .is_some()
    }

    /// Run one compaction if due; returns whether a job ran
    pub fn compact(self: &Arc<Self>) -> Result<bool> {
        let Some(_guard) = CompactingGuard::acquire(self) else {
            return Ok(false);
        };
        let compaction = {
            let broken = self.broken.lock();
            pick_compaction(
                &self.versions.current(),
                self.options.level0_compaction_threshold,
                &broken,
            )
        };
        let Some(compaction) = compaction else {
            return Ok(false);
        };
        if !self.inputs_healthy(&compaction) {
            return Ok(false);
        }

        let result = CompactJob::new(self.clone(), compaction).run();
        match result {
            Ok(()) => {
                self.versions.delete_obsolete_files(&self.cache);
                Ok(true)
            }
            Err(e) => {
                warn!(family = %self.name, error = %e, "compaction job failed, inputs kept");
                Err(EmberError::Compaction(e.to_string()))
            }
        }
    }

    /// Roll this family up into a coarser-interval family; returns whether a
    /// job ran
    pub fn rollup_into(self: &Arc<Self>, target: &Arc<Family>, rollup: Rollup) -> Result<bool> {
        let Some(_guard) = CompactingGuard::acquire(self) else {
            return Ok(false);
        };
        let compaction = pick_rollup(&self.versions.current(), &self.broken.lock());
        let Some(compaction) = compaction else {
            return Ok(false);
        };
        if !self.inputs_healthy(&compaction) {
            return Ok(false);
        }
        CompactJob::new_rollup(self.clone(), target.clone(), compaction, rollup)
            .run()
            .map_err(|e| EmberError::Compaction(e.to_string()))?;
        Ok(true)
    }

    /// Evict idle readers and delete unreferenced table files
    pub fn cleanup(&self, ttl: Duration) {
        self.cache.cleanup(ttl);
        self.versions.delete_obsolete_files(&self.cache);
    }

    /// Pre-open the inputs; a corrupt file is marked broken and skipped
    fn inputs_healthy(&self, compaction: &super::compaction::Compaction) -> bool {
        for file in compaction.inputs().iter().flatten() {
            if let Err(e) = self.cache.get_reader(file.file_number) {
                if e.is_corruption() {
                    warn!(
                        family = %self.name,
                        file = file.file_number,
                        error = %e,
                        "marking broken table file"
                    );
                    self.broken.lock().insert(file.file_number);
                } else {
                    warn!(family = %self.name, file = file.file_number, error = %e, "open input failure");
                }
                return false;
            }
        }
        true
    }
}

struct CompactingGuard<'a> {
    family: &'a Family,
}

impl<'a> CompactingGuard<'a> {
    fn acquire(family: &'a Family) -> Option<Self> {
        family
            .compacting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { family })
    }
}

impl Drop for CompactingGuard<'_> {
    fn drop(&mut self) {
        self.family.compacting.store(false, Ordering::Release);
    }
}

impl Drop for Family {
    fn drop(&mut self) {
        info!(family = %self.name, "closing family");
    }
}
