//! Compaction planning

use super::version::{EditLog, FileMeta, Version, NUM_LEVELS};
use crate::types::{FileNumber, SlotId};
use crate::Result;
use std::collections::HashSet;

/// Base size budget of level 1; deeper levels scale by the multiplier
const BASE_LEVEL_SIZE: u64 = 64 * 1024 * 1024;
const LEVEL_SIZE_MULTIPLIER: u64 = 10;

/// Rollup context: re-base slots from a fine interval family onto a coarser one
#[derive(Debug, Clone, Copy)]
pub struct Rollup {
    /// Source slot width in milliseconds
    pub source_interval: i64,
    /// Target slot width in milliseconds
    pub target_interval: i64,
    /// Family time of the source family
    pub source_family_time: i64,
    /// Family time of the target family owning the source range
    pub target_family_time: i64,
}

impl Rollup {
    /// Slots per target slot
    pub fn ratio(&self) -> i64 {
        self.target_interval / self.source_interval
    }

    /// Target slot of a source slot
    pub fn rollup_slot(&self, slot: SlotId) -> SlotId {
        let ts = self.source_family_time + slot as i64 * self.source_interval;
        ((ts - self.target_family_time) / self.target_interval) as SlotId
    }
}

/// Merges the duplicate-key values produced by one compaction input run
pub trait Merger: Send {
    /// Merge the values of one key, oldest input first
    fn merge(&mut self, key: u32, values: &[&[u8]]) -> Result<Vec<u8>>;
}

/// Creates mergers for compaction jobs
pub trait MergerFactory: Send + Sync {
    /// Create a merger; `rollup` is set for rollup jobs
    fn create(&self, rollup: Option<Rollup>) -> Box<dyn Merger>;
}

/// One planned compaction: the level's input files and the overlap above
#[derive(Debug)]
pub struct Compaction {
    level: usize,
    inputs: [Vec<FileMeta>; 2],
    edit: EditLog,
}

impl Compaction {
    /// Source level of the compaction
    pub fn level(&self) -> usize {
        self.level
    }

    /// Input files of the source level and of the level above
    pub fn inputs(&self) -> &[Vec<FileMeta>; 2] {
        &self.inputs
    }

    /// A single source file with no overlap above only needs a metadata move
    pub fn is_trivial_move(&self) -> bool {
        self.inputs[0].len() == 1 && self.inputs[1].is_empty()
    }

    /// Record deletion of every input file
    pub fn mark_input_deletes(&mut self) {
        for file in &self.inputs[0] {
            self.edit.delete_file(self.level, file.file_number);
        }
        for file in &self.inputs[1] {
            self.edit.delete_file(self.level + 1, file.file_number);
        }
    }

    /// Record an added file
    pub fn add_file(&mut self, level: usize, file: FileMeta) {
        self.edit.add_file(level, file);
    }

    /// Record a deleted file
    pub fn delete_file(&mut self, level: usize, file_number: crate::types::FileNumber) {
        self.edit.delete_file(level, file_number);
    }

    /// Consume the accumulated edit batch
    pub fn into_edit(self) -> EditLog {
        self.edit
    }

    /// Take the accumulated edit batch, leaving an empty one
    pub fn take_edit(&mut self) -> EditLog {
        std::mem::take(&mut self.edit)
    }
}

/// Pick the next compaction for a version, if one is due
///
/// Level 0 compacts by file count; deeper levels compact by size, choosing
/// the file overlapping the most files above it. Files marked broken never
/// join a compaction.
pub fn pick_compaction(
    version: &Version,
    level0_threshold: usize,
    broken: &HashSet<FileNumber>,
) -> Option<Compaction> {
    let healthy = |file: &&FileMeta| !broken.contains(&file.file_number);

    let level0: Vec<FileMeta> = version.files(0).iter().filter(healthy).copied().collect();
    if level0.len() >= level0_threshold {
        let min_key = level0.iter().map(|f| f.min_key).min()?;
        let max_key = level0.iter().map(|f| f.max_key).max()?;
        let overlap = version
            .overlapping_files(1, min_key, max_key)
            .into_iter()
            .filter(|file| !broken.contains(&file.file_number))
            .collect();
        return Some(Compaction {
            level: 0,
            inputs: [level0, overlap],
            edit: EditLog::new(),
        });
    }

    for level in 1..NUM_LEVELS - 1 {
        let files: Vec<FileMeta> = version.files(level).iter().filter(healthy).copied().collect();
        let size: u64 = files.iter().map(|f| f.size).sum();
        if size <= target_size(level) {
            continue;
        }
        let picked = files.iter().max_by_key(|file| {
            version
                .overlapping_files(level + 1, file.min_key, file.max_key)
                .len()
        })?;
        let overlap = version
            .overlapping_files(level + 1, picked.min_key, picked.max_key)
            .into_iter()
            .filter(|file| !broken.contains(&file.file_number))
            .collect();
        return Some(Compaction {
            level,
            inputs: [vec![*picked], overlap],
            edit: EditLog::new(),
        });
    }
    None
}

/// Plan a rollup over every healthy file of the version
pub fn pick_rollup(version: &Version, broken: &HashSet<FileNumber>) -> Option<Compaction> {
    let mut inputs = Vec::new();
    for level in 0..NUM_LEVELS {
        inputs.extend(
            version
                .files(level)
                .iter()
                .filter(|file| !broken.contains(&file.file_number))
                .copied(),
        );
    }
    if inputs.is_empty() {
        return None;
    }
    Some(Compaction {
        level: 0,
        inputs: [inputs, Vec::new()],
        edit: EditLog::new(),
    })
}

fn target_size(level: usize) -> u64 {
    BASE_LEVEL_SIZE * LEVEL_SIZE_MULTIPLIER.pow(level as u32 - 1)
}
