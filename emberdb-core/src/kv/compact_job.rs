//! Compaction job: merge input tables through a merger into output tables

use super::compaction::{Compaction, Rollup};
use super::family::Family;
use super::table::{MergedIterator, TableBuilder};
use super::version::FileMeta;
use crate::{EmberError, Result};
use std::sync::Arc;
use tracing::{info, warn};

/// Runs one planned compaction against a family
///
/// Merge jobs stream a merged iterator over the inputs, hand duplicate-key
/// runs to the family's merger and roll output files at the configured size.
/// Any error aborts the job: pending outputs are removed, no edit is
/// committed, and the inputs stay where they were.
pub struct CompactJob {
    family: Arc<Family>,
    /// Family receiving the outputs; differs from `family` for rollup
    output_family: Arc<Family>,
    compaction: Compaction,
    rollup: Option<Rollup>,
    builder: Option<TableBuilder>,
    outputs: Vec<FileMeta>,
}

impl CompactJob {
    /// Job compacting within one family
    pub fn new(family: Arc<Family>, compaction: Compaction) -> Self {
        Self {
            output_family: family.clone(),
            family,
            compaction,
            rollup: None,
            builder: None,
            outputs: Vec::new(),
        }
    }

    /// Job rolling a family up into a coarser-interval family
    pub fn new_rollup(
        family: Arc<Family>,
        target: Arc<Family>,
        compaction: Compaction,
        rollup: Rollup,
    ) -> Self {
        Self {
            family,
            output_family: target,
            compaction,
            rollup: Some(rollup),
            builder: None,
            outputs: Vec::new(),
        }
    }

    /// Run the compaction
    pub fn run(mut self) -> Result<()> {
        if self.rollup.is_none() && self.compaction.is_trivial_move() {
            self.move_compaction();
            return Ok(());
        }
        let result = self.merge_compaction();
        if result.is_err() {
            self.cleanup();
        }
        result
    }

    /// Re-level a single file without rewriting data
    fn move_compaction(mut self) {
        let level = self.compaction.level();
        let file = self.compaction.inputs()[0][0];
        info!(
            family = %self.family.name(),
            file = file.file_number,
            level,
            "trivial move compaction"
        );
        self.compaction.delete_file(level, file.file_number);
        self.compaction.add_file(level + 1, file);
        if let Err(e) = self.family.commit(self.compaction.into_edit()) {
            warn!(family = %self.family.name(), error = %e, "commit trivial move failure");
        }
    }

    fn merge_compaction(&mut self) -> Result<()> {
        let kind = if self.rollup.is_some() {
            "rollup"
        } else {
            "merge"
        };
        info!(
            family = %self.family.name(),
            level = self.compaction.level(),
            inputs = self.compaction.inputs()[0].len() + self.compaction.inputs()[1].len(),
            kind,
            "starting compaction job"
        );

        let snapshot = self.family.snapshot();
        // oldest first: upper level, then the source level in file order, so
        // mergers see values in write order
        let mut files: Vec<FileMeta> = self.compaction.inputs()[1].to_vec();
        let mut source = self.compaction.inputs()[0].to_vec();
        source.sort_by_key(|f| f.file_number);
        files.extend(source);

        let mut readers = Vec::with_capacity(files.len());
        for file in &files {
            readers.push(snapshot.find_reader(file.file_number)?);
        }

        let mut merger = self.family.merger_factory().create(self.rollup);
        let merged = MergedIterator::new(readers.iter().map(|reader| reader.iter()).collect());

        let mut current_key: Option<u32> = None;
        let mut run: Vec<&[u8]> = Vec::new();
        for (key, value) in merged {
            match current_key {
                Some(previous) if previous == key => run.push(value),
                Some(previous) => {
                    let block = merger.merge(previous, &run)?;
                    self.flush(previous, &block)?;
                    run.clear();
                    run.push(value);
                }
                None => run.push(value),
            }
            current_key = Some(key);
        }
        if let Some(key) = current_key {
            let block = merger.merge(key, &run)?;
            self.flush(key, &block)?;
        }
        if self.builder.is_some() {
            self.finish_output_file()?;
        }

        self.install_results()?;
        info!(family = %self.family.name(), outputs = self.outputs.len(), kind, "compaction job done");
        Ok(())
    }

    /// Append one merged entry, rolling output files at the size limit
    fn flush(&mut self, key: u32, value: &[u8]) -> Result<()> {
        if value.is_empty() {
            return Ok(());
        }
        if self.builder.is_none() {
            self.builder = Some(self.output_family.new_table_builder()?);
        }
        let builder = self.builder.as_mut().ok_or_else(|| {
            EmberError::Internal("compaction output builder missing".into())
        })?;
        builder.add(key, value)?;
        if builder.size() >= self.output_family.max_file_size() {
            self.finish_output_file()?;
        }
        Ok(())
    }

    fn finish_output_file(&mut self) -> Result<()> {
        let Some(builder) = self.builder.take() else {
            return Ok(());
        };
        if builder.count() == 0 {
            let file_number = builder.file_number();
            builder.abandon()?;
            self.output_family.remove_pending_output(file_number);
            return Ok(());
        }
        let built = builder.close().map_err(|e| {
            EmberError::Compaction(format!("close compaction output: {}", e))
        })?;
        self.outputs.push(FileMeta {
            file_number: built.file_number,
            min_key: built.min_key,
            max_key: built.max_key,
            size: built.size,
        });
        Ok(())
    }

    /// Install results: inputs marked deleted (merge) or kept (rollup),
    /// outputs added to the next level (merge) or the target's level 0
    /// (rollup), one edit committed
    fn install_results(&mut self) -> Result<()> {
        if self.rollup.is_some() {
            let mut edit = super::version::EditLog::new();
            for output in &self.outputs {
                edit.add_file(0, *output);
            }
            self.output_family.commit(edit)?;
        } else {
            self.compaction.mark_input_deletes();
            let level = self.compaction.level() + 1;
            for output in &self.outputs {
                self.compaction.add_file(level, *output);
            }
            let edit = self.compaction.take_edit();
            self.family.commit(edit)?;
        }
        for output in &self.outputs {
            self.output_family.remove_pending_output(output.file_number);
        }
        Ok(())
    }

    /// Drop pending outputs after a failed job
    fn cleanup(&mut self) {
        if let Some(builder) = self.builder.take() {
            let file_number = builder.file_number();
            if let Err(e) = builder.abandon() {
                warn!(
                    family = %self.output_family.name(),
                    file = file_number,
                    error = %e,
                    "abandon compaction output failure"
                );
            }
            self.output_family.remove_pending_output(file_number);
        }
        for output in std::mem::take(&mut self.outputs) {
            let path = super::table::table_file_name(self.output_family.dir(), output.file_number);
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "remove failed compaction output");
            }
            self.output_family.remove_pending_output(output.file_number);
        }
    }
}
