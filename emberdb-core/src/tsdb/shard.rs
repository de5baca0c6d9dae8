//! Shard: ordered families over one slice of the keyspace

use super::family::DataFamily;
use crate::config::EngineConfig;
use crate::index::ShardIndex;
use crate::kv::{self, FamilyOptions, Store};
use crate::meta::MetricMetaDatabase;
use crate::metricsdata::MetricDataMergerFactory;
use crate::replica::{marshal_rows, MetricRow};
use crate::types::{Interval, IntervalOptions, ShardId, Timestamp};
use crate::Result;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// One shard of a database
///
/// Routes incoming rows to families by `family_time` and owns the shard-wide
/// series index. Families share the database's data store; each family's KV
/// family is named `<interval_ms>-<family_time>`.
pub struct Shard {
    shard_id: ShardId,
    dir: PathBuf,
    intervals: IntervalOptions,
    config: EngineConfig,
    meta: Arc<MetricMetaDatabase>,
    index: Arc<ShardIndex>,
    store: Arc<Store>,
    families: RwLock<BTreeMap<(i64, Timestamp), Arc<DataFamily>>>,
}

impl Shard {
    pub(crate) fn new(
        shard_id: ShardId,
        dir: PathBuf,
        intervals: IntervalOptions,
        config: EngineConfig,
        meta: Arc<MetricMetaDatabase>,
        store: Arc<Store>,
    ) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&dir)?;
        info!(shard = shard_id, dir = %dir.display(), "opened shard");
        let shard = Arc::new(Self {
            shard_id,
            dir,
            intervals,
            config,
            meta,
            index: Arc::new(ShardIndex::new()),
            store,
            families: RwLock::new(BTreeMap::new()),
        });
        shard.restore()?;
        Ok(shard)
    }

    /// Reopen the families found on disk, replaying their WALs
    fn restore(self: &Arc<Self>) -> Result<()> {
        let families_dir = self.dir.join("families");
        if !families_dir.exists() {
            return Ok(());
        }
        for entry in std::fs::read_dir(&families_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some((storage, family_time)) = name.split_once('-').and_then(|(s, t)| {
                Some((s.parse::<i64>().ok()?, t.parse::<i64>().ok()?))
            }) else {
                warn!(shard = self.shard_id, dir = %name, "unparseable family dir");
                continue;
            };
            let Some(interval) = self
                .intervals
                .intervals
                .iter()
                .find(|interval| interval.storage == storage)
                .copied()
            else {
                warn!(shard = self.shard_id, storage, "family interval not configured");
                continue;
            };
            let family = self.get_or_create_family(interval, family_time)?;
            family.restore_wals()?;
        }
        Ok(())
    }

    /// Shard id
    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    /// Series index of this shard
    pub fn index(&self) -> &Arc<ShardIndex> {
        &self.index
    }

    /// Write interval of this shard
    pub fn write_interval(&self) -> Interval {
        self.intervals.write_interval()
    }

    /// Route rows into family WALs by timestamp
    pub fn write_rows(&self, leader: i32, rows: &[MetricRow]) -> Result<()> {
        let interval = self.write_interval();
        let mut grouped: BTreeMap<Timestamp, Vec<MetricRow>> = BTreeMap::new();
        for row in rows {
            grouped
                .entry(interval.family_time(row.timestamp))
                .or_default()
                .push(row.clone());
        }
        for (family_time, group) in grouped {
            let family = self.get_or_create_family(interval, family_time)?;
            family.append_wal(leader, &marshal_rows(&group)?)?;
        }
        Ok(())
    }

    /// Get or create the family owning `family_time` at the given interval
    pub fn get_or_create_family(
        &self,
        interval: Interval,
        family_time: Timestamp,
    ) -> Result<Arc<DataFamily>> {
        let key = (interval.storage, family_time);
        if let Some(family) = self.families.read().get(&key) {
            return Ok(family.clone());
        }
        let mut families = self.families.write();
        if let Some(family) = families.get(&key) {
            return Ok(family.clone());
        }

        let family_name = format!("{}-{}", interval.storage, family_time);
        let kv_family = self.store.get_or_create_family(
            &family_name,
            FamilyOptions {
                max_file_size: self.config.max_file_size,
                level0_compaction_threshold: self.config.level0_compaction_threshold,
                merger: Arc::new(MetricDataMergerFactory),
            },
        )?;
        let family = DataFamily::new(
            self.shard_id,
            family_time,
            interval,
            self.dir.join("families").join(&family_name),
            kv_family,
            self.meta.clone(),
            self.index.clone(),
            &self.config,
        )?;
        families.insert(key, family.clone());
        Ok(family)
    }

    /// Existing family, if open
    pub fn get_family(&self, interval: Interval, family_time: Timestamp) -> Option<Arc<DataFamily>> {
        self.families
            .read()
            .get(&(interval.storage, family_time))
            .cloned()
    }

    /// Families of the write interval overlapping `[start, end]`, plus any
    /// rollup families covering it
    pub fn families_in_range(&self, start: Timestamp, end: Timestamp) -> Vec<Arc<DataFamily>> {
        self.families
            .read()
            .values()
            .filter(|family| {
                let family_end = family.family_time() + family.interval().family - 1;
                family.family_time() <= end && family_end >= start
            })
            .cloned()
            .collect()
    }

    /// All open families
    pub fn families(&self) -> Vec<Arc<DataFamily>> {
        self.families.read().values().cloned().collect()
    }

    /// Flush families that hit their size or TTL trigger
    pub fn flush_due_families(&self) {
        for family in self.families() {
            if family.needs_flush(&self.config) {
                if let Err(e) = family.flush() {
                    warn!(shard = self.shard_id, family_time = family.family_time(), error = %e, "family flush failure");
                }
            }
        }
    }

    /// Memory held across the shard's memdbs
    pub fn memory_size(&self) -> usize {
        self.families()
            .iter()
            .map(|family| family.memory_size())
            .sum()
    }

    /// Roll write-interval families up into their coarser targets
    pub fn rollup(&self) -> Result<()> {
        let write_interval = self.write_interval();
        let targets = self.intervals.rollup_targets().to_vec();
        for family in self.families() {
            if family.interval().storage != write_interval.storage {
                continue;
            }
            for target in &targets {
                let target_time = target.family_time(family.family_time());
                let target_family = self.get_or_create_family(*target, target_time)?;
                family.kv_family().rollup_into(
                    target_family.kv_family(),
                    kv::Rollup {
                        source_interval: write_interval.storage,
                        target_interval: target.storage,
                        source_family_time: family.family_time(),
                        target_family_time: target_time,
                    },
                )?;
            }
        }
        Ok(())
    }

    /// Drop families whose retention elapsed and that no user retains
    pub fn drop_expired_families(&self, now: Timestamp) {
        let mut families = self.families.write();
        let expired: Vec<(i64, Timestamp)> = families
            .iter()
            .filter(|(_, family)| {
                let retention = family.interval().retention;
                retention > 0
                    && family.family_time() + family.interval().family + retention < now
                    && family.evictable()
            })
            .map(|(key, _)| *key)
            .collect();
        for key in expired {
            if let Some(family) = families.remove(&key) {
                info!(
                    shard = self.shard_id,
                    family_time = family.family_time(),
                    "dropping expired family"
                );
                family.close();
            }
        }
    }

    /// Run WAL GC across families
    pub fn gc_wal(&self) {
        for family in self.families() {
            family.gc_wal();
        }
    }

    /// Close every family's WAL, stopping replication
    pub fn close(&self) {
        for family in self.families() {
            family.close();
        }
    }
}
