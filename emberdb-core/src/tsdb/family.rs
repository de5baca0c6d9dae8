//! Data family: one `(shard, family_time)` partition

use crate::config::{EngineConfig, Limits};
use crate::index::ShardIndex;
use crate::kv;
use crate::memdb::{FieldValue, MemoryDatabase};
use crate::meta::MetricMetaDatabase;
use crate::queue::FanOutQueue;
use crate::replica::{BatchRows, LocalReplicator};
use crate::types::{Interval, ShardId, Timestamp};
use crate::{EmberError, Result};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Callback fired when a leader's acknowledged sequence advances
pub type AckCallback = Box<dyn Fn(i64) + Send + Sync>;

/// Per-leader replication sequences
struct LeaderSequence {
    replica: AtomicI64,
    ack: AtomicI64,
    callbacks: Mutex<Vec<AckCallback>>,
    invalid_count: AtomicU64,
}

impl LeaderSequence {
    fn new() -> Self {
        Self {
            replica: AtomicI64::new(-1),
            ack: AtomicI64::new(-1),
            callbacks: Mutex::new(Vec::new()),
            invalid_count: AtomicU64::new(0),
        }
    }
}

/// A memdb queued for flush with the sequences it covers
#[derive(Clone)]
struct PendingFlush {
    memdb: Arc<MemoryDatabase>,
    sequences: HashMap<i32, i64>,
}

/// One family's WAL partition and its replicator
struct FamilyWal {
    queue: Arc<FanOutQueue>,
    _replicator: LocalReplicator,
}

/// One data partition of a shard, keyed by family time
///
/// Owns the write path of its time range: per-leader WAL queues feeding
/// local replicators, the memdb chain, per-leader sequence tracking and the
/// KV family the memdbs flush into.
pub struct DataFamily {
    shard_id: ShardId,
    family_time: Timestamp,
    interval: Interval,
    dir: PathBuf,
    kv_family: Arc<kv::Family>,
    meta: Arc<MetricMetaDatabase>,
    index: Arc<ShardIndex>,
    limits: Limits,
    page_size: usize,
    // swap point of the write path: writers hold read, flush swap holds write
    mutable: RwLock<Option<Arc<MemoryDatabase>>>,
    immutables: Mutex<Vec<PendingFlush>>,
    sequences: DashMap<i32, Arc<LeaderSequence>>,
    wals: Mutex<HashMap<i32, FamilyWal>>,
    memdb_generation: AtomicU64,
    retain_count: AtomicUsize,
    flushing: std::sync::atomic::AtomicBool,
}

impl DataFamily {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        shard_id: ShardId,
        family_time: Timestamp,
        interval: Interval,
        dir: PathBuf,
        kv_family: Arc<kv::Family>,
        meta: Arc<MetricMetaDatabase>,
        index: Arc<ShardIndex>,
        config: &EngineConfig,
    ) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&dir)?;
        Ok(Arc::new(Self {
            shard_id,
            family_time,
            interval,
            dir,
            kv_family,
            meta,
            index,
            limits: config.limits.clone(),
            page_size: config.effective_page_size(),
            mutable: RwLock::new(None),
            immutables: Mutex::new(Vec::new()),
            sequences: DashMap::new(),
            wals: Mutex::new(HashMap::new()),
            memdb_generation: AtomicU64::new(0),
            retain_count: AtomicUsize::new(0),
            flushing: std::sync::atomic::AtomicBool::new(false),
        }))
    }

    /// Family time of this partition
    pub fn family_time(&self) -> Timestamp {
        self.family_time
    }

    /// Shard owning this family
    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    /// Slot grid of this family
    pub fn interval(&self) -> Interval {
        self.interval
    }

    /// The KV family holding flushed tables
    pub fn kv_family(&self) -> &Arc<kv::Family> {
        &self.kv_family
    }

    /// Append a row payload to the leader's WAL, starting its replicator on
    /// first use
    pub fn append_wal(self: &Arc<Self>, leader: i32, payload: &[u8]) -> Result<i64> {
        let mut wals = self.wals.lock();
        if let Some(wal) = wals.get(&leader) {
            return wal.queue.put(payload);
        }

        let dir = self.dir.join("wal").join(leader.to_string());
        let queue = Arc::new(FanOutQueue::new(dir, self.page_size)?);
        let replicator = LocalReplicator::start(self.clone(), leader, queue.clone())?;
        let seq = queue.put(payload)?;
        wals.insert(
            leader,
            FamilyWal {
                queue,
                _replicator: replicator,
            },
        );
        Ok(seq)
    }

    /// Reopen existing WAL partitions after a restart, replaying each
    pub fn restore_wals(self: &Arc<Self>) -> Result<()> {
        let wal_root = self.dir.join("wal");
        if !wal_root.exists() {
            return Ok(());
        }
        for entry in std::fs::read_dir(&wal_root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Ok(leader) = name.to_string_lossy().parse::<i32>() else {
                warn!(dir = %entry.path().display(), "unparseable wal leader dir");
                continue;
            };
            let mut wals = self.wals.lock();
            if wals.contains_key(&leader) {
                continue;
            }
            let queue = Arc::new(FanOutQueue::new(entry.path(), self.page_size)?);
            let replicator = LocalReplicator::start(self.clone(), leader, queue.clone())?;
            wals.insert(
                leader,
                FamilyWal {
                    queue,
                    _replicator: replicator,
                },
            );
        }
        Ok(())
    }

    /// Check that `seq` is the next expected sequence of the leader
    pub fn validate_sequence(&self, leader: i32, seq: i64) -> bool {
        let tracker = self.leader_sequence(leader);
        if seq == tracker.replica.load(Ordering::Acquire) + 1 {
            return true;
        }
        tracker.invalid_count.fetch_add(1, Ordering::Relaxed);
        debug!(
            shard = self.shard_id,
            family_time = self.family_time,
            leader,
            seq,
            "dropping out-of-order sequence"
        );
        false
    }

    /// Advance the leader's replica sequence unconditionally
    pub fn commit_sequence(&self, leader: i32, seq: i64) {
        self.leader_sequence(leader)
            .replica
            .store(seq, Ordering::Release);
    }

    /// Replica sequence of a leader
    pub fn replica_sequence(&self, leader: i32) -> i64 {
        self.leader_sequence(leader).replica.load(Ordering::Acquire)
    }

    /// Out-of-order drops observed for a leader
    pub fn invalid_sequence_count(&self, leader: i32) -> u64 {
        self.leader_sequence(leader)
            .invalid_count
            .load(Ordering::Relaxed)
    }

    /// Register a callback fired when the leader's ack sequence advances
    pub fn ack_sequence(&self, leader: i32, callback: AckCallback) {
        self.leader_sequence(leader).callbacks.lock().push(callback);
    }

    /// Acknowledged sequence of a leader
    pub fn acknowledged_sequence(&self, leader: i32) -> i64 {
        self.leader_sequence(leader).ack.load(Ordering::Acquire)
    }

    /// Mark the family in use, blocking eviction
    pub fn retain(&self) {
        self.retain_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Release one retain
    pub fn release(&self) {
        self.retain_count.fetch_sub(1, Ordering::AcqRel);
    }

    /// Whether the family is free of users
    pub fn evictable(&self) -> bool {
        self.retain_count.load(Ordering::Acquire) == 0
    }

    /// Apply a sorted row batch and commit the sequence
    ///
    /// Rows that fail admission (limits, foreign family time) are skipped;
    /// the sequence is committed inside the memdb guard so a concurrent
    /// flush swap never acknowledges rows it did not capture.
    pub fn write_rows(
        &self,
        leader: i32,
        seq: i64,
        batch: &BatchRows,
        now: Timestamp,
    ) -> Result<()> {
        let guard = self.acquire_memdb()?;
        let memdb = guard
            .as_ref()
            .ok_or_else(|| EmberError::Internal("memdb missing after acquire".into()))?;

        for row in batch.rows() {
            if self.interval.family_time(row.timestamp) != self.family_time {
                warn!(
                    shard = self.shard_id,
                    family_time = self.family_time,
                    row_ts = row.timestamp,
                    "dropping row routed to the wrong family"
                );
                continue;
            }
            if let Err(e) = self.write_row(memdb, row, now) {
                if e.is_limit() {
                    debug!(metric = %row.metric, error = %e, "row rejected by limits");
                } else {
                    warn!(metric = %row.metric, error = %e, "row write failure");
                }
            }
        }
        self.meta.set_sequence(seq);
        self.commit_sequence(leader, seq);
        Ok(())
    }

    fn write_row(
        &self,
        memdb: &Arc<MemoryDatabase>,
        row: &crate::replica::MetricRow,
        now: Timestamp,
    ) -> Result<()> {
        let metric_id = self.meta.gen_metric_id(&row.namespace, &row.metric)?;

        let mut tags = Vec::with_capacity(row.tags.len());
        for (key, value) in &row.tags {
            let tag_key_id = self.meta.gen_tag_key_id(metric_id, key)?;
            let tag_value_id = self.meta.gen_tag_value_id(tag_key_id, value)?;
            tags.push((tag_key_id, tag_value_id));
        }
        tags.sort_unstable();
        let series_id =
            self.index
                .get_or_create_series(metric_id, &tags, self.limits.max_series_per_metric)?;

        let mut fields = Vec::with_capacity(row.fields.len());
        for field in &row.fields {
            let field_id = self.meta.gen_field_id(metric_id, &field.name, field.field_type)?;
            fields.push(FieldValue {
                field_id,
                field_type: field.field_type,
                value: field.value,
            });
        }
        memdb.write(metric_id, series_id, row.timestamp, &fields, now)
    }

    /// Whether a flush is due by size or age
    pub fn needs_flush(&self, config: &EngineConfig) -> bool {
        let mutable = self.mutable.read();
        match mutable.as_ref() {
            Some(memdb) if !memdb.is_empty() => {
                memdb.memory_size() >= config.max_memdb_size
                    || memdb.age() >= config.mutable_memdb_ttl
            }
            _ => false,
        }
    }

    /// Memory held by the memdb chain
    pub fn memory_size(&self) -> usize {
        let mutable = self
            .mutable
            .read()
            .as_ref()
            .map(|memdb| memdb.memory_size())
            .unwrap_or(0);
        let immutable: usize = self
            .immutables
            .lock()
            .iter()
            .map(|pending| pending.memdb.memory_size())
            .sum();
        mutable + immutable
    }

    /// Flush the memdb chain into level-0 tables, then fire ack callbacks
    ///
    /// Each memdb stays on the flush queue until its table is committed, so
    /// concurrent data views never observe a gap; commit and dequeue happen
    /// under the queue lock, so they never observe the data twice either.
    pub fn flush(&self) -> Result<()> {
        // one flusher (and so one active table builder) per family at a time
        if self
            .flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        let result = self.flush_queue();
        self.flushing.store(false, Ordering::Release);
        result
    }

    fn flush_queue(&self) -> Result<()> {
        self.switch_memdb();
        loop {
            let pending = {
                let immutables = self.immutables.lock();
                immutables.first().cloned()
            };
            let Some(pending) = pending else {
                return Ok(());
            };
            self.flush_one(pending)?;
        }
    }

    /// Move the mutable memdb onto the flush queue, capturing the replica
    /// sequence of every leader
    pub fn switch_memdb(&self) {
        let mut mutable = self.mutable.write();
        let Some(memdb) = mutable.take() else {
            return;
        };
        if memdb.is_empty() {
            return;
        }
        let sequences: HashMap<i32, i64> = self
            .sequences
            .iter()
            .map(|entry| (*entry.key(), entry.replica.load(Ordering::Acquire)))
            .collect();
        self.immutables.lock().push(PendingFlush { memdb, sequences });
    }

    fn flush_one(&self, pending: PendingFlush) -> Result<()> {
        // the metadata referenced by this memdb must be durable before the
        // data is readable from a table
        self.meta.prepare_flush();
        self.meta.flush()?;

        let mut builder = self.kv_family.new_table_builder()?;
        pending.memdb.flush(&mut builder)?;
        let built = if builder.count() == 0 {
            let file_number = builder.file_number();
            builder.abandon()?;
            self.kv_family.remove_pending_output(file_number);
            None
        } else {
            Some(builder.close()?)
        };

        {
            let mut immutables = self.immutables.lock();
            if let Some(built) = built {
                self.kv_family.commit_flush(built)?;
            }
            immutables.retain(|entry| !Arc::ptr_eq(&entry.memdb, &pending.memdb));
        }

        info!(
            shard = self.shard_id,
            family_time = self.family_time,
            "flushed data family"
        );
        for (leader, seq) in pending.sequences {
            if seq < 0 {
                continue;
            }
            let tracker = self.leader_sequence(leader);
            tracker.ack.fetch_max(seq, Ordering::AcqRel);
            for callback in tracker.callbacks.lock().iter() {
                callback(seq);
            }
        }
        Ok(())
    }

    /// Memdbs and the table snapshot a query pins, point-in-time
    ///
    /// Lock order (mutable, then flush queue) matches `switch_memdb`; a
    /// memdb swapped between the two captures would appear twice, so the
    /// flush-queue entries are deduplicated against the mutable one.
    pub fn data_view(&self) -> (Vec<Arc<MemoryDatabase>>, kv::version::Snapshot) {
        let mut memdbs: Vec<Arc<MemoryDatabase>> = Vec::new();
        let mutable = self.mutable.read().clone();
        let immutables = self.immutables.lock();
        if let Some(memdb) = mutable {
            memdbs.push(memdb);
        }
        for pending in immutables.iter() {
            if !memdbs.iter().any(|memdb| Arc::ptr_eq(memdb, &pending.memdb)) {
                memdbs.push(pending.memdb.clone());
            }
        }
        let snapshot = self.kv_family.snapshot();
        drop(immutables);
        (memdbs, snapshot)
    }

    /// Close the family's WAL queues, stopping the replicators
    pub fn close(&self) {
        let wals = self.wals.lock();
        for wal in wals.values() {
            wal.queue.close();
        }
    }

    /// Run WAL page GC for every leader
    pub fn gc_wal(&self) {
        for wal in self.wals.lock().values() {
            wal.queue.gc();
        }
    }

    /// Reap metric stores idle since `before`
    pub fn evict_inactive_metrics(&self, before: Timestamp) {
        if let Some(memdb) = self.mutable.read().as_ref() {
            let reaped = memdb.evict_inactive(before);
            if reaped > 0 {
                debug!(
                    shard = self.shard_id,
                    family_time = self.family_time,
                    reaped,
                    "reaped inactive metric stores"
                );
            }
        }
    }

    fn leader_sequence(&self, leader: i32) -> Arc<LeaderSequence> {
        self.sequences
            .entry(leader)
            .or_insert_with(|| Arc::new(LeaderSequence::new()))
            .clone()
    }

    /// Current mutable memdb guard, creating the memdb on first use
    fn acquire_memdb(
        &self,
    ) -> Result<parking_lot::RwLockReadGuard<'_, Option<Arc<MemoryDatabase>>>> {
        loop {
            {
                let guard = self.mutable.read();
                if guard.is_some() {
                    return Ok(guard);
                }
            }
            let mut guard = self.mutable.write();
            if guard.is_none() {
                let generation = self.memdb_generation.fetch_add(1, Ordering::AcqRel);
                let dir = self.dir.join(format!("buffer-{}", generation));
                *guard = Some(Arc::new(MemoryDatabase::new(
                    dir,
                    self.family_time,
                    self.interval,
                )?));
            }
        }
    }
}
