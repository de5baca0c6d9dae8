//! The storage engine: databases, shards and data families

mod family;
mod shard;

pub use family::{AckCallback, DataFamily};
pub use shard::Shard;

use crate::config::EngineConfig;
use crate::kv::{Store, StoreManager};
use crate::meta::{MetricMetaDatabase, META_STORE_NAME};
use crate::pool::WorkerPool;
use crate::query::stmt::Query;
use crate::query::{LeafExecutor, QueryResult};
use crate::types::{IntervalOptions, ShardId, Timestamp};
use crate::{EmberError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tracing::{info, warn};

/// Idle time after which a memdb metric store is reaped
const METRIC_STORE_IDLE: i64 = 24 * 3600 * 1000;

/// A named time-series database
pub struct Database {
    name: String,
    intervals: IntervalOptions,
    config: EngineConfig,
    meta: Arc<MetricMetaDatabase>,
    store: Arc<Store>,
    shards: RwLock<HashMap<ShardId, Arc<Shard>>>,
    dir: std::path::PathBuf,
}

impl Database {
    fn open(
        name: &str,
        config: &EngineConfig,
        store_manager: &StoreManager,
        meta: Arc<MetricMetaDatabase>,
    ) -> Result<Arc<Self>> {
        let dir = config.data_dir.join(name);
        std::fs::create_dir_all(&dir)?;
        let store = store_manager.get_or_create_store(name)?;
        info!(database = name, "opened database");
        Ok(Arc::new(Self {
            name: name.to_string(),
            intervals: config.intervals.clone(),
            config: config.clone(),
            meta,
            store,
            shards: RwLock::new(HashMap::new()),
            dir,
        }))
    }

    /// Database name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Interval set of this database
    pub fn intervals(&self) -> &IntervalOptions {
        &self.intervals
    }

    /// Limits applied to writes and queries
    pub fn limits(&self) -> &crate::config::Limits {
        &self.config.limits
    }

    /// Metadata database shared by every shard
    pub fn meta(&self) -> &Arc<MetricMetaDatabase> {
        &self.meta
    }

    /// Get or create a shard
    pub fn get_or_create_shard(&self, shard_id: ShardId) -> Result<Arc<Shard>> {
        if let Some(shard) = self.shards.read().get(&shard_id) {
            return Ok(shard.clone());
        }
        let mut shards = self.shards.write();
        if let Some(shard) = shards.get(&shard_id) {
            return Ok(shard.clone());
        }
        let shard = Shard::new(
            shard_id,
            self.dir.join(format!("shard-{}", shard_id)),
            self.intervals.clone(),
            self.config.clone(),
            self.meta.clone(),
            self.store.clone(),
        )?;
        shards.insert(shard_id, shard.clone());
        Ok(shard)
    }

    /// Existing shard, if open
    pub fn get_shard(&self, shard_id: ShardId) -> Option<Arc<Shard>> {
        self.shards.read().get(&shard_id).cloned()
    }

    /// All open shards
    pub fn shards(&self) -> Vec<Arc<Shard>> {
        self.shards.read().values().cloned().collect()
    }

    /// Memory held across the database's memdbs
    pub fn memory_size(&self) -> usize {
        self.shards().iter().map(|shard| shard.memory_size()).sum()
    }

    fn close(&self) {
        for shard in self.shards() {
            shard.close();
        }
    }
}

/// Top-level engine handle owning every database and the background tasks
///
/// All shared state hangs off this handle; there are no process-wide
/// singletons.
pub struct Engine {
    config: EngineConfig,
    store_manager: Arc<StoreManager>,
    meta: Arc<MetricMetaDatabase>,
    databases: RwLock<HashMap<String, Arc<Database>>>,
    pool: Arc<WorkerPool>,
    closed: Arc<AtomicBool>,
    background: parking_lot::Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl Engine {
    /// Open the engine rooted at the configured data directory
    pub fn new(config: EngineConfig) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.data_dir)?;
        let store_manager = Arc::new(StoreManager::new(&config.data_dir));
        let meta_store = store_manager.get_or_create_store(META_STORE_NAME)?;
        let meta = Arc::new(MetricMetaDatabase::open(&meta_store, config.limits.clone())?);
        let pool = Arc::new(WorkerPool::new(
            "engine-worker",
            config.flush_concurrency.max(1),
        ));

        let engine = Arc::new(Self {
            config,
            store_manager,
            meta,
            databases: RwLock::new(HashMap::new()),
            pool,
            closed: Arc::new(AtomicBool::new(false)),
            background: parking_lot::Mutex::new(Vec::new()),
        });
        engine.start_background_tasks()?;
        Ok(engine)
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Shared metadata database
    pub fn meta(&self) -> &Arc<MetricMetaDatabase> {
        &self.meta
    }

    /// Worker pool for flush, compaction and query fan-out
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Get or create a database
    pub fn get_or_create_database(&self, name: &str) -> Result<Arc<Database>> {
        if let Some(db) = self.databases.read().get(name) {
            return Ok(db.clone());
        }
        let mut databases = self.databases.write();
        if let Some(db) = databases.get(name) {
            return Ok(db.clone());
        }
        let db = Database::open(name, &self.config, &self.store_manager, self.meta.clone())?;
        databases.insert(name.to_string(), db.clone());
        Ok(db)
    }

    /// Existing database, if open
    pub fn get_database(&self, name: &str) -> Result<Arc<Database>> {
        self.databases
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| EmberError::Internal(format!("database {} not found", name)))
    }

    /// Execute a leaf query against a database
    ///
    /// Shard scans fan out over the engine's read pool; each scan pins an
    /// immutable view, so reads never block writers.
    pub fn execute_query(
        &self,
        database: &str,
        shard_ids: &[ShardId],
        query: Query,
    ) -> Result<QueryResult> {
        let db = self.get_database(database)?;
        LeafExecutor::new(&db)
            .with_pool(self.pool.clone())
            .execute(shard_ids, query)
    }

    /// Run one maintenance pass: flush triggers, compactions, WAL GC
    ///
    /// The background threads call this on their schedule; tests call it
    /// directly to avoid timing dependence.
    pub fn maintain(&self) {
        let databases: Vec<Arc<Database>> = self.databases.read().values().cloned().collect();

        // memory pressure: flush the largest families until under target
        if let Some(ratio) = memory_usage_ratio() {
            if ratio >= self.config.max_mem_usage_before_flush {
                self.flush_under_pressure(&databases, ratio);
            }
        }

        for db in &databases {
            for shard in db.shards() {
                shard.flush_due_families();
                shard.gc_wal();
                for family in shard.families() {
                    let kv_family = family.kv_family().clone();
                    if kv_family.needs_compaction() {
                        self.pool.submit(move || {
                            if let Err(e) = kv_family.compact() {
                                warn!(error = %e, "background compaction failure");
                            }
                        });
                    }
                }
            }
        }
        self.meta.compact();
    }

    /// Run one TTL pass: drop expired families, reap idle metric stores
    pub fn run_ttl(&self, now: Timestamp) {
        for db in self.databases.read().values() {
            for shard in db.shards() {
                shard.drop_expired_families(now);
                for family in shard.families() {
                    family.evict_inactive_metrics(now - METRIC_STORE_IDLE);
                }
            }
        }
    }

    /// Evict idle table readers across every store
    pub fn cleanup_table_caches(&self) {
        for store in self.store_manager.stores() {
            store.cleanup(self.config.table_cache_ttl);
        }
    }

    /// Close the engine: stop background tasks, close WALs, flush meta
    pub fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        for db in self.databases.read().values() {
            db.close();
        }
        self.meta.prepare_flush();
        if let Err(e) = self.meta.flush() {
            warn!(error = %e, "flush metadata on close failure");
        }
        self.pool.shutdown();
        for handle in self.background.lock().drain(..) {
            let _ = handle.join();
        }
        info!("engine closed");
    }

    fn flush_under_pressure(&self, databases: &[Arc<Database>], ratio: f64) {
        info!(ratio, "memory pressure, flushing largest families");
        let mut families: Vec<Arc<DataFamily>> = databases
            .iter()
            .flat_map(|db| db.shards())
            .flat_map(|shard| shard.families())
            .collect();
        families.sort_by_key(|family| std::cmp::Reverse(family.memory_size()));

        for family in families {
            if let Err(e) = family.flush() {
                warn!(error = %e, "pressure flush failure");
            }
            match memory_usage_ratio() {
                Some(ratio) if ratio > self.config.target_mem_usage_after_flush => continue,
                _ => break,
            }
        }
    }

    fn start_background_tasks(self: &Arc<Self>) -> Result<()> {
        let mut background = self.background.lock();
        background.push(self.spawn_periodic(
            "engine-maintain",
            self.config.remove_task_interval,
            |engine| engine.maintain(),
        )?);
        background.push(self.spawn_periodic(
            "engine-ttl",
            self.config.ttl_task_interval,
            |engine| engine.run_ttl(crate::replica::now_millis()),
        )?);
        background.push(self.spawn_periodic(
            "engine-cache-cleanup",
            self.config.table_cache_ttl,
            |engine| engine.cleanup_table_caches(),
        )?);
        Ok(())
    }

    fn spawn_periodic(
        self: &Arc<Self>,
        name: &str,
        interval: Duration,
        task: fn(&Engine),
    ) -> Result<std::thread::JoinHandle<()>> {
        let engine = Arc::downgrade(self);
        let closed = self.closed.clone();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                // wake frequently so close() is honored promptly
                let tick = interval.min(Duration::from_millis(500));
                let mut elapsed = Duration::ZERO;
                loop {
                    std::thread::sleep(tick);
                    if closed.load(Ordering::Acquire) {
                        return;
                    }
                    elapsed += tick;
                    if elapsed < interval {
                        continue;
                    }
                    elapsed = Duration::ZERO;
                    let Some(engine) = engine.upgrade() else {
                        return;
                    };
                    task(&engine);
                }
            })?;
        Ok(handle)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.close();
    }
}

/// Fraction of system memory in use, if it can be sampled
fn memory_usage_ratio() -> Option<f64> {
    let mut system = System::new();
    system.refresh_memory();
    let total = system.total_memory();
    if total == 0 {
        return None;
    }
    Some(system.used_memory() as f64 / total as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::{MetricRow, RowField};
    use crate::types::{FieldType, Interval};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tempfile::TempDir;

    fn row(metric: &str, ts: i64, value: f64) -> MetricRow {
        MetricRow {
            namespace: "default".into(),
            metric: metric.into(),
            timestamp: ts,
            tags: vec![("host".into(), "h1".into())],
            fields: vec![RowField {
                name: "value".into(),
                field_type: FieldType::Sum,
                value,
            }],
        }
    }

    fn wait_replicated(family: &DataFamily, leader: i32, seq: i64) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while family.replica_sequence(leader) < seq {
            assert!(std::time::Instant::now() < deadline, "replication stalled");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn aligned_ts() -> i64 {
        let ts = 1_690_000_000_000_i64;
        ts - ts % 10_000
    }

    #[test]
    fn test_flush_fires_ack_once_then_query_reads_table() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::new(EngineConfig::with_data_dir(dir.path())).unwrap();
        let db = engine.get_or_create_database("metrics").unwrap();
        let shard = db.get_or_create_shard(0).unwrap();

        let t0 = aligned_ts();
        shard.write_rows(1, &[row("cpu", t0, 3.5)]).unwrap();
        let interval = shard.write_interval();
        let family = shard.get_family(interval, interval.family_time(t0)).unwrap();
        wait_replicated(&family, 1, 0);

        let fired = Arc::new(AtomicUsize::new(0));
        let last_seq = Arc::new(std::sync::atomic::AtomicI64::new(-1));
        {
            let fired = fired.clone();
            let last_seq = last_seq.clone();
            family.ack_sequence(
                1,
                Box::new(move |seq| {
                    fired.fetch_add(1, Ordering::SeqCst);
                    last_seq.store(seq, Ordering::SeqCst);
                }),
            );
        }

        family.flush().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(last_seq.load(Ordering::SeqCst), 0);
        assert_eq!(family.acknowledged_sequence(1), 0);

        // the memdb is gone; the row now reads from a level-0 table
        let (memdbs, snapshot) = family.data_view();
        assert!(memdbs.is_empty());
        assert_eq!(snapshot.version().files(0).len(), 1);

        // an empty flush acknowledges nothing further
        family.flush().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        engine.close();
    }

    #[test]
    fn test_wal_replay_recovers_unflushed_state() {
        let dir = TempDir::new().unwrap();
        let t0 = aligned_ts();
        {
            let engine = Engine::new(EngineConfig::with_data_dir(dir.path())).unwrap();
            let db = engine.get_or_create_database("metrics").unwrap();
            let shard = db.get_or_create_shard(0).unwrap();
            shard.write_rows(1, &[row("cpu", t0, 1.0)]).unwrap();
            shard.write_rows(1, &[row("cpu", t0 + 10_000, 2.0)]).unwrap();
            let interval = shard.write_interval();
            let family = shard.get_family(interval, interval.family_time(t0)).unwrap();
            wait_replicated(&family, 1, 1);
            // nothing flushed, nothing acknowledged
            assert_eq!(family.acknowledged_sequence(1), -1);
            engine.close();
        }

        // reopening replays the WAL into a fresh memdb
        let engine = Engine::new(EngineConfig::with_data_dir(dir.path())).unwrap();
        let db = engine.get_or_create_database("metrics").unwrap();
        let shard = db.get_or_create_shard(0).unwrap();
        let interval = shard.write_interval();
        let family = shard.get_family(interval, interval.family_time(t0)).unwrap();
        wait_replicated(&family, 1, 1);

        let metric_id = db.meta().get_metric_id("default", "cpu").unwrap();
        let (memdbs, _) = family.data_view();
        assert_eq!(memdbs.len(), 1);
        let series_ids = memdbs[0].series_ids(metric_id).unwrap();
        assert_eq!(series_ids.len(), 1);

        engine.close();
    }

    #[test]
    fn test_out_of_order_sequence_dropped() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::new(EngineConfig::with_data_dir(dir.path())).unwrap();
        let db = engine.get_or_create_database("metrics").unwrap();
        let shard = db.get_or_create_shard(0).unwrap();
        let interval = shard.write_interval();
        let family = shard
            .get_or_create_family(interval, interval.family_time(aligned_ts()))
            .unwrap();

        assert!(family.validate_sequence(7, 0));
        family.commit_sequence(7, 0);
        // a gap and a duplicate are both dropped
        assert!(!family.validate_sequence(7, 2));
        assert!(!family.validate_sequence(7, 0));
        assert_eq!(family.invalid_sequence_count(7), 2);
        assert!(family.validate_sequence(7, 1));

        engine.close();
    }

    #[test]
    fn test_interval_routing_across_families() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::new(EngineConfig::with_data_dir(dir.path())).unwrap();
        let db = engine.get_or_create_database("metrics").unwrap();
        let shard = db.get_or_create_shard(0).unwrap();

        let t0 = aligned_ts();
        let next_family = t0 - t0 % 3_600_000 + 3_600_000;
        shard
            .write_rows(1, &[row("cpu", t0, 1.0), row("cpu", next_family, 2.0)])
            .unwrap();

        let interval = shard.write_interval();
        assert!(shard.get_family(interval, interval.family_time(t0)).is_some());
        assert!(shard
            .get_family(interval, interval.family_time(next_family))
            .is_some());
        assert_eq!(shard.families().len(), 2);

        engine.close();
    }

    #[test]
    fn test_interval_validation() {
        assert!(Interval::new(10_000, 3_600_000, 0).is_ok());
        assert!(Interval::new(10_000, 15_000, 0).is_err());
    }
}
