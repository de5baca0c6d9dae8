//! Memory database: the per-family write buffer
//!
//! Rows land here from the local replicator and stay queryable until the
//! memdb is flushed into a level-0 table. Point data lives in a mmap-backed
//! buffer; the heap only carries the series/field indexes.

mod buffer;
mod field_store;
mod metric_store;

pub use buffer::{Chunk, DataPointBuffer};
pub use field_store::FieldStore;
pub use metric_store::{MetricStore, SeriesStore};

use crate::kv::table::TableBuilder;
use crate::metricsdata::MetricBlockBuilder;
use crate::types::{FieldId, FieldType, Interval, MetricId, SeriesId, Timestamp};
use crate::Result;
use dashmap::DashMap;
use roaring::RoaringBitmap;
use std::path::PathBuf;
use std::time::Instant;
use tracing::debug;

/// One field value of a row, resolved to ids
#[derive(Debug, Clone, Copy)]
pub struct FieldValue {
    pub field_id: FieldId,
    pub field_type: FieldType,
    pub value: f64,
}

/// Write buffer of one data family
pub struct MemoryDatabase {
    family_time: Timestamp,
    interval: Interval,
    buffer: DataPointBuffer,
    metric_stores: DashMap<MetricId, MetricStore>,
    created_at: Instant,
}

impl MemoryDatabase {
    /// Create a memdb backed by a buffer under `dir`
    pub fn new(dir: impl Into<PathBuf>, family_time: Timestamp, interval: Interval) -> Result<Self> {
        Ok(Self {
            family_time,
            interval,
            buffer: DataPointBuffer::new(dir)?,
            metric_stores: DashMap::new(),
            created_at: Instant::now(),
        })
    }

    /// Family time this memdb belongs to
    pub fn family_time(&self) -> Timestamp {
        self.family_time
    }

    /// Write one row's fields for a series
    pub fn write(
        &self,
        metric_id: MetricId,
        series_id: SeriesId,
        timestamp: Timestamp,
        fields: &[FieldValue],
        now: Timestamp,
    ) -> Result<()> {
        let slot = self.interval.slot(timestamp);
        let mut store = self.metric_stores.entry(metric_id).or_default();
        for field in fields {
            store.register_field(field.field_id, field.field_type);
            store.write(&self.buffer, series_id, field.field_id, slot, field.value, now)?;
        }
        Ok(())
    }

    /// Approximate memory held, in bytes
    pub fn memory_size(&self) -> usize {
        self.metric_stores
            .iter()
            .map(|store| store.memory_size())
            .sum()
    }

    /// Age since creation, for the mutable TTL trigger
    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Number of buffered metrics
    pub fn num_metrics(&self) -> usize {
        self.metric_stores.len()
    }

    /// Check if nothing was written
    pub fn is_empty(&self) -> bool {
        self.metric_stores.is_empty()
    }

    /// Series ids buffered for a metric
    pub fn series_ids(&self, metric_id: MetricId) -> Option<RoaringBitmap> {
        self.metric_stores
            .get(&metric_id)
            .map(|store| store.series_ids().clone())
    }

    /// Encoded TSD stream of one `(series, field)`, folding duplicate slots
    /// with the field's storage aggregation
    pub fn series_stream(
        &self,
        metric_id: MetricId,
        series_id: SeriesId,
        field_id: FieldId,
    ) -> Result<Option<Vec<u8>>> {
        let Some(store) = self.metric_stores.get(&metric_id) else {
            return Ok(None);
        };
        let Some(field_type) = store
            .field_metas()
            .iter()
            .find(|(id, _)| *id == field_id)
            .map(|(_, t)| *t)
        else {
            return Ok(None);
        };
        let Some(series) = store.series(series_id) else {
            return Ok(None);
        };
        let Some(field_store) = series.field(field_id) else {
            return Ok(None);
        };
        let stream = field_store.encode(field_type.agg_type())?;
        Ok((!stream.is_empty()).then_some(stream))
    }

    /// Flush every metric into the table builder, one block per metric
    pub fn flush(&self, builder: &mut TableBuilder) -> Result<()> {
        let mut metric_ids: Vec<MetricId> =
            self.metric_stores.iter().map(|entry| *entry.key()).collect();
        metric_ids.sort_unstable();

        for metric_id in metric_ids {
            let Some(store) = self.metric_stores.get(&metric_id) else {
                continue;
            };
            let block = Self::build_block(&store)?;
            if !block.is_empty() {
                builder.add(metric_id, &block)?;
            }
        }
        debug!(
            family_time = self.family_time,
            metrics = builder.count(),
            "flushed memdb"
        );
        Ok(())
    }

    /// Drop metric stores idle since `before`; returns how many were reaped
    pub fn evict_inactive(&self, before: Timestamp) -> usize {
        let idle: Vec<MetricId> = self
            .metric_stores
            .iter()
            .filter(|store| store.active_at() < before)
            .map(|store| *store.key())
            .collect();
        for metric_id in &idle {
            self.metric_stores.remove(metric_id);
        }
        idle.len()
    }

    fn build_block(store: &MetricStore) -> Result<Vec<u8>> {
        let field_metas = store.field_metas().to_vec();
        let mut builder = MetricBlockBuilder::new(field_metas.clone());
        let mut streams = Vec::with_capacity(field_metas.len());
        for series_id in store.series_ids() {
            let Some(series) = store.series(series_id) else {
                continue;
            };
            streams.clear();
            for (field_id, field_type) in &field_metas {
                match series.field(*field_id) {
                    Some(field_store) => {
                        streams.push(field_store.encode(field_type.agg_type())?)
                    }
                    None => streams.push(Vec::new()),
                }
            }
            builder.add_series(series_id, &streams)?;
        }
        builder.finish()
    }
}

impl Drop for MemoryDatabase {
    fn drop(&mut self) {
        self.buffer.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::TsdDecoder;
    use crate::kv::table::TableReader;
    use crate::metricsdata::MetricBlockReader;
    use tempfile::TempDir;

    fn interval() -> Interval {
        Interval::new(10_000, 3_600_000, 0).unwrap()
    }

    fn field(field_id: FieldId, value: f64) -> FieldValue {
        FieldValue {
            field_id,
            field_type: FieldType::Sum,
            value,
        }
    }

    #[test]
    fn test_write_then_flush_round_trip() {
        let dir = TempDir::new().unwrap();
        let memdb = MemoryDatabase::new(dir.path().join("buf"), 0, interval()).unwrap();

        memdb.write(7, 1, 10_000, &[field(0, 1.5)], 1).unwrap();
        memdb.write(7, 1, 20_000, &[field(0, 2.5)], 2).unwrap();
        memdb.write(7, 2, 10_000, &[field(0, 9.0)], 3).unwrap();
        memdb.write(8, 1, 0, &[field(1, 4.0)], 4).unwrap();
        assert_eq!(memdb.num_metrics(), 2);

        let mut builder = TableBuilder::new(dir.path(), 1).unwrap();
        memdb.flush(&mut builder).unwrap();
        builder.close().unwrap();

        let reader = TableReader::open(dir.path(), 1).unwrap();
        let block = MetricBlockReader::new(reader.get(7).unwrap()).unwrap();
        assert_eq!(block.series_ids().len(), 2);

        let entry = block.get_series(1).unwrap().unwrap();
        let points: Vec<_> = TsdDecoder::new(entry.field_stream(0).unwrap())
            .unwrap()
            .collect();
        assert_eq!(points, vec![(1, 1.5), (2, 2.5)]);

        let entry = block.get_series(2).unwrap().unwrap();
        let points: Vec<_> = TsdDecoder::new(entry.field_stream(0).unwrap())
            .unwrap()
            .collect();
        assert_eq!(points, vec![(1, 9.0)]);

        let block = MetricBlockReader::new(reader.get(8).unwrap()).unwrap();
        assert_eq!(block.series_ids().len(), 1);
    }

    #[test]
    fn test_duplicate_slot_folds_by_field_type() {
        let dir = TempDir::new().unwrap();
        let memdb = MemoryDatabase::new(dir.path().join("buf"), 0, interval()).unwrap();

        memdb.write(1, 1, 15_000, &[field(0, 1.0)], 1).unwrap();
        memdb.write(1, 1, 16_000, &[field(0, 2.0)], 2).unwrap();

        let gauge = FieldValue {
            field_id: 1,
            field_type: FieldType::Gauge,
            value: 5.0,
        };
        memdb.write(1, 1, 15_000, &[gauge], 3).unwrap();
        let gauge_again = FieldValue {
            value: 7.0,
            ..gauge
        };
        memdb.write(1, 1, 16_000, &[gauge_again], 4).unwrap();

        // sum field folds by addition
        let stream = memdb.series_stream(1, 1, 0).unwrap().unwrap();
        let points: Vec<_> = TsdDecoder::new(&stream).unwrap().collect();
        assert_eq!(points, vec![(1, 3.0)]);

        // gauge folds last-write-wins
        let stream = memdb.series_stream(1, 1, 1).unwrap().unwrap();
        let points: Vec<_> = TsdDecoder::new(&stream).unwrap().collect();
        assert_eq!(points, vec![(1, 7.0)]);
    }

    #[test]
    fn test_evict_inactive() {
        let dir = TempDir::new().unwrap();
        let memdb = MemoryDatabase::new(dir.path().join("buf"), 0, interval()).unwrap();
        memdb.write(1, 1, 0, &[field(0, 1.0)], 100).unwrap();
        memdb.write(2, 1, 0, &[field(0, 1.0)], 900).unwrap();

        assert_eq!(memdb.evict_inactive(500), 1);
        assert!(memdb.series_ids(1).is_none());
        assert!(memdb.series_ids(2).is_some());
    }
}
