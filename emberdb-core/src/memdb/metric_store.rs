//! Per-metric write buffer

use super::buffer::DataPointBuffer;
use super::field_store::FieldStore;
use crate::types::{FieldId, FieldType, SeriesId, SlotId, Timestamp};
use crate::Result;
use roaring::RoaringBitmap;
use std::collections::HashMap;

/// One series' field stores
#[derive(Default)]
pub struct SeriesStore {
    fields: Vec<(FieldId, FieldStore)>,
}

impl SeriesStore {
    fn field_mut(&mut self, field_id: FieldId) -> &mut FieldStore {
        if let Some(idx) = self.fields.iter().position(|(id, _)| *id == field_id) {
            return &mut self.fields[idx].1;
        }
        self.fields.push((field_id, FieldStore::new()));
        let last = self.fields.len() - 1;
        &mut self.fields[last].1
    }

    /// Store of one field, if any point was written
    pub fn field(&self, field_id: FieldId) -> Option<&FieldStore> {
        self.fields
            .iter()
            .find(|(id, _)| *id == field_id)
            .map(|(_, store)| store)
    }

    fn memory_size(&self) -> usize {
        self.fields
            .iter()
            .map(|(_, store)| store.memory_size())
            .sum()
    }
}

/// Write buffer of one metric within one family memdb
///
/// Series are sharded by the high 16 bits of their id, mirroring the bucket
/// layout of the on-disk metric block.
pub struct MetricStore {
    field_metas: Vec<(FieldId, FieldType)>,
    buckets: HashMap<u16, HashMap<u16, SeriesStore>>,
    series_ids: RoaringBitmap,
    start_slot: SlotId,
    end_slot: SlotId,
    active_at: Timestamp,
}

impl MetricStore {
    /// Empty store
    pub fn new() -> Self {
        Self {
            field_metas: Vec::new(),
            buckets: HashMap::new(),
            series_ids: RoaringBitmap::new(),
            start_slot: SlotId::MAX,
            end_slot: 0,
            active_at: 0,
        }
    }

    /// Register a field, keeping metas sorted by id
    pub fn register_field(&mut self, field_id: FieldId, field_type: FieldType) {
        if !self.field_metas.iter().any(|(id, _)| *id == field_id) {
            self.field_metas.push((field_id, field_type));
            self.field_metas.sort_by_key(|(id, _)| *id);
        }
    }

    /// Fields seen by this store, sorted by id
    pub fn field_metas(&self) -> &[(FieldId, FieldType)] {
        &self.field_metas
    }

    /// Write one field value
    pub fn write(
        &mut self,
        buffer: &DataPointBuffer,
        series_id: SeriesId,
        field_id: FieldId,
        slot: SlotId,
        value: f64,
        now: Timestamp,
    ) -> Result<()> {
        let high = (series_id >> 16) as u16;
        let low = series_id as u16;
        let series = self
            .buckets
            .entry(high)
            .or_default()
            .entry(low)
            .or_default();
        series.field_mut(field_id).write(buffer, slot, value)?;
        self.series_ids.insert(series_id);
        self.start_slot = self.start_slot.min(slot);
        self.end_slot = self.end_slot.max(slot);
        self.active_at = self.active_at.max(now);
        Ok(())
    }

    /// Ids of the series written to this store
    pub fn series_ids(&self) -> &RoaringBitmap {
        &self.series_ids
    }

    /// Store of one series
    pub fn series(&self, series_id: SeriesId) -> Option<&SeriesStore> {
        self.buckets
            .get(&((series_id >> 16) as u16))?
            .get(&(series_id as u16))
    }

    /// Slot range written so far; `None` when empty
    pub fn slot_range(&self) -> Option<(SlotId, SlotId)> {
        (!self.series_ids.is_empty()).then_some((self.start_slot, self.end_slot))
    }

    /// Timestamp of the last write
    pub fn active_at(&self) -> Timestamp {
        self.active_at
    }

    /// Approximate memory held, in bytes
    pub fn memory_size(&self) -> usize {
        self.buckets
            .values()
            .flat_map(|bucket| bucket.values())
            .map(|series| series.memory_size())
            .sum()
    }
}

impl Default for MetricStore {
    fn default() -> Self {
        Self::new()
    }
}
