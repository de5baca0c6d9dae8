//! Storage execute context shared by the query operators

use super::stmt::Query;
use crate::meta::MetricSchema;
use crate::types::{AggType, FieldMeta, Interval, MetricId, TagKeyId, Timestamp};
use roaring::RoaringBitmap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cancellation token carried by a query
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    canceled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Fresh, un-canceled token
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; in-flight scans stop at the next slot boundary
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }
}

/// One planned output field
#[derive(Debug, Clone)]
pub struct PlannedField {
    pub meta: FieldMeta,
    pub aggs: Vec<AggType>,
}

/// Context threaded through the operator pipeline
///
/// `MetadataLookup` fills the resolution fields, `TagValuesLookup` the
/// per-leaf filter results; the per-shard stages read both.
pub struct StorageExecuteContext {
    pub query: Query,
    pub cancel: CancelToken,

    // filled by metadata lookup
    pub metric_id: MetricId,
    pub schema: MetricSchema,
    pub group_by_tag_key_ids: Vec<TagKeyId>,
    pub fields: Vec<PlannedField>,
    /// Quantile requested by the select list, if any
    pub quantile: Option<f64>,

    // filled by tag-values lookup, keyed by the leaf's rewrite form
    pub tag_filter_result: HashMap<String, TagFilterResult>,

    // query grid
    pub interval: Interval,
    pub grid_start: Timestamp,
    pub grid_slots: usize,
}

/// Tag value ids matching one filter leaf
#[derive(Debug, Clone)]
pub struct TagFilterResult {
    pub tag_key_id: TagKeyId,
    pub tag_value_ids: RoaringBitmap,
}

impl StorageExecuteContext {
    /// Context for a query against a database using `interval` as the grid
    pub fn new(query: Query, interval: Interval) -> Self {
        let grid_start = query.time_range.start - query.time_range.start.rem_euclid(interval.storage);
        let grid_end = query.time_range.end - query.time_range.end.rem_euclid(interval.storage);
        let grid_slots = ((grid_end - grid_start) / interval.storage) as usize + 1;
        Self {
            query,
            cancel: CancelToken::new(),
            metric_id: 0,
            schema: MetricSchema::default(),
            group_by_tag_key_ids: Vec::new(),
            fields: Vec::new(),
            quantile: None,
            tag_filter_result: HashMap::new(),
            interval,
            grid_start,
            grid_slots,
        }
    }

    /// The planned `(field, agg)` pairs in output order
    pub fn flat_plan(&self) -> Vec<(FieldMeta, AggType)> {
        self.fields
            .iter()
            .flat_map(|field| {
                field
                    .aggs
                    .iter()
                    .map(|agg| (field.meta.clone(), *agg))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Grid position of a family slot, if it falls inside the grid
    pub fn grid_slot(&self, family_time: Timestamp, slot: crate::types::SlotId) -> Option<usize> {
        let ts = self.interval.slot_time(family_time, slot);
        if !self.query.time_range.contains(ts) && !self.query.time_range.contains(ts + self.interval.storage - 1) {
            return None;
        }
        let offset = (ts - self.grid_start) / self.interval.storage;
        (0..self.grid_slots as i64)
            .contains(&offset)
            .then_some(offset as usize)
    }
}
