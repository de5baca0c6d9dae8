//! Metric block merger for compaction and rollup

use super::{MetricBlockBuilder, MetricBlockReader};
use crate::encoding::{TsdDecoder, TsdEncoder};
use crate::kv::{Merger, MergerFactory, Rollup};
use crate::types::{FieldId, FieldType};
use crate::Result;
use roaring::RoaringBitmap;

/// Merges duplicate metric blocks during compaction
///
/// Streams are combined per `(series, field)` with the field's storage
/// aggregation; values arrive oldest input first, so last-write-wins fields
/// keep the newest value. In rollup mode slots are re-based onto the coarser
/// grid first; `+Inf` values are dropped on the way.
pub struct MetricDataMerger {
    rollup: Option<Rollup>,
}

impl Merger for MetricDataMerger {
    fn merge(&mut self, _key: u32, values: &[&[u8]]) -> Result<Vec<u8>> {
        let mut readers = Vec::with_capacity(values.len());
        for value in values {
            readers.push(MetricBlockReader::new(value)?);
        }

        // union of fields across inputs
        let mut field_metas: Vec<(FieldId, FieldType)> = Vec::new();
        for reader in &readers {
            for meta in reader.field_metas() {
                if !field_metas.iter().any(|(id, _)| id == &meta.0) {
                    field_metas.push(*meta);
                }
            }
        }
        field_metas.sort_by_key(|(id, _)| *id);

        let mut series_ids = RoaringBitmap::new();
        for reader in &readers {
            series_ids |= reader.series_ids();
        }

        let mut builder = MetricBlockBuilder::new(field_metas.clone());
        let mut streams = Vec::with_capacity(field_metas.len());
        for series_id in &series_ids {
            streams.clear();
            for (field_id, field_type) in &field_metas {
                let agg = field_type.agg_type();
                let mut encoder = TsdEncoder::new();
                for reader in &readers {
                    let Some(entry) = reader.get_series(series_id)? else {
                        continue;
                    };
                    let Some(stream) = entry.field_stream(*field_id) else {
                        continue;
                    };
                    for (slot, value) in TsdDecoder::new(stream)? {
                        match self.rollup {
                            Some(rollup) => {
                                if value.is_infinite() && value.is_sign_positive() {
                                    continue;
                                }
                                encoder.emit(rollup.rollup_slot(slot), value, agg);
                            }
                            None => encoder.emit(slot, value, agg),
                        }
                    }
                }
                streams.push(encoder.finish());
            }
            builder.add_series(series_id, &streams)?;
        }
        builder.finish()
    }
}

/// Factory handed to data families at open time
pub struct MetricDataMergerFactory;

impl MergerFactory for MetricDataMergerFactory {
    fn create(&self, rollup: Option<Rollup>) -> Box<dyn Merger> {
        Box::new(MetricDataMerger { rollup })
    }
}
