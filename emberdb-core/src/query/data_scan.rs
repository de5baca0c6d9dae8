//! Data scan operator: one shard's memdbs and tables into grouped aggregators

use super::aggregates::FieldAggregator;
use super::context::StorageExecuteContext;
use crate::encoding::TsdDecoder;
use crate::metricsdata::MetricBlockReader;
use crate::tsdb::Shard;
use crate::types::{SeriesId, TagValueId, Timestamp};
use crate::{EmberError, Result};
use roaring::RoaringBitmap;
use std::collections::HashMap;

/// Aggregators per grouping tag-value tuple; ungrouped queries use the empty
/// tuple
pub type ShardGroups = HashMap<Vec<TagValueId>, Vec<FieldAggregator>>;

/// Scan the shard's data view for the filtered series
///
/// Pins each family's memdbs and table snapshot first, so concurrent writes
/// and compactions stay invisible. The cancel token is checked between
/// series.
pub fn execute(
    ctx: &StorageExecuteContext,
    shard: &Shard,
    series_ids: &RoaringBitmap,
) -> Result<ShardGroups> {
    let plan = ctx.flat_plan();
    let mut groups = ShardGroups::new();

    // grouping tag values per series; series lacking a grouping tag are
    // dropped from grouped queries
    let mut group_tags: Vec<HashMap<SeriesId, TagValueId>> = Vec::new();
    for tag_key_id in &ctx.group_by_tag_key_ids {
        group_tags.push(
            shard
                .index()
                .series_tag_values(ctx.metric_id, *tag_key_id, series_ids),
        );
    }

    let range = ctx.query.time_range;
    for family in shard.families_in_range(range.start, range.end) {
        if family.interval().storage != ctx.interval.storage {
            continue;
        }
        let family_time = family.family_time();
        let (memdbs, snapshot) = family.data_view();

        for memdb in memdbs {
            let Some(buffered) = memdb.series_ids(ctx.metric_id) else {
                continue;
            };
            for series_id in buffered & series_ids {
                if ctx.cancel.is_canceled() {
                    return Err(EmberError::Canceled);
                }
                let Some(key) = group_key(&group_tags, series_id) else {
                    continue;
                };
                let aggregators = group_aggregators(&mut groups, key, ctx, &plan);
                for (idx, (field, _)) in plan.iter().enumerate() {
                    let Some(stream) = memdb.series_stream(ctx.metric_id, series_id, field.id)?
                    else {
                        continue;
                    };
                    emit_stream(ctx, family_time, &stream, &mut aggregators[idx])?;
                }
            }
        }

        for reader in snapshot.readers()? {
            let block = match reader.get(ctx.metric_id) {
                Ok(value) => MetricBlockReader::new(value)?,
                Err(EmberError::KeyNotExist) => continue,
                Err(e) => return Err(e),
            };
            for series_id in block.series_ids() & series_ids {
                if ctx.cancel.is_canceled() {
                    return Err(EmberError::Canceled);
                }
                let Some(entry) = block.get_series(series_id)? else {
                    continue;
                };
                let Some(key) = group_key(&group_tags, series_id) else {
                    continue;
                };
                let aggregators = group_aggregators(&mut groups, key, ctx, &plan);
                for (idx, (field, _)) in plan.iter().enumerate() {
                    let Some(stream) = entry.field_stream(field.id) else {
                        continue;
                    };
                    emit_stream(ctx, family_time, stream, &mut aggregators[idx])?;
                }
            }
        }
    }
    Ok(groups)
}

fn group_key(
    group_tags: &[HashMap<SeriesId, TagValueId>],
    series_id: SeriesId,
) -> Option<Vec<TagValueId>> {
    let mut key = Vec::with_capacity(group_tags.len());
    for tags in group_tags {
        key.push(*tags.get(&series_id)?);
    }
    Some(key)
}

fn group_aggregators<'a>(
    groups: &'a mut ShardGroups,
    key: Vec<TagValueId>,
    ctx: &StorageExecuteContext,
    plan: &[(crate::types::FieldMeta, crate::types::AggType)],
) -> &'a mut Vec<FieldAggregator> {
    groups.entry(key).or_insert_with(|| {
        plan.iter()
            .map(|(_, agg)| FieldAggregator::new(*agg, ctx.grid_slots))
            .collect()
    })
}

fn emit_stream(
    ctx: &StorageExecuteContext,
    family_time: Timestamp,
    stream: &[u8],
    aggregator: &mut FieldAggregator,
) -> Result<()> {
    for (slot, value) in TsdDecoder::new(stream)? {
        if let Some(grid_slot) = ctx.grid_slot(family_time, slot) {
            aggregator.emit(grid_slot, value);
        }
    }
    Ok(())
}
