//! Leaf executor: shard fan-out, partial merge, result build

use super::aggregates::FieldAggregator;
use super::context::StorageExecuteContext;
use super::data_scan::{self, ShardGroups};
use super::stmt::Query;
use super::{metadata_lookup, series_filter, tag_values_lookup};
use crate::meta::HISTOGRAM_BUCKET_PREFIX;
use crate::tsdb::Database;
use crate::types::{AggType, ShardId, TagValueId, Timestamp};
use crate::{EmberError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// One aggregated field series of a result group
#[derive(Debug, Clone, PartialEq)]
pub struct FieldResult {
    pub name: String,
    pub agg: AggType,
    pub values: Vec<Option<f64>>,
}

/// One grouping tuple with its aggregated fields
#[derive(Debug, Clone)]
pub struct GroupResult {
    /// `(tag key, tag value)` pairs in group-by order; empty when ungrouped
    pub tags: Vec<(String, String)>,
    pub fields: Vec<FieldResult>,
}

/// A completed leaf query
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub grid_start: Timestamp,
    pub interval: i64,
    pub groups: Vec<GroupResult>,
}

/// Executes one pre-planned query against a database
pub struct LeafExecutor<'a> {
    database: &'a Database,
    pool: Option<Arc<crate::pool::WorkerPool>>,
}

impl<'a> LeafExecutor<'a> {
    /// Executor over a database, scanning shards on the caller thread
    pub fn new(database: &'a Database) -> Self {
        Self {
            database,
            pool: None,
        }
    }

    /// Fan shard scans out over a read pool
    pub fn with_pool(mut self, pool: Arc<crate::pool::WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Run the operator pipeline across the given shards and merge partials
    pub fn execute(&self, shard_ids: &[ShardId], query: Query) -> Result<QueryResult> {
        self.execute_with_context(
            shard_ids,
            StorageExecuteContext::new(query, self.database.intervals().write_interval()),
        )
    }

    /// Variant taking a pre-built context, for callers wiring a cancel token
    pub fn execute_with_context(
        &self,
        shard_ids: &[ShardId],
        mut ctx: StorageExecuteContext,
    ) -> Result<QueryResult> {
        metadata_lookup::execute(&mut ctx, self.database.meta())?;
        tag_values_lookup::execute(&mut ctx, self.database.meta())?;
        let ctx = Arc::new(ctx);

        let shards: Vec<_> = shard_ids
            .iter()
            .filter_map(|shard_id| self.database.get_shard(*shard_id))
            .collect();
        let max_series = self.database.limits().max_series_per_query;

        // fan out over shards; each shard emits partial aggregators
        let mut merged = ShardGroups::new();
        match &self.pool {
            Some(pool) if shards.len() > 1 => {
                let (sender, receiver) = crossbeam_channel::bounded(shards.len());
                for shard in &shards {
                    let ctx = ctx.clone();
                    let shard = shard.clone();
                    let sender = sender.clone();
                    let scan = move || {
                        let _ = sender.send(scan_shard(&ctx, &shard, max_series));
                    };
                    if !pool.submit(scan.clone()) {
                        // pool saturated; run on the query thread instead
                        scan();
                    }
                }
                drop(sender);
                for partial in receiver {
                    merge_groups(&mut merged, partial?);
                }
            }
            _ => {
                for shard in &shards {
                    if ctx.cancel.is_canceled() {
                        return Err(EmberError::Canceled);
                    }
                    merge_groups(&mut merged, scan_shard(&ctx, shard, max_series)?);
                }
            }
        }

        self.build_result(&ctx, merged)
    }

    fn build_result(
        &self,
        ctx: &StorageExecuteContext,
        groups: ShardGroups,
    ) -> Result<QueryResult> {
        // resolve grouping tag value ids to strings
        let mut tag_values: Vec<HashMap<TagValueId, String>> = Vec::new();
        for (idx, tag_key_id) in ctx.group_by_tag_key_ids.iter().enumerate() {
            let mut wanted = roaring::RoaringBitmap::new();
            for key in groups.keys() {
                wanted.insert(key[idx]);
            }
            tag_values.push(self.database.meta().collect_tag_values(*tag_key_id, &wanted)?);
        }

        let plan = ctx.flat_plan();
        let mut results = Vec::with_capacity(groups.len());
        for (key, aggregators) in groups {
            let mut tags = Vec::with_capacity(key.len());
            for (idx, value_id) in key.iter().enumerate() {
                let value = tag_values[idx]
                    .get(value_id)
                    .cloned()
                    .unwrap_or_default();
                tags.push((ctx.query.group_by[idx].clone(), value));
            }

            let mut fields: Vec<FieldResult> = plan
                .iter()
                .zip(aggregators)
                .map(|((meta, agg), aggregator)| FieldResult {
                    name: meta.name.clone(),
                    agg: *agg,
                    values: aggregator.into_values(),
                })
                .collect();
            if let Some(q) = ctx.quantile {
                let quantile = compute_quantile(q, &fields, ctx.grid_slots);
                fields.retain(|field| !field.name.starts_with(HISTOGRAM_BUCKET_PREFIX));
                fields.push(quantile);
            }
            results.push(GroupResult { tags, fields });
        }
        results.sort_by(|a, b| a.tags.cmp(&b.tags));

        Ok(QueryResult {
            grid_start: ctx.grid_start,
            interval: ctx.interval.storage,
            groups: results,
        })
    }
}

/// Filter then scan one shard
fn scan_shard(
    ctx: &StorageExecuteContext,
    shard: &crate::tsdb::Shard,
    max_series: usize,
) -> Result<ShardGroups> {
    let series_ids = series_filter::execute(ctx, shard.index())?;
    if max_series > 0 && series_ids.len() > max_series as u64 {
        return Err(EmberError::TooManySeries {
            max: max_series as u32,
        });
    }
    debug!(
        shard = shard.shard_id(),
        series = series_ids.len(),
        "scanning shard"
    );
    data_scan::execute(ctx, shard, &series_ids)
}

fn merge_groups(merged: &mut ShardGroups, partial: ShardGroups) {
    for (key, aggregators) in partial {
        match merged.get_mut(&key) {
            Some(existing) => {
                for (current, incoming) in existing.iter_mut().zip(&aggregators) {
                    current.merge(incoming);
                }
            }
            None => {
                merged.insert(key, aggregators);
            }
        }
    }
}

/// Per-slot histogram quantile from bucket field sums
///
/// Bucket field names carry their upper bound; the value is linearly
/// interpolated inside the bucket holding the target rank.
fn compute_quantile(q: f64, fields: &[FieldResult], slots: usize) -> FieldResult {
    let mut buckets: Vec<(f64, &FieldResult)> = fields
        .iter()
        .filter_map(|field| {
            field
                .name
                .strip_prefix(HISTOGRAM_BUCKET_PREFIX)
                .and_then(|bound| bound.parse::<f64>().ok())
                .map(|bound| (bound, field))
        })
        .collect();
    buckets.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut values = vec![None; slots];
    for (slot, value) in values.iter_mut().enumerate() {
        let total: f64 = buckets
            .iter()
            .filter_map(|(_, field)| field.values[slot])
            .sum();
        if total <= 0.0 {
            continue;
        }
        let target = q * total;
        let mut cumulative = 0.0;
        let mut lower = 0.0;
        for (bound, field) in &buckets {
            let count = field.values[slot].unwrap_or(0.0);
            if cumulative + count >= target {
                let within = if count > 0.0 {
                    (target - cumulative) / count
                } else {
                    0.0
                };
                *value = Some(lower + (*bound - lower) * within);
                break;
            }
            cumulative += count;
            lower = *bound;
        }
        if value.is_none() {
            *value = buckets.last().map(|(bound, _)| *bound);
        }
    }

    FieldResult {
        name: format!("quantile({})", q),
        agg: AggType::Sum,
        values,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_groups_combines_matching_keys() {
        let mut merged = ShardGroups::new();
        let mut a = FieldAggregator::new(AggType::Sum, 2);
        a.emit(0, 1.0);
        merged.insert(vec![1], vec![a]);

        let mut b = FieldAggregator::new(AggType::Sum, 2);
        b.emit(0, 2.0);
        b.emit(1, 5.0);
        let mut partial = ShardGroups::new();
        partial.insert(vec![1], vec![b]);
        let mut c = FieldAggregator::new(AggType::Sum, 2);
        c.emit(1, 9.0);
        partial.insert(vec![2], vec![c]);

        merge_groups(&mut merged, partial);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[&vec![1u32]][0].values(), &[Some(3.0), Some(5.0)]);
        assert_eq!(merged[&vec![2u32]][0].values(), &[None, Some(9.0)]);
    }

    #[test]
    fn test_compute_quantile_interpolates() {
        let bucket = |bound: &str, count: f64| FieldResult {
            name: format!("{}{}", HISTOGRAM_BUCKET_PREFIX, bound),
            agg: AggType::Sum,
            values: vec![Some(count)],
        };
        // 10 observations <= 1.0, 10 more <= 2.0
        let fields = vec![bucket("1.0", 10.0), bucket("2.0", 10.0)];
        let result = compute_quantile(0.5, &fields, 1);
        assert_eq!(result.values[0], Some(1.0));
        let result = compute_quantile(0.75, &fields, 1);
        assert_eq!(result.values[0], Some(1.5));
    }
}
