//! Per-shard series index
//!
//! Maps each unique tag-value combination of a metric to a dense series id
//! and maintains the inverted index from tag value ids to series ids that
//! query filtering intersects. The index is rebuilt from WAL replay on
//! restart.

use crate::types::{MetricId, SeriesId, TagKeyId, TagValueId};
use crate::{EmberError, Result};
use dashmap::DashMap;
use roaring::RoaringBitmap;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

#[derive(Default)]
struct MetricIndex {
    series: HashMap<u64, SeriesId>,
    next_series_id: SeriesId,
    all_series: RoaringBitmap,
    inverted: HashMap<(TagKeyId, TagValueId), RoaringBitmap>,
}

/// Series index of one shard
#[derive(Default)]
pub struct ShardIndex {
    metrics: DashMap<MetricId, MetricIndex>,
}

impl ShardIndex {
    /// Empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or allocate the series id of a tag-value combination
    ///
    /// `tags` must be sorted by tag key id; `max_series` bounds the metric's
    /// cardinality, zero disables the check.
    pub fn get_or_create_series(
        &self,
        metric_id: MetricId,
        tags: &[(TagKeyId, TagValueId)],
        max_series: u32,
    ) -> Result<SeriesId> {
        let hash = tags_hash(tags);
        let mut index = self.metrics.entry(metric_id).or_default();
        if let Some(series_id) = index.series.get(&hash) {
            return Ok(*series_id);
        }
        if max_series > 0 && index.all_series.len() >= max_series as u64 {
            return Err(EmberError::TooManySeries { max: max_series });
        }

        let series_id = index.next_series_id;
        index.next_series_id += 1;
        index.series.insert(hash, series_id);
        index.all_series.insert(series_id);
        for (tag_key_id, tag_value_id) in tags {
            index
                .inverted
                .entry((*tag_key_id, *tag_value_id))
                .or_default()
                .insert(series_id);
        }
        Ok(series_id)
    }

    /// Every series id of a metric
    pub fn all_series(&self, metric_id: MetricId) -> RoaringBitmap {
        self.metrics
            .get(&metric_id)
            .map(|index| index.all_series.clone())
            .unwrap_or_default()
    }

    /// Series ids whose tag key carries any of the given value ids
    pub fn series_by_tag_values(
        &self,
        metric_id: MetricId,
        tag_key_id: TagKeyId,
        value_ids: &RoaringBitmap,
    ) -> RoaringBitmap {
        let Some(index) = self.metrics.get(&metric_id) else {
            return RoaringBitmap::new();
        };
        let mut found = RoaringBitmap::new();
        for value_id in value_ids {
            if let Some(series) = index.inverted.get(&(tag_key_id, value_id)) {
                found |= series;
            }
        }
        found
    }

    /// Value id of each series for one grouping tag key
    pub fn series_tag_values(
        &self,
        metric_id: MetricId,
        tag_key_id: TagKeyId,
        series_ids: &RoaringBitmap,
    ) -> HashMap<SeriesId, TagValueId> {
        let Some(index) = self.metrics.get(&metric_id) else {
            return HashMap::new();
        };
        let mut values = HashMap::new();
        for ((key, value_id), series) in &index.inverted {
            if *key != tag_key_id {
                continue;
            }
            for series_id in series & series_ids {
                values.insert(series_id, *value_id);
            }
        }
        values
    }
}

fn tags_hash(tags: &[(TagKeyId, TagValueId)]) -> u64 {
    let mut hasher = DefaultHasher::new();
    tags.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_series_allocation_is_stable() {
        let index = ShardIndex::new();
        let a = index.get_or_create_series(1, &[(1, 10), (2, 20)], 0).unwrap();
        let b = index.get_or_create_series(1, &[(1, 10), (2, 21)], 0).unwrap();
        assert_ne!(a, b);
        assert_eq!(
            index.get_or_create_series(1, &[(1, 10), (2, 20)], 0).unwrap(),
            a
        );
        assert_eq!(index.all_series(1).len(), 2);
        // other metrics allocate independently
        let c = index.get_or_create_series(2, &[(1, 10)], 0).unwrap();
        assert_eq!(c, 0);
    }

    #[test]
    fn test_series_limit() {
        let index = ShardIndex::new();
        index.get_or_create_series(1, &[(1, 1)], 2).unwrap();
        index.get_or_create_series(1, &[(1, 2)], 2).unwrap();
        assert!(matches!(
            index.get_or_create_series(1, &[(1, 3)], 2),
            Err(EmberError::TooManySeries { max: 2 })
        ));
    }

    #[test]
    fn test_inverted_lookup() {
        let index = ShardIndex::new();
        let a = index.get_or_create_series(1, &[(1, 10)], 0).unwrap();
        let b = index.get_or_create_series(1, &[(1, 11)], 0).unwrap();
        let c = index.get_or_create_series(1, &[(1, 10), (2, 5)], 0).unwrap();

        let values: RoaringBitmap = [10u32].into_iter().collect();
        let found = index.series_by_tag_values(1, 1, &values);
        assert!(found.contains(a) && found.contains(c) && !found.contains(b));

        let tag_values =
            index.series_tag_values(1, 1, &[a, b, c].into_iter().collect());
        assert_eq!(tag_values[&a], 10);
        assert_eq!(tag_values[&b], 11);
        assert_eq!(tag_values[&c], 10);
    }
}
