//! Query operator pipeline
//!
//! A pre-planned statement runs through metadata lookup, tag-value lookup,
//! per-shard series filtering, data scan and field aggregation; the leaf
//! executor fans shards out and merges partial aggregators.

mod aggregates;
mod context;
mod data_scan;
mod executor;
mod metadata_lookup;
mod series_filter;
pub mod stmt;
mod tag_values_lookup;

pub use aggregates::FieldAggregator;
pub use context::{CancelToken, PlannedField, StorageExecuteContext, TagFilterResult};
pub use data_scan::ShardGroups;
pub use executor::{FieldResult, GroupResult, LeafExecutor, QueryResult};

#[cfg(test)]
mod tests {
    use super::stmt::{Expr, Query, SelectItem};
    use super::*;
    use crate::config::EngineConfig;
    use crate::replica::{MetricRow, RowField};
    use crate::tsdb::Engine;
    use crate::types::{AggType, FieldType, TimeRange};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn engine(dir: &std::path::Path) -> Arc<Engine> {
        Engine::new(EngineConfig::with_data_dir(dir)).unwrap()
    }

    fn row(metric: &str, ts: i64, tags: &[(&str, &str)], fields: &[(&str, f64)]) -> MetricRow {
        MetricRow {
            namespace: "default".into(),
            metric: metric.into(),
            timestamp: ts,
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            fields: fields
                .iter()
                .map(|(name, value)| RowField {
                    name: name.to_string(),
                    field_type: FieldType::Sum,
                    value: *value,
                })
                .collect(),
        }
    }

    fn wait_replicated(family: &crate::tsdb::DataFamily, leader: i32, seq: i64) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while family.replica_sequence(leader) < seq {
            assert!(
                std::time::Instant::now() < deadline,
                "replication stalled at {}",
                family.replica_sequence(leader)
            );
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_query_with_group_by() {
        let dir = TempDir::new().unwrap();
        let engine = engine(dir.path());
        let db = engine.get_or_create_database("metrics").unwrap();
        let shard = db.get_or_create_shard(0).unwrap();

        // two series; t0 and t1 land in adjacent slots
        let t0 = 1_690_000_000_000_i64;
        let t0 = t0 - t0 % 10_000;
        let t1 = t0 + 10_000;
        shard
            .write_rows(
                1,
                &[
                    row("cpu", t0, &[("host", "h1"), ("app", "a1")], &[("f1", 1.0)]),
                    row("cpu", t1, &[("host", "h1"), ("app", "a1")], &[("f1", 2.0)]),
                    row("cpu", t0, &[("host", "h2"), ("app", "a2")], &[("f1", 9.0)]),
                ],
            )
            .unwrap();

        let interval = shard.write_interval();
        let family = shard
            .get_family(interval, interval.family_time(t0))
            .unwrap();
        wait_replicated(&family, 1, 0);

        let query = Query {
            namespace: "default".into(),
            metric: "cpu".into(),
            select: vec![SelectItem::Call {
                func: AggType::Sum,
                field: "f1".into(),
            }],
            condition: Some(Expr::Equals {
                tag_key: "host".into(),
                value: "h1".into(),
            }),
            group_by: vec!["host".into()],
            time_range: TimeRange::new(t0, t1),
        };
        let result = LeafExecutor::new(&db).execute(&[0], query.clone()).unwrap();

        assert_eq!(result.groups.len(), 1);
        let group = &result.groups[0];
        assert_eq!(group.tags, vec![("host".to_string(), "h1".to_string())]);
        assert_eq!(group.fields.len(), 1);
        assert_eq!(group.fields[0].name, "f1");
        assert_eq!(group.fields[0].values, vec![Some(1.0), Some(2.0)]);

        // the same result after flushing to a table
        family.flush().unwrap();
        let result = LeafExecutor::new(&db).execute(&[0], query).unwrap();
        assert_eq!(result.groups.len(), 1);
        assert_eq!(result.groups[0].fields[0].values, vec![Some(1.0), Some(2.0)]);

        engine.close();
    }

    #[test]
    fn test_query_sees_point_in_time_view() {
        let dir = TempDir::new().unwrap();
        let engine = engine(dir.path());
        let db = engine.get_or_create_database("metrics").unwrap();
        let shard = db.get_or_create_shard(0).unwrap();

        let t0 = 1_690_000_000_000_i64;
        let t0 = t0 - t0 % 10_000;
        shard
            .write_rows(1, &[row("mem", t0, &[("host", "h1")], &[("used", 5.0)])])
            .unwrap();
        let interval = shard.write_interval();
        let family = shard
            .get_family(interval, interval.family_time(t0))
            .unwrap();
        wait_replicated(&family, 1, 0);

        let query = Query {
            namespace: "default".into(),
            metric: "mem".into(),
            select: vec![SelectItem::Call {
                func: AggType::Sum,
                field: "used".into(),
            }],
            condition: None,
            group_by: vec![],
            time_range: TimeRange::new(t0, t0),
        };
        let result = LeafExecutor::new(&db).execute(&[0], query.clone()).unwrap();
        assert_eq!(result.groups[0].fields[0].values, vec![Some(5.0)]);

        // writes after the scan's view was pinned are not visible to it;
        // a fresh execution sees them
        shard
            .write_rows(1, &[row("mem", t0, &[("host", "h1")], &[("used", 2.0)])])
            .unwrap();
        wait_replicated(&family, 1, 1);
        let result = LeafExecutor::new(&db).execute(&[0], query).unwrap();
        assert_eq!(result.groups[0].fields[0].values, vec![Some(7.0)]);

        engine.close();
    }

    #[test]
    fn test_engine_query_fans_out_over_shards() {
        let dir = TempDir::new().unwrap();
        let engine = engine(dir.path());
        let db = engine.get_or_create_database("metrics").unwrap();
        let shard0 = db.get_or_create_shard(0).unwrap();
        let shard1 = db.get_or_create_shard(1).unwrap();

        let t0 = 1_690_000_000_000_i64;
        let t0 = t0 - t0 % 10_000;
        let t1 = t0 + 10_000;
        shard0
            .write_rows(1, &[row("cpu", t0, &[("host", "h1")], &[("f1", 1.0)])])
            .unwrap();
        shard1
            .write_rows(
                1,
                &[
                    row("cpu", t0, &[("host", "h1")], &[("f1", 2.0)]),
                    row("cpu", t1, &[("host", "h1")], &[("f1", 5.0)]),
                ],
            )
            .unwrap();

        let interval = shard0.write_interval();
        let family_time = interval.family_time(t0);
        wait_replicated(&shard0.get_family(interval, family_time).unwrap(), 1, 0);
        wait_replicated(&shard1.get_family(interval, family_time).unwrap(), 1, 0);

        // two shards drive the pool fan-out branch; partials merge per group
        let query = Query {
            namespace: "default".into(),
            metric: "cpu".into(),
            select: vec![SelectItem::Call {
                func: AggType::Sum,
                field: "f1".into(),
            }],
            condition: None,
            group_by: vec!["host".into()],
            time_range: TimeRange::new(t0, t1),
        };
        let result = engine.execute_query("metrics", &[0, 1], query).unwrap();

        assert_eq!(result.groups.len(), 1);
        let group = &result.groups[0];
        assert_eq!(group.tags, vec![("host".to_string(), "h1".to_string())]);
        assert_eq!(group.fields[0].values, vec![Some(3.0), Some(5.0)]);

        engine.close();
    }

    #[test]
    fn test_compaction_preserves_query_result() {
        let dir = TempDir::new().unwrap();
        let mut config = EngineConfig::with_data_dir(dir.path());
        config.level0_compaction_threshold = 2;
        let engine = Engine::new(config).unwrap();
        let db = engine.get_or_create_database("metrics").unwrap();
        let shard = db.get_or_create_shard(0).unwrap();

        let t0 = 1_690_000_000_000_i64;
        let t0 = t0 - t0 % 10_000;
        let interval = shard.write_interval();

        // two flushes produce two level-0 tables with overlapping slots
        shard
            .write_rows(1, &[row("cpu", t0, &[("host", "h1")], &[("f1", 1.0)])])
            .unwrap();
        let family = shard.get_family(interval, interval.family_time(t0)).unwrap();
        wait_replicated(&family, 1, 0);
        family.flush().unwrap();

        shard
            .write_rows(
                1,
                &[
                    row("cpu", t0, &[("host", "h1")], &[("f1", 4.0)]),
                    row("cpu", t0 + 10_000, &[("host", "h1")], &[("f1", 2.0)]),
                ],
            )
            .unwrap();
        wait_replicated(&family, 1, 1);
        family.flush().unwrap();
        assert_eq!(family.data_view().1.version().files(0).len(), 2);

        let query = Query {
            namespace: "default".into(),
            metric: "cpu".into(),
            select: vec![SelectItem::Call {
                func: AggType::Sum,
                field: "f1".into(),
            }],
            condition: None,
            group_by: vec![],
            time_range: TimeRange::new(t0, t0 + 10_000),
        };
        let before = LeafExecutor::new(&db).execute(&[0], query.clone()).unwrap();
        assert_eq!(before.groups[0].fields[0].values, vec![Some(5.0), Some(2.0)]);

        // compact the two tables and re-run: the result must not change
        assert!(family.kv_family().needs_compaction());
        assert!(family.kv_family().compact().unwrap());
        assert!(family.data_view().1.version().files(0).is_empty());

        let after = LeafExecutor::new(&db).execute(&[0], query).unwrap();
        assert_eq!(
            after.groups[0].fields[0].values,
            before.groups[0].fields[0].values
        );

        engine.close();
    }

    #[test]
    fn test_canceled_query_errors() {
        let dir = TempDir::new().unwrap();
        let engine = engine(dir.path());
        let db = engine.get_or_create_database("metrics").unwrap();
        let shard = db.get_or_create_shard(0).unwrap();

        let t0 = 1_690_000_000_000_i64;
        let t0 = t0 - t0 % 10_000;
        shard
            .write_rows(1, &[row("cpu", t0, &[("host", "h1")], &[("f1", 1.0)])])
            .unwrap();
        let interval = shard.write_interval();
        let family = shard
            .get_family(interval, interval.family_time(t0))
            .unwrap();
        wait_replicated(&family, 1, 0);

        let query = Query {
            namespace: "default".into(),
            metric: "cpu".into(),
            select: vec![SelectItem::Call {
                func: AggType::Sum,
                field: "f1".into(),
            }],
            condition: None,
            group_by: vec![],
            time_range: TimeRange::new(t0, t0),
        };
        let ctx = StorageExecuteContext::new(query, interval);
        ctx.cancel.cancel();
        let result = LeafExecutor::new(&db).execute_with_context(&[0], ctx);
        assert!(matches!(result, Err(crate::EmberError::Canceled)));

        engine.close();
    }
}
