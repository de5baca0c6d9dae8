//! Metadata lookup operator: names to ids, select list to field plan

use super::context::{PlannedField, StorageExecuteContext};
use super::stmt::SelectItem;
use crate::meta::{MetricMetaDatabase, HISTOGRAM_BUCKET_PREFIX};
use crate::types::AggType;
use crate::{EmberError, Result};

/// Resolve the metric, its schema, the group-by keys and the field plan
pub fn execute(ctx: &mut StorageExecuteContext, meta: &MetricMetaDatabase) -> Result<()> {
    let metric_id = meta.get_metric_id(&ctx.query.namespace, &ctx.query.metric)?;
    let schema = meta.get_schema(metric_id)?;
    if schema.fields.is_empty() {
        return Err(EmberError::FieldNotFound(ctx.query.metric.clone()));
    }
    ctx.metric_id = metric_id;

    ctx.group_by_tag_key_ids = Vec::with_capacity(ctx.query.group_by.len());
    for tag_key in &ctx.query.group_by {
        let tag = schema
            .tag_key(tag_key)
            .ok_or_else(|| EmberError::TagKeyNotFound(tag_key.clone()))?;
        ctx.group_by_tag_key_ids.push(tag.id);
    }

    if ctx.query.select.is_empty() {
        return Err(EmberError::Plan("empty select list".into()));
    }
    let mut fields: Vec<PlannedField> = Vec::new();
    let mut add = |meta: crate::types::FieldMeta, agg: AggType| {
        match fields.iter_mut().find(|field| field.meta.id == meta.id) {
            Some(field) => {
                if !field.aggs.contains(&agg) {
                    field.aggs.push(agg);
                }
            }
            None => fields.push(PlannedField {
                meta,
                aggs: vec![agg],
            }),
        }
    };

    for item in &ctx.query.select {
        match item {
            SelectItem::Call { func, field } => {
                let field_meta = schema
                    .field(field)
                    .ok_or_else(|| EmberError::FieldNotFound(field.clone()))?;
                if !field_meta.field_type.supports(*func) {
                    return Err(EmberError::Plan(format!(
                        "{:?} not applicable to field {}",
                        func, field
                    )));
                }
                add(field_meta.clone(), *func);
            }
            SelectItem::Quantile(q) => {
                if !(0.0..1.0).contains(q) || *q <= 0.0 {
                    return Err(EmberError::Plan(format!(
                        "quantile {} out of (0, 1)",
                        q
                    )));
                }
                // a quantile reads every histogram bucket field
                let mut buckets = 0;
                for field_meta in &schema.fields {
                    if field_meta.name.starts_with(HISTOGRAM_BUCKET_PREFIX) {
                        add(field_meta.clone(), AggType::Sum);
                        buckets += 1;
                    }
                }
                if buckets == 0 {
                    return Err(EmberError::FieldNotFound(format!(
                        "no histogram buckets on {}",
                        ctx.query.metric
                    )));
                }
                ctx.quantile = Some(*q);
            }
        }
    }
    ctx.fields = fields;
    ctx.schema = schema;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Limits;
    use crate::kv::StoreManager;
    use crate::meta::META_STORE_NAME;
    use crate::query::stmt::Query;
    use crate::types::{FieldType, Interval, TimeRange};
    use tempfile::TempDir;

    fn setup(dir: &std::path::Path) -> MetricMetaDatabase {
        let manager = StoreManager::new(dir);
        let store = manager.get_or_create_store(META_STORE_NAME).unwrap();
        let meta = MetricMetaDatabase::open(&store, Limits::default()).unwrap();
        let metric_id = meta.gen_metric_id("default", "cpu").unwrap();
        meta.gen_field_id(metric_id, "usage", FieldType::Sum).unwrap();
        meta.gen_tag_key_id(metric_id, "host").unwrap();
        meta
    }

    fn query(select: Vec<SelectItem>, group_by: Vec<String>) -> StorageExecuteContext {
        StorageExecuteContext::new(
            Query {
                namespace: "default".into(),
                metric: "cpu".into(),
                select,
                condition: None,
                group_by,
                time_range: TimeRange::new(0, 60_000),
            },
            Interval::new(10_000, 3_600_000, 0).unwrap(),
        )
    }

    #[test]
    fn test_resolves_fields_and_group_by() {
        let dir = TempDir::new().unwrap();
        let meta = setup(dir.path());
        let mut ctx = query(
            vec![SelectItem::Call {
                func: AggType::Sum,
                field: "usage".into(),
            }],
            vec!["host".into()],
        );
        execute(&mut ctx, &meta).unwrap();
        assert_eq!(ctx.fields.len(), 1);
        assert_eq!(ctx.fields[0].meta.name, "usage");
        assert_eq!(ctx.group_by_tag_key_ids.len(), 1);
    }

    #[test]
    fn test_planning_errors() {
        let dir = TempDir::new().unwrap();
        let meta = setup(dir.path());

        let mut ctx = query(vec![], vec![]);
        assert!(matches!(
            execute(&mut ctx, &meta),
            Err(EmberError::Plan(_))
        ));

        let mut ctx = query(
            vec![SelectItem::Call {
                func: AggType::Sum,
                field: "missing".into(),
            }],
            vec![],
        );
        assert!(matches!(
            execute(&mut ctx, &meta),
            Err(EmberError::FieldNotFound(_))
        ));

        let mut ctx = query(
            vec![SelectItem::Call {
                func: AggType::Sum,
                field: "usage".into(),
            }],
            vec!["zone".into()],
        );
        assert!(matches!(
            execute(&mut ctx, &meta),
            Err(EmberError::TagKeyNotFound(_))
        ));

        let mut ctx = query(vec![SelectItem::Quantile(1.5)], vec![]);
        assert!(matches!(
            execute(&mut ctx, &meta),
            Err(EmberError::Plan(_))
        ));
    }

    #[test]
    fn test_unknown_metric() {
        let dir = TempDir::new().unwrap();
        let meta = setup(dir.path());
        let mut ctx = query(
            vec![SelectItem::Call {
                func: AggType::Sum,
                field: "usage".into(),
            }],
            vec![],
        );
        ctx.query.metric = "nope".into();
        assert!(matches!(
            execute(&mut ctx, &meta),
            Err(EmberError::MetricNotFound(_))
        ));
    }
}
