//! Tag-values lookup operator: filter leaves to tag value id sets

use super::context::{StorageExecuteContext, TagFilterResult};
use super::stmt::{BinaryOp, Expr};
use crate::meta::{MetricMetaDatabase, TagValueFilter};
use crate::types::TagKeyId;
use crate::{EmberError, Result};

/// Walk the condition tree and resolve every filter leaf to a tag value id
/// bitmap, keyed by the leaf's rewrite form
pub fn execute(ctx: &mut StorageExecuteContext, meta: &MetricMetaDatabase) -> Result<()> {
    let Some(condition) = ctx.query.condition.clone() else {
        return Ok(());
    };
    walk(ctx, meta, &condition)
}

fn walk(ctx: &mut StorageExecuteContext, meta: &MetricMetaDatabase, expr: &Expr) -> Result<()> {
    match expr {
        Expr::Equals { tag_key, value } => {
            leaf(ctx, meta, tag_key, expr, TagValueFilter::Equal(value.clone()))
        }
        Expr::In { tag_key, values } => {
            leaf(ctx, meta, tag_key, expr, TagValueFilter::In(values.clone()))
        }
        Expr::Like { tag_key, pattern } => {
            leaf(ctx, meta, tag_key, expr, TagValueFilter::Like(pattern.clone()))
        }
        Expr::Regex { tag_key, pattern } => {
            leaf(ctx, meta, tag_key, expr, TagValueFilter::Regex(pattern.clone()))
        }
        Expr::Not(inner) | Expr::Paren(inner) => walk(ctx, meta, inner),
        Expr::Binary { left, op, right } => {
            if !matches!(op, BinaryOp::And | BinaryOp::Or) {
                return Err(EmberError::Plan(format!(
                    "operator {} not allowed in tag filter",
                    op.symbol()
                )));
            }
            walk(ctx, meta, left)?;
            walk(ctx, meta, right)
        }
    }
}

fn leaf(
    ctx: &mut StorageExecuteContext,
    meta: &MetricMetaDatabase,
    tag_key: &str,
    expr: &Expr,
    filter: TagValueFilter,
) -> Result<()> {
    let tag_key_id = resolve_tag_key(ctx, tag_key)?;
    let tag_value_ids = meta.find_tag_value_ids(tag_key_id, &filter)?;
    ctx.tag_filter_result.insert(
        expr.rewrite(),
        TagFilterResult {
            tag_key_id,
            tag_value_ids,
        },
    );
    Ok(())
}

fn resolve_tag_key(ctx: &StorageExecuteContext, tag_key: &str) -> Result<TagKeyId> {
    ctx.schema
        .tag_key(tag_key)
        .map(|tag| tag.id)
        .ok_or_else(|| EmberError::TagKeyNotFound(tag_key.to_string()))
}
