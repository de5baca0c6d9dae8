//! Series filtering operator: tag value sets to series id sets, per shard

use super::context::StorageExecuteContext;
use super::stmt::{BinaryOp, Expr};
use crate::index::ShardIndex;
use crate::Result;
use roaring::RoaringBitmap;

/// Series ids of one shard matching the query condition
///
/// Leaves use the inverted index; `not` subtracts from the metric's full
/// series set; `and`/`or` intersect and union.
pub fn execute(ctx: &StorageExecuteContext, index: &ShardIndex) -> Result<RoaringBitmap> {
    match &ctx.query.condition {
        None => Ok(index.all_series(ctx.metric_id)),
        Some(condition) => evaluate(ctx, index, condition),
    }
}

fn evaluate(
    ctx: &StorageExecuteContext,
    index: &ShardIndex,
    expr: &Expr,
) -> Result<RoaringBitmap> {
    match expr {
        Expr::Equals { .. } | Expr::In { .. } | Expr::Like { .. } | Expr::Regex { .. } => {
            let Some(result) = ctx.tag_filter_result.get(&expr.rewrite()) else {
                return Ok(RoaringBitmap::new());
            };
            Ok(index.series_by_tag_values(
                ctx.metric_id,
                result.tag_key_id,
                &result.tag_value_ids,
            ))
        }
        Expr::Not(inner) => {
            let inner = evaluate(ctx, index, inner)?;
            Ok(index.all_series(ctx.metric_id) - inner)
        }
        Expr::Paren(inner) => evaluate(ctx, index, inner),
        Expr::Binary { left, op, right } => {
            let left = evaluate(ctx, index, left)?;
            let right = evaluate(ctx, index, right)?;
            Ok(match op {
                BinaryOp::And => left & right,
                // the lookup stage already rejected other operators
                _ => left | right,
            })
        }
    }
}
