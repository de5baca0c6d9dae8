//! Query statement model
//!
//! The engine consumes a pre-parsed statement; SQL text never reaches this
//! layer. Conditions are a tagged expression tree walked by the operators.

use crate::types::{AggType, TimeRange};

/// Binary operators appearing in conditions; only `And`/`Or` are legal in
/// tag filters, the rest exist to be rejected with a planning error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    And,
    Or,
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    /// Operator spelling for diagnostics and rewrite keys
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
        }
    }
}

/// Condition expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// `tag = 'value'`
    Equals { tag_key: String, value: String },
    /// `tag in ('a', 'b')`
    In { tag_key: String, values: Vec<String> },
    /// `tag like 'pat%'`
    Like { tag_key: String, pattern: String },
    /// `tag =~ 'regex'`
    Regex { tag_key: String, pattern: String },
    /// `not expr`
    Not(Box<Expr>),
    /// `left op right`
    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },
    /// `(expr)`
    Paren(Box<Expr>),
}

impl Expr {
    /// Canonical form used to key per-leaf filter results
    pub fn rewrite(&self) -> String {
        match self {
            Expr::Equals { tag_key, value } => format!("{}={}", tag_key, value),
            Expr::In { tag_key, values } => format!("{} in ({})", tag_key, values.join(",")),
            Expr::Like { tag_key, pattern } => format!("{} like {}", tag_key, pattern),
            Expr::Regex { tag_key, pattern } => format!("{}=~{}", tag_key, pattern),
            Expr::Not(inner) => format!("not {}", inner.rewrite()),
            Expr::Binary { left, op, right } => {
                format!("{} {} {}", left.rewrite(), op.symbol(), right.rewrite())
            }
            Expr::Paren(inner) => format!("({})", inner.rewrite()),
        }
    }

    /// Tag key of a filter leaf, if this is one
    pub fn tag_key(&self) -> Option<&str> {
        match self {
            Expr::Equals { tag_key, .. }
            | Expr::In { tag_key, .. }
            | Expr::Like { tag_key, .. }
            | Expr::Regex { tag_key, .. } => Some(tag_key),
            _ => None,
        }
    }
}

/// One select-list item
#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    /// `agg(field)`
    Call { func: AggType, field: String },
    /// `quantile(p)` over a histogram metric
    Quantile(f64),
}

/// A planned leaf query against one metric
#[derive(Debug, Clone)]
pub struct Query {
    pub namespace: String,
    pub metric: String,
    pub select: Vec<SelectItem>,
    pub condition: Option<Expr>,
    pub group_by: Vec<String>,
    pub time_range: TimeRange,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrite_is_stable() {
        let expr = Expr::Binary {
            left: Box::new(Expr::Equals {
                tag_key: "host".into(),
                value: "h1".into(),
            }),
            op: BinaryOp::And,
            right: Box::new(Expr::Paren(Box::new(Expr::Not(Box::new(Expr::In {
                tag_key: "app".into(),
                values: vec!["a".into(), "b".into()],
            }))))),
        };
        assert_eq!(expr.rewrite(), "host=h1 and (not app in (a,b))");
    }
}
