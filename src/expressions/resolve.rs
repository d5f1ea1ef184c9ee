//! Type resolution.
//!
//! Walks a tree against a nested dataset scope, filling in the type and
//! nesting depth of every reference. Splits, applies, filters, sorts and
//! aggregate arguments introduce inner scopes; a reference with an explicit
//! nesting depth must resolve within the parent chain or resolution fails.

use crate::error::{Error, Result};
use crate::expressions::{ChainOp, Expression, SplitKey};
use crate::types::{AttributeType, DatasetType};

impl Expression {
    /// Return a retyped copy of this tree with every reference resolved
    /// against `scope`. Construction rules are re-checked along the way, so
    /// a tree that resolves also type-checks.
    pub fn resolve_types(&self, scope: &DatasetType) -> Result<Expression> {
        match self {
            Expression::Literal(_) => Ok(self.clone()),
            Expression::Ref(r) => {
                let (resolved, nest) = if r.nest > 0 {
                    (scope.resolve_at(&r.name, r.nest)?.clone(), r.nest)
                } else {
                    let (ty, depth) = scope.resolve(&r.name)?;
                    (ty.clone(), depth)
                };
                if r.ty != AttributeType::Null && r.ty != resolved {
                    return Err(Error::construction(format!(
                        "reference '{}' is declared {} but resolves to {}",
                        r.name,
                        r.ty.tag(),
                        resolved.tag()
                    )));
                }
                Ok(Expression::reference_at(&r.name, nest, resolved))
            }
            Expression::Chain(c) => {
                let operand = c.operand.resolve_types(scope)?;
                let inner_scope = operand.dataset_type().nest_under(scope);
                let resolve_arg = |arg: &Expression| -> Result<Expression> {
                    if c.op.argument_is_nested() {
                        arg.resolve_types(&inner_scope)
                    } else {
                        arg.resolve_types(scope)
                    }
                };
                let op = match &c.op {
                    ChainOp::Filter(e) => ChainOp::Filter(Box::new(resolve_arg(e)?)),
                    ChainOp::Apply { name, expression } => ChainOp::Apply {
                        name: name.clone(),
                        expression: Box::new(resolve_arg(expression)?),
                    },
                    ChainOp::Split { keys, data_name } => ChainOp::Split {
                        keys: keys
                            .iter()
                            .map(|k| {
                                Ok(SplitKey {
                                    name: k.name.clone(),
                                    expression: Box::new(resolve_arg(&k.expression)?),
                                })
                            })
                            .collect::<Result<Vec<_>>>()?,
                        data_name: data_name.clone(),
                    },
                    ChainOp::Sort {
                        expression,
                        direction,
                    } => ChainOp::Sort {
                        expression: Box::new(resolve_arg(expression)?),
                        direction: *direction,
                    },
                    ChainOp::Quantile { expression, value } => ChainOp::Quantile {
                        expression: Box::new(resolve_arg(expression)?),
                        value: *value,
                    },
                    ChainOp::Sum(e) => ChainOp::Sum(Box::new(resolve_arg(e)?)),
                    ChainOp::Min(e) => ChainOp::Min(Box::new(resolve_arg(e)?)),
                    ChainOp::Max(e) => ChainOp::Max(Box::new(resolve_arg(e)?)),
                    ChainOp::Average(e) => ChainOp::Average(Box::new(resolve_arg(e)?)),
                    ChainOp::CountDistinct(e) => {
                        ChainOp::CountDistinct(Box::new(resolve_arg(e)?))
                    }
                    ChainOp::Join(e) => ChainOp::Join(Box::new(resolve_arg(e)?)),
                    ChainOp::And(e) => ChainOp::And(Box::new(resolve_arg(e)?)),
                    ChainOp::Or(e) => ChainOp::Or(Box::new(resolve_arg(e)?)),
                    ChainOp::Is(e) => ChainOp::Is(Box::new(resolve_arg(e)?)),
                    ChainOp::In(e) => ChainOp::In(Box::new(resolve_arg(e)?)),
                    ChainOp::Overlap(e) => ChainOp::Overlap(Box::new(resolve_arg(e)?)),
                    ChainOp::Contains(e) => ChainOp::Contains(Box::new(resolve_arg(e)?)),
                    ChainOp::Add(e) => ChainOp::Add(Box::new(resolve_arg(e)?)),
                    ChainOp::Subtract(e) => ChainOp::Subtract(Box::new(resolve_arg(e)?)),
                    ChainOp::Multiply(e) => ChainOp::Multiply(Box::new(resolve_arg(e)?)),
                    ChainOp::Divide(e) => ChainOp::Divide(Box::new(resolve_arg(e)?)),
                    ChainOp::Power(e) => ChainOp::Power(Box::new(resolve_arg(e)?)),
                    ChainOp::Concat(e) => ChainOp::Concat(Box::new(resolve_arg(e)?)),
                    ChainOp::Fallback(e) => ChainOp::Fallback(Box::new(resolve_arg(e)?)),
                    ChainOp::Then(e) => ChainOp::Then(Box::new(resolve_arg(e)?)),
                    other => other.clone(),
                };
                operand.chain(op)
            }
        }
    }
}
