//! Tree substitution.
//!
//! A single top-down pass: the substitution function sees every node with
//! the nesting depth at which it sits, and may replace it. Replacements
//! are taken as-is; the pass does not descend into them, so a rule can
//! safely rewrite a node into a tree containing nodes it would also match.

use crate::error::Result;
use crate::expressions::{ChainOp, Expression, SplitKey};

/// A substitution rule: `Some(replacement)` rewrites the node, `None`
/// leaves it and lets the walk continue into its children.
pub type Substitution<'a> = dyn Fn(&Expression, usize) -> Result<Option<Expression>> + 'a;

impl Expression {
    pub fn substitute(&self, f: &Substitution) -> Result<Expression> {
        substitute_at(self, f, 0)
    }

    /// Rewrite every reference to `name` at the current level into `with`.
    pub fn substitute_reference(&self, name: &str, with: &Expression) -> Result<Expression> {
        self.substitute(&|e, depth| {
            Ok(match e.as_ref_expr() {
                Some(r) if r.name == name && r.nest == depth => Some(with.clone()),
                _ => None,
            })
        })
    }
}

fn substitute_at(e: &Expression, f: &Substitution, depth: usize) -> Result<Expression> {
    if let Some(replaced) = f(e, depth)? {
        return Ok(replaced);
    }
    match e {
        Expression::Ref(_) | Expression::Literal(_) => Ok(e.clone()),
        Expression::Chain(c) => {
            let operand = substitute_at(&c.operand, f, depth)?;
            let inner = if c.op.argument_is_nested() {
                depth + 1
            } else {
                depth
            };
            let sub = |arg: &Expression| substitute_at(arg, f, inner);
            let op = match &c.op {
                ChainOp::Filter(a) => ChainOp::Filter(Box::new(sub(a)?)),
                ChainOp::Apply { name, expression } => ChainOp::Apply {
                    name: name.clone(),
                    expression: Box::new(sub(expression)?),
                },
                ChainOp::Split { keys, data_name } => ChainOp::Split {
                    keys: keys
                        .iter()
                        .map(|k| {
                            Ok(SplitKey {
                                name: k.name.clone(),
                                expression: Box::new(sub(&k.expression)?),
                            })
                        })
                        .collect::<Result<Vec<_>>>()?,
                    data_name: data_name.clone(),
                },
                ChainOp::Sort {
                    expression,
                    direction,
                } => ChainOp::Sort {
                    expression: Box::new(sub(expression)?),
                    direction: *direction,
                },
                ChainOp::Quantile { expression, value } => ChainOp::Quantile {
                    expression: Box::new(sub(expression)?),
                    value: *value,
                },
                ChainOp::Sum(a) => ChainOp::Sum(Box::new(sub(a)?)),
                ChainOp::Min(a) => ChainOp::Min(Box::new(sub(a)?)),
                ChainOp::Max(a) => ChainOp::Max(Box::new(sub(a)?)),
                ChainOp::Average(a) => ChainOp::Average(Box::new(sub(a)?)),
                ChainOp::CountDistinct(a) => ChainOp::CountDistinct(Box::new(sub(a)?)),
                ChainOp::Join(a) => ChainOp::Join(Box::new(sub(a)?)),
                ChainOp::And(a) => ChainOp::And(Box::new(sub(a)?)),
                ChainOp::Or(a) => ChainOp::Or(Box::new(sub(a)?)),
                ChainOp::Is(a) => ChainOp::Is(Box::new(sub(a)?)),
                ChainOp::In(a) => ChainOp::In(Box::new(sub(a)?)),
                ChainOp::Overlap(a) => ChainOp::Overlap(Box::new(sub(a)?)),
                ChainOp::Contains(a) => ChainOp::Contains(Box::new(sub(a)?)),
                ChainOp::Add(a) => ChainOp::Add(Box::new(sub(a)?)),
                ChainOp::Subtract(a) => ChainOp::Subtract(Box::new(sub(a)?)),
                ChainOp::Multiply(a) => ChainOp::Multiply(Box::new(sub(a)?)),
                ChainOp::Divide(a) => ChainOp::Divide(Box::new(sub(a)?)),
                ChainOp::Power(a) => ChainOp::Power(Box::new(sub(a)?)),
                ChainOp::Concat(a) => ChainOp::Concat(Box::new(sub(a)?)),
                ChainOp::Fallback(a) => ChainOp::Fallback(Box::new(sub(a)?)),
                ChainOp::Then(a) => ChainOp::Then(Box::new(sub(a)?)),
                other => other.clone(),
            };
            operand.chain(op)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AttributeType;
    use crate::values::Datum;

    #[test]
    fn test_replaces_reference() {
        let e = Expression::reference_typed("added", AttributeType::Number)
            .add(Expression::number(1.0))
            .unwrap();
        let out = e
            .substitute_reference("added", &Expression::number(5.0))
            .unwrap();
        assert_eq!(out.compute_constant().unwrap(), Datum::Number(6.0));
    }

    #[test]
    fn test_depth_tracks_nested_scopes() {
        // The filter predicate sits one scope in; a level-0 substitution of
        // "x" must not touch the row-scoped $x inside it.
        let data = Expression::reference("data");
        let e = data
            .filter(
                Expression::reference_at("x", 0, AttributeType::Null)
                    .is(Expression::number(1.0))
                    .unwrap(),
            )
            .unwrap();
        let out = e
            .substitute(&|node, depth| {
                Ok(match node.as_ref_expr() {
                    Some(r) if r.name == "x" && depth == 0 => {
                        Some(Expression::number(9.0))
                    }
                    _ => None,
                })
            })
            .unwrap();
        assert_eq!(out, e);
    }

    #[test]
    fn test_no_descent_into_replacement() {
        // Replacement contains the pattern it matches; a re-entrant walk
        // would loop forever.
        let e = Expression::reference_typed("a", AttributeType::Number);
        let out = e
            .substitute(&|node, _| {
                Ok(match node.as_ref_expr() {
                    Some(r) if r.name == "a" => Some(
                        Expression::reference_typed("a", AttributeType::Number)
                            .add(Expression::number(1.0))?,
                    ),
                    _ => None,
                })
            })
            .unwrap();
        assert_eq!(
            out,
            Expression::reference_typed("a", AttributeType::Number)
                .add(Expression::number(1.0))
                .unwrap()
        );
    }
}
