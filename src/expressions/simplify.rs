//! Bottom-up simplification.
//!
//! Children are simplified first, then a fixed set of rewrite rules runs at
//! each chain node. The pass is idempotent: every rule either shrinks the
//! tree or moves it toward a normal form (filters migrate toward the data
//! source, conjunctions fold, constants evaluate).
//!
//! Simplification is also where query compilation happens. When an
//! operation lands on a remote placeholder the placeholder is offered the
//! operation; if the target plan can absorb it the node collapses back into
//! a (richer) placeholder literal, and if not the node stays, marking the
//! boundary between remote and local evaluation.

use std::sync::Arc;

use crate::error::Result;
use crate::expressions::{ChainOp, Expression, SplitKey};
use crate::types::AttributeType;
use crate::values::Datum;

impl Expression {
    pub fn simplify(&self) -> Result<Expression> {
        match self {
            Expression::Ref(_) | Expression::Literal(_) => Ok(self.clone()),
            Expression::Chain(c) => {
                let operand = c.operand.simplify()?;
                let op = simplify_op_args(&c.op)?;
                simplify_chain(operand, op)
            }
        }
    }
}

fn simplify_op_args(op: &ChainOp) -> Result<ChainOp> {
    let s = |a: &Expression| a.simplify().map(Box::new);
    Ok(match op {
        ChainOp::Filter(a) => ChainOp::Filter(s(a)?),
        ChainOp::Apply { name, expression } => ChainOp::Apply {
            name: name.clone(),
            expression: s(expression)?,
        },
        ChainOp::Split { keys, data_name } => ChainOp::Split {
            keys: keys
                .iter()
                .map(|k| {
                    Ok(SplitKey {
                        name: k.name.clone(),
                        expression: s(&k.expression)?,
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            data_name: data_name.clone(),
        },
        ChainOp::Sort {
            expression,
            direction,
        } => ChainOp::Sort {
            expression: s(expression)?,
            direction: *direction,
        },
        ChainOp::Quantile { expression, value } => ChainOp::Quantile {
            expression: s(expression)?,
            value: *value,
        },
        ChainOp::Sum(a) => ChainOp::Sum(s(a)?),
        ChainOp::Min(a) => ChainOp::Min(s(a)?),
        ChainOp::Max(a) => ChainOp::Max(s(a)?),
        ChainOp::Average(a) => ChainOp::Average(s(a)?),
        ChainOp::CountDistinct(a) => ChainOp::CountDistinct(s(a)?),
        ChainOp::Join(a) => ChainOp::Join(s(a)?),
        ChainOp::And(a) => ChainOp::And(s(a)?),
        ChainOp::Or(a) => ChainOp::Or(s(a)?),
        ChainOp::Is(a) => ChainOp::Is(s(a)?),
        ChainOp::In(a) => ChainOp::In(s(a)?),
        ChainOp::Overlap(a) => ChainOp::Overlap(s(a)?),
        ChainOp::Contains(a) => ChainOp::Contains(s(a)?),
        ChainOp::Add(a) => ChainOp::Add(s(a)?),
        ChainOp::Subtract(a) => ChainOp::Subtract(s(a)?),
        ChainOp::Multiply(a) => ChainOp::Multiply(s(a)?),
        ChainOp::Divide(a) => ChainOp::Divide(s(a)?),
        ChainOp::Power(a) => ChainOp::Power(s(a)?),
        ChainOp::Concat(a) => ChainOp::Concat(s(a)?),
        ChainOp::Fallback(a) => ChainOp::Fallback(s(a)?),
        ChainOp::Then(a) => ChainOp::Then(s(a)?),
        other => other.clone(),
    })
}

fn simplify_chain(operand: Expression, op: ChainOp) -> Result<Expression> {
    // Offer the operation to a remote placeholder first; absorption is the
    // whole point of the normal forms below.
    if let Some(remote) = operand.as_remote() {
        if let Some(next) = remote.add_operation(&op) {
            return Ok(Expression::literal(Datum::Remote(Arc::new(next))));
        }
    }

    match &op {
        // An apply of pending scalars against a one-row scope becomes a
        // single totals plan.
        ChainOp::Apply { name, expression } => {
            if let Some(Datum::Dataset(ds)) = operand.as_literal() {
                if ds.len() == 1 {
                    if let Some(total) =
                        crate::remote::RemoteDataset::total_from_apply(name, expression)
                    {
                        return Ok(Expression::literal(Datum::Remote(Arc::new(total))));
                    }
                }
            }
        }
        ChainOp::Filter(pred) => {
            if pred.is_literal_true() {
                return Ok(operand);
            }
            if let Expression::Chain(c) = &operand {
                match &c.op {
                    // x.filter(a).filter(b) => x.filter(a and b)
                    ChainOp::Filter(prev) => {
                        let combined =
                            (**prev).clone().and((**pred).clone())?.simplify()?;
                        return simplify_chain(
                            (*c.operand).clone(),
                            ChainOp::Filter(Box::new(combined)),
                        );
                    }
                    // A filter that does not read the applied column slides
                    // under the apply, toward the source.
                    ChainOp::Apply { name, .. }
                        if !pred.free_references().iter().any(|n| n == name) =>
                    {
                        let pushed = simplify_chain(
                            (*c.operand).clone(),
                            ChainOp::Filter(pred.clone()),
                        )?;
                        return simplify_chain(pushed, c.op.clone());
                    }
                    // Filtering commutes with sorting.
                    ChainOp::Sort { .. } => {
                        let pushed = simplify_chain(
                            (*c.operand).clone(),
                            ChainOp::Filter(pred.clone()),
                        )?;
                        return simplify_chain(pushed, c.op.clone());
                    }
                    _ => {}
                }
            }
        }
        ChainOp::Limit(n) => {
            if let Expression::Chain(c) = &operand {
                if let ChainOp::Limit(m) = &c.op {
                    return simplify_chain(
                        (*c.operand).clone(),
                        ChainOp::Limit((*n).min(*m)),
                    );
                }
            }
        }
        ChainOp::Select(names) => {
            if let Expression::Chain(c) = &operand {
                match &c.op {
                    // Only the narrower selection survives.
                    ChainOp::Select(prev) => {
                        let kept: Vec<String> = names
                            .iter()
                            .filter(|n| prev.contains(n))
                            .cloned()
                            .collect();
                        return simplify_chain(
                            (*c.operand).clone(),
                            ChainOp::Select(kept),
                        );
                    }
                    // An applied column the selection drops was never needed.
                    ChainOp::Apply { name, .. } if !names.contains(name) => {
                        return simplify_chain(
                            (*c.operand).clone(),
                            ChainOp::Select(names.clone()),
                        );
                    }
                    _ => {}
                }
            }
        }
        ChainOp::And(arg) => {
            if operand.is_literal_false() || arg.is_literal_false() {
                return Ok(Expression::boolean(false));
            }
            if operand.is_literal_true() {
                return Ok((**arg).clone());
            }
            if arg.is_literal_true() {
                return Ok(operand);
            }
        }
        ChainOp::Or(arg) => {
            if operand.is_literal_true() || arg.is_literal_true() {
                return Ok(Expression::boolean(true));
            }
            if operand.is_literal_false() {
                return Ok((**arg).clone());
            }
            if arg.is_literal_false() {
                return Ok(operand);
            }
        }
        ChainOp::Not => {
            if let Expression::Chain(c) = &operand {
                if c.op == ChainOp::Not {
                    return Ok((*c.operand).clone());
                }
            }
        }
        ChainOp::Fallback(arg) => {
            match operand.as_literal() {
                Some(Datum::Null) => return Ok((**arg).clone()),
                Some(_) => return Ok(operand),
                None => {}
            }
            if matches!(arg.as_literal(), Some(Datum::Null)) {
                return Ok(operand);
            }
        }
        ChainOp::Then(arg) => {
            if operand.is_literal_true() {
                return Ok((**arg).clone());
            }
            if operand.is_literal_false() {
                return Ok(Expression::literal(Datum::Null));
            }
        }
        ChainOp::Cast(ty) => {
            let ot = operand.output_type();
            if ot == *ty && ot != AttributeType::Null {
                return Ok(operand);
            }
        }
        ChainOp::Add(arg) | ChainOp::Subtract(arg) => {
            if matches!(arg.as_literal(), Some(Datum::Number(n)) if *n == 0.0) {
                return Ok(operand);
            }
        }
        ChainOp::Multiply(arg) | ChainOp::Divide(arg) | ChainOp::Power(arg) => {
            if matches!(arg.as_literal(), Some(Datum::Number(n)) if *n == 1.0) {
                return Ok(operand);
            }
        }
        ChainOp::Concat(arg) => {
            if matches!(arg.as_literal(), Some(Datum::String(s)) if s.is_empty()) {
                return Ok(operand);
            }
        }
        ChainOp::TimeShift { step: 0, .. } => {
            return Ok(operand);
        }
        _ => {}
    }

    let e = operand.chain(op)?;
    if !has_external(&e, 0) {
        return Ok(Expression::literal(e.compute_constant()?));
    }
    Ok(e)
}

/// Anything that keeps a tree from evaluating to a constant: a reference
/// escaping the tree, a remote placeholder, or an op with no local
/// evaluation.
fn has_external(e: &Expression, depth: usize) -> bool {
    match e {
        Expression::Ref(r) => r.nest >= depth,
        Expression::Literal(l) => matches!(l.value, Datum::Remote(_)),
        Expression::Chain(c) => {
            if matches!(
                c.op,
                ChainOp::Lookup { .. } | ChainOp::CustomAggregate { .. }
            ) {
                return true;
            }
            if has_external(&c.operand, depth) {
                return true;
            }
            let inner = if c.op.argument_is_nested() {
                depth + 1
            } else {
                depth
            };
            if let ChainOp::Split { keys, .. } = &c.op {
                if keys.iter().any(|k| has_external(&k.expression, inner)) {
                    return true;
                }
            }
            c.op.argument()
                .map(|a| has_external(a, inner))
                .unwrap_or(false)
        }
    }
}
