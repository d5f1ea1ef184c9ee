//! Aggregate segregation.
//!
//! Backends take a flat list of named aggregators plus arithmetic over
//! their outputs. An apply like `$seg.sum($added) / $seg.count()` has to be
//! pulled apart at emission time: each segment-rooted aggregate becomes a
//! physical aggregator (synthetic `__tN` names for the inner ones, deduped
//! by structure) and the residual expression becomes a post-aggregation
//! over those names.
//!
//! Rollup substitution also happens here: when an attribute records how it
//! was pre-aggregated, the logical aggregate is rewritten onto the stored
//! column (`count()` over a rolled-up source is `sum()` of its count
//! column).

use crate::expressions::{ChainOp, Expression};
use crate::remote::{replace_argument, NamedExpr, SEGMENT_NAME};
use crate::types::{AttributeInfo, AttributeType, Maker};

#[derive(Debug, Clone, PartialEq)]
pub struct Segregation {
    /// Physical aggregators, one per distinct aggregate expression.
    pub aggregates: Vec<NamedExpr>,
    /// Arithmetic over aggregator outputs, for applies that are not a
    /// single bare aggregate.
    pub post_aggregates: Vec<NamedExpr>,
}

impl Segregation {
    pub fn is_empty(&self) -> bool {
        self.aggregates.is_empty() && self.post_aggregates.is_empty()
    }
}

/// Pull the applies apart into aggregators and post-aggregations.
pub fn segregate(applies: &[NamedExpr], attributes: &[AttributeInfo]) -> Segregation {
    let mut out = Segregation {
        aggregates: Vec::new(),
        post_aggregates: Vec::new(),
    };
    let mut synthetic = 0usize;
    for apply in applies {
        let expr = normalize(&apply.expression, attributes);
        if is_bare_aggregate(&expr) {
            out.aggregates.push(NamedExpr::new(&apply.name, expr));
            continue;
        }
        let residual = extract(&expr, &mut out.aggregates, &mut synthetic);
        out.post_aggregates.push(NamedExpr::new(&apply.name, residual));
    }
    out
}

/// Rollup substitution plus average expansion, so the emitters only ever
/// see aggregates a backend natively has.
fn normalize(e: &Expression, attributes: &[AttributeInfo]) -> Expression {
    match e {
        Expression::Ref(_) | Expression::Literal(_) => e.clone(),
        Expression::Chain(c) => {
            let operand = normalize(&c.operand, attributes);
            // avg(x) = sum(x) / count()
            if let ChainOp::Average(arg) = &c.op {
                let sum = match operand.clone().sum((**arg).clone()) {
                    Ok(s) => normalize(&s, attributes),
                    Err(_) => return e.clone(),
                };
                let count = match operand.count() {
                    Ok(ct) => normalize(&ct, attributes),
                    Err(_) => return e.clone(),
                };
                return match sum.divide(count) {
                    Ok(d) => d,
                    Err(_) => e.clone(),
                };
            }
            let substituted = rollup_substitute(&c.op, &operand, attributes);
            if let Some(rewritten) = substituted {
                return rewritten;
            }
            let op = match c.op.argument() {
                Some(arg) => replace_argument(&c.op, normalize(arg, attributes)),
                None => c.op.clone(),
            };
            match operand.chain(op) {
                Ok(out) => out,
                Err(_) => e.clone(),
            }
        }
    }
}

/// Map a logical aggregate onto the rolled-up columns, when the source
/// records the derivation.
fn rollup_substitute(
    op: &ChainOp,
    operand: &Expression,
    attributes: &[AttributeInfo],
) -> Option<Expression> {
    if !op.is_aggregate() {
        return None;
    }
    let rewritten = match op {
        ChainOp::Count => {
            let count_col = attributes
                .iter()
                .find(|a| matches!(a.maker, Some(Maker::Count)))?;
            ChainOp::Sum(Box::new(Expression::reference_typed(
                &count_col.name,
                AttributeType::Number,
            )))
        }
        ChainOp::Sum(arg) => {
            let name = &arg.as_ref_expr()?.name;
            let col = attributes.iter().find(|a| {
                matches!(&a.maker, Some(Maker::Sum { column }) if column == name)
            })?;
            if &col.name == name {
                return None; // already the physical column
            }
            ChainOp::Sum(Box::new(Expression::reference_typed(
                &col.name,
                AttributeType::Number,
            )))
        }
        ChainOp::Min(arg) => {
            let name = &arg.as_ref_expr()?.name;
            let col = attributes.iter().find(|a| {
                matches!(&a.maker, Some(Maker::Min { column }) if column == name)
            })?;
            ChainOp::Min(Box::new(Expression::reference_typed(
                &col.name,
                AttributeType::Number,
            )))
        }
        ChainOp::Max(arg) => {
            let name = &arg.as_ref_expr()?.name;
            let col = attributes.iter().find(|a| {
                matches!(&a.maker, Some(Maker::Max { column }) if column == name)
            })?;
            ChainOp::Max(Box::new(Expression::reference_typed(
                &col.name,
                AttributeType::Number,
            )))
        }
        _ => return None,
    };
    operand.clone().chain(rewritten).ok()
}

fn is_bare_aggregate(e: &Expression) -> bool {
    match e.as_chain() {
        Some(c) => c.op.is_aggregate() && is_segment_chain(&c.operand),
        None => false,
    }
}

fn is_segment_chain(e: &Expression) -> bool {
    match e {
        Expression::Ref(r) => r.name == SEGMENT_NAME,
        Expression::Chain(c) => {
            matches!(c.op, ChainOp::Filter(_)) && is_segment_chain(&c.operand)
        }
        Expression::Literal(_) => false,
    }
}

/// Replace every aggregate subtree with a reference to a (possibly
/// synthetic) aggregator, reusing names for structurally equal aggregates.
fn extract(
    e: &Expression,
    aggregates: &mut Vec<NamedExpr>,
    synthetic: &mut usize,
) -> Expression {
    if is_bare_aggregate(e) {
        if let Some(existing) = aggregates.iter().find(|a| &a.expression == e) {
            return Expression::reference_typed(&existing.name, AttributeType::Number);
        }
        let name = format!("__t{}", *synthetic);
        *synthetic += 1;
        aggregates.push(NamedExpr::new(&name, e.clone()));
        return Expression::reference_typed(&name, AttributeType::Number);
    }
    match e {
        Expression::Ref(_) | Expression::Literal(_) => e.clone(),
        Expression::Chain(c) => {
            let operand = extract(&c.operand, aggregates, synthetic);
            let op = match c.op.argument() {
                Some(arg) => replace_argument(&c.op, extract(arg, aggregates, synthetic)),
                None => c.op.clone(),
            };
            match operand.chain(op) {
                Ok(out) => out,
                Err(_) => e.clone(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::RemoteDataset;
    use crate::types::AttributeInfo;

    fn seg() -> Expression {
        RemoteDataset::new("druid", "wikipedia")
            .with_attributes(vec![
                AttributeInfo::new("added", AttributeType::Number),
                AttributeInfo::new("channel", AttributeType::String),
            ])
            .segment_reference()
    }

    fn added() -> Expression {
        Expression::reference_typed("added", AttributeType::Number)
    }

    #[test]
    fn test_bare_aggregate_keeps_its_name() {
        let applies = vec![NamedExpr::new("Count", seg().count().unwrap())];
        let s = segregate(&applies, &[]);
        assert_eq!(s.aggregates.len(), 1);
        assert_eq!(s.aggregates[0].name, "Count");
        assert!(s.post_aggregates.is_empty());
    }

    #[test]
    fn test_compound_apply_extracts_synthetic_aggregates() {
        let ratio = seg()
            .sum(added())
            .unwrap()
            .divide(seg().count().unwrap())
            .unwrap();
        let applies = vec![NamedExpr::new("AddedPerRow", ratio)];
        let s = segregate(&applies, &[]);
        assert_eq!(s.aggregates.len(), 2);
        assert_eq!(s.aggregates[0].name, "__t0");
        assert_eq!(s.aggregates[1].name, "__t1");
        assert_eq!(s.post_aggregates.len(), 1);
        let residual = &s.post_aggregates[0].expression;
        assert_eq!(
            residual.free_references(),
            vec!["__t0".to_string(), "__t1".to_string()]
        );
    }

    #[test]
    fn test_equal_aggregates_dedup() {
        let spread = seg()
            .sum(added())
            .unwrap()
            .subtract(seg().sum(added()).unwrap())
            .unwrap();
        let applies = vec![NamedExpr::new("Zero", spread)];
        let s = segregate(&applies, &[]);
        assert_eq!(s.aggregates.len(), 1);
    }

    #[test]
    fn test_average_expands_to_sum_over_count() {
        let applies = vec![NamedExpr::new(
            "AvgAdded",
            seg().average(added()).unwrap(),
        )];
        let s = segregate(&applies, &[]);
        assert_eq!(s.aggregates.len(), 2);
        assert_eq!(s.post_aggregates.len(), 1);
        assert!(matches!(
            s.post_aggregates[0].expression.as_chain().unwrap().op,
            ChainOp::Divide(_)
        ));
    }

    #[test]
    fn test_rollup_count_becomes_sum_of_count_column() {
        let attrs = vec![
            AttributeInfo::new("count", AttributeType::Number).with_maker(Maker::Count),
            AttributeInfo::new("added", AttributeType::Number),
        ];
        let applies = vec![NamedExpr::new("Rows", seg().count().unwrap())];
        let s = segregate(&applies, &attrs);
        let agg = s.aggregates[0].expression.as_chain().unwrap();
        match &agg.op {
            ChainOp::Sum(arg) => {
                assert_eq!(arg.as_ref_expr().unwrap().name, "count");
            }
            other => panic!("expected a sum over the count column, got {:?}", other),
        }
    }

    #[test]
    fn test_filtered_aggregate_keeps_its_filter() {
        let filtered = seg()
            .filter(
                Expression::reference_typed("channel", AttributeType::String)
                    .is(Expression::string("en"))
                    .unwrap(),
            )
            .unwrap()
            .sum(added())
            .unwrap();
        let applies = vec![NamedExpr::new("EnAdded", filtered.clone())];
        let s = segregate(&applies, &[]);
        assert_eq!(s.aggregates[0].expression, filtered);
    }
}
