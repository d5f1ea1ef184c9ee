//! Aggregator and post-aggregation emission.
//!
//! Works over a [`Segregation`]: each physical aggregate becomes one
//! aggregator descriptor (wrapped in a filtered aggregator when the
//! segment chain carries a filter) and each residual expression becomes an
//! arithmetic post-aggregation over the aggregator names.
//!
//! Sketch columns steer emission: a distinct count over a `hyperUnique`
//! column folds the sketch, anything else falls back to the cardinality
//! estimator. Quantiles always need a histogram or sketch aggregator plus
//! a finalizing post-aggregation.

use serde_json::{json, Value as Json};

use crate::backends::druid::expression::version_at_least;
use crate::backends::druid::filter;
use crate::error::{Error, Result};
use crate::expressions::{ChainOp, Expression};
use crate::remote::segregate::Segregation;
use crate::remote::RemoteDataset;
use crate::values::Datum;

/// The quantiles sketch module shipped with this release; older brokers
/// only answer quantiles over pre-built histogram columns.
const QUANTILES_SKETCH_SINCE: &str = "0.11.0";

pub fn emit(
    seg: &Segregation,
    remote: &RemoteDataset,
    version: &str,
) -> Result<(Vec<Json>, Vec<Json>)> {
    let mut aggregations = Vec::new();
    let mut post_aggregations = Vec::new();
    for agg in &seg.aggregates {
        let (op_filter, op) = unwrap_segment_chain(&agg.expression)?;
        let descriptor = emit_aggregator(&agg.name, op, remote, version, &mut post_aggregations)?;
        aggregations.push(match op_filter {
            Some(pred) => match filter::emit(&pred, version)? {
                Some(f) => json!({
                    "type": "filtered",
                    "filter": f,
                    "aggregator": descriptor,
                }),
                None => descriptor,
            },
            None => descriptor,
        });
    }
    for post in &seg.post_aggregates {
        let mut descriptor = emit_post(&post.expression)?;
        descriptor["name"] = json!(post.name);
        post_aggregations.push(descriptor);
    }
    Ok((aggregations, post_aggregations))
}

/// Peel the filters off a segment-rooted aggregate chain, conjoining them.
fn unwrap_segment_chain(e: &Expression) -> Result<(Option<Expression>, &ChainOp)> {
    let c = e
        .as_chain()
        .ok_or_else(|| Error::construction("expected an aggregate chain"))?;
    let mut pred: Option<Expression> = None;
    let mut operand = &c.operand;
    while let Some(inner) = operand.as_chain() {
        match &inner.op {
            ChainOp::Filter(p) => {
                pred = Some(match pred {
                    Some(acc) => (**p).clone().and(acc)?,
                    None => (**p).clone(),
                });
                operand = &inner.operand;
            }
            _ => break,
        }
    }
    Ok((pred, &c.op))
}

fn emit_aggregator(
    name: &str,
    op: &ChainOp,
    remote: &RemoteDataset,
    version: &str,
    post_aggregations: &mut Vec<Json>,
) -> Result<Json> {
    Ok(match op {
        ChainOp::Count => json!({ "type": "count", "name": name }),
        ChainOp::Sum(arg) => numeric(name, arg, remote, "Sum")?,
        ChainOp::Min(arg) => numeric(name, arg, remote, "Min")?,
        ChainOp::Max(arg) => numeric(name, arg, remote, "Max")?,
        ChainOp::CountDistinct(arg) => {
            let column = column_of(arg)?;
            if native_of(remote, &column) == Some("hyperUnique") {
                json!({
                    "type": "hyperUnique",
                    "name": name,
                    "fieldName": column,
                })
            } else if remote.capabilities.exact_results_only {
                return Err(Error::unsupported(
                    "an exact distinct count over an unsketched column",
                    "druid",
                ));
            } else {
                json!({
                    "type": "cardinality",
                    "name": name,
                    "fields": [column],
                    "byRow": true,
                })
            }
        }
        ChainOp::Quantile { expression, value } => {
            if remote.capabilities.exact_results_only {
                return Err(Error::unsupported("an exact quantile", "druid"));
            }
            let column = column_of(expression)?;
            let inner = format!("__q_{}", name);
            if native_of(remote, &column) == Some("approximateHistogram") {
                post_aggregations.push(json!({
                    "type": "quantile",
                    "name": name,
                    "fieldName": inner,
                    "probability": value,
                }));
                json!({
                    "type": "approxHistogramFold",
                    "name": inner,
                    "fieldName": column,
                })
            } else {
                if !version_at_least(version, QUANTILES_SKETCH_SINCE) {
                    return Err(Error::unsupported(
                        "a quantile over an unsketched column",
                        "druid",
                    ));
                }
                post_aggregations.push(json!({
                    "type": "quantilesDoublesSketchToQuantile",
                    "name": name,
                    "field": { "type": "fieldAccess", "fieldName": inner },
                    "fraction": value,
                }));
                json!({
                    "type": "quantilesDoublesSketch",
                    "name": inner,
                    "fieldName": column,
                })
            }
        }
        ChainOp::CustomAggregate { name: custom } => {
            let mut descriptor = remote
                .custom_aggregations
                .get(custom)
                .cloned()
                .ok_or_else(|| {
                    Error::unsupported(
                        format!("the undeclared custom aggregation '{}'", custom),
                        "druid",
                    )
                })?;
            descriptor["name"] = json!(name);
            descriptor
        }
        other => {
            return Err(Error::unsupported(
                format!("the aggregate '{}'", other.name()),
                "druid",
            ))
        }
    })
}

fn numeric(
    name: &str,
    arg: &Expression,
    remote: &RemoteDataset,
    kind: &str,
) -> Result<Json> {
    let column = column_of(arg)?;
    let prefix = match native_of(remote, &column) {
        Some(native) if native.starts_with("long") => "long",
        _ => "double",
    };
    Ok(json!({
        "type": format!("{}{}", prefix, kind),
        "name": name,
        "fieldName": column,
    }))
}

fn column_of(arg: &Expression) -> Result<String> {
    arg.as_ref_expr()
        .map(|r| r.name.clone())
        .ok_or_else(|| Error::unsupported("an aggregate over a computed expression", "druid"))
}

fn native_of<'a>(remote: &'a RemoteDataset, column: &str) -> Option<&'a str> {
    remote
        .attributes
        .iter()
        .find(|a| a.name == column)
        .and_then(|a| a.native_type.as_deref())
}

fn emit_post(e: &Expression) -> Result<Json> {
    match e {
        Expression::Ref(r) => Ok(json!({
            "type": "fieldAccess",
            "fieldName": r.name,
        })),
        Expression::Literal(l) => match &l.value {
            Datum::Number(n) => Ok(json!({ "type": "constant", "value": n })),
            other => Err(Error::unsupported(
                format!("a {} constant in a post-aggregation", other.attribute_type()),
                "druid",
            )),
        },
        Expression::Chain(c) => {
            let func = match &c.op {
                ChainOp::Add(_) => "+",
                ChainOp::Subtract(_) => "-",
                ChainOp::Multiply(_) => "*",
                ChainOp::Divide(_) => "/",
                other => {
                    return Err(Error::unsupported(
                        format!("'{}' in a post-aggregation", other.name()),
                        "druid",
                    ))
                }
            };
            let arg = c
                .op
                .argument()
                .ok_or_else(|| Error::construction("binary op without argument"))?;
            Ok(json!({
                "type": "arithmetic",
                "fn": func,
                "fields": [emit_post(&c.operand)?, emit_post(arg)?],
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::segregate::segregate;
    use crate::remote::NamedExpr;
    use crate::types::{AttributeInfo, AttributeType};

    const V: &str = "0.20.0";

    fn wiki() -> RemoteDataset {
        RemoteDataset::new("druid", "wikipedia").with_attributes(vec![
            AttributeInfo::new("added", AttributeType::Number).with_native_type("longSum"),
            AttributeInfo::new("channel", AttributeType::String),
            AttributeInfo::new("unique_users", AttributeType::String)
                .with_native_type("hyperUnique"),
        ])
    }

    fn added() -> Expression {
        Expression::reference_typed("added", AttributeType::Number)
    }

    #[test]
    fn test_sum_uses_native_width() {
        let r = wiki();
        let applies = vec![NamedExpr::new(
            "Added",
            r.segment_reference().sum(added()).unwrap(),
        )];
        let (aggs, posts) = emit(&segregate(&applies, &r.attributes), &r, V).unwrap();
        assert_eq!(aggs[0]["type"], "longSum");
        assert_eq!(aggs[0]["fieldName"], "added");
        assert!(posts.is_empty());
    }

    #[test]
    fn test_filtered_aggregate_wraps() {
        let r = wiki();
        let filtered = r
            .segment_reference()
            .filter(
                Expression::reference_typed("channel", AttributeType::String)
                    .is(Expression::string("en"))
                    .unwrap(),
            )
            .unwrap()
            .sum(added())
            .unwrap();
        let applies = vec![NamedExpr::new("EnAdded", filtered)];
        let (aggs, _) = emit(&segregate(&applies, &r.attributes), &r, V).unwrap();
        assert_eq!(aggs[0]["type"], "filtered");
        assert_eq!(aggs[0]["filter"]["type"], "selector");
        assert_eq!(aggs[0]["aggregator"]["type"], "longSum");
        assert_eq!(aggs[0]["aggregator"]["name"], "EnAdded");
    }

    #[test]
    fn test_distinct_count_folds_sketch_column() {
        let r = wiki();
        let applies = vec![NamedExpr::new(
            "Users",
            r.segment_reference()
                .count_distinct(Expression::reference_typed(
                    "unique_users",
                    AttributeType::String,
                ))
                .unwrap(),
        )];
        let (aggs, _) = emit(&segregate(&applies, &r.attributes), &r, V).unwrap();
        assert_eq!(aggs[0]["type"], "hyperUnique");
    }

    #[test]
    fn test_distinct_count_over_plain_column_uses_cardinality() {
        let r = wiki();
        let applies = vec![NamedExpr::new(
            "Channels",
            r.segment_reference()
                .count_distinct(Expression::reference_typed(
                    "channel",
                    AttributeType::String,
                ))
                .unwrap(),
        )];
        let (aggs, _) = emit(&segregate(&applies, &r.attributes), &r, V).unwrap();
        assert_eq!(aggs[0]["type"], "cardinality");
    }

    #[test]
    fn test_compound_apply_emits_arithmetic_post_aggregation() {
        let r = wiki();
        let ratio = r
            .segment_reference()
            .sum(added())
            .unwrap()
            .divide(r.segment_reference().count().unwrap())
            .unwrap();
        let applies = vec![NamedExpr::new("PerRow", ratio)];
        let (aggs, posts) = emit(&segregate(&applies, &r.attributes), &r, V).unwrap();
        assert_eq!(aggs.len(), 2);
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0]["type"], "arithmetic");
        assert_eq!(posts[0]["name"], "PerRow");
        assert_eq!(posts[0]["fn"], "/");
    }

    #[test]
    fn test_quantile_emits_sketch_and_finalizer() {
        let r = wiki();
        let applies = vec![NamedExpr::new(
            "P95",
            r.segment_reference()
                .quantile(added(), 0.95)
                .unwrap(),
        )];
        let (aggs, posts) = emit(&segregate(&applies, &r.attributes), &r, V).unwrap();
        assert_eq!(aggs[0]["type"], "quantilesDoublesSketch");
        assert_eq!(posts[0]["type"], "quantilesDoublesSketchToQuantile");
        assert_eq!(posts[0]["name"], "P95");
    }

    #[test]
    fn test_quantile_sketch_needs_minimum_version() {
        let r = wiki();
        let applies = vec![NamedExpr::new(
            "P95",
            r.segment_reference()
                .quantile(added(), 0.95)
                .unwrap(),
        )];
        assert!(matches!(
            emit(&segregate(&applies, &r.attributes), &r, "0.10.1").unwrap_err(),
            Error::Unsupported { .. }
        ));
    }

    #[test]
    fn test_custom_aggregation_lookup() {
        let r = wiki().with_custom_aggregation(
            "net",
            json!({ "type": "doubleSum", "fieldName": "delta" }),
        );
        let applies = vec![NamedExpr::new(
            "Net",
            r.segment_reference()
                .chain(ChainOp::CustomAggregate { name: "net".into() })
                .unwrap(),
        )];
        let (aggs, _) = emit(&segregate(&applies, &r.attributes), &r, V).unwrap();
        assert_eq!(aggs[0]["type"], "doubleSum");
        assert_eq!(aggs[0]["name"], "Net");

        let missing = vec![NamedExpr::new(
            "Nope",
            r.segment_reference()
                .chain(ChainOp::CustomAggregate { name: "other".into() })
                .unwrap(),
        )];
        assert!(matches!(
            emit(&segregate(&missing, &r.attributes), &r, V).unwrap_err(),
            Error::Unsupported { .. }
        ));
    }
}
