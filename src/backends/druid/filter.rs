//! Native filter emission.
//!
//! Predicates translate to dimension-native filters (selector, in, bound,
//! interval, regex, search) whenever the left side resolves to a column
//! plus extraction cascade. Anything else falls back to an expression
//! filter, which needs a new enough engine.

use serde_json::{json, Value as Json};

use crate::backends::druid::expression;
use crate::backends::druid::extraction::extraction_of;
use crate::error::{Error, Result};
use crate::expressions::{ChainOp, Expression};
use crate::values::Datum;

/// Emit a boolean expression as a native filter. `None` means "no filter"
/// (the predicate is literally true).
pub fn emit(e: &Expression, version: &str) -> Result<Option<Json>> {
    if e.is_literal_true() {
        return Ok(None);
    }
    Ok(Some(emit_inner(e, version)?))
}

fn emit_inner(e: &Expression, version: &str) -> Result<Json> {
    let c = match e.as_chain() {
        Some(c) => c,
        None => return fallback(e, version),
    };
    match &c.op {
        ChainOp::And(arg) => Ok(json!({
            "type": "and",
            "fields": flatten(&c.operand, arg, version, true)?,
        })),
        ChainOp::Or(arg) => Ok(json!({
            "type": "or",
            "fields": flatten(&c.operand, arg, version, false)?,
        })),
        ChainOp::Not => Ok(json!({
            "type": "not",
            "field": emit_inner(&c.operand, version)?,
        })),
        ChainOp::Is(arg) => {
            let (dim, ef) = match extraction_of(&c.operand) {
                Some(d) => d,
                None => return fallback(e, version),
            };
            let value = match arg.as_literal() {
                Some(v) => v,
                None => return fallback(e, version),
            };
            Ok(with_extraction(
                json!({
                    "type": "selector",
                    "dimension": dim,
                    "value": value.to_js(),
                }),
                ef,
            ))
        }
        ChainOp::In(arg) | ChainOp::Overlap(arg) => {
            let (dim, ef) = match extraction_of(&c.operand) {
                Some(d) => d,
                None => return fallback(e, version),
            };
            match arg.as_literal() {
                Some(Datum::Set(set)) => Ok(with_extraction(
                    json!({
                        "type": "in",
                        "dimension": dim,
                        "values": set.elements.iter().map(|v| v.to_js()).collect::<Vec<_>>(),
                    }),
                    ef,
                )),
                Some(Datum::NumberRange(r)) => {
                    let mut f = json!({
                        "type": "bound",
                        "dimension": dim,
                        "ordering": "numeric",
                    });
                    if let Some(s) = r.start {
                        f["lower"] = json!(s.to_string());
                        f["lowerStrict"] = json!(!r.bounds.start_closed);
                    }
                    if let Some(end) = r.end {
                        f["upper"] = json!(end.to_string());
                        f["upperStrict"] = json!(!r.bounds.end_closed);
                    }
                    Ok(with_extraction(f, ef))
                }
                // A pinned window on a time column is the interval filter.
                Some(Datum::TimeRange(r)) if ef.is_none() => Ok(json!({
                    "type": "interval",
                    "dimension": dim,
                    "intervals": [r.to_interval()],
                })),
                _ => fallback(e, version),
            }
        }
        ChainOp::Match { regex } => {
            let (dim, ef) = match extraction_of(&c.operand) {
                Some(d) => d,
                None => return fallback(e, version),
            };
            Ok(with_extraction(
                json!({
                    "type": "regex",
                    "dimension": dim,
                    "pattern": regex,
                }),
                ef,
            ))
        }
        ChainOp::Contains(arg) => {
            let (dim, ef) = match extraction_of(&c.operand) {
                Some(d) => d,
                None => return fallback(e, version),
            };
            match arg.as_literal() {
                Some(Datum::String(s)) => Ok(with_extraction(
                    json!({
                        "type": "search",
                        "dimension": dim,
                        "query": {
                            "type": "contains",
                            "value": s,
                            "caseSensitive": true,
                        },
                    }),
                    ef,
                )),
                _ => fallback(e, version),
            }
        }
        _ => fallback(e, version),
    }
}

fn flatten(
    operand: &Expression,
    arg: &Expression,
    version: &str,
    conjunction: bool,
) -> Result<Vec<Json>> {
    let mut fields = Vec::new();
    for side in [operand, arg] {
        let emitted = emit_inner(side, version)?;
        let same_kind = emitted["type"] == if conjunction { "and" } else { "or" };
        if same_kind {
            if let Json::Array(inner) = emitted["fields"].clone() {
                fields.extend(inner);
                continue;
            }
        }
        fields.push(emitted);
    }
    Ok(fields)
}

fn with_extraction(mut filter: Json, ef: Option<Json>) -> Json {
    if let Some(f) = ef {
        filter["extractionFn"] = f;
    }
    filter
}

fn fallback(e: &Expression, version: &str) -> Result<Json> {
    let expr = expression::emit(e, version).map_err(|err| match err {
        Error::Unsupported { construct, backend } => Error::Unsupported {
            construct: format!("filter on {}", construct),
            backend,
        },
        other => other,
    })?;
    Ok(json!({ "type": "expression", "expression": expr }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AttributeType;
    use crate::values::{NumberRange, Set};

    const V: &str = "0.20.0";

    fn channel() -> Expression {
        Expression::reference_typed("channel", AttributeType::String)
    }

    #[test]
    fn test_literal_true_is_no_filter() {
        assert_eq!(emit(&Expression::boolean(true), V).unwrap(), None);
    }

    #[test]
    fn test_selector() {
        let f = emit(&channel().is(Expression::string("en")).unwrap(), V)
            .unwrap()
            .unwrap();
        assert_eq!(f["type"], "selector");
        assert_eq!(f["dimension"], "channel");
        assert_eq!(f["value"], "en");
    }

    #[test]
    fn test_in_set() {
        let f = emit(
            &channel()
                .in_(Expression::literal(Datum::Set(Set::of_strings(&["en", "de"]))))
                .unwrap(),
            V,
        )
        .unwrap()
        .unwrap();
        assert_eq!(f["type"], "in");
        assert_eq!(f["values"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_bound_from_number_range() {
        let f = emit(
            &Expression::reference_typed("added", AttributeType::Number)
                .in_(Expression::literal(Datum::NumberRange(NumberRange::new(
                    10.0, 20.0,
                ))))
                .unwrap(),
            V,
        )
        .unwrap()
        .unwrap();
        assert_eq!(f["type"], "bound");
        assert_eq!(f["lowerStrict"], false);
        assert_eq!(f["upperStrict"], true);
    }

    #[test]
    fn test_conjunctions_flatten() {
        let a = channel().is(Expression::string("en")).unwrap();
        let b = Expression::reference_typed("page", AttributeType::String)
            .is(Expression::string("Main"))
            .unwrap();
        let c = Expression::reference_typed("user", AttributeType::String)
            .is(Expression::string("bot"))
            .unwrap()
            .not()
            .unwrap();
        let f = emit(&a.and(b).unwrap().and(c).unwrap(), V).unwrap().unwrap();
        assert_eq!(f["type"], "and");
        assert_eq!(f["fields"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_selector_through_extraction() {
        let f = emit(
            &channel().substring(0, 2).unwrap().is(Expression::string("en")).unwrap(),
            V,
        )
        .unwrap()
        .unwrap();
        assert_eq!(f["type"], "selector");
        assert_eq!(f["extractionFn"]["type"], "substring");
    }

    #[test]
    fn test_arithmetic_predicate_falls_back_to_expression() {
        let f = emit(
            &Expression::reference_typed("added", AttributeType::Number)
                .add(Expression::reference_typed("deleted", AttributeType::Number))
                .unwrap()
                .in_(Expression::literal(Datum::NumberRange(NumberRange::new(
                    0.0, 10.0,
                ))))
                .unwrap(),
            V,
        )
        .unwrap()
        .unwrap();
        assert_eq!(f["type"], "expression");
    }

    #[test]
    fn test_expression_fallback_gated_by_version() {
        let e = Expression::reference_typed("added", AttributeType::Number)
            .add(Expression::number(1.0))
            .unwrap()
            .in_(Expression::literal(Datum::NumberRange(NumberRange::new(
                0.0, 10.0,
            ))))
            .unwrap();
        assert!(matches!(
            emit(&e, "0.9.2").unwrap_err(),
            Error::Unsupported { .. }
        ));
    }
}
