//! Dimension extraction functions.
//!
//! A scalar transform chain over a single column (`$page.substring(0,3)
//! .lower()`) maps onto the native extraction-fn cascade, letting filters
//! and dimensions stay in the column-native fast path instead of falling
//! back to expression evaluation. Composition always flattens: composing
//! onto an existing cascade extends its list rather than nesting.

use serde_json::{json, Value as Json};

use crate::expressions::{CaseMode, ChainOp, Expression, TimePartKind};
use crate::values::Duration;

/// Resolve an expression to `(column, extraction fn)` if it is a
/// transform chain over one reference.
pub fn extraction_of(e: &Expression) -> Option<(String, Option<Json>)> {
    match e {
        Expression::Ref(r) => Some((r.name.clone(), None)),
        Expression::Chain(c) => {
            let (dim, inner) = extraction_of(&c.operand)?;
            let f = extraction_fn(&c.op)?;
            Some((dim, Some(compose(inner, f))))
        }
        Expression::Literal(_) => None,
    }
}

fn extraction_fn(op: &ChainOp) -> Option<Json> {
    Some(match op {
        ChainOp::Substring { position, len } => json!({
            "type": "substring",
            "index": position,
            "length": len,
        }),
        ChainOp::Extract { regex } => json!({
            "type": "regex",
            "expr": regex,
            "replaceMissingValue": true,
        }),
        ChainOp::ChangeCase { mode } => match mode {
            CaseMode::Upper => json!({ "type": "upper" }),
            CaseMode::Lower => json!({ "type": "lower" }),
        },
        ChainOp::Lookup { table } => json!({
            "type": "registeredLookup",
            "lookup": table,
            "retainMissingValue": true,
        }),
        ChainOp::TimePart { part } => time_format(time_part_format(*part), None),
        ChainOp::TimeBucket { duration } | ChainOp::TimeFloor { duration } => {
            time_format("yyyy-MM-dd'T'HH:mm:ss'Z'", Some(*duration))
        }
        _ => return None,
    })
}

fn time_part_format(part: TimePartKind) -> &'static str {
    match part {
        TimePartKind::Year => "yyyy",
        TimePartKind::Month => "M",
        TimePartKind::DayOfMonth => "d",
        TimePartKind::DayOfWeek => "e",
        TimePartKind::HourOfDay => "H",
        TimePartKind::MinuteOfHour => "m",
        TimePartKind::SecondOfMinute => "s",
    }
}

fn time_format(format: &str, granularity: Option<Duration>) -> Json {
    let mut f = json!({
        "type": "timeFormat",
        "format": format,
        "timeZone": "Etc/UTC",
        "locale": "en-US",
    });
    if let Some(d) = granularity {
        f["granularity"] = json!({
            "type": "period",
            "period": d.to_string(),
            "timeZone": "Etc/UTC",
        });
    }
    f
}

/// Compose two extraction fns into one flattened cascade.
pub fn compose(first: Option<Json>, second: Json) -> Json {
    let first = match first {
        Some(f) => f,
        None => return second,
    };
    let mut fns = cascade_list(first);
    fns.extend(cascade_list(second));
    json!({ "type": "cascade", "extractionFns": fns })
}

fn cascade_list(f: Json) -> Vec<Json> {
    if f["type"] == "cascade" {
        match f["extractionFns"].clone() {
            Json::Array(fns) => fns,
            _ => vec![f],
        }
    } else {
        vec![f]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AttributeType;

    #[test]
    fn test_single_transform() {
        let e = Expression::reference_typed("page", AttributeType::String)
            .substring(0, 3)
            .unwrap();
        let (dim, f) = extraction_of(&e).unwrap();
        assert_eq!(dim, "page");
        assert_eq!(f.unwrap()["type"], "substring");
    }

    #[test]
    fn test_composition_flattens() {
        let e = Expression::reference_typed("page", AttributeType::String)
            .substring(0, 3)
            .unwrap()
            .change_case(CaseMode::Lower)
            .unwrap()
            .extract("^(a.*)$")
            .unwrap();
        let (_, f) = extraction_of(&e).unwrap();
        let f = f.unwrap();
        assert_eq!(f["type"], "cascade");
        let fns = f["extractionFns"].as_array().unwrap();
        assert_eq!(fns.len(), 3);
        assert!(fns.iter().all(|x| x["type"] != "cascade"));
    }

    #[test]
    fn test_arithmetic_is_not_an_extraction() {
        let e = Expression::reference_typed("added", AttributeType::Number)
            .add(Expression::number(1.0))
            .unwrap();
        assert!(extraction_of(&e).is_none());
    }
}
