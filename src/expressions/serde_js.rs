//! Expression wire form.
//!
//! Expressions serialize to tagged JSON records, `{"op": "...", ...}`, and
//! deserialize back through the validating constructors, so a malformed
//! document fails with a construction error rather than producing an
//! ill-typed tree. `from_js(to_js(e)) == e` holds for every node kind.

use std::collections::BTreeMap;

use serde_json::{json, Map, Value as Json};

use crate::error::{Error, Result};
use crate::expressions::{
    CaseMode, ChainExpr, ChainOp, Direction, Expression, SplitKey, TimePartKind,
};
use crate::types::{AttributeType, DatasetType};
use crate::values::{Datum, Duration};

impl Expression {
    pub fn to_js(&self) -> Json {
        match self {
            Expression::Ref(r) => {
                let mut obj = Map::new();
                obj.insert("op".into(), json!("ref"));
                obj.insert("name".into(), json!(r.name));
                if r.nest > 0 {
                    obj.insert("nest".into(), json!(r.nest));
                }
                if r.ty != AttributeType::Null {
                    obj.insert("type".into(), type_to_js(&r.ty));
                }
                Json::Object(obj)
            }
            Expression::Literal(l) => json!({
                "op": "literal",
                "value": l.value.to_js(),
                "type": l.value.attribute_type().tag(),
            }),
            Expression::Chain(c) => chain_to_js(c),
        }
    }

    pub fn from_js(value: &Json) -> Result<Expression> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::construction("expression must be a JSON object"))?;
        let op = obj
            .get("op")
            .and_then(|o| o.as_str())
            .ok_or_else(|| Error::construction("expression is missing its op tag"))?;
        match op {
            "ref" => {
                let name = req_str(obj, "name")?;
                let nest = obj.get("nest").and_then(|n| n.as_u64()).unwrap_or(0) as usize;
                let ty = match obj.get("type") {
                    Some(t) => type_from_js(t)?,
                    None => AttributeType::Null,
                };
                Ok(Expression::reference_at(&name, nest, ty))
            }
            "literal" => {
                let ty = match obj.get("type").and_then(|t| t.as_str()) {
                    Some(tag) => AttributeType::from_tag(tag)?,
                    None => {
                        return Err(Error::construction("literal is missing its type tag"))
                    }
                };
                let value = obj.get("value").unwrap_or(&Json::Null);
                Ok(Expression::literal(Datum::from_js(value, &ty)?))
            }
            other => chain_from_js(other, obj),
        }
    }
}

fn chain_to_js(c: &ChainExpr) -> Json {
    let mut obj = Map::new();
    obj.insert("op".into(), json!(c.op.name()));
    obj.insert("operand".into(), c.operand.to_js());
    match &c.op {
        ChainOp::Apply { name, expression } => {
            obj.insert("name".into(), json!(name));
            obj.insert("expression".into(), expression.to_js());
        }
        ChainOp::Split { keys, data_name } => {
            let mut splits = Map::new();
            for k in keys {
                splits.insert(k.name.clone(), k.expression.to_js());
            }
            obj.insert("splits".into(), Json::Object(splits));
            obj.insert("dataName".into(), json!(data_name));
        }
        ChainOp::Sort {
            expression,
            direction,
        } => {
            obj.insert("expression".into(), expression.to_js());
            obj.insert(
                "direction".into(),
                json!(match direction {
                    Direction::Ascending => "ascending",
                    Direction::Descending => "descending",
                }),
            );
        }
        ChainOp::Limit(n) => {
            obj.insert("value".into(), json!(n));
        }
        ChainOp::Select(attributes) => {
            obj.insert("attributes".into(), json!(attributes));
        }
        ChainOp::Quantile { expression, value } => {
            obj.insert("expression".into(), expression.to_js());
            obj.insert("value".into(), json!(value));
        }
        ChainOp::CustomAggregate { name } => {
            obj.insert("custom".into(), json!(name));
        }
        ChainOp::Match { regex } | ChainOp::Extract { regex } => {
            obj.insert("regex".into(), json!(regex));
        }
        ChainOp::Substring { position, len } => {
            obj.insert("position".into(), json!(position));
            obj.insert("len".into(), json!(len));
        }
        ChainOp::ChangeCase { mode } => {
            obj.insert(
                "transformType".into(),
                json!(match mode {
                    CaseMode::Upper => "upperCase",
                    CaseMode::Lower => "lowerCase",
                }),
            );
        }
        ChainOp::Lookup { table } => {
            obj.insert("lookup".into(), json!(table));
        }
        ChainOp::NumberBucket { size, offset } => {
            obj.insert("size".into(), json!(size));
            if *offset != 0.0 {
                obj.insert("offset".into(), json!(offset));
            }
        }
        ChainOp::TimeBucket { duration } | ChainOp::TimeFloor { duration } => {
            obj.insert("duration".into(), json!(duration.to_string()));
        }
        ChainOp::TimeShift { duration, step } => {
            obj.insert("duration".into(), json!(duration.to_string()));
            obj.insert("step".into(), json!(step));
        }
        ChainOp::TimePart { part } => {
            obj.insert("part".into(), json!(time_part_tag(*part)));
        }
        ChainOp::Cast(ty) => {
            obj.insert("outputType".into(), json!(ty.tag()));
        }
        other => {
            if let Some(arg) = other.argument() {
                obj.insert("expression".into(), arg.to_js());
            }
        }
    }
    Json::Object(obj)
}

fn chain_from_js(op: &str, obj: &Map<String, Json>) -> Result<Expression> {
    let operand = Expression::from_js(
        obj.get("operand")
            .ok_or_else(|| Error::construction(format!("{} is missing its operand", op)))?,
    )?;
    let arg = |key: &str| -> Result<Expression> {
        Expression::from_js(obj.get(key).ok_or_else(|| {
            Error::construction(format!("{} is missing its {}", op, key))
        })?)
    };
    let boxed = |key: &str| -> Result<Box<Expression>> { Ok(Box::new(arg(key)?)) };

    let chain_op = match op {
        "filter" => ChainOp::Filter(boxed("expression")?),
        "apply" => ChainOp::Apply {
            name: req_str(obj, "name")?,
            expression: boxed("expression")?,
        },
        "split" => {
            let splits = obj
                .get("splits")
                .and_then(|s| s.as_object())
                .ok_or_else(|| Error::construction("split is missing its splits map"))?;
            let mut keys = Vec::new();
            for (name, e) in splits {
                keys.push(SplitKey {
                    name: name.clone(),
                    expression: Box::new(Expression::from_js(e)?),
                });
            }
            keys.sort_by(|a, b| a.name.cmp(&b.name));
            ChainOp::Split {
                keys,
                data_name: req_str(obj, "dataName")?,
            }
        }
        "sort" => ChainOp::Sort {
            expression: boxed("expression")?,
            direction: match obj.get("direction").and_then(|d| d.as_str()) {
                Some("descending") => Direction::Descending,
                Some("ascending") | None => Direction::Ascending,
                Some(other) => {
                    return Err(Error::construction(format!(
                        "unknown sort direction '{}'",
                        other
                    )))
                }
            },
        },
        "limit" => {
            let v = obj
                .get("value")
                .and_then(|v| v.as_i64())
                .ok_or_else(|| Error::construction("limit is missing its value"))?;
            return operand.limit(v);
        }
        "select" => ChainOp::Select(
            obj.get("attributes")
                .and_then(|a| a.as_array())
                .ok_or_else(|| Error::construction("select is missing its attributes"))?
                .iter()
                .map(|a| {
                    a.as_str()
                        .map(|s| s.to_string())
                        .ok_or_else(|| Error::construction("select attribute must be a string"))
                })
                .collect::<Result<Vec<_>>>()?,
        ),
        "join" => ChainOp::Join(boxed("expression")?),
        "count" => ChainOp::Count,
        "sum" => ChainOp::Sum(boxed("expression")?),
        "min" => ChainOp::Min(boxed("expression")?),
        "max" => ChainOp::Max(boxed("expression")?),
        "average" => ChainOp::Average(boxed("expression")?),
        "countDistinct" => ChainOp::CountDistinct(boxed("expression")?),
        "quantile" => {
            let value = obj
                .get("value")
                .and_then(|v| v.as_f64())
                .ok_or_else(|| Error::construction("quantile is missing its value"))?;
            return operand.quantile(arg("expression")?, value);
        }
        "customAggregate" => ChainOp::CustomAggregate {
            name: req_str(obj, "custom")?,
        },
        "and" => ChainOp::And(boxed("expression")?),
        "or" => ChainOp::Or(boxed("expression")?),
        "not" => ChainOp::Not,
        "is" => ChainOp::Is(boxed("expression")?),
        "in" => ChainOp::In(boxed("expression")?),
        "overlap" => ChainOp::Overlap(boxed("expression")?),
        "contains" => ChainOp::Contains(boxed("expression")?),
        "match" => return operand.match_(&req_str(obj, "regex")?),
        "add" => ChainOp::Add(boxed("expression")?),
        "subtract" => ChainOp::Subtract(boxed("expression")?),
        "multiply" => ChainOp::Multiply(boxed("expression")?),
        "divide" => ChainOp::Divide(boxed("expression")?),
        "power" => ChainOp::Power(boxed("expression")?),
        "absolute" => ChainOp::Absolute,
        "concat" => ChainOp::Concat(boxed("expression")?),
        "substring" => ChainOp::Substring {
            position: req_u64(obj, "position")? as usize,
            len: req_u64(obj, "len")? as usize,
        },
        "extract" => return operand.extract(&req_str(obj, "regex")?),
        "changeCase" => ChainOp::ChangeCase {
            mode: match req_str(obj, "transformType")?.as_str() {
                "upperCase" => CaseMode::Upper,
                "lowerCase" => CaseMode::Lower,
                other => {
                    return Err(Error::construction(format!(
                        "unknown case transform '{}'",
                        other
                    )))
                }
            },
        },
        "length" => ChainOp::Length,
        "lookup" => ChainOp::Lookup {
            table: req_str(obj, "lookup")?,
        },
        "fallback" => ChainOp::Fallback(boxed("expression")?),
        "then" => ChainOp::Then(boxed("expression")?),
        "numberBucket" => ChainOp::NumberBucket {
            size: obj
                .get("size")
                .and_then(|v| v.as_f64())
                .ok_or_else(|| Error::construction("numberBucket is missing its size"))?,
            offset: obj.get("offset").and_then(|v| v.as_f64()).unwrap_or(0.0),
        },
        "timeBucket" => ChainOp::TimeBucket {
            duration: Duration::parse(&req_str(obj, "duration")?)?,
        },
        "timeFloor" => ChainOp::TimeFloor {
            duration: Duration::parse(&req_str(obj, "duration")?)?,
        },
        "timeShift" => ChainOp::TimeShift {
            duration: Duration::parse(&req_str(obj, "duration")?)?,
            step: obj.get("step").and_then(|v| v.as_i64()).unwrap_or(1) as i32,
        },
        "timePart" => ChainOp::TimePart {
            part: time_part_from_tag(&req_str(obj, "part")?)?,
        },
        "cast" => ChainOp::Cast(AttributeType::from_tag(&req_str(obj, "outputType")?)?),
        other => {
            return Err(Error::construction(format!(
                "unknown expression op '{}'",
                other
            )))
        }
    };
    operand.chain(chain_op)
}

/// Scalar and set types serialize as their bare tag; dataset types carry
/// their attribute scope so a deserialized reference resolves the same
/// names the original did.
fn type_to_js(ty: &AttributeType) -> Json {
    match ty {
        AttributeType::Dataset(dt) if !dt.attributes.is_empty() => {
            let mut attrs = Map::new();
            for (name, t) in &dt.attributes {
                attrs.insert(name.clone(), type_to_js(t));
            }
            json!({ "type": "DATASET", "attributes": attrs })
        }
        other => json!(other.tag()),
    }
}

fn type_from_js(value: &Json) -> Result<AttributeType> {
    match value {
        Json::String(tag) => AttributeType::from_tag(tag),
        Json::Object(obj) => {
            match obj.get("type").and_then(|t| t.as_str()) {
                Some("DATASET") => {}
                _ => return Err(Error::construction("structured type must be a dataset")),
            }
            let mut attributes = BTreeMap::new();
            if let Some(attrs) = obj.get("attributes").and_then(|a| a.as_object()) {
                for (name, t) in attrs {
                    attributes.insert(name.clone(), type_from_js(t)?);
                }
            }
            Ok(AttributeType::Dataset(DatasetType::new(attributes)))
        }
        _ => Err(Error::construction("type must be a tag or a dataset object")),
    }
}

fn req_str(obj: &Map<String, Json>, key: &str) -> Result<String> {
    obj.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| Error::construction(format!("missing required field '{}'", key)))
}

fn req_u64(obj: &Map<String, Json>, key: &str) -> Result<u64> {
    obj.get(key)
        .and_then(|v| v.as_u64())
        .ok_or_else(|| Error::construction(format!("missing required field '{}'", key)))
}

fn time_part_tag(part: TimePartKind) -> &'static str {
    match part {
        TimePartKind::Year => "YEAR",
        TimePartKind::Month => "MONTH_OF_YEAR",
        TimePartKind::DayOfMonth => "DAY_OF_MONTH",
        TimePartKind::DayOfWeek => "DAY_OF_WEEK",
        TimePartKind::HourOfDay => "HOUR_OF_DAY",
        TimePartKind::MinuteOfHour => "MINUTE_OF_HOUR",
        TimePartKind::SecondOfMinute => "SECOND_OF_MINUTE",
    }
}

fn time_part_from_tag(tag: &str) -> Result<TimePartKind> {
    Ok(match tag {
        "YEAR" => TimePartKind::Year,
        "MONTH_OF_YEAR" => TimePartKind::Month,
        "DAY_OF_MONTH" => TimePartKind::DayOfMonth,
        "DAY_OF_WEEK" => TimePartKind::DayOfWeek,
        "HOUR_OF_DAY" => TimePartKind::HourOfDay,
        "MINUTE_OF_HOUR" => TimePartKind::MinuteOfHour,
        "SECOND_OF_MINUTE" => TimePartKind::SecondOfMinute,
        other => {
            return Err(Error::construction(format!(
                "unknown time part '{}'",
                other
            )))
        }
    })
}
