//! Immutable value model.
//!
//! [`Datum`] is the runtime value of every expression: scalars, ranges,
//! sets, materialized datasets, and the remote-dataset placeholder the
//! plan compiler folds operations into.

pub mod dataset;
pub mod duration;
pub mod range;
pub mod set;

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value as Json};

use crate::error::{Error, Result};
use crate::remote::RemoteDataset;
use crate::types::{AttributeType, DatasetType};

pub use dataset::{compare_scalars, zero_row, Dataset, Row};
pub use duration::Duration;
pub use range::{Bounds, NumberRange, TimeRange};
pub use set::Set;

#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Time(DateTime<Utc>),
    NumberRange(NumberRange),
    TimeRange(TimeRange),
    Set(Set),
    Dataset(Arc<Dataset>),
    Remote(Arc<RemoteDataset>),
}

impl Datum {
    pub fn attribute_type(&self) -> AttributeType {
        match self {
            Datum::Null => AttributeType::Null,
            Datum::Bool(_) => AttributeType::Boolean,
            Datum::Number(_) => AttributeType::Number,
            Datum::String(_) => AttributeType::String,
            Datum::Time(_) => AttributeType::Time,
            Datum::NumberRange(_) => AttributeType::NumberRange,
            Datum::TimeRange(_) => AttributeType::TimeRange,
            Datum::Set(s) => AttributeType::Set(Box::new(s.set_type.clone())),
            Datum::Dataset(_) => AttributeType::Dataset(DatasetType::default()),
            // A value-mode placeholder is a pending scalar; all other modes
            // stand in for a dataset.
            Datum::Remote(r) => r.output_type(),
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Datum::Null => false,
            Datum::Bool(b) => *b,
            Datum::Number(n) => *n != 0.0,
            Datum::String(s) => !s.is_empty(),
            _ => true,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Datum::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Datum::String(s) => Some(s),
            _ => None,
        }
    }

    /// Canonical JSON form: scalars map to JSON scalars, time to ISO-8601
    /// strings, ranges and sets to tagged objects.
    pub fn to_js(&self) -> Json {
        match self {
            Datum::Null => Json::Null,
            Datum::Bool(b) => json!(b),
            Datum::Number(n) => json!(n),
            Datum::String(s) => json!(s),
            Datum::Time(t) => json!(t.to_rfc3339_opts(SecondsFormat::Millis, true)),
            Datum::NumberRange(r) => json!({
                "start": r.start,
                "end": r.end,
                "bounds": r.bounds.to_string(),
            }),
            Datum::TimeRange(r) => json!({
                "start": r.start.map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true)),
                "end": r.end.map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true)),
                "bounds": r.bounds.to_string(),
            }),
            Datum::Set(s) => json!({
                "setType": s.set_type.tag(),
                "elements": s.elements.iter().map(|e| e.to_js()).collect::<Vec<_>>(),
            }),
            Datum::Dataset(d) => d.to_js(),
            // Remote placeholders have no wire form; they exist only inside
            // a compilation pass.
            Datum::Remote(_) => Json::Null,
        }
    }

    /// Deserialize against a declared type (the serialized expression
    /// carries the tag alongside the value).
    pub fn from_js(value: &Json, ty: &AttributeType) -> Result<Datum> {
        if value.is_null() {
            return Ok(Datum::Null);
        }
        Ok(match ty {
            AttributeType::Null => Datum::Null,
            AttributeType::Boolean => Datum::Bool(
                value
                    .as_bool()
                    .ok_or_else(|| Error::construction("expected a boolean literal"))?,
            ),
            AttributeType::Number => Datum::Number(
                value
                    .as_f64()
                    .ok_or_else(|| Error::construction("expected a number literal"))?,
            ),
            AttributeType::String => Datum::String(
                value
                    .as_str()
                    .ok_or_else(|| Error::construction("expected a string literal"))?
                    .to_string(),
            ),
            AttributeType::Time => Datum::Time(parse_time(value)?),
            AttributeType::NumberRange => {
                let obj = range_object(value)?;
                Datum::NumberRange(NumberRange {
                    start: obj.0.as_ref().map(|v| v.as_f64()).flatten(),
                    end: obj.1.as_ref().map(|v| v.as_f64()).flatten(),
                    bounds: obj.2,
                })
            }
            AttributeType::TimeRange => {
                let obj = range_object(value)?;
                Datum::TimeRange(TimeRange {
                    start: obj.0.as_ref().map(parse_time).transpose()?,
                    end: obj.1.as_ref().map(parse_time).transpose()?,
                    bounds: obj.2,
                })
            }
            AttributeType::Set(inner) => {
                let obj = value
                    .as_object()
                    .ok_or_else(|| Error::construction("expected a set literal object"))?;
                let elements = obj
                    .get("elements")
                    .and_then(|e| e.as_array())
                    .ok_or_else(|| Error::construction("set literal missing elements"))?
                    .iter()
                    .map(|e| Datum::from_js(e, inner))
                    .collect::<Result<Vec<_>>>()?;
                Datum::Set(Set::new((**inner).clone(), elements)?)
            }
            AttributeType::Dataset(_) => Datum::Dataset(Arc::new(Dataset::from_js(value)?)),
        })
    }

    /// Best-effort deserialization when no type tag is available (rows
    /// coming back from a backend).
    pub fn from_js_untyped(value: &Json) -> Result<Datum> {
        Ok(match value {
            Json::Null => Datum::Null,
            Json::Bool(b) => Datum::Bool(*b),
            Json::Number(n) => Datum::Number(
                n.as_f64()
                    .ok_or_else(|| Error::construction("non-finite number"))?,
            ),
            Json::String(s) => Datum::String(s.clone()),
            Json::Array(_) => Datum::Dataset(Arc::new(Dataset::from_js(value)?)),
            Json::Object(_) => {
                return Err(Error::construction(
                    "can not infer a value type for an object literal",
                ))
            }
        })
    }
}

fn parse_time(value: &Json) -> Result<DateTime<Utc>> {
    let s = value
        .as_str()
        .ok_or_else(|| Error::construction("expected an ISO-8601 time string"))?;
    s.parse::<DateTime<Utc>>()
        .map_err(|e| Error::construction(format!("invalid time '{}': {}", s, e)))
}

type RangeParts = (Option<Json>, Option<Json>, Bounds);

fn range_object(value: &Json) -> Result<RangeParts> {
    let obj = value
        .as_object()
        .ok_or_else(|| Error::construction("expected a range literal object"))?;
    let bounds = match obj.get("bounds").and_then(|b| b.as_str()) {
        Some(s) => Bounds::try_from(s.to_string())?,
        None => Bounds::default(),
    };
    let grab = |key: &str| -> Option<Json> {
        obj.get(key).filter(|v| !v.is_null()).cloned()
    };
    Ok((grab("start"), grab("end"), bounds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_js_round_trip() {
        let cases = vec![
            (Datum::Bool(true), AttributeType::Boolean),
            (Datum::Number(42.5), AttributeType::Number),
            (Datum::String("wiki".into()), AttributeType::String),
            (
                Datum::Time("2015-03-14T00:00:00Z".parse().unwrap()),
                AttributeType::Time,
            ),
            (
                Datum::NumberRange(NumberRange::new(1.0, 5.0)),
                AttributeType::NumberRange,
            ),
            (
                Datum::TimeRange(TimeRange::new(
                    "2015-03-12T00:00:00Z".parse().unwrap(),
                    "2015-03-19T00:00:00Z".parse().unwrap(),
                )),
                AttributeType::TimeRange,
            ),
            (
                Datum::Set(Set::of_strings(&["en", "de"])),
                AttributeType::Set(Box::new(AttributeType::String)),
            ),
        ];
        for (datum, ty) in cases {
            let js = datum.to_js();
            assert_eq!(Datum::from_js(&js, &ty).unwrap(), datum);
        }
    }

    #[test]
    fn test_truthiness() {
        assert!(!Datum::Null.is_truthy());
        assert!(!Datum::Number(0.0).is_truthy());
        assert!(Datum::Number(4.0).is_truthy());
        assert!(!Datum::String(String::new()).is_truthy());
    }
}
