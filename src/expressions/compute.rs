//! Direct evaluation over materialized values.
//!
//! This is the slice of the reference engine the core itself needs: the
//! simplifier folds constant sub-trees and evaluates pending aggregates
//! against literal datasets, and the plan runner re-applies sorts and
//! limits to joined results. Evaluation never sees a remote placeholder;
//! those are absorbed by the plan compiler first.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::expressions::{CaseMode, ChainOp, Direction, Expression, TimePartKind};
use crate::types::AttributeType;
use crate::values::{compare_scalars, Dataset, Datum, Row};

use chrono::{Datelike, Timelike};

/// A stack of row scopes; nested dataset evaluation pushes a scope.
#[derive(Debug, Clone, Copy)]
pub struct RowScope<'a> {
    pub row: &'a Row,
    pub parent: Option<&'a RowScope<'a>>,
}

impl<'a> RowScope<'a> {
    pub fn root(row: &'a Row) -> RowScope<'a> {
        RowScope { row, parent: None }
    }

    pub fn nested(&'a self, row: &'a Row) -> RowScope<'a> {
        RowScope {
            row,
            parent: Some(self),
        }
    }

    fn lookup(&self, name: &str, nest: usize) -> Result<Datum> {
        let mut scope = self;
        for _ in 0..nest {
            scope = scope.parent.ok_or_else(|| {
                Error::construction(format!(
                    "reference '{}' escapes the row scope chain",
                    name
                ))
            })?;
        }
        Ok(scope.row.get(name).cloned().unwrap_or(Datum::Null))
    }
}

impl Expression {
    /// Evaluate a constant expression (no references).
    pub fn compute_constant(&self) -> Result<Datum> {
        let empty = Row::new();
        self.compute(&RowScope::root(&empty))
    }

    pub fn compute(&self, scope: &RowScope) -> Result<Datum> {
        match self {
            Expression::Literal(l) => Ok(l.value.clone()),
            Expression::Ref(r) => scope.lookup(&r.name, r.nest),
            Expression::Chain(c) => {
                let operand = c.operand.compute(scope)?;
                apply_op(&c.op, operand, scope)
            }
        }
    }
}

fn apply_op(op: &ChainOp, operand: Datum, scope: &RowScope) -> Result<Datum> {
    if matches!(operand, Datum::Remote(_)) {
        return Err(Error::construction(format!(
            "can not compute {} over an uncompiled remote dataset",
            op.name()
        )));
    }
    match op {
        // ---- dataset shaping ----
        ChainOp::Filter(pred) => {
            let ds = want_dataset(&operand, op)?;
            let rows = ds.filter(&|row| {
                let inner = scope.nested(row);
                Ok(pred.compute(&inner)?.is_truthy())
            })?;
            Ok(Datum::Dataset(Arc::new(rows)))
        }
        ChainOp::Apply { name, expression } => {
            let ds = want_dataset(&operand, op)?;
            let mut rows = Vec::with_capacity(ds.len());
            for row in &ds.rows {
                let inner = scope.nested(row);
                let mut out = row.clone();
                out.insert(name.clone(), expression.compute(&inner)?);
                rows.push(out);
            }
            Ok(Datum::Dataset(Arc::new(Dataset::new(rows))))
        }
        ChainOp::Split { keys, data_name } => {
            let ds = want_dataset(&operand, op)?;
            let mut groups: Vec<(Vec<Datum>, Vec<Row>)> = Vec::new();
            for row in &ds.rows {
                let inner = scope.nested(row);
                let key: Vec<Datum> = keys
                    .iter()
                    .map(|k| k.expression.compute(&inner))
                    .collect::<Result<_>>()?;
                match groups.iter_mut().find(|(k, _)| *k == key) {
                    Some((_, rows)) => rows.push(row.clone()),
                    None => groups.push((key, vec![row.clone()])),
                }
            }
            let rows = groups
                .into_iter()
                .map(|(key, rows)| {
                    let mut out: Row = BTreeMap::new();
                    for (k, v) in keys.iter().zip(key) {
                        out.insert(k.name.clone(), v);
                    }
                    out.insert(
                        data_name.clone(),
                        Datum::Dataset(Arc::new(Dataset::new(rows))),
                    );
                    out
                })
                .collect();
            Ok(Datum::Dataset(Arc::new(Dataset::new(rows))))
        }
        ChainOp::Sort {
            expression,
            direction,
        } => {
            let ds = want_dataset(&operand, op)?;
            let mut keyed: Vec<(Datum, Row)> = Vec::with_capacity(ds.len());
            for row in &ds.rows {
                let inner = scope.nested(row);
                keyed.push((expression.compute(&inner)?, row.clone()));
            }
            keyed.sort_by(|a, b| {
                let ord = compare_scalars(&a.0, &b.0);
                match direction {
                    Direction::Ascending => ord,
                    Direction::Descending => ord.reverse(),
                }
            });
            Ok(Datum::Dataset(Arc::new(Dataset::new(
                keyed.into_iter().map(|(_, r)| r).collect(),
            ))))
        }
        ChainOp::Limit(n) => {
            let ds = want_dataset(&operand, op)?;
            Ok(Datum::Dataset(Arc::new(ds.limit(*n))))
        }
        ChainOp::Select(names) => {
            let ds = want_dataset(&operand, op)?;
            Ok(Datum::Dataset(Arc::new(ds.select(names))))
        }
        ChainOp::Join(other) => {
            let left = want_dataset(&operand, op)?;
            let right = match other.compute(scope)? {
                Datum::Dataset(d) => d,
                _ => return Err(Error::construction("join argument must be a dataset")),
            };
            // Join on the shared scalar attributes of the first rows.
            let keys: Vec<String> = match (left.rows.first(), right.rows.first()) {
                (Some(l), Some(r)) => l
                    .keys()
                    .filter(|k| r.contains_key(*k))
                    .cloned()
                    .collect(),
                _ => Vec::new(),
            };
            Ok(Datum::Dataset(Arc::new(left.join_on(&right, &keys, true))))
        }

        // ---- aggregates ----
        ChainOp::Count => {
            let ds = want_dataset(&operand, op)?;
            Ok(Datum::Number(ds.count()))
        }
        ChainOp::Sum(e) => {
            let ds = want_dataset(&operand, op)?;
            Ok(Datum::Number(ds.sum(&row_eval(e, scope))?))
        }
        ChainOp::Min(e) => {
            let ds = want_dataset(&operand, op)?;
            ds.min(&row_eval(e, scope))
        }
        ChainOp::Max(e) => {
            let ds = want_dataset(&operand, op)?;
            ds.max(&row_eval(e, scope))
        }
        ChainOp::Average(e) => {
            let ds = want_dataset(&operand, op)?;
            ds.average(&row_eval(e, scope))
        }
        ChainOp::CountDistinct(e) => {
            let ds = want_dataset(&operand, op)?;
            Ok(Datum::Number(ds.count_distinct(&row_eval(e, scope))?))
        }
        ChainOp::Quantile { expression, value } => {
            let ds = want_dataset(&operand, op)?;
            ds.quantile(&row_eval(expression, scope), *value)
        }
        ChainOp::CustomAggregate { name } => Err(Error::construction(format!(
            "custom aggregate '{}' can not be computed locally",
            name
        ))),

        // ---- boolean ----
        ChainOp::And(e) => Ok(Datum::Bool(
            operand.is_truthy() && e.compute(scope)?.is_truthy(),
        )),
        ChainOp::Or(e) => Ok(Datum::Bool(
            operand.is_truthy() || e.compute(scope)?.is_truthy(),
        )),
        ChainOp::Not => Ok(Datum::Bool(!operand.is_truthy())),
        ChainOp::Is(e) => Ok(Datum::Bool(operand == e.compute(scope)?)),
        ChainOp::In(e) => {
            let arg = e.compute(scope)?;
            Ok(Datum::Bool(match (&operand, &arg) {
                (_, Datum::Set(s)) => s.contains(&operand),
                (Datum::Number(n), Datum::NumberRange(r)) => r.contains(*n),
                (Datum::Time(t), Datum::TimeRange(r)) => r.contains(*t),
                (Datum::Null, _) => false,
                _ => {
                    return Err(Error::construction(
                        "in requires a set or range argument",
                    ))
                }
            }))
        }
        ChainOp::Overlap(e) => {
            let arg = e.compute(scope)?;
            Ok(Datum::Bool(match (&operand, &arg) {
                (Datum::NumberRange(a), Datum::NumberRange(b)) => a.intersects(b),
                (Datum::TimeRange(a), Datum::TimeRange(b)) => a.intersects(b),
                (Datum::Set(a), Datum::Set(b)) => {
                    a.elements.iter().any(|x| b.contains(x))
                }
                (Datum::Time(t), Datum::TimeRange(r)) => r.contains(*t),
                (Datum::Number(n), Datum::NumberRange(r)) => r.contains(*n),
                (Datum::Null, _) | (_, Datum::Null) => false,
                _ => {
                    return Err(Error::construction(
                        "overlap requires range or set values",
                    ))
                }
            }))
        }
        ChainOp::Contains(e) => {
            let arg = e.compute(scope)?;
            match (&operand, &arg) {
                (Datum::String(s), Datum::String(sub)) => Ok(Datum::Bool(s.contains(sub))),
                (Datum::Null, _) | (_, Datum::Null) => Ok(Datum::Bool(false)),
                _ => Err(Error::construction("contains requires string values")),
            }
        }
        ChainOp::Match { regex } => {
            let re = regex::Regex::new(regex)
                .map_err(|e| Error::construction(format!("invalid regex: {}", e)))?;
            match &operand {
                Datum::String(s) => Ok(Datum::Bool(re.is_match(s))),
                Datum::Null => Ok(Datum::Bool(false)),
                _ => Err(Error::construction("match requires a string operand")),
            }
        }

        // ---- arithmetic ----
        ChainOp::Add(e) => numeric(op, operand, e.compute(scope)?, |a, b| a + b),
        ChainOp::Subtract(e) => numeric(op, operand, e.compute(scope)?, |a, b| a - b),
        ChainOp::Multiply(e) => numeric(op, operand, e.compute(scope)?, |a, b| a * b),
        ChainOp::Divide(e) => {
            let b = e.compute(scope)?;
            match (operand.as_number(), b.as_number()) {
                (Some(_), Some(y)) if y == 0.0 => Ok(Datum::Null),
                (Some(x), Some(y)) => Ok(Datum::Number(x / y)),
                _ => Ok(Datum::Null),
            }
        }
        ChainOp::Power(e) => numeric(op, operand, e.compute(scope)?, |a, b| a.powf(b)),
        ChainOp::Absolute => match operand.as_number() {
            Some(n) => Ok(Datum::Number(n.abs())),
            None => Ok(Datum::Null),
        },

        // ---- string ----
        ChainOp::Concat(e) => {
            let b = e.compute(scope)?;
            match (operand.as_str(), b.as_str()) {
                (Some(x), Some(y)) => Ok(Datum::String(format!("{}{}", x, y))),
                _ => Ok(Datum::Null),
            }
        }
        ChainOp::Substring { position, len } => match operand.as_str() {
            Some(s) => Ok(Datum::String(
                s.chars().skip(*position).take(*len).collect(),
            )),
            None => Ok(Datum::Null),
        },
        ChainOp::Extract { regex } => {
            let re = regex::Regex::new(regex)
                .map_err(|e| Error::construction(format!("invalid regex: {}", e)))?;
            match operand.as_str() {
                Some(s) => Ok(re
                    .captures(s)
                    .and_then(|c| c.get(1).or_else(|| c.get(0)))
                    .map(|m| Datum::String(m.as_str().to_string()))
                    .unwrap_or(Datum::Null)),
                None => Ok(Datum::Null),
            }
        }
        ChainOp::ChangeCase { mode } => match operand.as_str() {
            Some(s) => Ok(Datum::String(match mode {
                CaseMode::Upper => s.to_uppercase(),
                CaseMode::Lower => s.to_lowercase(),
            })),
            None => Ok(Datum::Null),
        },
        ChainOp::Length => match operand.as_str() {
            Some(s) => Ok(Datum::Number(s.chars().count() as f64)),
            None => Ok(Datum::Null),
        },
        ChainOp::Lookup { table } => Err(Error::construction(format!(
            "lookup table '{}' is not available locally",
            table
        ))),
        ChainOp::Fallback(e) => {
            if matches!(operand, Datum::Null) {
                e.compute(scope)
            } else {
                Ok(operand)
            }
        }
        ChainOp::Then(e) => {
            if operand.is_truthy() {
                e.compute(scope)
            } else {
                Ok(Datum::Null)
            }
        }

        // ---- bucketing & time ----
        ChainOp::NumberBucket { size, offset } => match operand.as_number() {
            Some(n) => {
                let start = ((n - offset) / size).floor() * size + offset;
                Ok(Datum::NumberRange(crate::values::NumberRange::new(
                    start,
                    start + size,
                )))
            }
            None => Ok(Datum::Null),
        },
        ChainOp::TimeBucket { duration } => match operand {
            Datum::Time(t) => {
                let start = duration.floor(t)?;
                let end = duration.shift(start, 1);
                Ok(Datum::TimeRange(crate::values::TimeRange::new(start, end)))
            }
            _ => Ok(Datum::Null),
        },
        ChainOp::TimeFloor { duration } => match operand {
            Datum::Time(t) => Ok(Datum::Time(duration.floor(t)?)),
            _ => Ok(Datum::Null),
        },
        ChainOp::TimeShift { duration, step } => match operand {
            Datum::Time(t) => Ok(Datum::Time(duration.shift(t, *step))),
            _ => Ok(Datum::Null),
        },
        ChainOp::TimePart { part } => match operand {
            Datum::Time(t) => Ok(Datum::Number(match part {
                TimePartKind::Year => t.year() as f64,
                TimePartKind::Month => t.month() as f64,
                TimePartKind::DayOfMonth => t.day() as f64,
                TimePartKind::DayOfWeek => t.weekday().number_from_monday() as f64,
                TimePartKind::HourOfDay => t.hour() as f64,
                TimePartKind::MinuteOfHour => t.minute() as f64,
                TimePartKind::SecondOfMinute => t.second() as f64,
            })),
            _ => Ok(Datum::Null),
        },

        ChainOp::Cast(ty) => cast(operand, ty),
    }
}

fn numeric(
    op: &ChainOp,
    a: Datum,
    b: Datum,
    f: impl Fn(f64, f64) -> f64,
) -> Result<Datum> {
    match (a.as_number(), b.as_number()) {
        (Some(x), Some(y)) => Ok(Datum::Number(f(x, y))),
        _ => {
            if matches!(a, Datum::Null) || matches!(b, Datum::Null) {
                Ok(Datum::Null)
            } else {
                Err(Error::construction(format!(
                    "{} requires numeric values",
                    op.name()
                )))
            }
        }
    }
}

fn cast(operand: Datum, ty: &AttributeType) -> Result<Datum> {
    Ok(match (operand, ty) {
        (Datum::Null, _) => Datum::Null,
        (d, t) if &d.attribute_type() == t => d,
        (Datum::Number(n), AttributeType::String) => Datum::String(format_number(n)),
        (Datum::String(s), AttributeType::Number) => match s.parse::<f64>() {
            Ok(n) => Datum::Number(n),
            Err(_) => Datum::Null,
        },
        (Datum::Number(n), AttributeType::Time) => Datum::Time(
            chrono::TimeZone::timestamp_millis_opt(&chrono::Utc, n as i64)
                .single()
                .ok_or_else(|| Error::construction("number out of time range"))?,
        ),
        (Datum::Time(t), AttributeType::Number) => Datum::Number(t.timestamp_millis() as f64),
        (Datum::Bool(b), AttributeType::Number) => Datum::Number(if b { 1.0 } else { 0.0 }),
        (Datum::Number(n), AttributeType::Boolean) => Datum::Bool(n != 0.0),
        (Datum::String(s), AttributeType::Boolean) => Datum::Bool(s == "true" || s == "1"),
        (d, t) => {
            return Err(Error::construction(format!(
                "can not cast {} to {}",
                d.attribute_type().tag(),
                t.tag()
            )))
        }
    })
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

fn row_eval<'a>(
    e: &'a Expression,
    scope: &'a RowScope<'a>,
) -> impl Fn(&Row) -> Result<Datum> + 'a {
    move |row: &Row| {
        let inner = scope.nested(row);
        e.compute(&inner)
    }
}

fn want_dataset<'a>(d: &'a Datum, op: &ChainOp) -> Result<&'a Arc<Dataset>> {
    match d {
        Datum::Dataset(ds) => Ok(ds),
        _ => Err(Error::construction(format!(
            "{} requires a dataset operand",
            op.name()
        ))),
    }
}
