//! SQL emission.
//!
//! SQL backends return flat scalar rows, so alongside the statement every
//! query carries an inflation plan (one entry per output column, turning
//! scalars back into times, booleans, and bucket ranges) and the zero-row
//! fallback for aggregate queries that match nothing.

use chrono::{DateTime, Utc};
use serde_json::Value as Json;

use crate::backends::logical_type;
use crate::error::{Error, Result};
use crate::expressions::{CaseMode, ChainOp, Direction, Expression, TimePartKind};
use crate::remote::{QueryMode, RemoteDataset, SortSpec, SEGMENT_NAME, VALUE_NAME};
use crate::types::{AttributeInfo, AttributeType};
use crate::values::{Datum, Dataset, Duration, NumberRange, Row, TimeRange};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    /// Lowest-common-denominator SQL.
    Generic,
    /// The analytic engine's SQL layer: `TIME_FLOOR`, `TIME_SHIFT`,
    /// `APPROX_QUANTILE`, `LOOKUP`.
    Druid,
}

impl SqlDialect {
    fn backend_name(&self) -> &'static str {
        match self {
            SqlDialect::Generic => "sql",
            SqlDialect::Druid => "druid-sql",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
    pub sql: String,
    /// One entry per output column, in no particular order.
    pub inflation: Vec<Inflater>,
    /// Row to synthesize when an aggregate query returns nothing.
    pub zero_row: Option<Row>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Inflater {
    pub column: String,
    pub kind: InflateKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InflateKind {
    Boolean,
    Number,
    String,
    Time,
    TimeRange { duration: Duration },
    NumberRange { size: f64 },
}

impl Inflater {
    pub fn new(column: &str, kind: InflateKind) -> Inflater {
        Inflater {
            column: column.to_string(),
            kind,
        }
    }

    pub fn inflate(&self, value: &Json) -> Result<Datum> {
        if value.is_null() {
            return Ok(Datum::Null);
        }
        Ok(match &self.kind {
            InflateKind::Boolean => Datum::Bool(match value {
                Json::Bool(b) => *b,
                Json::Number(n) => n.as_f64() != Some(0.0),
                Json::String(s) => s == "true" || s == "1",
                _ => false,
            }),
            InflateKind::Number => Datum::Number(number_value(value)?),
            InflateKind::String => Datum::String(match value {
                Json::String(s) => s.clone(),
                other => other.to_string(),
            }),
            InflateKind::Time => Datum::Time(time_value(value)?),
            InflateKind::TimeRange { duration } => {
                let start = time_value(value)?;
                Datum::TimeRange(TimeRange::new(start, duration.shift(start, 1)))
            }
            InflateKind::NumberRange { size } => {
                let n = number_value(value)?;
                Datum::NumberRange(NumberRange::new(n, n + size))
            }
        })
    }
}

fn number_value(v: &Json) -> Result<f64> {
    match v {
        Json::Number(n) => n
            .as_f64()
            .ok_or_else(|| Error::Transport("non-finite number".to_string())),
        Json::String(s) => s
            .parse()
            .map_err(|_| Error::Transport(format!("bad number '{}'", s))),
        other => Err(Error::Transport(format!("bad number value {}", other))),
    }
}

fn time_value(v: &Json) -> Result<DateTime<Utc>> {
    match v {
        Json::String(s) => {
            if let Ok(t) = s.parse::<DateTime<Utc>>() {
                return Ok(t);
            }
            // drivers commonly hand back "2015-03-14 00:00:00"
            format!("{}Z", s.replace(' ', "T"))
                .parse::<DateTime<Utc>>()
                .map_err(|e| Error::Transport(format!("bad time '{}': {}", s, e)))
        }
        Json::Number(n) => {
            let ms = n
                .as_i64()
                .ok_or_else(|| Error::Transport("bad epoch value".to_string()))?;
            chrono::TimeZone::timestamp_millis_opt(&Utc, ms)
                .single()
                .ok_or_else(|| Error::Transport(format!("bad epoch millis {}", ms)))
        }
        other => Err(Error::Transport(format!("bad time value {}", other))),
    }
}

// ---- emission ----

pub fn emit(remote: &RemoteDataset, dialect: SqlDialect) -> Result<SqlQuery> {
    let table = quote_ident(&remote.source);
    let where_clause = if remote.filter.is_literal_true() {
        String::new()
    } else {
        format!(" WHERE {}", scalar_sql(&remote.filter, remote, dialect)?)
    };
    match &remote.mode {
        QueryMode::Raw {
            select,
            sort,
            limit,
        } => {
            let names: Vec<String> = match select {
                Some(names) => names.clone(),
                None => remote
                    .attributes
                    .iter()
                    .map(|a| a.name.clone())
                    .chain(remote.derived_attributes.keys().cloned())
                    .collect(),
            };
            let mut columns = Vec::new();
            let mut inflation = Vec::new();
            for name in &names {
                if let Some(derived) = remote.derived_attributes.get(name) {
                    columns.push(format!(
                        "{} AS {}",
                        scalar_sql(derived, remote, dialect)?,
                        quote_ident(name)
                    ));
                    inflation.push(Inflater::new(name, kind_of_type(&derived.output_type())));
                } else {
                    columns.push(quote_ident(name));
                    let ty = remote
                        .attributes
                        .iter()
                        .find(|a| &a.name == name)
                        .map(|a| a.ty.clone())
                        .unwrap_or(AttributeType::String);
                    inflation.push(Inflater::new(name, kind_of_type(&ty)));
                }
            }
            let mut sql = format!("SELECT {} FROM {}{}", columns.join(", "), table, where_clause);
            push_order_limit(&mut sql, sort, limit)?;
            Ok(SqlQuery {
                sql,
                inflation,
                zero_row: None,
            })
        }
        QueryMode::Value { expression } => {
            let sql = format!(
                "SELECT {} AS {} FROM {}{}",
                aggregate_sql(expression, remote, dialect)?,
                quote_ident(VALUE_NAME),
                table,
                where_clause
            );
            let zero = remote
                .zero_value()
                .map(|v| Row::from([(VALUE_NAME.to_string(), v)]));
            Ok(SqlQuery {
                sql,
                inflation: vec![Inflater::new(
                    VALUE_NAME,
                    kind_of_type(&expression.output_type()),
                )],
                zero_row: zero,
            })
        }
        QueryMode::Total { applies } => {
            let mut columns = Vec::new();
            let mut inflation = Vec::new();
            for a in applies {
                columns.push(format!(
                    "{} AS {}",
                    aggregate_sql(&a.expression, remote, dialect)?,
                    quote_ident(&a.name)
                ));
                inflation.push(Inflater::new(&a.name, kind_of_type(&a.expression.output_type())));
            }
            let sql = format!("SELECT {} FROM {}{}", columns.join(", "), table, where_clause);
            Ok(SqlQuery {
                sql,
                inflation,
                zero_row: remote.zero_total_row(),
            })
        }
        QueryMode::Split {
            keys,
            applies,
            having,
            sort,
            limit,
            ..
        } => {
            let mut columns = Vec::new();
            let mut inflation = Vec::new();
            for k in keys {
                columns.push(format!(
                    "{} AS {}",
                    scalar_sql(&k.expression, remote, dialect)?,
                    quote_ident(&k.name)
                ));
                inflation.push(Inflater::new(&k.name, key_kind(&k.expression)));
            }
            for a in applies {
                columns.push(format!(
                    "{} AS {}",
                    aggregate_sql(&a.expression, remote, dialect)?,
                    quote_ident(&a.name)
                ));
                inflation.push(Inflater::new(&a.name, kind_of_type(&a.expression.output_type())));
            }
            let group_by: Vec<String> = (1..=keys.len()).map(|i| i.to_string()).collect();
            let mut sql = format!(
                "SELECT {} FROM {}{} GROUP BY {}",
                columns.join(", "),
                table,
                where_clause,
                group_by.join(", ")
            );
            if let Some(h) = having {
                sql.push_str(&format!(" HAVING {}", scalar_sql(h, remote, dialect)?));
            }
            push_order_limit(&mut sql, sort, limit)?;
            Ok(SqlQuery {
                sql,
                inflation,
                zero_row: None,
            })
        }
    }
}

fn push_order_limit(
    sql: &mut String,
    sort: &Option<SortSpec>,
    limit: &Option<usize>,
) -> Result<()> {
    if let Some(s) = sort {
        let name = s
            .expression
            .as_ref_expr()
            .map(|r| r.name.clone())
            .ok_or_else(|| Error::construction("sort must be on a named column"))?;
        sql.push_str(&format!(
            " ORDER BY {} {}",
            quote_ident(&name),
            if s.direction == Direction::Descending {
                "DESC"
            } else {
                "ASC"
            }
        ));
    }
    if let Some(n) = limit {
        sql.push_str(&format!(" LIMIT {}", n));
    }
    Ok(())
}

fn kind_of_type(ty: &AttributeType) -> InflateKind {
    match ty {
        AttributeType::Boolean => InflateKind::Boolean,
        AttributeType::Number => InflateKind::Number,
        AttributeType::Time => InflateKind::Time,
        _ => InflateKind::String,
    }
}

fn key_kind(e: &Expression) -> InflateKind {
    if let Some(c) = e.as_chain() {
        match &c.op {
            ChainOp::TimeBucket { duration } | ChainOp::TimeFloor { duration } => {
                return InflateKind::TimeRange {
                    duration: *duration,
                }
            }
            ChainOp::NumberBucket { size, .. } => {
                return InflateKind::NumberRange { size: *size }
            }
            _ => {}
        }
    }
    kind_of_type(&e.output_type())
}

// ---- the expression renderer ----

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_string(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn time_literal(t: DateTime<Utc>) -> String {
    format!("TIMESTAMP '{}'", t.format("%Y-%m-%d %H:%M:%S"))
}

/// An apply expression: aggregates render inline (SQL nests them freely,
/// no segregation step needed), scalars recurse into `scalar_sql`.
fn aggregate_sql(
    e: &Expression,
    remote: &RemoteDataset,
    dialect: SqlDialect,
) -> Result<String> {
    match e {
        Expression::Chain(c) if c.op.is_aggregate() => {
            let pred = segment_filter(&c.operand)?;
            let guard = |inner: &Expression| -> Result<String> {
                let x = scalar_sql(inner, remote, dialect)?;
                Ok(match &pred {
                    Some(p) => format!(
                        "CASE WHEN {} THEN {} END",
                        scalar_sql(p, remote, dialect)?,
                        x
                    ),
                    None => x,
                })
            };
            Ok(match &c.op {
                ChainOp::Count => match &pred {
                    Some(p) => format!(
                        "SUM(CASE WHEN {} THEN 1 ELSE 0 END)",
                        scalar_sql(p, remote, dialect)?
                    ),
                    None => "COUNT(*)".to_string(),
                },
                ChainOp::Sum(a) => format!("SUM({})", guard(a)?),
                ChainOp::Min(a) => format!("MIN({})", guard(a)?),
                ChainOp::Max(a) => format!("MAX({})", guard(a)?),
                ChainOp::Average(a) => format!("AVG({})", guard(a)?),
                ChainOp::CountDistinct(a) => format!("COUNT(DISTINCT {})", guard(a)?),
                ChainOp::Quantile { expression, value } => {
                    if remote.capabilities.exact_results_only
                        || dialect != SqlDialect::Druid
                    {
                        return Err(Error::unsupported(
                            "a quantile aggregate",
                            dialect.backend_name(),
                        ));
                    }
                    format!("APPROX_QUANTILE({}, {})", guard(expression)?, value)
                }
                ChainOp::CustomAggregate { name } => {
                    return Err(Error::unsupported(
                        format!("the custom aggregation '{}'", name),
                        dialect.backend_name(),
                    ))
                }
                other => {
                    return Err(Error::unsupported(
                        format!("the aggregate '{}'", other.name()),
                        dialect.backend_name(),
                    ))
                }
            })
        }
        Expression::Chain(c) => {
            let operand = aggregate_sql(&c.operand, remote, dialect)?;
            match c.op.argument() {
                Some(arg) => {
                    binary_sql(&c.op, operand, aggregate_sql(arg, remote, dialect)?, dialect)
                }
                None => unary_sql(&c.op, operand, dialect),
            }
        }
        _ => scalar_sql(e, remote, dialect),
    }
}

/// Unwrap the filter chain under an aggregate; the base must be the
/// segment reference itself.
fn segment_filter(operand: &Expression) -> Result<Option<Expression>> {
    match operand {
        Expression::Ref(r) if r.name == SEGMENT_NAME => Ok(None),
        Expression::Chain(c) => match &c.op {
            ChainOp::Filter(p) => {
                let inner = segment_filter(&c.operand)?;
                Ok(Some(match inner {
                    Some(acc) => (**p).clone().and(acc)?,
                    None => (**p).clone(),
                }))
            }
            _ => Err(Error::construction("aggregate over a non-segment chain")),
        },
        _ => Err(Error::construction("aggregate over a non-segment chain")),
    }
}

fn scalar_sql(e: &Expression, remote: &RemoteDataset, dialect: SqlDialect) -> Result<String> {
    match e {
        Expression::Ref(r) => Ok(quote_ident(&r.name)),
        Expression::Literal(l) => literal_sql(&l.value, dialect),
        Expression::Chain(c) => {
            // set/range membership expands at the comparison site
            if let ChainOp::In(arg) | ChainOp::Overlap(arg) = &c.op {
                if let Some(v) = arg.as_literal() {
                    return membership_sql(
                        scalar_sql(&c.operand, remote, dialect)?,
                        v,
                        dialect,
                    );
                }
            }
            let operand = scalar_sql(&c.operand, remote, dialect)?;
            match c.op.argument() {
                Some(arg) => {
                    binary_sql(&c.op, operand, scalar_sql(arg, remote, dialect)?, dialect)
                }
                None => unary_sql(&c.op, operand, dialect),
            }
        }
    }
}

fn literal_sql(v: &Datum, dialect: SqlDialect) -> Result<String> {
    Ok(match v {
        Datum::Null => "NULL".to_string(),
        Datum::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        Datum::Number(n) => {
            if n.fract() == 0.0 && n.abs() < 1e15 {
                format!("{}", *n as i64)
            } else {
                format!("{}", n)
            }
        }
        Datum::String(s) => quote_string(s),
        Datum::Time(t) => time_literal(*t),
        other => {
            return Err(Error::unsupported(
                format!("a {} literal", other.attribute_type()),
                dialect.backend_name(),
            ))
        }
    })
}

fn membership_sql(operand: String, v: &Datum, dialect: SqlDialect) -> Result<String> {
    Ok(match v {
        Datum::Set(set) => {
            let elements = set
                .elements
                .iter()
                .map(|el| literal_sql(el, dialect))
                .collect::<Result<Vec<_>>>()?;
            format!("{} IN ({})", operand, elements.join(", "))
        }
        Datum::NumberRange(r) => {
            range_sql(&operand, r.start.map(|n| literal_sql(&Datum::Number(n), dialect)),
                r.end.map(|n| literal_sql(&Datum::Number(n), dialect)),
                r.bounds.start_closed, r.bounds.end_closed)?
        }
        Datum::TimeRange(r) => {
            range_sql(&operand, r.start.map(|t| Ok(time_literal(t))),
                r.end.map(|t| Ok(time_literal(t))),
                r.bounds.start_closed, r.bounds.end_closed)?
        }
        other => format!("{} = {}", operand, literal_sql(other, dialect)?),
    })
}

fn range_sql(
    operand: &str,
    start: Option<Result<String>>,
    end: Option<Result<String>>,
    start_closed: bool,
    end_closed: bool,
) -> Result<String> {
    let mut terms = Vec::new();
    if let Some(s) = start {
        terms.push(format!(
            "{} {} {}",
            operand,
            if start_closed { ">=" } else { ">" },
            s?
        ));
    }
    if let Some(e) = end {
        terms.push(format!(
            "{} {} {}",
            operand,
            if end_closed { "<=" } else { "<" },
            e?
        ));
    }
    Ok(if terms.is_empty() {
        "TRUE".to_string()
    } else {
        format!("({})", terms.join(" AND "))
    })
}

fn binary_sql(
    op: &ChainOp,
    a: String,
    b: String,
    dialect: SqlDialect,
) -> Result<String> {
    Ok(match op {
        ChainOp::And(_) => format!("({} AND {})", a, b),
        ChainOp::Or(_) => format!("({} OR {})", a, b),
        ChainOp::Is(_) => format!("({} = {})", a, b),
        ChainOp::Add(_) => format!("({} + {})", a, b),
        ChainOp::Subtract(_) => format!("({} - {})", a, b),
        ChainOp::Multiply(_) => format!("({} * {})", a, b),
        ChainOp::Divide(_) => format!("({} / {})", a, b),
        ChainOp::Power(_) => format!("POWER({}, {})", a, b),
        ChainOp::Concat(_) => format!("CONCAT({}, {})", a, b),
        ChainOp::Fallback(_) => format!("COALESCE({}, {})", a, b),
        ChainOp::Then(_) => format!("CASE WHEN {} THEN {} END", a, b),
        ChainOp::Contains(_) => format!("(POSITION({} IN {}) > 0)", b, a),
        ChainOp::In(_) | ChainOp::Overlap(_) => format!("({} = {})", a, b),
        other => {
            return Err(Error::unsupported(
                format!("operation '{}'", other.name()),
                dialect.backend_name(),
            ))
        }
    })
}

fn unary_sql(op: &ChainOp, a: String, dialect: SqlDialect) -> Result<String> {
    Ok(match op {
        ChainOp::Not => format!("(NOT {})", a),
        ChainOp::Absolute => format!("ABS({})", a),
        ChainOp::Length => format!("CHAR_LENGTH({})", a),
        ChainOp::Match { regex } => format!("REGEXP_LIKE({}, {})", a, quote_string(regex)),
        ChainOp::Extract { regex } => match dialect {
            SqlDialect::Druid => {
                format!("REGEXP_EXTRACT({}, {}, 1)", a, quote_string(regex))
            }
            SqlDialect::Generic => {
                return Err(Error::unsupported(
                    "regular-expression extraction",
                    dialect.backend_name(),
                ))
            }
        },
        // one-based positions in SQL
        ChainOp::Substring { position, len } => {
            format!("SUBSTRING({}, {}, {})", a, position + 1, len)
        }
        ChainOp::ChangeCase { mode } => match mode {
            CaseMode::Upper => format!("UPPER({})", a),
            CaseMode::Lower => format!("LOWER({})", a),
        },
        ChainOp::Lookup { table } => match dialect {
            SqlDialect::Druid => format!("LOOKUP({}, {})", a, quote_string(table)),
            SqlDialect::Generic => {
                return Err(Error::unsupported("lookups", dialect.backend_name()))
            }
        },
        ChainOp::NumberBucket { size, offset } => format!(
            "(FLOOR(({} - {off}) / {size}) * {size} + {off})",
            a,
            size = size,
            off = offset,
        ),
        ChainOp::TimeBucket { duration } | ChainOp::TimeFloor { duration } => match dialect {
            SqlDialect::Druid => format!("TIME_FLOOR({}, '{}')", a, duration),
            SqlDialect::Generic => {
                let unit = trunc_unit(duration).ok_or_else(|| {
                    Error::unsupported(
                        format!("bucketing by '{}'", duration),
                        dialect.backend_name(),
                    )
                })?;
                format!("DATE_TRUNC('{}', {})", unit, a)
            }
        },
        ChainOp::TimeShift { duration, step } => match dialect {
            SqlDialect::Druid => format!("TIME_SHIFT({}, '{}', {})", a, duration, step),
            SqlDialect::Generic => {
                return Err(Error::unsupported("time shifting", dialect.backend_name()))
            }
        },
        ChainOp::TimePart { part } => {
            format!("EXTRACT({} FROM {})", extract_unit(*part), a)
        }
        ChainOp::Cast(ty) => {
            let target = match ty {
                AttributeType::Number => "DOUBLE",
                AttributeType::String => "VARCHAR",
                AttributeType::Time => "TIMESTAMP",
                AttributeType::Boolean => "BOOLEAN",
                other => {
                    return Err(Error::unsupported(
                        format!("cast to {}", other),
                        dialect.backend_name(),
                    ))
                }
            };
            format!("CAST({} AS {})", a, target)
        }
        other => {
            return Err(Error::unsupported(
                format!("operation '{}'", other.name()),
                dialect.backend_name(),
            ))
        }
    })
}

fn trunc_unit(d: &Duration) -> Option<&'static str> {
    match d.to_string().as_str() {
        "P1Y" => Some("year"),
        "P1M" => Some("month"),
        "P1W" => Some("week"),
        "P1D" => Some("day"),
        "PT1H" => Some("hour"),
        "PT1M" => Some("minute"),
        "PT1S" => Some("second"),
        _ => None,
    }
}

fn extract_unit(part: TimePartKind) -> &'static str {
    match part {
        TimePartKind::Year => "YEAR",
        TimePartKind::Month => "MONTH",
        TimePartKind::DayOfMonth => "DAY",
        TimePartKind::DayOfWeek => "DOW",
        TimePartKind::HourOfDay => "HOUR",
        TimePartKind::MinuteOfHour => "MINUTE",
        TimePartKind::SecondOfMinute => "SECOND",
    }
}

// ---- normalization ----

pub fn normalize(query: &SqlQuery, response: &Json) -> Result<Dataset> {
    let rows_json = response
        .as_array()
        .ok_or_else(|| Error::Transport(format!("expected a row array, got {}", response)))?;
    let mut rows = Vec::with_capacity(rows_json.len());
    for row_json in rows_json {
        let mut row = Row::new();
        for inf in &query.inflation {
            let value = &row_json[&inf.column];
            row.insert(inf.column.clone(), inf.inflate(value)?);
        }
        rows.push(row);
    }
    if rows.is_empty() {
        if let Some(zero) = &query.zero_row {
            rows.push(zero.clone());
        }
    }
    Ok(Dataset::new(rows))
}

// ---- introspection ----

pub fn introspection_query(source: &str) -> SqlQuery {
    SqlQuery {
        sql: format!(
            "SELECT COLUMN_NAME, DATA_TYPE FROM INFORMATION_SCHEMA.COLUMNS \
             WHERE TABLE_NAME = {}",
            quote_string(source)
        ),
        inflation: vec![
            Inflater::new("COLUMN_NAME", InflateKind::String),
            Inflater::new("DATA_TYPE", InflateKind::String),
        ],
        zero_row: None,
    }
}

pub fn attributes(response: &Json) -> Result<Vec<AttributeInfo>> {
    let rows = response
        .as_array()
        .ok_or_else(|| Error::Transport("bad introspection response".to_string()))?;
    let mut out = Vec::new();
    for row in rows {
        let name = row["COLUMN_NAME"]
            .as_str()
            .ok_or_else(|| Error::Transport("introspection row missing COLUMN_NAME".to_string()))?;
        let native = row["DATA_TYPE"].as_str().unwrap_or("");
        let ty = if name == "__time" {
            AttributeType::Time
        } else {
            logical_type(native)
        };
        out.push(AttributeInfo::new(name, ty).with_native_type(native));
    }
    Ok(out)
}
