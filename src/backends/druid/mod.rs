//! Native query emission and response normalization.
//!
//! A finalized leaf plan maps onto exactly one native query type:
//!
//! * raw mode -> `scan`
//! * value / total mode -> `timeseries` with an `all` granularity, or
//!   `timeBoundary` for an unfiltered min/max of the time column
//! * split on one time bucket -> `timeseries` with a period granularity
//! * split on one string key, sorted by a metric and limited -> `topN`
//! * any other split -> `groupBy`
//!
//! The same classification drives normalization, so the two sides cannot
//! drift apart.

pub mod aggregation;
pub mod expression;
pub mod extraction;
pub mod filter;
pub mod introspect;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value as Json};

use crate::error::{Error, Result};
use crate::expressions::{ChainOp, Direction, Expression};
use crate::remote::segregate::{segregate, Segregation};
use crate::remote::{NamedExpr, QueryMode, RemoteDataset, SortSpec, SEGMENT_NAME, VALUE_NAME};
use crate::types::AttributeType;
use crate::values::{Datum, Dataset, Duration, NumberRange, Row, TimeRange};

pub use expression::version_at_least;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum QueryKind {
    Scan,
    TimeBoundary { bound: &'static str },
    /// `bucket` is the split key materialized by the period granularity.
    Timeseries { bucket: Option<(String, Duration)> },
    TopN { metric: String, descending: bool },
    GroupBy,
}

pub(crate) fn query_kind(remote: &RemoteDataset) -> Result<QueryKind> {
    Ok(match &remote.mode {
        QueryMode::Raw { .. } => QueryKind::Scan,
        QueryMode::Value { expression } => match time_boundary_bound(remote, expression) {
            Some(bound) => QueryKind::TimeBoundary { bound },
            None => QueryKind::Timeseries { bucket: None },
        },
        QueryMode::Total { .. } => QueryKind::Timeseries { bucket: None },
        QueryMode::Split {
            keys,
            having,
            sort,
            limit,
            ..
        } => {
            if keys.len() == 1 {
                if let Some(duration) = time_bucket_of(remote, &keys[0].expression) {
                    if having.is_none() && sort_is_on_key(sort, &keys[0].name) {
                        return Ok(QueryKind::Timeseries {
                            bucket: Some((keys[0].name.clone(), duration)),
                        });
                    }
                }
                if let (Some(s), Some(_)) = (sort, limit) {
                    if having.is_none() {
                        if let Some(r) = s.expression.as_ref_expr() {
                            let is_apply = match &remote.mode {
                                QueryMode::Split { applies, .. } => {
                                    applies.iter().any(|a| a.name == r.name)
                                }
                                _ => false,
                            };
                            if is_apply {
                                return Ok(QueryKind::TopN {
                                    metric: r.name.clone(),
                                    descending: s.direction == Direction::Descending,
                                });
                            }
                        }
                    }
                }
            }
            QueryKind::GroupBy
        }
    })
}

fn sort_is_on_key(sort: &Option<SortSpec>, key: &str) -> bool {
    match sort {
        None => true,
        Some(s) => {
            s.direction == Direction::Ascending
                && s.expression.as_ref_expr().map(|r| r.name.as_str()) == Some(key)
        }
    }
}

fn time_boundary_bound(
    remote: &RemoteDataset,
    expression: &Expression,
) -> Option<&'static str> {
    if !remote.filter.is_literal_true() {
        return None;
    }
    let time = remote.time_attribute()?;
    let c = expression.as_chain()?;
    if c.operand.as_ref_expr()?.name != SEGMENT_NAME {
        return None;
    }
    let (bound, arg) = match &c.op {
        ChainOp::Min(a) => ("minTime", a),
        ChainOp::Max(a) => ("maxTime", a),
        _ => return None,
    };
    if arg.as_ref_expr()?.name == time.name {
        Some(bound)
    } else {
        None
    }
}

fn time_bucket_of(remote: &RemoteDataset, key: &Expression) -> Option<Duration> {
    let time = remote.time_attribute()?;
    let c = key.as_chain()?;
    if c.operand.as_ref_expr()?.name != time.name {
        return None;
    }
    match &c.op {
        ChainOp::TimeBucket { duration } | ChainOp::TimeFloor { duration } => Some(*duration),
        _ => None,
    }
}

/// The plan's time constraint, pulled out of the base filter: native
/// queries take intervals separately from the dimension filter.
fn split_time_filter(remote: &RemoteDataset) -> Result<(Vec<String>, Expression)> {
    let time_name = remote.time_attribute().map(|a| a.name.clone());
    let mut intervals = Vec::new();
    let mut residual: Vec<Expression> = Vec::new();
    collect_conjunction(&remote.filter, &mut |term| {
        if let (Some(time), Some(c)) = (&time_name, term.as_chain()) {
            if let ChainOp::In(arg) | ChainOp::Overlap(arg) = &c.op {
                if c.operand.as_ref_expr().map(|r| r.name == *time) == Some(true) {
                    if let Some(Datum::TimeRange(range)) = arg.as_literal() {
                        intervals.push(range.to_interval());
                        return;
                    }
                }
            }
        }
        residual.push(term.clone());
    });
    if intervals.is_empty() {
        if !remote.capabilities.allow_eternity {
            return Err(Error::unsupported(
                "a query without a time filter",
                "druid",
            ));
        }
        intervals.push(
            TimeRange {
                start: None,
                end: None,
                bounds: Default::default(),
            }
            .to_interval(),
        );
    }
    let mut rest = Expression::boolean(true);
    for term in residual {
        rest = rest.and(term)?;
    }
    Ok((intervals, rest.simplify()?))
}

fn collect_conjunction(e: &Expression, each: &mut dyn FnMut(&Expression)) {
    if let Some(c) = e.as_chain() {
        if let ChainOp::And(arg) = &c.op {
            collect_conjunction(&c.operand, each);
            collect_conjunction(arg, each);
            return;
        }
    }
    if !e.is_literal_true() {
        each(e);
    }
}

pub fn emit(remote: &RemoteDataset, version: &str) -> Result<Json> {
    let kind = query_kind(remote)?;
    // timeBoundary has no interval clause; it only fires on an unfiltered
    // plan anyway.
    if let QueryKind::TimeBoundary { bound } = &kind {
        return Ok(json!({
            "queryType": "timeBoundary",
            "dataSource": remote.source,
            "bound": bound,
        }));
    }
    let (intervals, residual) = split_time_filter(remote)?;
    let dim_filter = filter::emit(&residual, version)?;

    match kind {
        QueryKind::TimeBoundary { .. } => unreachable!(),
        QueryKind::Scan => emit_scan(remote, version, intervals, dim_filter),
        QueryKind::Timeseries { bucket } => {
            let applies = mode_applies(remote);
            let seg = segregate(&applies, &remote.attributes);
            let (aggregations, post_aggregations) =
                aggregation::emit(&seg, remote, version)?;
            let granularity = match &bucket {
                Some((_, duration)) => json!({
                    "type": "period",
                    "period": duration.to_string(),
                    "timeZone": "Etc/UTC",
                }),
                None => json!("all"),
            };
            let mut q = json!({
                "queryType": "timeseries",
                "dataSource": remote.source,
                "intervals": intervals,
                "granularity": granularity,
                "aggregations": aggregations,
            });
            if !post_aggregations.is_empty() {
                q["postAggregations"] = json!(post_aggregations);
            }
            if let Some(f) = dim_filter {
                q["filter"] = f;
            }
            if bucket.is_some() {
                q["context"] = json!({ "skipEmptyBuckets": true });
            }
            Ok(q)
        }
        QueryKind::TopN { metric, descending } => {
            let (keys, applies, limit) = match &remote.mode {
                QueryMode::Split {
                    keys,
                    applies,
                    limit: Some(limit),
                    ..
                } => (keys, applies.clone(), *limit),
                _ => return Err(Error::construction("topN requires a limited split")),
            };
            let seg = segregate(&applies, &remote.attributes);
            let (aggregations, post_aggregations) =
                aggregation::emit(&seg, remote, version)?;
            let mut virtual_columns = Vec::new();
            let dimension = dimension_spec(&keys[0], version, &mut virtual_columns)?;
            let mut q = json!({
                "queryType": "topN",
                "dataSource": remote.source,
                "intervals": intervals,
                "granularity": "all",
                "dimension": dimension,
                "metric": if descending {
                    json!(metric)
                } else {
                    json!({ "type": "inverted", "metric": metric })
                },
                "threshold": limit,
                "aggregations": aggregations,
            });
            if !post_aggregations.is_empty() {
                q["postAggregations"] = json!(post_aggregations);
            }
            if let Some(f) = dim_filter {
                q["filter"] = f;
            }
            if !virtual_columns.is_empty() {
                q["virtualColumns"] = json!(virtual_columns);
            }
            Ok(q)
        }
        QueryKind::GroupBy => {
            let (keys, applies, having, sort, limit) = match &remote.mode {
                QueryMode::Split {
                    keys,
                    applies,
                    having,
                    sort,
                    limit,
                    ..
                } => (keys, applies.clone(), having, sort, limit),
                _ => return Err(Error::construction("groupBy requires a split")),
            };
            let seg = segregate(&applies, &remote.attributes);
            let (aggregations, post_aggregations) =
                aggregation::emit(&seg, remote, version)?;
            let mut virtual_columns = Vec::new();
            let dimensions = keys
                .iter()
                .map(|k| dimension_spec(k, version, &mut virtual_columns))
                .collect::<Result<Vec<_>>>()?;
            let mut q = json!({
                "queryType": "groupBy",
                "dataSource": remote.source,
                "intervals": intervals,
                "granularity": "all",
                "dimensions": dimensions,
                "aggregations": aggregations,
            });
            if !post_aggregations.is_empty() {
                q["postAggregations"] = json!(post_aggregations);
            }
            if let Some(f) = dim_filter {
                q["filter"] = f;
            }
            if let Some(h) = having {
                if let Some(f) = filter::emit(h, version)? {
                    q["having"] = json!({ "type": "filter", "filter": f });
                }
            }
            if sort.is_some() || limit.is_some() {
                let columns = match sort {
                    Some(s) => {
                        let name = s
                            .expression
                            .as_ref_expr()
                            .map(|r| r.name.clone())
                            .ok_or_else(|| {
                                Error::construction("sort must be on a named column")
                            })?;
                        json!([{
                            "dimension": name,
                            "direction": if s.direction == Direction::Descending {
                                "descending"
                            } else {
                                "ascending"
                            },
                        }])
                    }
                    None => json!([]),
                };
                let mut spec = json!({ "type": "default", "columns": columns });
                if let Some(n) = limit {
                    spec["limit"] = json!(n);
                }
                q["limitSpec"] = spec;
            }
            if !virtual_columns.is_empty() {
                q["virtualColumns"] = json!(virtual_columns);
            }
            Ok(q)
        }
    }
}

fn emit_scan(
    remote: &RemoteDataset,
    version: &str,
    intervals: Vec<String>,
    dim_filter: Option<Json>,
) -> Result<Json> {
    let (select, limit) = match &remote.mode {
        QueryMode::Raw { select, limit, .. } => (select.clone(), *limit),
        _ => return Err(Error::construction("scan requires raw mode")),
    };
    let mut columns: Vec<String> = Vec::new();
    let mut virtual_columns = Vec::new();
    let wanted: Vec<String> = match &select {
        Some(names) => names.clone(),
        None => remote
            .attributes
            .iter()
            .map(|a| a.name.clone())
            .chain(remote.derived_attributes.keys().cloned())
            .collect(),
    };
    for name in wanted {
        if let Some(derived) = remote.derived_attributes.get(&name) {
            virtual_columns.push(virtual_column(&name, derived, version)?);
        }
        columns.push(name);
    }
    let mut q = json!({
        "queryType": "scan",
        "dataSource": remote.source,
        "intervals": intervals,
        "resultFormat": "list",
        "columns": columns,
    });
    if let Some(f) = dim_filter {
        q["filter"] = f;
    }
    if let Some(n) = limit {
        q["limit"] = json!(n);
    }
    if !virtual_columns.is_empty() {
        q["virtualColumns"] = json!(virtual_columns);
    }
    Ok(q)
}

fn mode_applies(remote: &RemoteDataset) -> Vec<NamedExpr> {
    match &remote.mode {
        QueryMode::Value { expression } => {
            vec![NamedExpr::new(VALUE_NAME, expression.clone())]
        }
        QueryMode::Total { applies } | QueryMode::Split { applies, .. } => applies.clone(),
        QueryMode::Raw { .. } => Vec::new(),
    }
}

fn virtual_column(name: &str, e: &Expression, version: &str) -> Result<Json> {
    let output_type = match e.output_type() {
        AttributeType::Number => "DOUBLE",
        AttributeType::Time => "LONG",
        _ => "STRING",
    };
    Ok(json!({
        "type": "expression",
        "name": name,
        "expression": expression::emit(e, version)?,
        "outputType": output_type,
    }))
}

/// Dimension spec for a split key: plain column, extraction over a column,
/// or a virtual column when neither fits.
fn dimension_spec(
    key: &NamedExpr,
    version: &str,
    virtual_columns: &mut Vec<Json>,
) -> Result<Json> {
    match extraction::extraction_of(&key.expression) {
        Some((dim, None)) => Ok(json!({
            "type": "default",
            "dimension": dim,
            "outputName": key.name,
        })),
        Some((dim, Some(ef))) => Ok(json!({
            "type": "extraction",
            "dimension": dim,
            "outputName": key.name,
            "extractionFn": ef,
        })),
        None => {
            let vname = format!("v:{}", key.name);
            virtual_columns.push(virtual_column(&vname, &key.expression, version)?);
            Ok(json!({
                "type": "default",
                "dimension": vname,
                "outputName": key.name,
            }))
        }
    }
}

// ---- response normalization ----

pub fn normalize(remote: &RemoteDataset, response: &Json) -> Result<Dataset> {
    let kind = query_kind(remote)?;
    let mut rows = match &kind {
        QueryKind::TimeBoundary { bound } => {
            let result = &response[0]["result"];
            let t = parse_time_value(&result[bound])?;
            vec![Row::from([(VALUE_NAME.to_string(), Datum::Time(t))])]
        }
        QueryKind::Scan => {
            let mut out = Vec::new();
            for segment in as_array(response)? {
                for event in as_array(&segment["events"])? {
                    out.push(raw_row(remote, event)?);
                }
            }
            out
        }
        QueryKind::Timeseries { bucket } => {
            let mut out = Vec::new();
            for entry in as_array(response)? {
                let mut row = object_row(&entry["result"])?;
                if let Some((key, duration)) = bucket {
                    let start = parse_time_value(&entry["timestamp"])?;
                    row.insert(
                        key.clone(),
                        Datum::TimeRange(TimeRange::new(start, duration.shift(start, 1))),
                    );
                }
                out.push(row);
            }
            out
        }
        QueryKind::TopN { .. } => {
            let mut out = Vec::new();
            for entry in as_array(&response[0]["result"])? {
                out.push(split_row(remote, entry)?);
            }
            out
        }
        QueryKind::GroupBy => {
            let mut out = Vec::new();
            for entry in as_array(response)? {
                out.push(split_row(remote, &entry["event"])?);
            }
            out
        }
    };

    // Aggregate queries with no matching rows still answer: counts are
    // zero, everything else null.
    if rows.is_empty() {
        match &remote.mode {
            QueryMode::Total { .. } => {
                if let Some(zero) = remote.zero_total_row() {
                    rows.push(zero);
                }
            }
            QueryMode::Value { .. } => {
                if let Some(zero) = remote.zero_value() {
                    rows.push(Row::from([(VALUE_NAME.to_string(), zero)]));
                }
            }
            _ => {}
        }
    }

    let mut dataset = Dataset::new(rows);
    // Shaping the chosen native form could not express runs here.
    if let QueryMode::Split {
        having,
        sort,
        limit,
        ..
    } = &remote.mode
    {
        if let (Some(h), QueryKind::Timeseries { .. }) = (having, &kind) {
            dataset = dataset.filter(&|row| {
                let scope = crate::expressions::RowScope::root(row);
                Ok(h.compute(&scope)?.is_truthy())
            })?;
        }
        if let Some(s) = sort {
            if matches!(kind, QueryKind::Timeseries { .. }) {
                if let Some(r) = s.expression.as_ref_expr() {
                    dataset = dataset
                        .sort_by_column(&r.name, s.direction == Direction::Descending);
                }
            }
        }
        if let Some(n) = limit {
            if matches!(kind, QueryKind::Timeseries { .. }) {
                dataset = dataset.limit(*n);
            }
        }
    }
    Ok(dataset)
}

fn as_array(v: &Json) -> Result<&Vec<Json>> {
    v.as_array()
        .ok_or_else(|| Error::Transport(format!("expected a JSON array, got {}", v)))
}

fn object_row(v: &Json) -> Result<Row> {
    let obj = v
        .as_object()
        .ok_or_else(|| Error::Transport(format!("expected a JSON object, got {}", v)))?;
    let mut row = Row::new();
    for (k, val) in obj {
        row.insert(k.clone(), Datum::from_js_untyped(val)?);
    }
    Ok(row)
}

/// Scan rows: raw columns come back typed by the attribute declarations
/// (the time column in particular arrives as epoch millis).
fn raw_row(remote: &RemoteDataset, event: &Json) -> Result<Row> {
    let obj = event
        .as_object()
        .ok_or_else(|| Error::Transport("scan event is not an object".to_string()))?;
    let mut row = Row::new();
    for (k, val) in obj {
        let is_time = remote
            .attributes
            .iter()
            .any(|a| a.name == *k && a.ty == AttributeType::Time);
        let datum = if is_time && !val.is_null() {
            Datum::Time(parse_time_value(val)?)
        } else {
            Datum::from_js_untyped(val)?
        };
        row.insert(k.clone(), datum);
    }
    Ok(row)
}

/// Split rows: bucketed keys come back as scalars and re-inflate into the
/// range the bucket covers.
fn split_row(remote: &RemoteDataset, entry: &Json) -> Result<Row> {
    let mut row = object_row(entry)?;
    if let QueryMode::Split { keys, .. } = &remote.mode {
        for key in keys {
            let Some(value) = row.get(&key.name).cloned() else {
                continue;
            };
            let inflated = inflate_key(&key.expression, &value)?;
            row.insert(key.name.clone(), inflated);
        }
    }
    Ok(row)
}

fn inflate_key(expression: &Expression, value: &Datum) -> Result<Datum> {
    let Some(c) = expression.as_chain() else {
        return Ok(value.clone());
    };
    Ok(match (&c.op, value) {
        (ChainOp::TimeBucket { duration } | ChainOp::TimeFloor { duration }, v) => {
            let start = match v {
                Datum::Time(t) => *t,
                Datum::String(s) => s
                    .parse::<DateTime<Utc>>()
                    .map_err(|e| Error::Transport(format!("bad bucket time '{}': {}", s, e)))?,
                Datum::Number(n) => epoch_millis(*n)?,
                other => return Ok(other.clone()),
            };
            Datum::TimeRange(TimeRange::new(start, duration.shift(start, 1)))
        }
        (ChainOp::NumberBucket { size, .. }, Datum::Number(n)) => {
            Datum::NumberRange(NumberRange::new(*n, *n + *size))
        }
        (ChainOp::NumberBucket { size, .. }, Datum::String(s)) => {
            let n: f64 = s
                .parse()
                .map_err(|_| Error::Transport(format!("bad bucket number '{}'", s)))?;
            Datum::NumberRange(NumberRange::new(n, n + *size))
        }
        (_, v) => v.clone(),
    })
}

fn parse_time_value(v: &Json) -> Result<DateTime<Utc>> {
    match v {
        Json::String(s) => s
            .parse::<DateTime<Utc>>()
            .map_err(|e| Error::Transport(format!("bad time '{}': {}", s, e))),
        Json::Number(n) => epoch_millis(n.as_f64().unwrap_or(f64::NAN)),
        other => Err(Error::Transport(format!("bad time value {}", other))),
    }
}

fn epoch_millis(n: f64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(n as i64)
        .single()
        .ok_or_else(|| Error::Transport(format!("bad epoch millis {}", n)))
}

/// Segregation of the current mode's applies, exposed for payload
/// inspection (simulation builds rows from it).
pub(crate) fn current_segregation(remote: &RemoteDataset) -> Segregation {
    segregate(&mode_applies(remote), &remote.attributes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expressions::SplitKey;
    use crate::types::AttributeInfo;

    const V: &str = "0.20.0";

    fn march_13() -> TimeRange {
        TimeRange::new(
            "2015-03-13T00:00:00Z".parse().unwrap(),
            "2015-03-14T00:00:00Z".parse().unwrap(),
        )
    }

    fn wiki() -> RemoteDataset {
        let r = RemoteDataset::new("druid", "wikipedia").with_attributes(vec![
            AttributeInfo::new("__time", AttributeType::Time),
            AttributeInfo::new("channel", AttributeType::String),
            AttributeInfo::new("added", AttributeType::Number).with_native_type("longSum"),
        ]);
        let window = Expression::reference_typed("__time", AttributeType::Time)
            .in_(Expression::literal(Datum::TimeRange(march_13())))
            .unwrap();
        r.add_operation(&ChainOp::Filter(Box::new(window))).unwrap()
    }

    fn split_on_channel(r: &RemoteDataset) -> RemoteDataset {
        r.add_operation(&ChainOp::Split {
            keys: vec![SplitKey {
                name: "Channel".into(),
                expression: Box::new(Expression::reference_typed(
                    "channel",
                    AttributeType::String,
                )),
            }],
            data_name: "wiki".into(),
        })
        .unwrap()
        .add_operation(&ChainOp::Apply {
            name: "Added".into(),
            expression: Box::new(
                Expression::reference_typed(
                    "wiki",
                    AttributeType::Dataset(r.raw_dataset_type()),
                )
                .sum(Expression::reference_typed("added", AttributeType::Number))
                .unwrap(),
            ),
        })
        .unwrap()
    }

    #[test]
    fn test_total_emits_all_granularity_timeseries() {
        let v = wiki().add_operation(&ChainOp::Count).unwrap();
        let q = emit(&v, V).unwrap();
        assert_eq!(q["queryType"], "timeseries");
        assert_eq!(q["granularity"], "all");
        assert_eq!(
            q["intervals"][0],
            "2015-03-13T00:00:00.000Z/2015-03-14T00:00:00.000Z"
        );
        assert!(q.get("filter").is_none());
    }

    #[test]
    fn test_missing_time_filter_needs_eternity() {
        let r = RemoteDataset::new("druid", "wikipedia")
            .with_attributes(vec![AttributeInfo::new("__time", AttributeType::Time)]);
        let v = r.add_operation(&ChainOp::Count).unwrap();
        assert!(matches!(emit(&v, V), Err(Error::Unsupported { .. })));

        let mut open = v.clone();
        open.capabilities.allow_eternity = true;
        let q = emit(&open, V).unwrap();
        assert!(q["intervals"][0]
            .as_str()
            .unwrap()
            .starts_with("-146136543-09-08"));
    }

    #[test]
    fn test_sorted_limited_split_emits_topn() {
        let split = split_on_channel(&wiki())
            .add_operation(&ChainOp::Sort {
                expression: Box::new(Expression::reference_typed(
                    "Added",
                    AttributeType::Number,
                )),
                direction: Direction::Descending,
            })
            .unwrap()
            .add_operation(&ChainOp::Limit(5))
            .unwrap();
        let q = emit(&split, V).unwrap();
        assert_eq!(q["queryType"], "topN");
        assert_eq!(q["metric"], "Added");
        assert_eq!(q["threshold"], 5);
        assert_eq!(q["dimension"]["dimension"], "channel");
        assert_eq!(q["dimension"]["outputName"], "Channel");
    }

    #[test]
    fn test_time_bucket_split_emits_period_timeseries() {
        let r = wiki();
        let split = r
            .add_operation(&ChainOp::Split {
                keys: vec![SplitKey {
                    name: "Hour".into(),
                    expression: Box::new(
                        Expression::reference_typed("__time", AttributeType::Time)
                            .time_bucket(Duration::parse("PT1H").unwrap())
                            .unwrap(),
                    ),
                }],
                data_name: "wiki".into(),
            })
            .unwrap();
        let q = emit(&split, V).unwrap();
        assert_eq!(q["queryType"], "timeseries");
        assert_eq!(q["granularity"]["period"], "PT1H");
    }

    #[test]
    fn test_unsorted_split_emits_groupby_with_having() {
        let split = split_on_channel(&wiki())
            .add_operation(&ChainOp::Filter(Box::new(
                Expression::reference_typed("Added", AttributeType::Number)
                    .in_(Expression::literal(Datum::NumberRange(NumberRange::new(
                        100.0,
                        f64::MAX,
                    ))))
                    .unwrap(),
            )))
            .unwrap();
        let q = emit(&split, V).unwrap();
        assert_eq!(q["queryType"], "groupBy");
        assert_eq!(q["having"]["type"], "filter");
        assert_eq!(q["having"]["filter"]["type"], "bound");
    }

    #[test]
    fn test_raw_emits_scan() {
        let raw = wiki()
            .add_operation(&ChainOp::Select(vec![
                "channel".to_string(),
                "added".to_string(),
            ]))
            .unwrap()
            .add_operation(&ChainOp::Limit(100))
            .unwrap();
        let q = emit(&raw, V).unwrap();
        assert_eq!(q["queryType"], "scan");
        assert_eq!(q["columns"], json!(["channel", "added"]));
        assert_eq!(q["limit"], 100);
    }

    #[test]
    fn test_min_time_emits_time_boundary() {
        let r = RemoteDataset::new("druid", "wikipedia")
            .with_attributes(vec![AttributeInfo::new("__time", AttributeType::Time)]);
        let v = r
            .add_operation(&ChainOp::Min(Box::new(Expression::reference_typed(
                "__time",
                AttributeType::Time,
            ))))
            .unwrap();
        let q = emit(&v, V).unwrap();
        assert_eq!(q["queryType"], "timeBoundary");
        assert_eq!(q["bound"], "minTime");
    }

    #[test]
    fn test_timeseries_rows_inflate_bucket_key() {
        let r = wiki();
        let split = r
            .add_operation(&ChainOp::Split {
                keys: vec![SplitKey {
                    name: "Hour".into(),
                    expression: Box::new(
                        Expression::reference_typed("__time", AttributeType::Time)
                            .time_bucket(Duration::parse("PT1H").unwrap())
                            .unwrap(),
                    ),
                }],
                data_name: "wiki".into(),
            })
            .unwrap()
            .add_operation(&ChainOp::Apply {
                name: "Count".into(),
                expression: Box::new(
                    Expression::reference_typed(
                        "wiki",
                        AttributeType::Dataset(r.raw_dataset_type()),
                    )
                    .count()
                    .unwrap(),
                ),
            })
            .unwrap();
        let response = json!([
            { "timestamp": "2015-03-13T07:00:00.000Z", "result": { "Count": 4 } },
        ]);
        let ds = normalize(&split, &response).unwrap();
        assert_eq!(ds.len(), 1);
        match ds.rows[0].get("Hour") {
            Some(Datum::TimeRange(tr)) => {
                assert_eq!(tr.start, Some("2015-03-13T07:00:00Z".parse().unwrap()));
                assert_eq!(tr.end, Some("2015-03-13T08:00:00Z".parse().unwrap()));
            }
            other => panic!("expected a time range key, got {:?}", other),
        }
        assert_eq!(ds.rows[0].get("Count"), Some(&Datum::Number(4.0)));
    }

    #[test]
    fn test_empty_total_response_yields_zero_row() {
        let total = {
            let count = wiki().add_operation(&ChainOp::Count).unwrap();
            RemoteDataset::total_from_apply(
                "Count",
                &Expression::literal(Datum::Remote(std::sync::Arc::new(count))),
            )
            .unwrap()
        };
        let ds = normalize(&total, &json!([])).unwrap();
        assert_eq!(ds.len(), 1);
        assert_eq!(ds.rows[0].get("Count"), Some(&Datum::Number(0.0)));
    }
}
