//! Query execution.
//!
//! The compiler side of the crate turns an expression into one or more
//! leaf plans; this module drives them against a [`Requester`], merges
//! delegate results, substitutes them back into the expression, and
//! re-simplifies until the expression collapses into a plain value.
//!
//! [`SimulationRequester`] answers every query with placeholder values so
//! a pipeline can be exercised end to end without an engine: numbers are
//! 4, strings are `"some_string"`, times are 2015-03-14.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value as Json};
use tokio::sync::mpsc;

use crate::backends::{self, EngineRegistry, InflateKind, QueryPayload, SqlQuery};
use crate::error::{Error, Result};
use crate::expressions::Expression;
use crate::remote::{
    collect_remotes, decompose, MergeStrategy, QueryMode, RemoteDataset, VALUE_NAME,
};
use crate::values::{Dataset, Datum, Row, Set};

/// Sends a compiled payload to the engine it names and returns the raw
/// JSON response.
#[async_trait]
pub trait Requester: Send + Sync {
    async fn query(&self, engine: &str, payload: &QueryPayload) -> Result<Json>;
}

/// Rounds an expression completes: each pass runs the first outstanding
/// plan and substitutes its result. Two plans only ever arise from
/// decomposition, which nests them as delegates of one plan, so in
/// practice one round suffices; the bound guards against a substitution
/// that fails to make progress.
const MAX_ROUNDS: usize = 64;

pub async fn execute(
    expression: &Expression,
    registry: &EngineRegistry,
    requester: &dyn Requester,
) -> Result<Datum> {
    let mut current = expression.simplify()?;
    for _ in 0..MAX_ROUNDS {
        let remotes = collect_remotes(&current);
        let Some(target) = remotes.into_iter().next() else {
            return current
                .as_literal()
                .cloned()
                .ok_or_else(|| Error::construction("expression did not resolve to a value"));
        };
        let data = run_plan(&target, registry, requester).await?;
        let result = plan_result(&target, data);
        current = current
            .substitute(&|e, _| {
                Ok(match e.as_literal() {
                    Some(Datum::Remote(r)) if Arc::ptr_eq(r, &target) => {
                        Some(Expression::literal(result.clone()))
                    }
                    _ => None,
                })
            })?
            .simplify()?;
    }
    Err(Error::Transport(
        "expression did not converge".to_string(),
    ))
}

fn plan_result(remote: &RemoteDataset, data: Dataset) -> Datum {
    match &remote.mode {
        QueryMode::Value { .. } => data
            .rows
            .first()
            .and_then(|row| row.get(VALUE_NAME).cloned())
            .unwrap_or(Datum::Null),
        _ => Datum::Dataset(Arc::new(data)),
    }
}

async fn run_plan(
    remote: &RemoteDataset,
    registry: &EngineRegistry,
    requester: &dyn Requester,
) -> Result<Dataset> {
    // Last chance to split the plan before it hits the wire.
    let plan = decompose::time_compare(remote).unwrap_or_else(|| remote.clone());

    let mut data = if plan.delegates.is_empty() {
        run_single(&plan, registry, requester).await?
    } else {
        match &plan.merge {
            Some(MergeStrategy::Join {
                keys,
                keep_unmatched,
            }) => {
                let (left, right) = tokio::join!(
                    run_single(&plan.delegates[0], registry, requester),
                    run_single(&plan.delegates[1], registry, requester),
                );
                left?.join_on(&right?, keys, *keep_unmatched)
            }
            Some(MergeStrategy::Waterfall {
                key,
                key_expression,
                cap,
            }) => {
                let first = run_single(&plan.delegates[0], registry, requester).await?;
                let winners: Vec<Datum> = first
                    .column(key)
                    .into_iter()
                    .filter(|d| *d != Datum::Null)
                    .take(*cap)
                    .collect();
                let set = Set::new(key_expression.output_type(), winners)?;
                let mut second = plan.delegates[1].clone();
                let narrowed = key_expression
                    .clone()
                    .in_(Expression::literal(Datum::Set(set)))?;
                second.filter = second.filter.clone().and(narrowed)?.simplify()?;
                let second = run_single(&second, registry, requester).await?;
                first.join_on(&second, std::slice::from_ref(key), false)
            }
            None => {
                return Err(Error::construction(
                    "plan has delegates but no merge strategy",
                ))
            }
        }
    };

    if let Some(s) = &plan.finalize_sort {
        let name = s
            .expression
            .as_ref_expr()
            .map(|r| r.name.clone())
            .ok_or_else(|| Error::construction("finalize sort must be on a named column"))?;
        data = data.sort_by_column(&name, s.direction == crate::expressions::Direction::Descending);
    }
    if let Some(n) = plan.finalize_limit {
        data = data.limit(n);
    }
    Ok(data)
}

async fn run_single(
    remote: &RemoteDataset,
    registry: &EngineRegistry,
    requester: &dyn Requester,
) -> Result<Dataset> {
    let payload = backends::compile(remote, registry)?;
    tracing::debug!(
        engine = %remote.engine,
        source = %remote.source,
        "dispatching query"
    );
    let response = requester.query(&remote.engine, &payload).await?;
    backends::normalize(remote, &payload, &response)
}

/// Deliver a result set row by row over a bounded channel. The producer
/// blocks once the consumer falls `capacity` rows behind.
pub fn row_stream(dataset: Dataset, capacity: usize) -> mpsc::Receiver<Row> {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    tokio::spawn(async move {
        for row in dataset.rows {
            if tx.send(row).await.is_err() {
                break;
            }
        }
    });
    rx
}

// ---- simulation ----

const SIM_TIME: &str = "2015-03-14T00:00:00.000Z";
const SIM_STRING: &str = "some_string";
const SIM_NUMBER: f64 = 4.0;

/// Answers every query with a plausible single-row response matching the
/// payload's shape.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimulationRequester;

#[async_trait]
impl Requester for SimulationRequester {
    async fn query(&self, _engine: &str, payload: &QueryPayload) -> Result<Json> {
        Ok(match payload {
            QueryPayload::Native(q) => native_stub(q),
            QueryPayload::Sql(q) => sql_stub(q),
        })
    }
}

fn native_stub(q: &Json) -> Json {
    match q["queryType"].as_str().unwrap_or("") {
        "timeBoundary" => {
            let bound = q["bound"].as_str().unwrap_or("maxTime");
            let mut result = serde_json::Map::new();
            result.insert(bound.to_string(), json!(SIM_TIME));
            json!([{ "timestamp": SIM_TIME, "result": result }])
        }
        "timeseries" => json!([{ "timestamp": SIM_TIME, "result": metric_stub(q) }]),
        "topN" => {
            let mut row = metric_stub(q);
            if let Some(name) = q["dimension"]["outputName"].as_str() {
                row.insert(name.to_string(), json!(SIM_STRING));
            }
            json!([{ "timestamp": SIM_TIME, "result": [row] }])
        }
        "groupBy" => {
            let mut event = metric_stub(q);
            if let Some(dims) = q["dimensions"].as_array() {
                for d in dims {
                    if let Some(name) = d["outputName"].as_str() {
                        event.insert(name.to_string(), json!(SIM_STRING));
                    }
                }
            }
            json!([{ "version": "v1", "timestamp": SIM_TIME, "event": event }])
        }
        "scan" => {
            let mut event = serde_json::Map::new();
            if let Some(columns) = q["columns"].as_array() {
                for c in columns {
                    if let Some(name) = c.as_str() {
                        event.insert(
                            name.to_string(),
                            if name == "__time" {
                                json!(SIM_TIME)
                            } else {
                                json!(SIM_STRING)
                            },
                        );
                    }
                }
            }
            json!([{ "events": [event] }])
        }
        "segmentMetadata" => json!([{
            "columns": { "__time": { "type": "LONG" } }
        }]),
        _ => json!([]),
    }
}

/// One value per aggregator and post-aggregator named in the payload.
fn metric_stub(q: &Json) -> serde_json::Map<String, Json> {
    let mut row = serde_json::Map::new();
    for section in ["aggregations", "postAggregations"] {
        if let Some(entries) = q[section].as_array() {
            for entry in entries {
                if let Some(name) = entry["name"].as_str() {
                    row.insert(name.to_string(), json!(SIM_NUMBER));
                }
            }
        }
    }
    row
}

fn sql_stub(q: &SqlQuery) -> Json {
    let mut row = serde_json::Map::new();
    for inf in &q.inflation {
        row.insert(
            inf.column.clone(),
            match &inf.kind {
                InflateKind::Boolean => json!(true),
                InflateKind::Number | InflateKind::NumberRange { .. } => json!(SIM_NUMBER),
                InflateKind::String => json!(SIM_STRING),
                InflateKind::Time | InflateKind::TimeRange { .. } => json!(SIM_TIME),
            },
        );
    }
    Json::Array(vec![Json::Object(row)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expressions::{ChainOp, SplitKey};
    use crate::types::{AttributeInfo, AttributeType};
    use crate::values::TimeRange;

    fn wiki(engine: &str) -> Arc<RemoteDataset> {
        let r = RemoteDataset::new(engine, "wikipedia").with_attributes(vec![
            AttributeInfo::new("__time", AttributeType::Time),
            AttributeInfo::new("channel", AttributeType::String),
            AttributeInfo::new("added", AttributeType::Number),
        ]);
        let window = Expression::reference_typed("__time", AttributeType::Time)
            .in_(Expression::literal(Datum::TimeRange(TimeRange::new(
                "2015-03-13T00:00:00Z".parse().unwrap(),
                "2015-03-14T00:00:00Z".parse().unwrap(),
            ))))
            .unwrap();
        Arc::new(r.add_operation(&ChainOp::Filter(Box::new(window))).unwrap())
    }

    #[tokio::test]
    async fn test_simulated_count() {
        let e = Expression::literal(Datum::Remote(wiki("druid")))
            .count()
            .unwrap();
        let registry = EngineRegistry::simulation();
        let out = execute(&e, &registry, &SimulationRequester).await.unwrap();
        assert_eq!(out, Datum::Number(4.0));
    }

    #[tokio::test]
    async fn test_simulated_count_over_sql() {
        let e = Expression::literal(Datum::Remote(wiki("druidsql")))
            .count()
            .unwrap();
        let registry = EngineRegistry::simulation();
        let out = execute(&e, &registry, &SimulationRequester).await.unwrap();
        assert_eq!(out, Datum::Number(4.0));
    }

    #[tokio::test]
    async fn test_simulated_split() {
        let base = wiki("druid");
        let raw_type = base.raw_dataset_type();
        let e = Expression::literal(Datum::Remote(base))
            .chain(ChainOp::Split {
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
            .chain(ChainOp::Apply {
                name: "Added".into(),
                expression: Box::new(
                    Expression::reference_typed("wiki", AttributeType::Dataset(raw_type))
                        .sum(Expression::reference_typed("added", AttributeType::Number))
                        .unwrap(),
                ),
            })
            .unwrap();
        let registry = EngineRegistry::simulation();
        let out = execute(&e, &registry, &SimulationRequester).await.unwrap();
        let Datum::Dataset(ds) = out else {
            panic!("expected a dataset");
        };
        assert_eq!(ds.len(), 1);
        assert_eq!(
            ds.rows[0].get("Channel"),
            Some(&Datum::String("some_string".to_string()))
        );
        assert_eq!(ds.rows[0].get("Added"), Some(&Datum::Number(4.0)));
    }

    #[tokio::test]
    async fn test_row_stream_delivers_in_order() {
        let rows: Vec<Row> = (0..5)
            .map(|i| Row::from([("n".to_string(), Datum::Number(i as f64))]))
            .collect();
        let mut rx = row_stream(Dataset::new(rows), 2);
        let mut seen = Vec::new();
        while let Some(row) = rx.recv().await {
            seen.push(row.get("n").cloned().unwrap());
        }
        assert_eq!(
            seen,
            (0..5).map(|i| Datum::Number(i as f64)).collect::<Vec<_>>()
        );
    }
}
