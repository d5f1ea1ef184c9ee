//! In-memory materialized datasets.
//!
//! Used for literal results (so the simplifier can evaluate pending
//! aggregates directly), for simulation output, and as the merge substrate
//! when a decomposed plan joins two physical results.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde_json::Value as Json;

use crate::error::{Error, Result};
use crate::values::Datum;

pub type Row = BTreeMap<String, Datum>;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Dataset {
    pub rows: Vec<Row>,
}

impl Dataset {
    pub fn new(rows: Vec<Row>) -> Dataset {
        Dataset { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn count(&self) -> f64 {
        self.rows.len() as f64
    }

    /// Sum of `eval` over all rows; null row values contribute nothing.
    pub fn sum(&self, eval: &dyn Fn(&Row) -> Result<Datum>) -> Result<f64> {
        let mut total = 0.0;
        for row in &self.rows {
            if let Datum::Number(n) = eval(row)? {
                total += n;
            }
        }
        Ok(total)
    }

    pub fn min(&self, eval: &dyn Fn(&Row) -> Result<Datum>) -> Result<Datum> {
        self.fold_extreme(eval, Ordering::Less)
    }

    pub fn max(&self, eval: &dyn Fn(&Row) -> Result<Datum>) -> Result<Datum> {
        self.fold_extreme(eval, Ordering::Greater)
    }

    fn fold_extreme(
        &self,
        eval: &dyn Fn(&Row) -> Result<Datum>,
        keep: Ordering,
    ) -> Result<Datum> {
        let mut best: Option<Datum> = None;
        for row in &self.rows {
            let v = eval(row)?;
            if matches!(v, Datum::Null) {
                continue;
            }
            best = Some(match best {
                None => v,
                Some(b) => {
                    if compare_scalars(&v, &b) == keep {
                        v
                    } else {
                        b
                    }
                }
            });
        }
        Ok(best.unwrap_or(Datum::Null))
    }

    pub fn average(&self, eval: &dyn Fn(&Row) -> Result<Datum>) -> Result<Datum> {
        let mut total = 0.0;
        let mut count = 0usize;
        for row in &self.rows {
            if let Datum::Number(n) = eval(row)? {
                total += n;
                count += 1;
            }
        }
        if count == 0 {
            Ok(Datum::Null)
        } else {
            Ok(Datum::Number(total / count as f64))
        }
    }

    pub fn count_distinct(&self, eval: &dyn Fn(&Row) -> Result<Datum>) -> Result<f64> {
        let mut seen: Vec<Datum> = Vec::new();
        for row in &self.rows {
            let v = eval(row)?;
            if matches!(v, Datum::Null) {
                continue;
            }
            if !seen.contains(&v) {
                seen.push(v);
            }
        }
        Ok(seen.len() as f64)
    }

    /// Nearest-rank quantile over the numeric values of `eval`.
    pub fn quantile(&self, eval: &dyn Fn(&Row) -> Result<Datum>, q: f64) -> Result<Datum> {
        let mut values = Vec::new();
        for row in &self.rows {
            if let Datum::Number(n) = eval(row)? {
                values.push(n);
            }
        }
        if values.is_empty() {
            return Ok(Datum::Null);
        }
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
        let rank = ((values.len() as f64 * q).ceil() as usize).clamp(1, values.len());
        Ok(Datum::Number(values[rank - 1]))
    }

    pub fn filter(&self, keep: &dyn Fn(&Row) -> Result<bool>) -> Result<Dataset> {
        let mut rows = Vec::new();
        for row in &self.rows {
            if keep(row)? {
                rows.push(row.clone());
            }
        }
        Ok(Dataset::new(rows))
    }

    pub fn sort_by_column(&self, column: &str, descending: bool) -> Dataset {
        let mut rows = self.rows.clone();
        rows.sort_by(|a, b| {
            let av = a.get(column).unwrap_or(&Datum::Null);
            let bv = b.get(column).unwrap_or(&Datum::Null);
            let ord = compare_scalars(av, bv);
            if descending {
                ord.reverse()
            } else {
                ord
            }
        });
        Dataset::new(rows)
    }

    pub fn limit(&self, n: usize) -> Dataset {
        Dataset::new(self.rows.iter().take(n).cloned().collect())
    }

    pub fn select(&self, names: &[String]) -> Dataset {
        let rows = self
            .rows
            .iter()
            .map(|row| {
                row.iter()
                    .filter(|(k, _)| names.iter().any(|n| n == *k))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .collect();
        Dataset::new(rows)
    }

    pub fn column(&self, name: &str) -> Vec<Datum> {
        self.rows
            .iter()
            .map(|r| r.get(name).cloned().unwrap_or(Datum::Null))
            .collect()
    }

    /// Join on equality of the `keys` tuple. Rows of `self` are kept in
    /// order; `keep_unmatched_right` turns the left join into a full join.
    pub fn join_on(
        &self,
        other: &Dataset,
        keys: &[String],
        keep_unmatched_right: bool,
    ) -> Dataset {
        let key_of = |row: &Row| -> Vec<Datum> {
            keys.iter()
                .map(|k| row.get(k).cloned().unwrap_or(Datum::Null))
                .collect()
        };
        let mut rows = Vec::new();
        let mut matched_right = vec![false; other.rows.len()];
        for left in &self.rows {
            let lk = key_of(left);
            let mut merged = left.clone();
            for (i, right) in other.rows.iter().enumerate() {
                if key_of(right) == lk {
                    matched_right[i] = true;
                    for (k, v) in right {
                        merged.entry(k.clone()).or_insert_with(|| v.clone());
                    }
                    break;
                }
            }
            rows.push(merged);
        }
        if keep_unmatched_right {
            for (i, right) in other.rows.iter().enumerate() {
                if !matched_right[i] {
                    rows.push(right.clone());
                }
            }
        }
        Dataset::new(rows)
    }

    pub fn to_js(&self) -> Json {
        Json::Array(
            self.rows
                .iter()
                .map(|row| {
                    Json::Object(
                        row.iter()
                            .map(|(k, v)| (k.clone(), v.to_js()))
                            .collect(),
                    )
                })
                .collect(),
        )
    }
}

/// Total order over comparable scalar datums; incomparable kinds sort by
/// type tag so sorting stays deterministic.
pub fn compare_scalars(a: &Datum, b: &Datum) -> Ordering {
    match (a, b) {
        (Datum::Null, Datum::Null) => Ordering::Equal,
        (Datum::Null, _) => Ordering::Less,
        (_, Datum::Null) => Ordering::Greater,
        (Datum::Number(x), Datum::Number(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        (Datum::String(x), Datum::String(y)) => x.cmp(y),
        (Datum::Bool(x), Datum::Bool(y)) => x.cmp(y),
        (Datum::Time(x), Datum::Time(y)) => x.cmp(y),
        (Datum::TimeRange(x), Datum::TimeRange(y)) => x.start.cmp(&y.start),
        (Datum::NumberRange(x), Datum::NumberRange(y)) => {
            x.start.partial_cmp(&y.start).unwrap_or(Ordering::Equal)
        }
        _ => a.attribute_type().tag().cmp(&b.attribute_type().tag()),
    }
}

/// The zero-row fallback for an empty aggregate result: counts are zero,
/// everything else is null.
pub fn zero_row(aggregate_names: &[(String, bool)]) -> Row {
    aggregate_names
        .iter()
        .map(|(name, is_count)| {
            let v = if *is_count {
                Datum::Number(0.0)
            } else {
                Datum::Null
            };
            (name.clone(), v)
        })
        .collect()
}

impl Dataset {
    pub fn from_js(value: &Json) -> Result<Dataset> {
        let arr = value
            .as_array()
            .ok_or_else(|| Error::construction("dataset literal must be an array"))?;
        let mut rows = Vec::with_capacity(arr.len());
        for item in arr {
            let obj = item
                .as_object()
                .ok_or_else(|| Error::construction("dataset row must be an object"))?;
            let mut row = Row::new();
            for (k, v) in obj {
                row.insert(k.clone(), Datum::from_js_untyped(v)?);
            }
            rows.push(row);
        }
        Ok(Dataset::new(rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: Vec<(&str, Datum)>) -> Row {
        pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    fn sample() -> Dataset {
        Dataset::new(vec![
            row(vec![
                ("channel", Datum::String("en".into())),
                ("added", Datum::Number(10.0)),
            ]),
            row(vec![
                ("channel", Datum::String("de".into())),
                ("added", Datum::Number(4.0)),
            ]),
            row(vec![
                ("channel", Datum::String("en".into())),
                ("added", Datum::Number(6.0)),
            ]),
        ])
    }

    #[test]
    fn test_aggregates() {
        let ds = sample();
        let added = |r: &Row| Ok(r.get("added").cloned().unwrap_or(Datum::Null));
        let channel = |r: &Row| Ok(r.get("channel").cloned().unwrap_or(Datum::Null));
        assert_eq!(ds.count(), 3.0);
        assert_eq!(ds.sum(&added).unwrap(), 20.0);
        assert_eq!(ds.min(&added).unwrap(), Datum::Number(4.0));
        assert_eq!(ds.max(&added).unwrap(), Datum::Number(10.0));
        assert_eq!(ds.count_distinct(&channel).unwrap(), 2.0);
        assert_eq!(
            ds.average(&added).unwrap(),
            Datum::Number(20.0 / 3.0)
        );
    }

    #[test]
    fn test_sort_limit_select() {
        let ds = sample().sort_by_column("added", true).limit(2);
        assert_eq!(ds.rows[0].get("added"), Some(&Datum::Number(10.0)));
        assert_eq!(ds.len(), 2);
        let narrowed = ds.select(&["channel".to_string()]);
        assert!(narrowed.rows[0].get("added").is_none());
    }

    #[test]
    fn test_join_on() {
        let left = Dataset::new(vec![
            row(vec![("k", Datum::String("a".into())), ("x", Datum::Number(1.0))]),
            row(vec![("k", Datum::String("b".into())), ("x", Datum::Number(2.0))]),
        ]);
        let right = Dataset::new(vec![
            row(vec![("k", Datum::String("b".into())), ("y", Datum::Number(20.0))]),
            row(vec![("k", Datum::String("c".into())), ("y", Datum::Number(30.0))]),
        ]);
        let keys = vec!["k".to_string()];

        let lj = left.join_on(&right, &keys, false);
        assert_eq!(lj.len(), 2);
        assert_eq!(lj.rows[1].get("y"), Some(&Datum::Number(20.0)));
        assert!(lj.rows[0].get("y").is_none());

        let fj = left.join_on(&right, &keys, true);
        assert_eq!(fj.len(), 3);
        assert_eq!(fj.rows[2].get("k"), Some(&Datum::String("c".into())));
    }
}
