//! Plan decomposition shortcuts.
//!
//! Two query shapes no single backend pass can answer are rewritten into a
//! pair of sibling plans plus a merge step:
//!
//! * **Time comparison** — every aggregate is pinned to one of two
//!   equal-length windows. Each window becomes its own plan; the earlier
//!   plan's time key is shifted onto the later timeline and the results
//!   join on the keys.
//! * **Top-N waterfall** — a sorted-and-limited split joined against an
//!   unlimited split on the same key. The first plan runs alone; its
//!   winning keys constrain the second, which then left-joins back.
//!
//! Final ordering is stripped from the physical plans and re-applied in
//! memory after the merge.

use crate::expressions::{ChainOp, Expression};
use crate::remote::{
    MergeStrategy, NamedExpr, QueryMode, RemoteDataset, SortSpec, WATERFALL_KEY_CAP,
};
use crate::types::AttributeType;
use crate::values::{Datum, Duration, TimeRange};

/// Attempt the waterfall (or plain same-key join) shortcut for
/// `left.join(right)`.
pub(crate) fn join_shortcut(
    left: &RemoteDataset,
    arg: &Expression,
) -> Option<RemoteDataset> {
    let right = arg.as_remote()?;
    if left.engine != right.engine
        || left.source != right.source
        || !left.delegates.is_empty()
        || !right.delegates.is_empty()
    {
        return None;
    }
    let (l_keys, l_applies, l_having, l_sort, l_limit) = split_parts(left)?;
    let (r_keys, r_applies, r_having, r_sort, r_limit) = split_parts(right)?;
    if l_keys != r_keys || l_having.is_some() || r_having.is_some() {
        return None;
    }
    if l_applies
        .iter()
        .any(|a| r_applies.iter().any(|b| a.name == b.name))
    {
        return None;
    }

    let mut merged = left.clone();
    let mut applies = l_applies.to_vec();
    applies.extend(r_applies.iter().cloned());

    match (l_sort, l_limit, r_sort, r_limit) {
        // top-N waterfall: first plan picks the keys, second fills in
        (Some(_), Some(limit), None, None) if l_keys.len() == 1 => {
            if *limit > WATERFALL_KEY_CAP {
                return None;
            }
            set_split_applies(&mut merged, applies);
            merged.delegates = vec![left.clone(), right.as_ref().clone()];
            merged.merge = Some(MergeStrategy::Waterfall {
                key: l_keys[0].name.clone(),
                key_expression: l_keys[0].expression.clone(),
                cap: WATERFALL_KEY_CAP,
            });
            Some(merged)
        }
        // same grouping, no ordering on either side: plain full join
        (None, None, None, None) => {
            set_split_applies(&mut merged, applies);
            merged.delegates = vec![left.clone(), right.as_ref().clone()];
            merged.merge = Some(MergeStrategy::Join {
                keys: l_keys.iter().map(|k| k.name.clone()).collect(),
                keep_unmatched: true,
            });
            Some(merged)
        }
        _ => None,
    }
}

type SplitParts<'a> = (
    &'a [NamedExpr],
    &'a [NamedExpr],
    &'a Option<Expression>,
    &'a Option<SortSpec>,
    &'a Option<usize>,
);

fn split_parts(r: &RemoteDataset) -> Option<SplitParts<'_>> {
    match &r.mode {
        QueryMode::Split {
            keys,
            applies,
            having,
            sort,
            limit,
            ..
        } => Some((keys, applies, having, sort, limit)),
        _ => None,
    }
}

fn set_split_applies(r: &mut RemoteDataset, new_applies: Vec<NamedExpr>) {
    if let QueryMode::Split { applies, .. } = &mut r.mode {
        *applies = new_applies;
    }
}

/// Detect and perform the time-comparison decomposition. Consulted once at
/// plan finalization; `None` means the plan runs as-is.
pub fn time_compare(remote: &RemoteDataset) -> Option<RemoteDataset> {
    if !remote.delegates.is_empty() {
        return None;
    }
    let (keys, applies, sort, limit) = match &remote.mode {
        QueryMode::Total { applies } => (Vec::new(), applies.clone(), None, None),
        QueryMode::Split {
            keys,
            applies,
            having: None,
            sort,
            limit,
            ..
        } => (keys.clone(), applies.clone(), sort.clone(), *limit),
        _ => return None,
    };
    let applies = applies.as_slice();
    let keys = keys.as_slice();
    if applies.is_empty() {
        return None;
    }

    // Every apply must aggregate over exactly one pinned window.
    let mut windows: Vec<(String, TimeRange)> = Vec::new();
    let mut apply_windows: Vec<usize> = Vec::new();
    for apply in applies {
        let (attr, range) = apply_window(&apply.expression)?;
        let idx = match windows.iter().position(|(a, r)| *a == attr && *r == range) {
            Some(i) => i,
            None => {
                windows.push((attr, range));
                windows.len() - 1
            }
        };
        apply_windows.push(idx);
    }
    if windows.len() != 2 || windows[0].0 != windows[1].0 {
        return None;
    }
    let attr = windows[0].0.clone();
    let (r0, r1) = (&windows[0].1, &windows[1].1);
    if !r0.is_bounded() || !r1.is_bounded() || r0.duration_millis() != r1.duration_millis() {
        return None;
    }

    // Later window is the main timeline; the earlier one shifts onto it.
    let (main_idx, prev_idx) = if r0.start > r1.start { (0, 1) } else { (1, 0) };
    let main = windows[main_idx].1.clone();
    let prev = windows[prev_idx].1.clone();
    let delta_millis = main.start?.timestamp_millis() - prev.start?.timestamp_millis();
    let shift = whole_second_duration(delta_millis)?;

    // At most one key may bucket the comparison attribute.
    let mut time_key: Option<(usize, Duration)> = None;
    for (i, key) in keys.iter().enumerate() {
        match bucket_of(&key.expression, &attr) {
            Some(d) => {
                if time_key.is_some() {
                    return None;
                }
                time_key = Some((i, d));
            }
            None if key.expression.free_references().iter().any(|r| *r == attr) => {
                return None
            }
            None => {}
        }
    }

    let build = |window: &TimeRange, shifted: bool| -> Option<RemoteDataset> {
        let mut d = remote.clone();
        let window_term = Expression::reference_typed(&attr, AttributeType::Time)
            .in_(Expression::literal(Datum::TimeRange(window.clone())))
            .ok()?;
        d.filter = if d.filter.is_literal_true() {
            window_term
        } else {
            d.filter.and(window_term).ok()?
        };
        let stripped: Vec<NamedExpr> = applies
            .iter()
            .zip(&apply_windows)
            .filter(|(_, w)| {
                let want = if shifted { prev_idx } else { main_idx };
                **w == want
            })
            .map(|(a, _)| {
                Some(NamedExpr::new(&a.name, strip_window(&a.expression)?))
            })
            .collect::<Option<Vec<_>>>()?;
        let mut new_keys = keys.to_vec();
        if shifted {
            if let Some((i, duration)) = &time_key {
                let shifted_expr = Expression::reference_typed(&attr, AttributeType::Time)
                    .time_shift(shift, 1)
                    .ok()?
                    .time_bucket(*duration)
                    .ok()?;
                new_keys[*i] = NamedExpr::new(&new_keys[*i].name, shifted_expr);
            }
        }
        d.mode = match &remote.mode {
            QueryMode::Total { .. } => QueryMode::Total { applies: stripped },
            QueryMode::Split { data_name, .. } => QueryMode::Split {
                keys: new_keys,
                data_name: data_name.clone(),
                applies: stripped,
                having: None,
                sort: None,
                limit: None,
            },
            _ => return None,
        };
        Some(d)
    };

    let main_plan = build(&main, false)?;
    let prev_plan = build(&prev, true)?;

    // An immediately-preceding window can never contribute keys the main
    // window misses entirely, so the join stays left-only.
    let adjacent = prev.end == main.start;
    tracing::debug!(
        source = %remote.source,
        attr = %attr,
        shift = %shift,
        adjacent,
        "time-compare decomposition"
    );

    let mut out = remote.clone();
    out.delegates = vec![main_plan, prev_plan];
    out.merge = Some(MergeStrategy::Join {
        keys: keys.iter().map(|k| k.name.clone()).collect(),
        keep_unmatched: !adjacent,
    });
    out.finalize_sort = sort;
    out.finalize_limit = limit;
    if let QueryMode::Split { sort, limit, .. } = &mut out.mode {
        *sort = None;
        *limit = None;
    }
    Some(out)
}

fn whole_second_duration(delta_millis: i64) -> Option<Duration> {
    if delta_millis <= 0 || delta_millis % 1000 != 0 {
        return None;
    }
    let seconds = u32::try_from(delta_millis / 1000).ok()?;
    Some(Duration {
        years: 0,
        months: 0,
        weeks: 0,
        days: 0,
        hours: 0,
        minutes: 0,
        seconds,
    })
}

/// `$attr.timeBucket(d)` (or `timeFloor`) yields the bucket duration.
fn bucket_of(key: &Expression, attr: &str) -> Option<Duration> {
    let c = key.as_chain()?;
    let r = c.operand.as_ref_expr()?;
    if r.name != attr {
        return None;
    }
    match &c.op {
        ChainOp::TimeBucket { duration } | ChainOp::TimeFloor { duration } => Some(*duration),
        _ => None,
    }
}

/// `$t.in(<time range literal>)` over the comparison attribute.
fn window_term(e: &Expression) -> Option<(String, TimeRange)> {
    let c = e.as_chain()?;
    let r = c.operand.as_ref_expr()?;
    if r.ty != AttributeType::Time {
        return None;
    }
    let arg = match &c.op {
        ChainOp::In(a) | ChainOp::Overlap(a) => a,
        _ => return None,
    };
    match arg.as_literal()? {
        Datum::TimeRange(range) => Some((r.name.clone(), range.clone())),
        _ => None,
    }
}

/// The window a segment filter pins, plus whatever else it constrains.
fn filter_window(p: &Expression) -> Option<(String, TimeRange, Option<Expression>)> {
    if let Some((attr, range)) = window_term(p) {
        return Some((attr, range, None));
    }
    let c = p.as_chain()?;
    if let ChainOp::And(arg) = &c.op {
        if let Some((attr, range)) = window_term(&c.operand) {
            return Some((attr, range, Some((**arg).clone())));
        }
        if let Some((attr, range)) = window_term(arg) {
            return Some((attr, range, Some((*c.operand).clone())));
        }
    }
    None
}

/// The single window an apply expression aggregates over: every aggregate
/// inside it must be filtered to the same pinned range.
fn apply_window(e: &Expression) -> Option<(String, TimeRange)> {
    let mut found: Option<(String, TimeRange)> = None;
    if scan_windows(e, &mut found) {
        found
    } else {
        None
    }
}

fn scan_windows(e: &Expression, found: &mut Option<(String, TimeRange)>) -> bool {
    match e {
        Expression::Ref(_) | Expression::Literal(_) => true,
        Expression::Chain(c) => {
            if c.op.is_aggregate() {
                let fc = match c.operand.as_chain() {
                    Some(fc) => fc,
                    None => return false, // unwindowed aggregate
                };
                let pred = match &fc.op {
                    ChainOp::Filter(p) => p,
                    _ => return false,
                };
                let (attr, range, _) = match filter_window(pred) {
                    Some(w) => w,
                    None => return false,
                };
                return match found {
                    Some((a, r)) => *a == attr && *r == range,
                    None => {
                        *found = Some((attr, range));
                        true
                    }
                };
            }
            if !scan_windows(&c.operand, found) {
                return false;
            }
            match c.op.argument() {
                Some(arg) => scan_windows(arg, found),
                None => true,
            }
        }
    }
}

/// Remove the window term from every aggregate's segment filter; the
/// delegate's base filter carries the window instead.
fn strip_window(e: &Expression) -> Option<Expression> {
    match e {
        Expression::Ref(_) | Expression::Literal(_) => Some(e.clone()),
        Expression::Chain(c) => {
            if c.op.is_aggregate() {
                let fc = c.operand.as_chain()?;
                let pred = match &fc.op {
                    ChainOp::Filter(p) => p,
                    _ => return None,
                };
                let (_, _, residual) = filter_window(pred)?;
                let base = match residual {
                    Some(rest) => (*fc.operand).clone().filter(rest).ok()?,
                    None => (*fc.operand).clone(),
                };
                return base.chain(c.op.clone()).ok();
            }
            let operand = strip_window(&c.operand)?;
            let op = match c.op.argument() {
                Some(arg) => {
                    let stripped = strip_window(arg)?;
                    rebuild_with_argument(&c.op, stripped)
                }
                None => c.op.clone(),
            };
            operand.chain(op).ok()
        }
    }
}

fn rebuild_with_argument(op: &ChainOp, arg: Expression) -> ChainOp {
    crate::remote::replace_argument(op, arg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expressions::{Direction, SplitKey};
    use crate::types::{AttributeInfo, AttributeType};
    use crate::values::Datum;

    fn base() -> RemoteDataset {
        RemoteDataset::new("druid", "wikipedia").with_attributes(vec![
            AttributeInfo::new("__time", AttributeType::Time),
            AttributeInfo::new("channel", AttributeType::String),
            AttributeInfo::new("added", AttributeType::Number),
        ])
    }

    fn window(start: &str, end: &str) -> TimeRange {
        TimeRange::new(start.parse().unwrap(), end.parse().unwrap())
    }

    fn windowed_sum(r: &RemoteDataset, w: &TimeRange) -> Expression {
        r.segment_reference()
            .filter(
                Expression::reference_typed("__time", AttributeType::Time)
                    .in_(Expression::literal(Datum::TimeRange(w.clone())))
                    .unwrap(),
            )
            .unwrap()
            .sum(Expression::reference_typed("added", AttributeType::Number))
            .unwrap()
    }

    fn comparison_total(r: &RemoteDataset, current: &TimeRange, previous: &TimeRange) -> RemoteDataset {
        let mut total = r.clone();
        total.mode = QueryMode::Total {
            applies: vec![
                NamedExpr::new("Current", windowed_sum(r, current)),
                NamedExpr::new("Previous", windowed_sum(r, previous)),
            ],
        };
        total
    }

    #[test]
    fn test_adjacent_windows_decompose_to_left_join() {
        let r = base();
        let current = window("2015-03-13T00:00:00Z", "2015-03-14T00:00:00Z");
        let previous = window("2015-03-12T00:00:00Z", "2015-03-13T00:00:00Z");
        let out = time_compare(&comparison_total(&r, &current, &previous)).unwrap();

        assert_eq!(out.delegates.len(), 2);
        match &out.merge {
            Some(MergeStrategy::Join { keep_unmatched, .. }) => assert!(!keep_unmatched),
            other => panic!("expected a join merge, got {:?}", other),
        }
        // each delegate carries its own window in the base filter and an
        // unfiltered aggregate
        for d in &out.delegates {
            assert!(!d.filter.is_literal_true());
            match &d.mode {
                QueryMode::Total { applies } => {
                    assert_eq!(applies.len(), 1);
                    let agg = applies[0].expression.as_chain().unwrap();
                    assert!(agg.operand.as_ref_expr().is_some());
                }
                other => panic!("expected totals, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_disjoint_windows_decompose_to_full_join() {
        let r = base();
        let current = window("2015-03-13T00:00:00Z", "2015-03-14T00:00:00Z");
        let previous = window("2015-03-06T00:00:00Z", "2015-03-07T00:00:00Z");
        let out = time_compare(&comparison_total(&r, &current, &previous)).unwrap();
        match &out.merge {
            Some(MergeStrategy::Join { keep_unmatched, .. }) => assert!(keep_unmatched),
            other => panic!("expected a join merge, got {:?}", other),
        }
    }

    #[test]
    fn test_unequal_windows_do_not_decompose() {
        let r = base();
        let current = window("2015-03-13T00:00:00Z", "2015-03-14T00:00:00Z");
        let previous = window("2015-03-10T00:00:00Z", "2015-03-13T00:00:00Z");
        assert!(time_compare(&comparison_total(&r, &current, &previous)).is_none());
    }

    #[test]
    fn test_split_time_key_shifts_in_previous_plan() {
        let r = base();
        let current = window("2015-03-13T00:00:00Z", "2015-03-14T00:00:00Z");
        let previous = window("2015-03-12T00:00:00Z", "2015-03-13T00:00:00Z");
        let hour = Duration::parse("PT1H").unwrap();

        let mut split = r.clone();
        split.mode = QueryMode::Split {
            keys: vec![NamedExpr::new(
                "Hour",
                Expression::reference_typed("__time", AttributeType::Time)
                    .time_bucket(hour)
                    .unwrap(),
            )],
            data_name: "wiki".into(),
            applies: vec![
                NamedExpr::new("Current", windowed_sum(&r, &current)),
                NamedExpr::new("Previous", windowed_sum(&r, &previous)),
            ],
            having: None,
            sort: None,
            limit: None,
        };
        let out = time_compare(&split).unwrap();
        let prev_plan = &out.delegates[1];
        match &prev_plan.mode {
            QueryMode::Split { keys, .. } => {
                let key = keys[0].expression.as_chain().unwrap();
                assert!(matches!(key.op, ChainOp::TimeBucket { .. }));
                let shifted = key.operand.as_chain().unwrap();
                assert!(matches!(shifted.op, ChainOp::TimeShift { .. }));
            }
            other => panic!("expected a split plan, got {:?}", other),
        }
    }

    #[test]
    fn test_merged_plan_keeps_limit_ahead_of_a_late_sort() {
        let r = base();
        let current = window("2015-03-13T00:00:00Z", "2015-03-14T00:00:00Z");
        let previous = window("2015-03-12T00:00:00Z", "2015-03-13T00:00:00Z");

        let mut split = r.clone();
        split.mode = QueryMode::Split {
            keys: vec![NamedExpr::new(
                "Channel",
                Expression::reference_typed("channel", AttributeType::String),
            )],
            data_name: "wiki".into(),
            applies: vec![
                NamedExpr::new("Current", windowed_sum(&r, &current)),
                NamedExpr::new("Previous", windowed_sum(&r, &previous)),
            ],
            having: None,
            sort: None,
            limit: None,
        };
        let out = time_compare(&split).unwrap();

        let sort = ChainOp::Sort {
            expression: Box::new(Expression::reference_typed(
                "Current",
                AttributeType::Number,
            )),
            direction: Direction::Descending,
        };

        // sort before limit: both land on the merge step
        let shaped = out
            .add_operation(&sort)
            .unwrap()
            .add_operation(&ChainOp::Limit(5))
            .unwrap();
        assert!(shaped.finalize_sort.is_some());
        assert_eq!(shaped.finalize_limit, Some(5));

        // once the limit is taken, a later ordering must stay outside
        let limited = out.add_operation(&ChainOp::Limit(5)).unwrap();
        assert_eq!(limited.finalize_limit, Some(5));
        assert!(limited.add_operation(&sort).is_none());
    }

    #[test]
    fn test_waterfall_shortcut() {
        let r = base();
        let key = SplitKey {
            name: "Channel".into(),
            expression: Box::new(Expression::reference_typed(
                "channel",
                AttributeType::String,
            )),
        };
        let first = r
            .add_operation(&ChainOp::Split {
                keys: vec![key.clone()],
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
        let second = r
            .add_operation(&ChainOp::Split {
                keys: vec![key],
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

        let joined = first
            .add_operation(&ChainOp::Join(Box::new(Expression::literal(
                Datum::Remote(std::sync::Arc::new(second)),
            ))))
            .unwrap();
        assert_eq!(joined.delegates.len(), 2);
        match &joined.merge {
            Some(MergeStrategy::Waterfall { key, cap, .. }) => {
                assert_eq!(key, "Channel");
                assert_eq!(*cap, WATERFALL_KEY_CAP);
            }
            other => panic!("expected a waterfall merge, got {:?}", other),
        }
        match &joined.mode {
            QueryMode::Split { applies, .. } => assert_eq!(applies.len(), 2),
            other => panic!("expected a split plan, got {:?}", other),
        }
    }
}
