//! End-to-end pipeline tests
//!
//! Each scenario drives an expression through simplification, watches what
//! the plan compiler absorbs, and checks the emitted query or the executed
//! result.

use std::sync::Arc;

use lattice_core::remote::{decompose, MergeStrategy};
use lattice_core::types::{AttributeInfo, AttributeType, Maker};
use lattice_core::{
    execute, ChainOp, Datum, Direction, EngineRegistry, Expression, NumberRange, QueryMode,
    RemoteDataset, SimulationRequester, TimeRange,
};

fn march(day: u32) -> chrono::DateTime<chrono::Utc> {
    format!("2015-03-{:02}T00:00:00Z", day).parse().unwrap()
}

fn wiki() -> RemoteDataset {
    let r = RemoteDataset::new("druid", "wikipedia").with_attributes(vec![
        AttributeInfo::new("__time", AttributeType::Time),
        AttributeInfo::new("channel", AttributeType::String),
        AttributeInfo::new("added", AttributeType::Number).with_native_type("longSum"),
    ]);
    let window = Expression::reference_typed("__time", AttributeType::Time)
        .in_(Expression::literal(Datum::TimeRange(TimeRange::new(
            march(13),
            march(14),
        ))))
        .unwrap();
    r.add_operation(&ChainOp::Filter(Box::new(window))).unwrap()
}

fn wiki_expr() -> Expression {
    Expression::literal(Datum::Remote(Arc::new(wiki())))
}

fn channel_ref() -> Expression {
    Expression::reference_typed("channel", AttributeType::String)
}

fn added_ref() -> Expression {
    Expression::reference_typed("added", AttributeType::Number)
}

fn segment_of(base: &RemoteDataset) -> Expression {
    Expression::reference_typed("wiki", AttributeType::Dataset(base.raw_dataset_type()))
}

#[cfg(test)]
mod compile_scenarios {
    use super::*;

    #[test]
    fn test_filter_on_aggregate_compiles_to_having() {
        let base = wiki();
        let below_hundred = Expression::reference_typed("Count", AttributeType::Number)
            .in_(Expression::literal(Datum::NumberRange(NumberRange {
                start: None,
                end: Some(100.0),
                bounds: Default::default(),
            })))
            .unwrap();
        let e = wiki_expr()
            .split(channel_ref(), "Channel", "wiki")
            .unwrap()
            .apply("Count", segment_of(&base).count().unwrap())
            .unwrap()
            .filter(below_hundred)
            .unwrap()
            .simplify()
            .unwrap();

        // one plan, with the post-aggregate filter folded in
        let remote = e.as_remote().expect("filter should have been absorbed");
        match &remote.mode {
            QueryMode::Split { having, .. } => assert!(having.is_some()),
            other => panic!("expected a split plan, got {:?}", other),
        }
    }

    #[test]
    fn test_select_narrows_to_the_intersection() {
        let e = wiki_expr()
            .select(&["channel", "added", "__time"])
            .unwrap()
            .select(&["channel", "added"])
            .unwrap()
            .simplify()
            .unwrap();
        let remote = e.as_remote().expect("selects should have been absorbed");
        match &remote.mode {
            QueryMode::Raw { select, .. } => {
                assert_eq!(
                    select.as_deref(),
                    Some(&["channel".to_string(), "added".to_string()][..])
                );
            }
            other => panic!("expected a raw plan, got {:?}", other),
        }
    }

    #[test]
    fn test_rollup_source_counts_by_summing_the_count_column() {
        let r = RemoteDataset::new("druid", "wikipedia_rollup").with_attributes(vec![
            AttributeInfo::new("__time", AttributeType::Time),
            AttributeInfo::new("count", AttributeType::Number)
                .with_native_type("longSum")
                .with_maker(Maker::Count),
        ]);
        let window = Expression::reference_typed("__time", AttributeType::Time)
            .in_(Expression::literal(Datum::TimeRange(TimeRange::new(
                march(13),
                march(14),
            ))))
            .unwrap();
        let r = r.add_operation(&ChainOp::Filter(Box::new(window))).unwrap();
        let e = Expression::literal(Datum::Remote(Arc::new(r)))
            .count()
            .unwrap()
            .simplify()
            .unwrap();
        let remote = e.as_remote().expect("count should have been absorbed");

        let q = lattice_core::backends::druid::emit(remote, "0.20.0").unwrap();
        assert_eq!(q["aggregations"][0]["type"], "longSum");
        assert_eq!(q["aggregations"][0]["fieldName"], "count");
    }
}

#[cfg(test)]
mod decomposition_scenarios {
    use super::*;

    /// Two aggregates pinned to adjacent, equal-length windows on the same
    /// time reference come back as two physical plans joined on the
    /// grouping key, not one plan with an OR-filtered time dimension.
    #[test]
    fn test_time_compare_splits_into_two_joined_plans() {
        let base = RemoteDataset::new("druid", "wikipedia").with_attributes(vec![
            AttributeInfo::new("__time", AttributeType::Time),
            AttributeInfo::new("channel", AttributeType::String),
            AttributeInfo::new("added", AttributeType::Number).with_native_type("longSum"),
        ]);
        let window = |start: u32, end: u32| {
            Expression::reference_typed("__time", AttributeType::Time)
                .in_(Expression::literal(Datum::TimeRange(TimeRange::new(
                    march(start),
                    march(end),
                ))))
                .unwrap()
        };
        let pinned = |w: Expression| {
            segment_of(&base)
                .filter(w)
                .unwrap()
                .sum(added_ref())
                .unwrap()
        };
        let e = Expression::literal(Datum::Remote(Arc::new(base.clone())))
            .split(channel_ref(), "Channel", "wiki")
            .unwrap()
            .apply("Prev", pinned(window(12, 13)))
            .unwrap()
            .apply("Main", pinned(window(13, 14)))
            .unwrap()
            .sort(
                Expression::reference_typed("Main", AttributeType::Number),
                Direction::Descending,
            )
            .unwrap()
            .limit(5)
            .unwrap()
            .simplify()
            .unwrap();

        let remote = e.as_remote().expect("the whole query should compile");
        let plan = decompose::time_compare(remote).expect("windows should decompose");
        assert_eq!(plan.delegates.len(), 2);
        match &plan.merge {
            // adjacent windows share an edge, so unmatched groups from the
            // second plan cannot exist
            Some(MergeStrategy::Join {
                keys,
                keep_unmatched,
            }) => {
                assert_eq!(keys, &["Channel".to_string()]);
                assert!(!keep_unmatched);
            }
            other => panic!("expected a join merge, got {:?}", other),
        }
        // ordering runs after the merge, not inside either delegate
        assert!(plan.finalize_sort.is_some());
        assert_eq!(plan.finalize_limit, Some(5));
        for delegate in &plan.delegates {
            match &delegate.mode {
                QueryMode::Split { sort, limit, .. } => {
                    assert!(sort.is_none());
                    assert!(limit.is_none());
                }
                other => panic!("expected split delegates, got {:?}", other),
            }
        }
    }
}

#[cfg(test)]
mod execution_scenarios {
    use super::*;

    #[tokio::test]
    async fn test_simulated_topn_round_trip() {
        let base = wiki();
        let e = wiki_expr()
            .split(channel_ref(), "Channel", "wiki")
            .unwrap()
            .apply("Added", segment_of(&base).sum(added_ref()).unwrap())
            .unwrap()
            .sort(
                Expression::reference_typed("Added", AttributeType::Number),
                Direction::Descending,
            )
            .unwrap()
            .limit(5)
            .unwrap();
        let registry = EngineRegistry::simulation();
        let out = execute(&e, &registry, &SimulationRequester).await.unwrap();
        let Datum::Dataset(ds) = out else {
            panic!("expected a dataset result");
        };
        assert_eq!(ds.len(), 1);
        assert_eq!(
            ds.rows[0].get("Channel"),
            Some(&Datum::String("some_string".to_string()))
        );
        assert_eq!(ds.rows[0].get("Added"), Some(&Datum::Number(4.0)));
    }

    #[tokio::test]
    async fn test_simulated_total_with_ratio() {
        // aggregates chained on the placeholder collapse into value plans,
        // and the apply gathers them into one totals plan
        let w = wiki_expr();
        let per_row = w
            .clone()
            .sum(added_ref())
            .unwrap()
            .divide(w.count().unwrap())
            .unwrap();
        let e = Expression::total_scope()
            .apply("AddedPerRow", per_row)
            .unwrap();
        let registry = EngineRegistry::simulation();
        let out = execute(&e, &registry, &SimulationRequester).await.unwrap();
        let Datum::Dataset(ds) = out else {
            panic!("expected a dataset result");
        };
        assert_eq!(ds.len(), 1);
        assert_eq!(ds.rows[0].get("AddedPerRow"), Some(&Datum::Number(4.0)));
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_numeric() -> BoxedStrategy<Expression> {
        let leaf = prop_oneof![
            (-1.0e6f64..1.0e6).prop_map(Expression::number),
            Just(Expression::reference_typed("x", AttributeType::Number)),
            Just(Expression::reference_typed("y", AttributeType::Number)),
        ];
        leaf.prop_recursive(4, 24, 2, |inner| {
            (inner.clone(), inner, 0..4u8)
                .prop_map(|(a, b, op)| match op {
                    0 => a.add(b).unwrap(),
                    1 => a.subtract(b).unwrap(),
                    2 => a.multiply(b).unwrap(),
                    _ => a.absolute().unwrap(),
                })
                .boxed()
        })
        .boxed()
    }

    fn arb_boolean() -> BoxedStrategy<Expression> {
        let leaf = prop_oneof![
            any::<bool>().prop_map(Expression::boolean),
            Just(Expression::reference_typed("flag", AttributeType::Boolean)),
        ];
        leaf.prop_recursive(4, 24, 2, |inner| {
            (inner.clone(), inner, 0..3u8)
                .prop_map(|(a, b, op)| match op {
                    0 => a.and(b).unwrap(),
                    1 => a.or(b).unwrap(),
                    _ => a.not().unwrap(),
                })
                .boxed()
        })
        .boxed()
    }

    proptest! {
        #[test]
        fn simplify_is_idempotent(e in arb_numeric()) {
            let once = e.simplify().unwrap();
            prop_assert_eq!(once.simplify().unwrap(), once);
        }

        #[test]
        fn simplify_preserves_numeric_type(e in arb_numeric()) {
            prop_assert_eq!(
                e.simplify().unwrap().output_type(),
                AttributeType::Number
            );
        }

        #[test]
        fn boolean_simplify_is_idempotent(e in arb_boolean()) {
            let once = e.simplify().unwrap();
            prop_assert_eq!(once.simplify().unwrap(), once);
        }

        #[test]
        fn limits_fold_to_the_minimum(a in 0i64..1000, b in 0i64..1000) {
            let e = Expression::reference("data")
                .limit(a)
                .unwrap()
                .limit(b)
                .unwrap()
                .simplify()
                .unwrap();
            prop_assert_eq!(
                e.as_chain().unwrap().op.clone(),
                ChainOp::Limit(a.min(b) as usize)
            );
        }
    }

    #[test]
    fn test_filter_and_sort_commute() {
        let pred = Expression::reference("channel")
            .is(Expression::string("en"))
            .unwrap();
        let sorted_then_filtered = Expression::reference("data")
            .sort(added_ref(), Direction::Ascending)
            .unwrap()
            .filter(pred.clone())
            .unwrap()
            .simplify()
            .unwrap();
        let filtered_then_sorted = Expression::reference("data")
            .filter(pred)
            .unwrap()
            .sort(added_ref(), Direction::Ascending)
            .unwrap()
            .simplify()
            .unwrap();
        assert_eq!(sorted_then_filtered, filtered_then_sorted);
    }

    #[test]
    fn test_wire_form_round_trips_a_split() {
        let e = Expression::reference("wiki")
            .split(
                channel_ref()
                    .change_case(lattice_core::expressions::CaseMode::Upper)
                    .unwrap(),
                "Channel",
                "wiki",
            )
            .unwrap()
            .apply(
                "Added",
                Expression::reference("wiki").sum(added_ref()).unwrap(),
            )
            .unwrap()
            .sort(
                Expression::reference_typed("Added", AttributeType::Number),
                Direction::Descending,
            )
            .unwrap()
            .limit(10)
            .unwrap();
        let back = Expression::from_js(&e.to_js()).unwrap();
        assert_eq!(back, e);
    }
}
