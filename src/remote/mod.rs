//! The incremental query-plan compiler.
//!
//! A [`RemoteDataset`] is an immutable description of one view of a remote
//! source: engine, physical source, declared attributes, a running filter,
//! and a [`QueryMode`] describing the output shape accumulated so far. The
//! simplifier offers it chain operations one at a time through
//! [`RemoteDataset::add_operation`]; every accepted operation yields a new
//! instance (copy-on-write) and `None` means "cannot push further" — a
//! normal control-flow outcome, never an error. Whatever the plan rejects
//! stays in the tree and runs locally over the plan's materialized output.
//!
//! Mode transitions are one-directional within a pass:
//! `raw -> {value | total | split}`.

pub mod decompose;
pub mod segregate;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value as Json;

use crate::error::{Error, Result};
use crate::expressions::{ChainOp, Direction, Expression, SplitKey};
use crate::types::{AttributeInfo, AttributeType, DatasetType, Maker};
use crate::values::{zero_row, Datum, Duration, Row, TimeRange};

/// Placeholder name the plan's expressions use for "the rows this query
/// sees" once an aggregate detaches them from any concrete reference.
pub const SEGMENT_NAME: &str = "__SEGMENT__";

/// Output column name of a scalar (value-mode) query.
pub const VALUE_NAME: &str = "__VALUE__";

/// Upper bound on the key set inlined as a literal filter by the top-N
/// waterfall decomposition.
pub const WATERFALL_KEY_CAP: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// Reject approximate estimators (sketch quantiles and the like).
    pub exact_results_only: bool,
    /// Allow querying without any time constraint.
    pub allow_eternity: bool,
    /// Time columns floored at ingestion: filters and split keys touching
    /// them must stay bucket-aligned.
    pub conceal_buckets: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NamedExpr {
    pub name: String,
    pub expression: Expression,
}

impl NamedExpr {
    pub fn new(name: &str, expression: Expression) -> NamedExpr {
        NamedExpr {
            name: name.to_string(),
            expression,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortSpec {
    pub expression: Expression,
    pub direction: Direction,
}

/// The accumulated output shape.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryMode {
    Raw {
        select: Option<Vec<String>>,
        sort: Option<SortSpec>,
        limit: Option<usize>,
    },
    /// One scalar; `expression` is an aggregate chain over the segment
    /// reference, possibly wrapped in further scalar post-aggregation.
    Value { expression: Expression },
    /// Named aggregates, no grouping.
    Total { applies: Vec<NamedExpr> },
    Split {
        keys: Vec<NamedExpr>,
        data_name: String,
        applies: Vec<NamedExpr>,
        having: Option<Expression>,
        sort: Option<SortSpec>,
        limit: Option<usize>,
    },
}

/// How the results of decomposed sibling plans recombine.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeStrategy {
    /// Join the two result sets on the named key columns.
    Join {
        keys: Vec<String>,
        keep_unmatched: bool,
    },
    /// Run the first plan, constrain the second to the first's winning
    /// keys, then left-join.
    Waterfall {
        key: String,
        key_expression: Expression,
        cap: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteDataset {
    pub engine: String,
    pub source: String,
    pub version: Option<String>,
    pub attributes: Vec<AttributeInfo>,
    /// Named expressions computed server-side, not physical columns.
    pub derived_attributes: BTreeMap<String, Expression>,
    /// Raw aggregator descriptors usable by name through `customAggregate`.
    pub custom_aggregations: BTreeMap<String, Json>,
    pub filter: Expression,
    pub capabilities: Capabilities,
    pub mode: QueryMode,
    /// Sibling plans produced by decomposition; empty for a leaf plan.
    pub delegates: Vec<RemoteDataset>,
    pub merge: Option<MergeStrategy>,
    /// Final ordering re-applied in memory after a merge.
    pub finalize_sort: Option<SortSpec>,
    pub finalize_limit: Option<usize>,
}

impl RemoteDataset {
    pub fn new(engine: &str, source: &str) -> RemoteDataset {
        RemoteDataset {
            engine: engine.to_string(),
            source: source.to_string(),
            version: None,
            attributes: Vec::new(),
            derived_attributes: BTreeMap::new(),
            custom_aggregations: BTreeMap::new(),
            filter: Expression::boolean(true),
            capabilities: Capabilities::default(),
            mode: QueryMode::Raw {
                select: None,
                sort: None,
                limit: None,
            },
            delegates: Vec::new(),
            merge: None,
            finalize_sort: None,
            finalize_limit: None,
        }
    }

    pub fn with_attributes(mut self, attributes: Vec<AttributeInfo>) -> RemoteDataset {
        self.attributes = attributes;
        self
    }

    pub fn with_version(mut self, version: &str) -> RemoteDataset {
        self.version = Some(version.to_string());
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> RemoteDataset {
        self.capabilities = capabilities;
        self
    }

    pub fn with_custom_aggregation(mut self, name: &str, aggregator: Json) -> RemoteDataset {
        self.custom_aggregations
            .insert(name.to_string(), aggregator);
        self
    }

    pub fn with_derived_attribute(
        mut self,
        name: &str,
        expression: Expression,
    ) -> Result<RemoteDataset> {
        if !self.is_expressible(&expression) {
            return Err(Error::construction(format!(
                "derived attribute '{}' references unknown attributes",
                name
            )));
        }
        self.derived_attributes
            .insert(name.to_string(), expression);
        Ok(self)
    }

    /// Set the base filter; it must be a boolean over declared attributes.
    pub fn with_filter(mut self, filter: Expression) -> Result<RemoteDataset> {
        if filter.output_type() != AttributeType::Boolean {
            return Err(Error::construction("base filter must be boolean"));
        }
        if !self.is_expressible(&filter) {
            return Err(Error::construction(
                "base filter references unknown attributes",
            ));
        }
        self.filter = filter;
        Ok(self)
    }

    // ---- shape inspection ----

    /// The raw row scope: physical plus derived attributes.
    pub fn raw_dataset_type(&self) -> DatasetType {
        let mut dt = DatasetType::default();
        for a in &self.attributes {
            dt = dt.with_attribute(&a.name, a.ty.clone());
        }
        for (name, e) in &self.derived_attributes {
            dt = dt.with_attribute(name, e.output_type());
        }
        dt
    }

    pub fn dataset_type(&self) -> DatasetType {
        match &self.mode {
            QueryMode::Raw { select, .. } => match select {
                Some(names) => self.raw_dataset_type().keep_only(names),
                None => self.raw_dataset_type(),
            },
            QueryMode::Value { .. } => DatasetType::default(),
            QueryMode::Total { applies } => {
                let mut dt = DatasetType::default();
                for a in applies {
                    dt = dt.with_attribute(&a.name, a.expression.output_type());
                }
                dt
            }
            QueryMode::Split {
                keys,
                data_name,
                applies,
                ..
            } => {
                let mut dt = DatasetType::default();
                for k in keys {
                    dt = dt.with_attribute(&k.name, k.expression.output_type());
                }
                dt = dt.with_attribute(
                    data_name,
                    AttributeType::Dataset(self.raw_dataset_type()),
                );
                for a in applies {
                    dt = dt.with_attribute(&a.name, a.expression.output_type());
                }
                dt
            }
        }
    }

    /// A value-mode plan stands in for a pending scalar; every other mode
    /// stands in for a dataset.
    pub fn output_type(&self) -> AttributeType {
        match &self.mode {
            QueryMode::Value { expression } => expression.output_type(),
            _ => AttributeType::Dataset(self.dataset_type()),
        }
    }

    /// The typed placeholder the plan's own expressions aggregate over.
    pub fn segment_reference(&self) -> Expression {
        Expression::reference_typed(
            SEGMENT_NAME,
            AttributeType::Dataset(self.raw_dataset_type()),
        )
    }

    pub fn time_attribute(&self) -> Option<&AttributeInfo> {
        self.attributes.iter().find(|a| a.ty == AttributeType::Time)
    }

    fn key_names(&self) -> Vec<String> {
        match &self.mode {
            QueryMode::Split { keys, .. } => keys.iter().map(|k| k.name.clone()).collect(),
            _ => Vec::new(),
        }
    }

    fn apply_names(&self) -> Vec<String> {
        match &self.mode {
            QueryMode::Total { applies } | QueryMode::Split { applies, .. } => {
                applies.iter().map(|a| a.name.clone()).collect()
            }
            _ => Vec::new(),
        }
    }

    /// The empty-result fallback for a value plan.
    pub(crate) fn zero_value(&self) -> Option<Datum> {
        match &self.mode {
            QueryMode::Value { expression } => Some(if is_count_rooted(expression) {
                Datum::Number(0.0)
            } else {
                Datum::Null
            }),
            _ => None,
        }
    }

    /// The empty-result fallback row for total-style plans: counts are
    /// zero, everything else null.
    pub fn zero_total_row(&self) -> Option<Row> {
        let applies = match &self.mode {
            QueryMode::Total { applies } => applies,
            _ => return None,
        };
        let names: Vec<(String, bool)> = applies
            .iter()
            .map(|a| (a.name.clone(), is_count_rooted(&a.expression)))
            .collect();
        Some(zero_row(&names))
    }

    // ---- the per-operation contract ----

    /// Offer one chain operation to the plan. `Some` is the extended plan;
    /// `None` is the rejection sentinel.
    pub fn add_operation(&self, op: &ChainOp) -> Option<RemoteDataset> {
        let next = if !self.delegates.is_empty() {
            // A decomposed plan only absorbs trailing shaping it can defer
            // to the merge step.
            self.add_to_merged(op)
        } else {
            match op {
                ChainOp::Filter(pred) => self.add_filter(pred),
                ChainOp::Select(names) => self.add_select(names),
                ChainOp::Split { keys, data_name } => self.add_split(keys, data_name),
                ChainOp::Apply { name, expression } => self.add_apply(name, expression),
                ChainOp::Sort {
                    expression,
                    direction,
                } => self.add_sort(expression, *direction),
                ChainOp::Limit(n) => self.add_limit(*n),
                ChainOp::Join(arg) => decompose::join_shortcut(self, arg),
                op if op.is_aggregate() => self.add_aggregate(op),
                op => self.add_post_aggregate(op),
            }
        };
        tracing::trace!(
            source = %self.source,
            op = op.name(),
            absorbed = next.is_some(),
            "push-down"
        );
        next
    }

    fn add_filter(&self, pred: &Expression) -> Option<RemoteDataset> {
        match &self.mode {
            QueryMode::Raw { limit, .. } => {
                if limit.is_some() {
                    return None; // filtering after a limit is not the same query
                }
                if !self.is_expressible(pred) {
                    return None;
                }
                if self.capabilities.conceal_buckets && !self.filter_respects_buckets(pred) {
                    return None;
                }
                let filter = self
                    .filter
                    .clone()
                    .and(pred.clone())
                    .ok()?
                    .simplify()
                    .ok()?;
                let mut next = self.clone();
                next.filter = filter;
                Some(next)
            }
            QueryMode::Split {
                keys,
                data_name,
                applies,
                having,
                sort,
                limit,
            } => {
                if limit.is_some() {
                    return None;
                }
                let visible: Vec<String> = self
                    .key_names()
                    .into_iter()
                    .chain(self.apply_names())
                    .collect();
                if !pred.free_references().iter().all(|r| visible.contains(r)) {
                    return None;
                }
                let having = match having {
                    Some(h) => h.clone().and(pred.clone()).ok()?.simplify().ok()?,
                    None => pred.clone(),
                };
                let mut next = self.clone();
                next.mode = QueryMode::Split {
                    keys: keys.clone(),
                    data_name: data_name.clone(),
                    applies: applies.clone(),
                    having: Some(having),
                    sort: sort.clone(),
                    limit: *limit,
                };
                Some(next)
            }
            _ => None,
        }
    }

    fn add_select(&self, names: &[String]) -> Option<RemoteDataset> {
        match &self.mode {
            QueryMode::Raw { sort, limit, .. } => {
                let dt = self.raw_dataset_type();
                if !names.iter().all(|n| dt.get(n).is_some()) {
                    return None;
                }
                let mut next = self.clone();
                next.mode = QueryMode::Raw {
                    select: Some(names.to_vec()),
                    sort: sort.clone(),
                    limit: *limit,
                };
                Some(next)
            }
            QueryMode::Split {
                keys,
                data_name,
                applies,
                having,
                sort,
                limit,
            } => {
                // Grouping keys must survive; aggregates prune to the kept
                // names.
                if !keys.iter().all(|k| names.contains(&k.name)) {
                    return None;
                }
                let kept: Vec<NamedExpr> = applies
                    .iter()
                    .filter(|a| names.contains(&a.name))
                    .cloned()
                    .collect();
                let mut next = self.clone();
                next.mode = QueryMode::Split {
                    keys: keys.clone(),
                    data_name: data_name.clone(),
                    applies: kept,
                    having: having.clone(),
                    sort: sort.clone(),
                    limit: *limit,
                };
                Some(next)
            }
            _ => None,
        }
    }

    fn add_split(&self, keys: &[SplitKey], data_name: &str) -> Option<RemoteDataset> {
        match &self.mode {
            QueryMode::Raw { sort, limit, .. } => {
                if sort.is_some() || limit.is_some() {
                    return None;
                }
                for k in keys {
                    if !self.is_expressible(&k.expression) {
                        return None;
                    }
                    if self.capabilities.conceal_buckets
                        && !self.key_respects_buckets(&k.expression)
                    {
                        return None;
                    }
                }
                let mut next = self.clone();
                next.mode = QueryMode::Split {
                    keys: keys
                        .iter()
                        .map(|k| NamedExpr::new(&k.name, (*k.expression).clone()))
                        .collect(),
                    data_name: data_name.to_string(),
                    applies: Vec::new(),
                    having: None,
                    sort: None,
                    limit: None,
                };
                Some(next)
            }
            _ => None,
        }
    }

    fn add_apply(&self, name: &str, expression: &Expression) -> Option<RemoteDataset> {
        match &self.mode {
            QueryMode::Raw { .. } => {
                // A raw apply is a deferred server-side expression.
                if contains_aggregate(expression) || !self.is_expressible(expression) {
                    return None;
                }
                match self.derived_attributes.get(name) {
                    Some(existing) if existing == expression => Some(self.clone()),
                    Some(_) => None,
                    None => {
                        let mut next = self.clone();
                        next.derived_attributes
                            .insert(name.to_string(), expression.clone());
                        Some(next)
                    }
                }
            }
            QueryMode::Total { applies } => {
                let expr = self.normalize_apply(expression, None)?;
                match applies.iter().find(|a| a.name == name) {
                    Some(existing) if existing.expression == expr => Some(self.clone()),
                    Some(_) => None,
                    None => {
                        let mut next = self.clone();
                        let mut applies = applies.clone();
                        applies.push(NamedExpr::new(name, expr));
                        next.mode = QueryMode::Total { applies };
                        Some(next)
                    }
                }
            }
            QueryMode::Split {
                keys,
                data_name,
                applies,
                having,
                sort,
                limit,
            } => {
                let expr = self.normalize_apply(expression, Some(data_name))?;
                match applies.iter().find(|a| a.name == name) {
                    Some(existing) if existing.expression == expr => Some(self.clone()),
                    Some(_) => None,
                    None => {
                        let mut next = self.clone();
                        let mut applies = applies.clone();
                        applies.push(NamedExpr::new(name, expr));
                        next.mode = QueryMode::Split {
                            keys: keys.clone(),
                            data_name: data_name.clone(),
                            applies,
                            having: having.clone(),
                            sort: sort.clone(),
                            limit: *limit,
                        };
                        Some(next)
                    }
                }
            }
            QueryMode::Value { .. } => None,
        }
    }

    fn add_sort(&self, expression: &Expression, direction: Direction) -> Option<RemoteDataset> {
        match &self.mode {
            QueryMode::Raw {
                select,
                limit: None,
                ..
            } => {
                if !engine_supports_raw_sort(&self.engine) || !self.is_expressible(expression) {
                    return None;
                }
                let mut next = self.clone();
                next.mode = QueryMode::Raw {
                    select: select.clone(),
                    sort: Some(SortSpec {
                        expression: expression.clone(),
                        direction,
                    }),
                    limit: None,
                };
                Some(next)
            }
            QueryMode::Split {
                keys,
                data_name,
                applies,
                having,
                limit: None,
                ..
            } => {
                let visible: Vec<String> = self
                    .key_names()
                    .into_iter()
                    .chain(self.apply_names())
                    .collect();
                let name = expression.as_ref_expr()?.name.clone();
                if !visible.contains(&name) {
                    return None;
                }
                let mut next = self.clone();
                next.mode = QueryMode::Split {
                    keys: keys.clone(),
                    data_name: data_name.clone(),
                    applies: applies.clone(),
                    having: having.clone(),
                    sort: Some(SortSpec {
                        expression: expression.clone(),
                        direction,
                    }),
                    limit: None,
                };
                Some(next)
            }
            // Sorting after a limit is not equivalent; reject.
            _ => None,
        }
    }

    fn add_limit(&self, n: usize) -> Option<RemoteDataset> {
        let mut next = self.clone();
        match &mut next.mode {
            QueryMode::Raw { limit, .. } | QueryMode::Split { limit, .. } => {
                *limit = Some(limit.map_or(n, |m| m.min(n)));
            }
            // One row in, one row out: nothing to record.
            QueryMode::Value { .. } | QueryMode::Total { .. } => {}
        }
        Some(next)
    }

    fn add_aggregate(&self, op: &ChainOp) -> Option<RemoteDataset> {
        if self.capabilities.exact_results_only && matches!(op, ChainOp::Quantile { .. }) {
            return None;
        }
        match &self.mode {
            QueryMode::Raw { limit: None, .. } => {
                if let Some(arg) = op.argument() {
                    if !self.is_expressible(arg) {
                        return None;
                    }
                }
                let expression = self.segment_reference().chain(op.clone()).ok()?;
                let mut next = self.clone();
                next.mode = QueryMode::Value { expression };
                Some(next)
            }
            // Fold-on-resplit: a numeric aggregate over the grouped result
            // collapses the whole plan back to one scalar, in the cases
            // where that is algebraically sound.
            QueryMode::Split {
                keys,
                applies,
                having: None,
                limit: None,
                ..
            } => {
                let expression = match op {
                    ChainOp::Count if keys.len() == 1 => self
                        .segment_reference()
                        .count_distinct(keys[0].expression.clone())
                        .ok()?,
                    ChainOp::Sum(arg) => {
                        let apply = self.find_apply(applies, arg)?;
                        match terminal_aggregate(&apply.expression)? {
                            ChainOp::Sum(_) | ChainOp::Count => apply.expression.clone(),
                            _ => return None,
                        }
                    }
                    ChainOp::Min(arg) => {
                        let apply = self.find_apply(applies, arg)?;
                        match terminal_aggregate(&apply.expression)? {
                            ChainOp::Min(_) => apply.expression.clone(),
                            _ => return None,
                        }
                    }
                    ChainOp::Max(arg) => {
                        let apply = self.find_apply(applies, arg)?;
                        match terminal_aggregate(&apply.expression)? {
                            ChainOp::Max(_) => apply.expression.clone(),
                            _ => return None,
                        }
                    }
                    _ => return None,
                };
                let mut next = self.clone();
                next.mode = QueryMode::Value { expression };
                Some(next)
            }
            _ => None,
        }
    }

    /// A value-mode plan absorbs further scalar operations into its value
    /// expression: constant arguments directly, compatible value-mode
    /// placeholders by splicing in their own expressions.
    fn add_post_aggregate(&self, op: &ChainOp) -> Option<RemoteDataset> {
        let expression = match &self.mode {
            QueryMode::Value { expression } => expression,
            _ => return None,
        };
        let op = match op.argument() {
            None => op.clone(),
            Some(arg) => {
                let inlined = self.inline_value_remotes(arg)?;
                if contains_remote(&inlined) || !inlined.free_references().is_empty() {
                    return None;
                }
                replace_argument(op, inlined)
            }
        };
        let next_expr = expression.clone().chain(op).ok()?;
        let mut next = self.clone();
        next.mode = QueryMode::Value {
            expression: next_expr,
        };
        Some(next)
    }

    // ---- totals ----

    /// Build a total-mode plan from the first apply against a one-row
    /// scope, when the applied expression is built from value-mode
    /// placeholders of a single source.
    pub fn total_from_apply(name: &str, expression: &Expression) -> Option<RemoteDataset> {
        let remotes = collect_remotes(expression);
        let first = remotes.first()?;
        if !matches!(first.mode, QueryMode::Value { .. }) {
            return None;
        }
        let mut base = (**first).clone();
        base.mode = QueryMode::Total {
            applies: Vec::new(),
        };
        base.add_apply(name, expression)
    }

    // ---- helpers ----

    fn find_apply<'a>(
        &self,
        applies: &'a [NamedExpr],
        arg: &Expression,
    ) -> Option<&'a NamedExpr> {
        let name = &arg.as_ref_expr()?.name;
        applies.iter().find(|a| &a.name == name)
    }

    /// Rewrite an incoming apply expression into plan form: the row-scope
    /// dataset reference becomes the segment placeholder and embedded
    /// value-mode placeholders are spliced in; then check the result only
    /// aggregates over the segment.
    fn normalize_apply(
        &self,
        expression: &Expression,
        data_name: Option<&str>,
    ) -> Option<Expression> {
        let mut expr = self.inline_value_remotes(expression)?;
        if let Some(data_name) = data_name {
            expr = expr
                .substitute_reference(data_name, &self.segment_reference())
                .ok()?;
        }
        if contains_remote(&expr) {
            return None;
        }
        let visible: Vec<String> = self
            .key_names()
            .into_iter()
            .chain(self.apply_names())
            .collect();
        if !self.is_valid_apply(&expr, &visible) {
            return None;
        }
        if self.capabilities.exact_results_only
            && expr.some(&|e| {
                matches!(
                    e.as_chain().map(|c| &c.op),
                    Some(ChainOp::Quantile { .. })
                )
            })
        {
            return None;
        }
        Some(expr)
    }

    fn inline_value_remotes(&self, e: &Expression) -> Option<Expression> {
        e.substitute(&|node, _| {
            if let Some(r) = node.as_remote() {
                if let QueryMode::Value { expression } = &r.mode {
                    if self.same_base(r) {
                        return Ok(Some(expression.clone()));
                    }
                }
                return Err(Error::construction("foreign placeholder"));
            }
            Ok(None)
        })
        .ok()
    }

    fn same_base(&self, other: &RemoteDataset) -> bool {
        self.engine == other.engine
            && self.source == other.source
            && self.version == other.version
            && self.filter == other.filter
            && self.attributes == other.attributes
    }

    /// Valid plan-side apply: scalar math over segment-rooted aggregates,
    /// literals, and references to already-named keys/applies.
    fn is_valid_apply(&self, e: &Expression, visible: &[String]) -> bool {
        match e {
            Expression::Literal(l) => !matches!(l.value, Datum::Remote(_)),
            Expression::Ref(r) => visible.contains(&r.name),
            Expression::Chain(c) => {
                if c.op.is_aggregate() {
                    if !is_segment_rooted(&c.operand) {
                        return false;
                    }
                    return match c.op.argument() {
                        Some(arg) => self.is_expressible(arg),
                        None => true,
                    };
                }
                if !self.is_valid_apply(&c.operand, visible) {
                    return false;
                }
                match c.op.argument() {
                    Some(arg) => self.is_valid_apply(arg, visible),
                    None => true,
                }
            }
        }
    }

    /// Can the backend evaluate this row-scope expression? Every free
    /// reference must be a declared or derived attribute, with no nested
    /// aggregation.
    fn is_expressible(&self, e: &Expression) -> bool {
        if contains_aggregate(e) || contains_remote(e) {
            return false;
        }
        let dt = self.raw_dataset_type();
        e.free_references().iter().all(|r| dt.get(r).is_some())
    }

    fn maker_floor(&self, name: &str) -> Option<Duration> {
        self.attributes.iter().find_map(|a| {
            if a.name == name {
                match &a.maker {
                    Some(Maker::TimeFloor { duration }) => Some(*duration),
                    _ => None,
                }
            } else {
                None
            }
        })
    }

    /// With concealed buckets, a filter may only pin a floored time column
    /// to ranges aligned on its floor duration.
    fn filter_respects_buckets(&self, pred: &Expression) -> bool {
        !violates_buckets(self, pred)
    }

    fn key_respects_buckets(&self, key: &Expression) -> bool {
        match key {
            Expression::Ref(r) => self.maker_floor(&r.name).is_none(),
            Expression::Chain(c) => match &c.op {
                ChainOp::TimeBucket { duration } | ChainOp::TimeFloor { duration } => {
                    match c.operand.as_ref_expr() {
                        Some(r) => match self.maker_floor(&r.name) {
                            Some(floor) => duration_covers(*duration, floor),
                            None => true,
                        },
                        None => true,
                    }
                }
                _ => !key
                    .free_references()
                    .iter()
                    .any(|r| self.maker_floor(r).is_some()),
            },
            Expression::Literal(_) => true,
        }
    }
}

fn engine_supports_raw_sort(engine: &str) -> bool {
    // The native scan protocol returns rows in segment order only.
    engine != "druid"
}

/// `outer` bucketing is answerable over data floored to `floor` when it is
/// the same span or a whole multiple of it.
fn duration_covers(outer: Duration, floor: Duration) -> bool {
    if outer == floor {
        return true;
    }
    match (outer.exact_millis(), floor.exact_millis()) {
        (Some(o), Some(f)) => f > 0 && o >= f && o % f == 0,
        _ => false,
    }
}

fn violates_buckets(remote: &RemoteDataset, e: &Expression) -> bool {
    match e {
        Expression::Chain(c) => {
            let lhs_floor = c
                .operand
                .as_ref_expr()
                .and_then(|r| remote.maker_floor(&r.name));
            if let Some(floor) = lhs_floor {
                return match &c.op {
                    ChainOp::In(arg) | ChainOp::Overlap(arg) => match arg.as_literal() {
                        Some(Datum::TimeRange(range)) => !range_aligned(range, floor),
                        _ => true,
                    },
                    _ => true, // point predicates on a floored column
                };
            }
            if violates_buckets(remote, &c.operand) {
                return true;
            }
            c.op.argument()
                .map(|a| violates_buckets(remote, a))
                .unwrap_or(false)
        }
        _ => false,
    }
}

fn range_aligned(range: &TimeRange, floor: Duration) -> bool {
    let aligned = |t: chrono::DateTime<chrono::Utc>| match floor.floor(t) {
        Ok(f) => f == t,
        Err(_) => false,
    };
    range.start.map(&aligned).unwrap_or(true) && range.end.map(&aligned).unwrap_or(true)
}

fn is_segment_rooted(e: &Expression) -> bool {
    match e {
        Expression::Ref(r) => r.name == SEGMENT_NAME,
        Expression::Chain(c) => {
            matches!(c.op, ChainOp::Filter(_)) && is_segment_rooted(&c.operand)
        }
        Expression::Literal(_) => false,
    }
}

/// The aggregate op at the root of a plan-side apply expression, if the
/// expression is exactly one segment-rooted aggregate.
fn terminal_aggregate(e: &Expression) -> Option<&ChainOp> {
    let c = e.as_chain()?;
    if c.op.is_aggregate() && is_segment_rooted(&c.operand) {
        Some(&c.op)
    } else {
        None
    }
}

fn contains_aggregate(e: &Expression) -> bool {
    e.some(&|n| {
        n.as_chain()
            .map(|c| c.op.is_aggregate())
            .unwrap_or(false)
    })
}

fn contains_remote(e: &Expression) -> bool {
    e.some(&|n| n.as_remote().is_some())
}

pub(crate) fn collect_remotes(e: &Expression) -> Vec<Arc<RemoteDataset>> {
    let mut out = Vec::new();
    collect_remotes_into(e, &mut out);
    out
}

fn collect_remotes_into(e: &Expression, out: &mut Vec<Arc<RemoteDataset>>) {
    match e {
        Expression::Literal(l) => {
            if let Datum::Remote(r) = &l.value {
                out.push(r.clone());
            }
        }
        Expression::Ref(_) => {}
        Expression::Chain(c) => {
            collect_remotes_into(&c.operand, out);
            if let ChainOp::Split { keys, .. } = &c.op {
                for k in keys {
                    collect_remotes_into(&k.expression, out);
                }
            }
            if let Some(arg) = c.op.argument() {
                collect_remotes_into(arg, out);
            }
        }
    }
}

pub(crate) fn replace_argument(op: &ChainOp, arg: Expression) -> ChainOp {
    let b = Box::new(arg);
    match op {
        ChainOp::And(_) => ChainOp::And(b),
        ChainOp::Or(_) => ChainOp::Or(b),
        ChainOp::Is(_) => ChainOp::Is(b),
        ChainOp::In(_) => ChainOp::In(b),
        ChainOp::Overlap(_) => ChainOp::Overlap(b),
        ChainOp::Contains(_) => ChainOp::Contains(b),
        ChainOp::Add(_) => ChainOp::Add(b),
        ChainOp::Subtract(_) => ChainOp::Subtract(b),
        ChainOp::Multiply(_) => ChainOp::Multiply(b),
        ChainOp::Divide(_) => ChainOp::Divide(b),
        ChainOp::Power(_) => ChainOp::Power(b),
        ChainOp::Concat(_) => ChainOp::Concat(b),
        ChainOp::Fallback(_) => ChainOp::Fallback(b),
        ChainOp::Then(_) => ChainOp::Then(b),
        other => other.clone(),
    }
}

impl RemoteDataset {
    /// Trailing shaping on an already-decomposed plan defers to the merge
    /// step instead of the physical queries.
    fn add_to_merged(&self, op: &ChainOp) -> Option<RemoteDataset> {
        match op {
            ChainOp::Sort {
                expression,
                direction,
            } => {
                // Reordering after the limit has been taken would change
                // which rows survive, so the sort stays outside the plan.
                if self.finalize_limit.is_some() {
                    return None;
                }
                expression.as_ref_expr()?;
                let mut next = self.clone();
                next.finalize_sort = Some(SortSpec {
                    expression: expression.as_ref().clone(),
                    direction: *direction,
                });
                Some(next)
            }
            ChainOp::Limit(n) => {
                let mut next = self.clone();
                next.finalize_limit =
                    Some(next.finalize_limit.map_or(*n, |m| m.min(*n)));
                Some(next)
            }
            _ => None,
        }
    }

}

fn is_count_rooted(e: &Expression) -> bool {
    match terminal_aggregate(e) {
        Some(ChainOp::Count) => true,
        _ => false,
    }
}

impl Expression {
    /// The one-row scope totals are applied against.
    pub fn total_scope() -> Expression {
        Expression::literal(Datum::Dataset(Arc::new(crate::values::Dataset::new(
            vec![Row::new()],
        ))))
    }
}
