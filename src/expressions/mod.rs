//! The expression AST.
//!
//! An [`Expression`] is an immutable, structurally-comparable tree. Leaves
//! are references and literals; every other kind is a *chain* node with
//! exactly one operand (the value it transforms) and, for binary kinds, one
//! argument expression. The op set is closed: emitters match exhaustively
//! and the compiler flags a missing case for any new kind.
//!
//! Output types are fixed at construction; rewriting always builds new
//! nodes.

pub mod compute;
pub mod resolve;
pub mod serde_js;
pub mod simplify;
pub mod substitute;

pub use compute::RowScope;
pub use substitute::Substitution;

use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::types::{AttributeType, DatasetType};
use crate::values::{Datum, Duration, Set};

#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Ref(RefExpr),
    Literal(LiteralExpr),
    Chain(ChainExpr),
}

/// A reference to a named attribute, `nest` scopes up from where the
/// reference sits.
#[derive(Debug, Clone, PartialEq)]
pub struct RefExpr {
    pub name: String,
    pub nest: usize,
    pub ty: AttributeType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LiteralExpr {
    pub value: Datum,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChainExpr {
    pub op: ChainOp,
    pub operand: Box<Expression>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseMode {
    Upper,
    Lower,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimePartKind {
    Year,
    Month,
    DayOfMonth,
    DayOfWeek,
    HourOfDay,
    MinuteOfHour,
    SecondOfMinute,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SplitKey {
    pub name: String,
    pub expression: Box<Expression>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

/// The closed set of chain operations.
#[derive(Debug, Clone, PartialEq)]
pub enum ChainOp {
    // dataset shaping
    Filter(Box<Expression>),
    Apply {
        name: String,
        expression: Box<Expression>,
    },
    Split {
        keys: Vec<SplitKey>,
        data_name: String,
    },
    Sort {
        expression: Box<Expression>,
        direction: Direction,
    },
    Limit(usize),
    Select(Vec<String>),
    Join(Box<Expression>),

    // aggregates
    Count,
    Sum(Box<Expression>),
    Min(Box<Expression>),
    Max(Box<Expression>),
    Average(Box<Expression>),
    CountDistinct(Box<Expression>),
    Quantile {
        expression: Box<Expression>,
        value: f64,
    },
    CustomAggregate {
        name: String,
    },

    // boolean
    And(Box<Expression>),
    Or(Box<Expression>),
    Not,
    Is(Box<Expression>),
    In(Box<Expression>),
    Overlap(Box<Expression>),
    Contains(Box<Expression>),
    Match {
        regex: String,
    },

    // arithmetic
    Add(Box<Expression>),
    Subtract(Box<Expression>),
    Multiply(Box<Expression>),
    Divide(Box<Expression>),
    Power(Box<Expression>),
    Absolute,

    // string
    Concat(Box<Expression>),
    Substring {
        position: usize,
        len: usize,
    },
    Extract {
        regex: String,
    },
    ChangeCase {
        mode: CaseMode,
    },
    Length,
    Lookup {
        table: String,
    },
    Fallback(Box<Expression>),
    Then(Box<Expression>),

    // bucketing & time
    NumberBucket {
        size: f64,
        offset: f64,
    },
    TimeBucket {
        duration: Duration,
    },
    TimeFloor {
        duration: Duration,
    },
    TimeShift {
        duration: Duration,
        step: i32,
    },
    TimePart {
        part: TimePartKind,
    },

    Cast(AttributeType),
}

impl ChainOp {
    /// Wire tag and display name of this operation.
    pub fn name(&self) -> &'static str {
        match self {
            ChainOp::Filter(_) => "filter",
            ChainOp::Apply { .. } => "apply",
            ChainOp::Split { .. } => "split",
            ChainOp::Sort { .. } => "sort",
            ChainOp::Limit(_) => "limit",
            ChainOp::Select(_) => "select",
            ChainOp::Join(_) => "join",
            ChainOp::Count => "count",
            ChainOp::Sum(_) => "sum",
            ChainOp::Min(_) => "min",
            ChainOp::Max(_) => "max",
            ChainOp::Average(_) => "average",
            ChainOp::CountDistinct(_) => "countDistinct",
            ChainOp::Quantile { .. } => "quantile",
            ChainOp::CustomAggregate { .. } => "customAggregate",
            ChainOp::And(_) => "and",
            ChainOp::Or(_) => "or",
            ChainOp::Not => "not",
            ChainOp::Is(_) => "is",
            ChainOp::In(_) => "in",
            ChainOp::Overlap(_) => "overlap",
            ChainOp::Contains(_) => "contains",
            ChainOp::Match { .. } => "match",
            ChainOp::Add(_) => "add",
            ChainOp::Subtract(_) => "subtract",
            ChainOp::Multiply(_) => "multiply",
            ChainOp::Divide(_) => "divide",
            ChainOp::Power(_) => "power",
            ChainOp::Absolute => "absolute",
            ChainOp::Concat(_) => "concat",
            ChainOp::Substring { .. } => "substring",
            ChainOp::Extract { .. } => "extract",
            ChainOp::ChangeCase { .. } => "changeCase",
            ChainOp::Length => "length",
            ChainOp::Lookup { .. } => "lookup",
            ChainOp::Fallback(_) => "fallback",
            ChainOp::Then(_) => "then",
            ChainOp::NumberBucket { .. } => "numberBucket",
            ChainOp::TimeBucket { .. } => "timeBucket",
            ChainOp::TimeFloor { .. } => "timeFloor",
            ChainOp::TimeShift { .. } => "timeShift",
            ChainOp::TimePart { .. } => "timePart",
            ChainOp::Cast(_) => "cast",
        }
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(
            self,
            ChainOp::Count
                | ChainOp::Sum(_)
                | ChainOp::Min(_)
                | ChainOp::Max(_)
                | ChainOp::Average(_)
                | ChainOp::CountDistinct(_)
                | ChainOp::Quantile { .. }
                | ChainOp::CustomAggregate { .. }
        )
    }

    /// Direct argument expression of a binary kind, if any. Split keys,
    /// sort keys and aggregate arguments count; unary kinds return `None`.
    pub fn argument(&self) -> Option<&Expression> {
        match self {
            ChainOp::Filter(e)
            | ChainOp::Join(e)
            | ChainOp::Sum(e)
            | ChainOp::Min(e)
            | ChainOp::Max(e)
            | ChainOp::Average(e)
            | ChainOp::CountDistinct(e)
            | ChainOp::And(e)
            | ChainOp::Or(e)
            | ChainOp::Is(e)
            | ChainOp::In(e)
            | ChainOp::Overlap(e)
            | ChainOp::Contains(e)
            | ChainOp::Add(e)
            | ChainOp::Subtract(e)
            | ChainOp::Multiply(e)
            | ChainOp::Divide(e)
            | ChainOp::Power(e)
            | ChainOp::Concat(e)
            | ChainOp::Fallback(e)
            | ChainOp::Then(e) => Some(e),
            ChainOp::Apply { expression, .. } => Some(expression),
            ChainOp::Sort { expression, .. } => Some(expression),
            ChainOp::Quantile { expression, .. } => Some(expression),
            _ => None,
        }
    }

    /// Does the argument (and split keys / sort key) sit inside the
    /// operand's row scope? Dataset-shaping kinds and aggregates introduce
    /// a nested scope; plain scalar binaries do not.
    pub fn argument_is_nested(&self) -> bool {
        matches!(
            self,
            ChainOp::Filter(_)
                | ChainOp::Apply { .. }
                | ChainOp::Split { .. }
                | ChainOp::Sort { .. }
                | ChainOp::Sum(_)
                | ChainOp::Min(_)
                | ChainOp::Max(_)
                | ChainOp::Average(_)
                | ChainOp::CountDistinct(_)
                | ChainOp::Quantile { .. }
        )
    }
}

impl Expression {
    // ---- leaf constructors ----

    /// An unresolved reference (type filled in by the resolver).
    pub fn reference(name: &str) -> Expression {
        Expression::Ref(RefExpr {
            name: name.to_string(),
            nest: 0,
            ty: AttributeType::Null,
        })
    }

    pub fn reference_typed(name: &str, ty: AttributeType) -> Expression {
        Expression::Ref(RefExpr {
            name: name.to_string(),
            nest: 0,
            ty,
        })
    }

    pub fn reference_at(name: &str, nest: usize, ty: AttributeType) -> Expression {
        Expression::Ref(RefExpr {
            name: name.to_string(),
            nest,
            ty,
        })
    }

    pub fn literal(value: Datum) -> Expression {
        Expression::Literal(LiteralExpr { value })
    }

    pub fn number(n: f64) -> Expression {
        Expression::literal(Datum::Number(n))
    }

    pub fn string(s: &str) -> Expression {
        Expression::literal(Datum::String(s.to_string()))
    }

    pub fn boolean(b: bool) -> Expression {
        Expression::literal(Datum::Bool(b))
    }

    pub fn set(s: Set) -> Expression {
        Expression::literal(Datum::Set(s))
    }

    // ---- chain constructors (validated) ----

    pub fn chain(self, op: ChainOp) -> Result<Expression> {
        validate_chain(&self, &op)?;
        Ok(Expression::Chain(ChainExpr {
            op,
            operand: Box::new(self),
        }))
    }

    pub fn filter(self, predicate: Expression) -> Result<Expression> {
        self.chain(ChainOp::Filter(Box::new(predicate)))
    }

    pub fn apply(self, name: &str, expression: Expression) -> Result<Expression> {
        self.chain(ChainOp::Apply {
            name: name.to_string(),
            expression: Box::new(expression),
        })
    }

    /// Split on a single key.
    pub fn split(self, expression: Expression, name: &str, data_name: &str) -> Result<Expression> {
        self.chain(ChainOp::Split {
            keys: vec![SplitKey {
                name: name.to_string(),
                expression: Box::new(expression),
            }],
            data_name: data_name.to_string(),
        })
    }

    /// Split on several keys. Keys are kept in canonical (name) order so
    /// structurally equal splits compare equal regardless of authoring
    /// order.
    pub fn split_multi(self, keys: Vec<(String, Expression)>, data_name: &str) -> Result<Expression> {
        let mut keys: Vec<SplitKey> = keys
            .into_iter()
            .map(|(name, expression)| SplitKey {
                name,
                expression: Box::new(expression),
            })
            .collect();
        keys.sort_by(|a, b| a.name.cmp(&b.name));
        self.chain(ChainOp::Split {
            keys,
            data_name: data_name.to_string(),
        })
    }

    pub fn sort(self, expression: Expression, direction: Direction) -> Result<Expression> {
        self.chain(ChainOp::Sort {
            expression: Box::new(expression),
            direction,
        })
    }

    pub fn limit(self, value: i64) -> Result<Expression> {
        if value < 0 {
            return Err(Error::construction(format!(
                "limit must not be negative (got {})",
                value
            )));
        }
        self.chain(ChainOp::Limit(value as usize))
    }

    pub fn select(self, attributes: &[&str]) -> Result<Expression> {
        self.chain(ChainOp::Select(
            attributes.iter().map(|a| a.to_string()).collect(),
        ))
    }

    pub fn join(self, other: Expression) -> Result<Expression> {
        self.chain(ChainOp::Join(Box::new(other)))
    }

    pub fn count(self) -> Result<Expression> {
        self.chain(ChainOp::Count)
    }

    pub fn sum(self, e: Expression) -> Result<Expression> {
        self.chain(ChainOp::Sum(Box::new(e)))
    }

    pub fn min(self, e: Expression) -> Result<Expression> {
        self.chain(ChainOp::Min(Box::new(e)))
    }

    pub fn max(self, e: Expression) -> Result<Expression> {
        self.chain(ChainOp::Max(Box::new(e)))
    }

    pub fn average(self, e: Expression) -> Result<Expression> {
        self.chain(ChainOp::Average(Box::new(e)))
    }

    pub fn count_distinct(self, e: Expression) -> Result<Expression> {
        self.chain(ChainOp::CountDistinct(Box::new(e)))
    }

    pub fn quantile(self, e: Expression, value: f64) -> Result<Expression> {
        if !(0.0..=1.0).contains(&value) {
            return Err(Error::construction(format!(
                "quantile must be in [0, 1] (got {})",
                value
            )));
        }
        self.chain(ChainOp::Quantile {
            expression: Box::new(e),
            value,
        })
    }

    pub fn and(self, e: Expression) -> Result<Expression> {
        self.chain(ChainOp::And(Box::new(e)))
    }

    pub fn or(self, e: Expression) -> Result<Expression> {
        self.chain(ChainOp::Or(Box::new(e)))
    }

    pub fn not(self) -> Result<Expression> {
        self.chain(ChainOp::Not)
    }

    pub fn is(self, e: Expression) -> Result<Expression> {
        self.chain(ChainOp::Is(Box::new(e)))
    }

    pub fn in_(self, e: Expression) -> Result<Expression> {
        self.chain(ChainOp::In(Box::new(e)))
    }

    pub fn overlap(self, e: Expression) -> Result<Expression> {
        self.chain(ChainOp::Overlap(Box::new(e)))
    }

    pub fn contains(self, e: Expression) -> Result<Expression> {
        self.chain(ChainOp::Contains(Box::new(e)))
    }

    pub fn match_(self, regex: &str) -> Result<Expression> {
        regex::Regex::new(regex)
            .map_err(|e| Error::construction(format!("invalid regex '{}': {}", regex, e)))?;
        self.chain(ChainOp::Match {
            regex: regex.to_string(),
        })
    }

    pub fn add(self, e: Expression) -> Result<Expression> {
        self.chain(ChainOp::Add(Box::new(e)))
    }

    pub fn subtract(self, e: Expression) -> Result<Expression> {
        self.chain(ChainOp::Subtract(Box::new(e)))
    }

    pub fn multiply(self, e: Expression) -> Result<Expression> {
        self.chain(ChainOp::Multiply(Box::new(e)))
    }

    pub fn divide(self, e: Expression) -> Result<Expression> {
        self.chain(ChainOp::Divide(Box::new(e)))
    }

    pub fn power(self, e: Expression) -> Result<Expression> {
        self.chain(ChainOp::Power(Box::new(e)))
    }

    pub fn absolute(self) -> Result<Expression> {
        self.chain(ChainOp::Absolute)
    }

    pub fn concat(self, e: Expression) -> Result<Expression> {
        self.chain(ChainOp::Concat(Box::new(e)))
    }

    pub fn substring(self, position: usize, len: usize) -> Result<Expression> {
        self.chain(ChainOp::Substring { position, len })
    }

    pub fn extract(self, regex: &str) -> Result<Expression> {
        regex::Regex::new(regex)
            .map_err(|e| Error::construction(format!("invalid regex '{}': {}", regex, e)))?;
        self.chain(ChainOp::Extract {
            regex: regex.to_string(),
        })
    }

    pub fn change_case(self, mode: CaseMode) -> Result<Expression> {
        self.chain(ChainOp::ChangeCase { mode })
    }

    pub fn length(self) -> Result<Expression> {
        self.chain(ChainOp::Length)
    }

    pub fn lookup(self, table: &str) -> Result<Expression> {
        self.chain(ChainOp::Lookup {
            table: table.to_string(),
        })
    }

    pub fn fallback(self, e: Expression) -> Result<Expression> {
        self.chain(ChainOp::Fallback(Box::new(e)))
    }

    pub fn then(self, e: Expression) -> Result<Expression> {
        self.chain(ChainOp::Then(Box::new(e)))
    }

    pub fn number_bucket(self, size: f64, offset: f64) -> Result<Expression> {
        if size <= 0.0 {
            return Err(Error::construction(format!(
                "bucket size must be positive (got {})",
                size
            )));
        }
        self.chain(ChainOp::NumberBucket { size, offset })
    }

    pub fn time_bucket(self, duration: Duration) -> Result<Expression> {
        self.chain(ChainOp::TimeBucket { duration })
    }

    pub fn time_floor(self, duration: Duration) -> Result<Expression> {
        self.chain(ChainOp::TimeFloor { duration })
    }

    pub fn time_shift(self, duration: Duration, step: i32) -> Result<Expression> {
        self.chain(ChainOp::TimeShift { duration, step })
    }

    pub fn time_part(self, part: TimePartKind) -> Result<Expression> {
        self.chain(ChainOp::TimePart { part })
    }

    pub fn cast(self, as_type: AttributeType) -> Result<Expression> {
        self.chain(ChainOp::Cast(as_type))
    }

    // ---- inspection ----

    pub fn output_type(&self) -> AttributeType {
        match self {
            Expression::Ref(r) => r.ty.clone(),
            Expression::Literal(l) => l.value.attribute_type(),
            Expression::Chain(c) => chain_output_type(&c.op, &c.operand),
        }
    }

    /// The inner dataset type of a dataset-valued expression.
    pub fn dataset_type(&self) -> DatasetType {
        match self.output_type() {
            AttributeType::Dataset(dt) => dt,
            _ => DatasetType::default(),
        }
    }

    pub fn as_literal(&self) -> Option<&Datum> {
        match self {
            Expression::Literal(l) => Some(&l.value),
            _ => None,
        }
    }

    pub fn as_ref_expr(&self) -> Option<&RefExpr> {
        match self {
            Expression::Ref(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_chain(&self) -> Option<&ChainExpr> {
        match self {
            Expression::Chain(c) => Some(c),
            _ => None,
        }
    }

    pub fn is_literal_true(&self) -> bool {
        matches!(self.as_literal(), Some(Datum::Bool(true)))
    }

    pub fn is_literal_false(&self) -> bool {
        matches!(self.as_literal(), Some(Datum::Bool(false)))
    }

    /// The remote placeholder at the root of this sub-tree, if any.
    pub fn as_remote(&self) -> Option<&Arc<crate::remote::RemoteDataset>> {
        match self.as_literal() {
            Some(Datum::Remote(r)) => Some(r),
            _ => None,
        }
    }

    /// Does any node of this tree satisfy `pred`?
    pub fn some(&self, pred: &dyn Fn(&Expression) -> bool) -> bool {
        if pred(self) {
            return true;
        }
        match self {
            Expression::Chain(c) => {
                if c.operand.some(pred) {
                    return true;
                }
                if let ChainOp::Split { keys, .. } = &c.op {
                    if keys.iter().any(|k| k.expression.some(pred)) {
                        return true;
                    }
                }
                c.op.argument().map(|a| a.some(pred)).unwrap_or(false)
            }
            _ => false,
        }
    }

    /// Names referenced at the current nesting level; names referencing
    /// inner dataset scopes are excluded.
    pub fn free_references(&self) -> Vec<String> {
        let mut out = Vec::new();
        collect_free(self, 0, &mut out);
        out.sort();
        out.dedup();
        out
    }
}

fn collect_free(e: &Expression, depth: usize, out: &mut Vec<String>) {
    match e {
        Expression::Ref(r) => {
            if r.nest == depth {
                out.push(r.name.clone());
            }
        }
        Expression::Literal(_) => {}
        Expression::Chain(c) => {
            collect_free(&c.operand, depth, out);
            let inner = if c.op.argument_is_nested() {
                depth + 1
            } else {
                depth
            };
            if let ChainOp::Split { keys, .. } = &c.op {
                for k in keys {
                    collect_free(&k.expression, inner, out);
                }
            }
            if let Some(arg) = c.op.argument() {
                collect_free(arg, inner, out);
            }
        }
    }
}

fn chain_output_type(op: &ChainOp, operand: &Expression) -> AttributeType {
    use AttributeType as T;
    match op {
        ChainOp::Filter(_) | ChainOp::Sort { .. } | ChainOp::Limit(_) | ChainOp::Join(_) => {
            operand.output_type()
        }
        ChainOp::Select(names) => match operand.output_type() {
            T::Dataset(dt) => T::Dataset(dt.keep_only(names)),
            other => other,
        },
        ChainOp::Apply { name, expression } => match operand.output_type() {
            T::Dataset(dt) => {
                T::Dataset(dt.with_attribute(name, expression.output_type()))
            }
            other => other,
        },
        ChainOp::Split { keys, data_name } => {
            let inner = operand.dataset_type();
            let mut dt = DatasetType::default();
            for k in keys {
                dt = dt.with_attribute(&k.name, k.expression.output_type());
            }
            dt = dt.with_attribute(data_name, T::Dataset(inner));
            T::Dataset(dt)
        }
        ChainOp::Count
        | ChainOp::Sum(_)
        | ChainOp::Average(_)
        | ChainOp::CountDistinct(_)
        | ChainOp::Quantile { .. }
        | ChainOp::CustomAggregate { .. }
        | ChainOp::Length => T::Number,
        ChainOp::Min(e) | ChainOp::Max(e) => e.output_type(),
        ChainOp::And(_)
        | ChainOp::Or(_)
        | ChainOp::Not
        | ChainOp::Is(_)
        | ChainOp::In(_)
        | ChainOp::Overlap(_)
        | ChainOp::Contains(_)
        | ChainOp::Match { .. } => T::Boolean,
        ChainOp::Add(_)
        | ChainOp::Subtract(_)
        | ChainOp::Multiply(_)
        | ChainOp::Divide(_)
        | ChainOp::Power(_)
        | ChainOp::Absolute
        | ChainOp::TimePart { .. } => T::Number,
        ChainOp::Concat(_)
        | ChainOp::Substring { .. }
        | ChainOp::Extract { .. }
        | ChainOp::ChangeCase { .. }
        | ChainOp::Lookup { .. } => T::String,
        ChainOp::Fallback(_) => operand.output_type(),
        ChainOp::Then(e) => e.output_type(),
        ChainOp::NumberBucket { .. } => T::NumberRange,
        ChainOp::TimeBucket { .. } => T::TimeRange,
        ChainOp::TimeFloor { .. } | ChainOp::TimeShift { .. } => T::Time,
        ChainOp::Cast(t) => t.clone(),
    }
}

/// Construction-time shape checks. Unresolved (null-typed) children pass;
/// the resolver re-validates once types are known.
fn validate_chain(operand: &Expression, op: &ChainOp) -> Result<()> {
    use AttributeType as T;
    let ot = operand.output_type();
    let type_err = |want: &str| {
        Err(Error::construction(format!(
            "{} requires a {} operand (got {})",
            op.name(),
            want,
            ot.tag()
        )))
    };
    let want_dataset = || {
        if ot.is_dataset() || ot == T::Null {
            Ok(())
        } else {
            type_err("DATASET")
        }
    };
    let want = |t: T, label: &str| {
        if ot.unifies_with(&t) {
            Ok(())
        } else {
            type_err(label)
        }
    };
    let arg_want = |arg: &Expression, t: T| -> Result<()> {
        let at = arg.output_type();
        if at.unifies_with(&t) {
            Ok(())
        } else {
            Err(Error::construction(format!(
                "{} requires a {} argument (got {})",
                op.name(),
                t.tag(),
                at.tag()
            )))
        }
    };

    match op {
        ChainOp::Filter(pred) => {
            want_dataset()?;
            arg_want(pred, T::Boolean)
        }
        ChainOp::Apply { name, .. } => {
            want_dataset()?;
            if name.is_empty() {
                return Err(Error::construction("apply name must not be empty"));
            }
            Ok(())
        }
        ChainOp::Split { keys, data_name } => {
            want_dataset()?;
            if keys.is_empty() {
                return Err(Error::construction("split must have at least one key"));
            }
            if data_name.is_empty() {
                return Err(Error::construction("split data name must not be empty"));
            }
            Ok(())
        }
        ChainOp::Sort { .. } | ChainOp::Limit(_) | ChainOp::Select(_) => want_dataset(),
        ChainOp::Join(other) => {
            want_dataset()?;
            arg_want(other, T::Dataset(DatasetType::default()))
        }
        ChainOp::Count | ChainOp::CustomAggregate { .. } => want_dataset(),
        ChainOp::Sum(e) | ChainOp::Average(e) | ChainOp::Quantile { expression: e, .. } => {
            want_dataset()?;
            arg_want(e, T::Number)
        }
        ChainOp::Min(_) | ChainOp::Max(_) | ChainOp::CountDistinct(_) => want_dataset(),
        ChainOp::And(e) | ChainOp::Or(e) => {
            want(T::Boolean, "BOOLEAN")?;
            arg_want(e, T::Boolean)
        }
        ChainOp::Not => want(T::Boolean, "BOOLEAN"),
        ChainOp::Is(e) => {
            let at = e.output_type();
            if ot.unifies_with(&at) {
                Ok(())
            } else {
                Err(Error::construction(format!(
                    "is requires matching types ({} vs {})",
                    ot.tag(),
                    at.tag()
                )))
            }
        }
        ChainOp::In(e) => {
            let at = e.output_type();
            let ok = match &at {
                T::Set(inner) => ot.unifies_with(inner),
                T::NumberRange => ot.unifies_with(&T::Number),
                T::TimeRange => ot.unifies_with(&T::Time),
                T::Null => true,
                _ => false,
            };
            if ok {
                Ok(())
            } else {
                Err(Error::construction(format!(
                    "in requires a SET or range argument matching {} (got {})",
                    ot.tag(),
                    at.tag()
                )))
            }
        }
        ChainOp::Overlap(e) => {
            let at = e.output_type();
            let ok = matches!(
                at,
                T::NumberRange | T::TimeRange | T::Set(_) | T::Null
            );
            if ok {
                Ok(())
            } else {
                Err(Error::construction(
                    "overlap requires a range or set argument".to_string(),
                ))
            }
        }
        ChainOp::Contains(e) => {
            want(T::String, "STRING")?;
            arg_want(e, T::String)
        }
        ChainOp::Match { .. } | ChainOp::Extract { .. } => want(T::String, "STRING"),
        ChainOp::Add(e)
        | ChainOp::Subtract(e)
        | ChainOp::Multiply(e)
        | ChainOp::Divide(e)
        | ChainOp::Power(e) => {
            want(T::Number, "NUMBER")?;
            arg_want(e, T::Number)
        }
        ChainOp::Absolute => want(T::Number, "NUMBER"),
        ChainOp::Concat(e) => {
            want(T::String, "STRING")?;
            arg_want(e, T::String)
        }
        ChainOp::Substring { .. } | ChainOp::ChangeCase { .. } | ChainOp::Length => {
            want(T::String, "STRING")
        }
        ChainOp::Lookup { .. } => want(T::String, "STRING"),
        ChainOp::Fallback(e) => {
            let at = e.output_type();
            if ot.unifies_with(&at) {
                Ok(())
            } else {
                Err(Error::construction(format!(
                    "fallback requires matching types ({} vs {})",
                    ot.tag(),
                    at.tag()
                )))
            }
        }
        ChainOp::Then(_) => want(T::Boolean, "BOOLEAN"),
        ChainOp::NumberBucket { .. } => want(T::Number, "NUMBER"),
        ChainOp::TimeBucket { .. }
        | ChainOp::TimeFloor { .. }
        | ChainOp::TimeShift { .. }
        | ChainOp::TimePart { .. } => want(T::Time, "TIME"),
        ChainOp::Cast(t) => match t {
            T::Number | T::String | T::Time | T::Boolean => Ok(()),
            _ => Err(Error::construction(format!(
                "can not cast to {}",
                t.tag()
            ))),
        },
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Ref(r) => {
                for _ in 0..r.nest {
                    write!(f, "^")?;
                }
                write!(f, "${}", r.name)
            }
            Expression::Literal(l) => write!(f, "{}", l.value.to_js()),
            Expression::Chain(c) => {
                write!(f, "{}.{}(", c.operand, c.op.name())?;
                if let Some(arg) = c.op.argument() {
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structural_equality() {
        let a = Expression::reference_typed("added", AttributeType::Number)
            .add(Expression::number(1.0))
            .unwrap();
        let b = Expression::reference_typed("added", AttributeType::Number)
            .add(Expression::number(1.0))
            .unwrap();
        assert_eq!(a, b);
        let c = Expression::reference_typed("added", AttributeType::Number)
            .add(Expression::number(2.0))
            .unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_output_types() {
        let r = Expression::reference_typed("added", AttributeType::Number);
        assert_eq!(
            r.clone().add(Expression::number(1.0)).unwrap().output_type(),
            AttributeType::Number
        );
        assert_eq!(
            r.clone().is(Expression::number(1.0)).unwrap().output_type(),
            AttributeType::Boolean
        );
        let t = Expression::reference_typed("time", AttributeType::Time);
        assert_eq!(
            t.time_bucket(Duration::parse("P1D").unwrap())
                .unwrap()
                .output_type(),
            AttributeType::TimeRange
        );
    }

    #[test]
    fn test_construction_errors() {
        // number + string
        assert!(Expression::number(1.0)
            .add(Expression::string("x"))
            .is_err());
        // negative limit
        assert!(Expression::reference("data").limit(-3).is_err());
        // empty split
        assert!(Expression::reference("data")
            .split_multi(vec![], "inner")
            .is_err());
        // filter on a number
        assert!(Expression::number(1.0)
            .filter(Expression::boolean(true))
            .is_err());
        // bad regex
        assert!(Expression::string("x").match_("(").is_err());
    }

    #[test]
    fn test_free_references() {
        let data = Expression::reference_typed(
            "data",
            AttributeType::Dataset(DatasetType::from_pairs(vec![(
                "channel",
                AttributeType::String,
            )])),
        );
        let e = data
            .filter(
                Expression::reference_at("channel", 0, AttributeType::String)
                    .is(Expression::string("en"))
                    .unwrap(),
            )
            .unwrap();
        // channel lives in the row scope, not the current level
        assert_eq!(e.free_references(), vec!["data".to_string()]);

        // a ^-reference escapes back to the current level
        let data2 = Expression::reference("data");
        let outer = Expression::reference_at("threshold", 1, AttributeType::Number);
        let e2 = data2
            .filter(
                Expression::reference_at("added", 0, AttributeType::Number)
                    .is(outer)
                    .unwrap(),
            )
            .unwrap();
        let mut frees = e2.free_references();
        frees.sort();
        assert_eq!(frees, vec!["data".to_string(), "threshold".to_string()]);
    }

    #[test]
    fn test_apply_extends_dataset_type() {
        let dt = DatasetType::from_pairs(vec![("added", AttributeType::Number)]);
        let data = Expression::reference_typed("data", AttributeType::Dataset(dt));
        let applied = data
            .apply(
                "Added",
                Expression::reference_typed("data", AttributeType::Dataset(DatasetType::default()))
                    .sum(Expression::reference_typed("added", AttributeType::Number))
                    .unwrap(),
            )
            .unwrap();
        let out = applied.dataset_type();
        assert_eq!(out.get("Added"), Some(&AttributeType::Number));
        assert_eq!(out.get("added"), Some(&AttributeType::Number));
    }
}
