//! Native expression strings.
//!
//! The escape hatch for scalar logic the column-native paths cannot carry:
//! virtual columns, expression filters, and expression post-aggregations
//! all take this string form. Availability is version-gated; callers check
//! the gate and fall back to an emission error naming the construct.

use crate::error::{Error, Result};
use crate::expressions::{CaseMode, ChainOp, Expression, TimePartKind};
use crate::values::Datum;

/// First release with the expression language.
pub const EXPRESSIONS_SINCE: &str = "0.11.0";
/// `timestamp_shift` and friends arrived later.
pub const TIME_SHIFT_SINCE: &str = "0.13.0";

/// Lexicographic-by-component version comparison.
pub fn version_at_least(version: &str, min: &str) -> bool {
    let parse = |s: &str| -> Vec<u64> {
        s.split('.')
            .map(|p| {
                p.chars()
                    .take_while(|c| c.is_ascii_digit())
                    .collect::<String>()
                    .parse()
                    .unwrap_or(0)
            })
            .collect()
    };
    parse(version) >= parse(min)
}

pub fn emit(e: &Expression, version: &str) -> Result<String> {
    if !version_at_least(version, EXPRESSIONS_SINCE) {
        return Err(Error::unsupported(
            format!("expression '{}' (no expression support before {})", e, EXPRESSIONS_SINCE),
            "druid",
        ));
    }
    emit_any(e, version)
}

fn emit_any(e: &Expression, version: &str) -> Result<String> {
    match e {
        Expression::Ref(r) => Ok(format!("\"{}\"", r.name)),
        Expression::Literal(l) => emit_literal(&l.value),
        Expression::Chain(c) => {
            let operand = emit_any(&c.operand, version)?;
            emit_op(&c.op, operand, version)
        }
    }
}

fn emit_literal(v: &Datum) -> Result<String> {
    Ok(match v {
        Datum::Null => "null".to_string(),
        Datum::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        Datum::Number(n) => format_number(*n),
        Datum::String(s) => quote_string(s),
        Datum::Time(t) => t.timestamp_millis().to_string(),
        other => {
            return Err(Error::unsupported(
                format!("a {} literal in an expression", other.attribute_type()),
                "druid",
            ))
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

fn quote_string(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
}

fn emit_op(op: &ChainOp, operand: String, version: &str) -> Result<String> {
    let arg = |a: &Expression| emit_any(a, version);
    Ok(match op {
        ChainOp::Not => format!("!{}", operand),
        ChainOp::Absolute => format!("abs({})", operand),
        ChainOp::Length => format!("strlen({})", operand),
        ChainOp::And(a) => format!("({} && {})", operand, arg(a)?),
        ChainOp::Or(a) => format!("({} || {})", operand, arg(a)?),
        ChainOp::Is(a) => format!("({} == {})", operand, arg(a)?),
        ChainOp::Add(a) => format!("({} + {})", operand, arg(a)?),
        ChainOp::Subtract(a) => format!("({} - {})", operand, arg(a)?),
        ChainOp::Multiply(a) => format!("({} * {})", operand, arg(a)?),
        ChainOp::Divide(a) => format!("({} / {})", operand, arg(a)?),
        ChainOp::Power(a) => format!("pow({}, {})", operand, arg(a)?),
        ChainOp::Concat(a) => format!("concat({}, {})", operand, arg(a)?),
        ChainOp::Fallback(a) => format!("nvl({}, {})", operand, arg(a)?),
        ChainOp::Then(a) => format!("if({}, {}, null)", operand, arg(a)?),
        ChainOp::Contains(a) => {
            format!("(strpos({}, {}) >= 0)", operand, arg(a)?)
        }
        ChainOp::Match { regex } => format!(
            "(regexp_extract({}, {}) != null)",
            operand,
            quote_string(regex)
        ),
        ChainOp::Extract { regex } => {
            format!("regexp_extract({}, {}, 1)", operand, quote_string(regex))
        }
        ChainOp::Substring { position, len } => {
            format!("substring({}, {}, {})", operand, position, len)
        }
        ChainOp::ChangeCase { mode } => match mode {
            CaseMode::Upper => format!("upper({})", operand),
            CaseMode::Lower => format!("lower({})", operand),
        },
        ChainOp::Lookup { table } => {
            format!("lookup({}, {})", operand, quote_string(table))
        }
        ChainOp::In(a) | ChainOp::Overlap(a) => emit_in(&operand, a, version)?,
        ChainOp::NumberBucket { size, offset } => format!(
            "(floor(({} - {off}) / {size}) * {size} + {off})",
            operand,
            size = format_number(*size),
            off = format_number(*offset),
        ),
        ChainOp::TimeBucket { duration } | ChainOp::TimeFloor { duration } => format!(
            "timestamp_floor({}, '{}')",
            operand, duration
        ),
        ChainOp::TimeShift { duration, step } => {
            if !version_at_least(version, TIME_SHIFT_SINCE) {
                return Err(Error::unsupported(
                    format!("timeShift before {}", TIME_SHIFT_SINCE),
                    "druid",
                ));
            }
            format!("timestamp_shift({}, '{}', {})", operand, duration, step)
        }
        ChainOp::TimePart { part } => format!(
            "timestamp_extract({}, '{}')",
            operand,
            time_part_unit(*part)
        ),
        ChainOp::Cast(ty) => {
            let native = match ty {
                crate::types::AttributeType::Number => "DOUBLE",
                crate::types::AttributeType::String => "STRING",
                crate::types::AttributeType::Time => "LONG",
                other => {
                    return Err(Error::unsupported(
                        format!("cast to {}", other),
                        "druid",
                    ))
                }
            };
            format!("cast({}, '{}')", operand, native)
        }
        other => {
            return Err(Error::unsupported(
                format!("operation '{}' in an expression", other.name()),
                "druid",
            ))
        }
    })
}

fn emit_in(operand: &str, arg: &Expression, version: &str) -> Result<String> {
    match arg.as_literal() {
        Some(Datum::Set(set)) => {
            let terms = set
                .elements
                .iter()
                .map(|el| Ok(format!("({} == {})", operand, emit_literal(el)?)))
                .collect::<Result<Vec<_>>>()?;
            Ok(format!("({})", terms.join(" || ")))
        }
        Some(Datum::NumberRange(r)) => {
            let mut terms = Vec::new();
            if let Some(s) = r.start {
                let cmp = if r.bounds.start_closed { ">=" } else { ">" };
                terms.push(format!("{} {} {}", operand, cmp, format_number(s)));
            }
            if let Some(e) = r.end {
                let cmp = if r.bounds.end_closed { "<=" } else { "<" };
                terms.push(format!("{} {} {}", operand, cmp, format_number(e)));
            }
            if terms.is_empty() {
                return Ok("1".to_string());
            }
            Ok(format!("({})", terms.join(" && ")))
        }
        Some(Datum::TimeRange(r)) => {
            let mut terms = Vec::new();
            if let Some(s) = r.start {
                let cmp = if r.bounds.start_closed { ">=" } else { ">" };
                terms.push(format!("{} {} {}", operand, cmp, s.timestamp_millis()));
            }
            if let Some(e) = r.end {
                let cmp = if r.bounds.end_closed { "<=" } else { "<" };
                terms.push(format!("{} {} {}", operand, cmp, e.timestamp_millis()));
            }
            if terms.is_empty() {
                return Ok("1".to_string());
            }
            Ok(format!("({})", terms.join(" && ")))
        }
        _ => {
            let a = emit_any(arg, version)?;
            Ok(format!("({} == {})", operand, a))
        }
    }
}

fn time_part_unit(part: TimePartKind) -> &'static str {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AttributeType;

    fn added() -> Expression {
        Expression::reference_typed("added", AttributeType::Number)
    }

    #[test]
    fn test_version_comparison() {
        assert!(version_at_least("0.13.0", "0.11.0"));
        assert!(version_at_least("0.11.0", "0.11.0"));
        assert!(!version_at_least("0.10.1", "0.11.0"));
        assert!(version_at_least("25.0.0", "0.13.0"));
    }

    #[test]
    fn test_arithmetic_emission() {
        let e = added()
            .add(Expression::number(1.0))
            .unwrap()
            .multiply(Expression::number(2.5))
            .unwrap();
        assert_eq!(emit(&e, "0.20.0").unwrap(), "((\"added\" + 1) * 2.5)");
    }

    #[test]
    fn test_string_escaping() {
        let e = Expression::reference_typed("page", AttributeType::String)
            .is(Expression::string("it's"))
            .unwrap();
        assert_eq!(emit(&e, "0.20.0").unwrap(), "(\"page\" == 'it\\'s')");
    }

    #[test]
    fn test_old_version_rejected() {
        let err = emit(&added(), "0.9.2").unwrap_err();
        assert!(matches!(err, Error::Unsupported { .. }));
    }

    #[test]
    fn test_time_shift_gate() {
        let e = Expression::reference_typed("__time", AttributeType::Time)
            .time_shift(crate::values::Duration::parse("P1D").unwrap(), -1)
            .unwrap();
        assert!(emit(&e, "0.11.0").is_err());
        assert_eq!(
            emit(&e, "0.13.0").unwrap(),
            "timestamp_shift(\"__time\", 'P1D', -1)"
        );
    }
}
