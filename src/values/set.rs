//! Homogeneous set values.
//!
//! Elements are kept deduplicated in a canonical order so equality is
//! structural. The element type is recorded explicitly so that an empty set
//! is still typed.

use std::cmp::Ordering;

use crate::error::{Error, Result};
use crate::types::AttributeType;
use crate::values::Datum;

#[derive(Debug, Clone, PartialEq)]
pub struct Set {
    pub set_type: AttributeType,
    pub elements: Vec<Datum>,
}

impl Set {
    /// Build a set, checking element homogeneity and canonicalizing order.
    pub fn new(set_type: AttributeType, mut elements: Vec<Datum>) -> Result<Set> {
        for e in &elements {
            if !e.attribute_type().unifies_with(&set_type) {
                return Err(Error::construction(format!(
                    "set of type {} can not hold a {}",
                    set_type.tag(),
                    e.attribute_type().tag()
                )));
            }
        }
        elements.sort_by(compare_datums);
        elements.dedup();
        Ok(Set { set_type, elements })
    }

    pub fn of_strings(values: &[&str]) -> Set {
        Set::new(
            AttributeType::String,
            values.iter().map(|v| Datum::String(v.to_string())).collect(),
        )
        .unwrap()
    }

    pub fn of_numbers(values: &[f64]) -> Set {
        Set::new(
            AttributeType::Number,
            values.iter().map(|v| Datum::Number(*v)).collect(),
        )
        .unwrap()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn contains(&self, d: &Datum) -> bool {
        self.elements.iter().any(|e| e == d)
    }

    pub fn union(&self, other: &Set) -> Result<Set> {
        let mut elements = self.elements.clone();
        elements.extend(other.elements.iter().cloned());
        Set::new(self.set_type.clone(), elements)
    }

    pub fn intersect(&self, other: &Set) -> Result<Set> {
        let elements = self
            .elements
            .iter()
            .filter(|e| other.contains(e))
            .cloned()
            .collect();
        Set::new(self.set_type.clone(), elements)
    }
}

/// Canonical element order: by type tag first, then by value.
fn compare_datums(a: &Datum, b: &Datum) -> Ordering {
    match (a, b) {
        (Datum::Number(x), Datum::Number(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        (Datum::String(x), Datum::String(y)) => x.cmp(y),
        (Datum::Bool(x), Datum::Bool(y)) => x.cmp(y),
        (Datum::Time(x), Datum::Time(y)) => x.cmp(y),
        (Datum::NumberRange(x), Datum::NumberRange(y)) => x
            .start
            .partial_cmp(&y.start)
            .unwrap_or(Ordering::Equal)
            .then(x.end.partial_cmp(&y.end).unwrap_or(Ordering::Equal)),
        (Datum::TimeRange(x), Datum::TimeRange(y)) => {
            x.start.cmp(&y.start).then(x.end.cmp(&y.end))
        }
        _ => a
            .attribute_type()
            .tag()
            .cmp(&b.attribute_type().tag()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_order_equality() {
        let a = Set::of_strings(&["en", "de", "fr"]);
        let b = Set::of_strings(&["fr", "en", "de", "en"]);
        assert_eq!(a, b);
        assert_eq!(b.len(), 3);
    }

    #[test]
    fn test_heterogeneous_rejected() {
        let err = Set::new(
            AttributeType::String,
            vec![Datum::String("a".to_string()), Datum::Number(1.0)],
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_union_intersect_contains() {
        let a = Set::of_numbers(&[1.0, 2.0, 3.0]);
        let b = Set::of_numbers(&[3.0, 4.0]);
        assert_eq!(a.union(&b).unwrap(), Set::of_numbers(&[1.0, 2.0, 3.0, 4.0]));
        assert_eq!(a.intersect(&b).unwrap(), Set::of_numbers(&[3.0]));
        assert!(a.contains(&Datum::Number(2.0)));
        assert!(!a.contains(&Datum::Number(9.0)));
    }

    #[test]
    fn test_empty_set_is_typed() {
        let e = Set::new(AttributeType::String, vec![]).unwrap();
        assert!(e.is_empty());
        assert_eq!(e.set_type, AttributeType::String);
    }
}
