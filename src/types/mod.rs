//! Logical type system.
//!
//! Every expression node has a fixed output type drawn from [`AttributeType`].
//! Dataset-valued expressions carry a [`DatasetType`]: a named-attribute
//! scope that nests (splits and applies introduce inner datasets), with a
//! parent link used by the resolver to reach ancestor scopes.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Logical output type of an expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeType {
    Null,
    Boolean,
    Number,
    String,
    Time,
    NumberRange,
    TimeRange,
    /// Homogeneous set; the element type is recorded so the empty set is
    /// still typed.
    Set(Box<AttributeType>),
    Dataset(DatasetType),
}

impl AttributeType {
    /// Parse the wire name used in serialized expressions
    /// (`"NUMBER"`, `"SET/STRING"`, ...).
    pub fn from_tag(tag: &str) -> Result<AttributeType> {
        Ok(match tag {
            "NULL" => AttributeType::Null,
            "BOOLEAN" => AttributeType::Boolean,
            "NUMBER" => AttributeType::Number,
            "STRING" => AttributeType::String,
            "TIME" => AttributeType::Time,
            "NUMBER_RANGE" => AttributeType::NumberRange,
            "TIME_RANGE" => AttributeType::TimeRange,
            "DATASET" => AttributeType::Dataset(DatasetType::default()),
            _ => {
                if let Some(inner) = tag.strip_prefix("SET/") {
                    AttributeType::Set(Box::new(AttributeType::from_tag(inner)?))
                } else {
                    return Err(Error::construction(format!("unknown type tag '{}'", tag)));
                }
            }
        })
    }

    pub fn tag(&self) -> String {
        match self {
            AttributeType::Null => "NULL".to_string(),
            AttributeType::Boolean => "BOOLEAN".to_string(),
            AttributeType::Number => "NUMBER".to_string(),
            AttributeType::String => "STRING".to_string(),
            AttributeType::Time => "TIME".to_string(),
            AttributeType::NumberRange => "NUMBER_RANGE".to_string(),
            AttributeType::TimeRange => "TIME_RANGE".to_string(),
            AttributeType::Set(inner) => format!("SET/{}", inner.tag()),
            AttributeType::Dataset(_) => "DATASET".to_string(),
        }
    }

    pub fn is_dataset(&self) -> bool {
        matches!(self, AttributeType::Dataset(_))
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, AttributeType::Number)
    }

    /// The range type bucketing this scalar produces, if any.
    pub fn bucket_type(&self) -> Option<AttributeType> {
        match self {
            AttributeType::Number => Some(AttributeType::NumberRange),
            AttributeType::Time => Some(AttributeType::TimeRange),
            _ => None,
        }
    }

    /// Two types unify when equal or when one side is still untyped null.
    pub fn unifies_with(&self, other: &AttributeType) -> bool {
        self == other
            || matches!(self, AttributeType::Null)
            || matches!(other, AttributeType::Null)
    }
}

impl fmt::Display for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// A nested named-attribute scope.
///
/// Equality is structural over the attribute map; the parent link exists
/// only for resolution and is deliberately excluded from comparison.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatasetType {
    pub attributes: BTreeMap<String, AttributeType>,
    #[serde(skip)]
    pub parent: Option<Arc<DatasetType>>,
}

impl PartialEq for DatasetType {
    fn eq(&self, other: &Self) -> bool {
        self.attributes == other.attributes
    }
}

impl DatasetType {
    pub fn new(attributes: BTreeMap<String, AttributeType>) -> DatasetType {
        DatasetType {
            attributes,
            parent: None,
        }
    }

    pub fn from_pairs(pairs: Vec<(&str, AttributeType)>) -> DatasetType {
        DatasetType::new(
            pairs
                .into_iter()
                .map(|(n, t)| (n.to_string(), t))
                .collect(),
        )
    }

    /// Push this scope under `parent`, producing the scope seen inside a
    /// split or apply.
    pub fn nest_under(mut self, parent: &DatasetType) -> DatasetType {
        self.parent = Some(Arc::new(parent.clone()));
        self
    }

    pub fn get(&self, name: &str) -> Option<&AttributeType> {
        self.attributes.get(name)
    }

    /// Resolve `name` at an explicit nesting depth: walk `nest` parents up,
    /// then look the name up in that scope.
    pub fn resolve_at(&self, name: &str, nest: usize) -> Result<&AttributeType> {
        let mut scope = self;
        for _ in 0..nest {
            scope = scope.parent.as_deref().ok_or_else(|| {
                Error::construction(format!(
                    "reference '{}' escapes the scope chain (nest {})",
                    name, nest
                ))
            })?;
        }
        scope.get(name).ok_or_else(|| {
            Error::construction(format!("could not resolve reference '{}'", name))
        })
    }

    /// Resolve an unqualified reference: search this scope, then ancestors.
    /// Returns the type and the depth at which the name was found.
    pub fn resolve(&self, name: &str) -> Result<(&AttributeType, usize)> {
        let mut scope = self;
        let mut depth = 0;
        loop {
            if let Some(ty) = scope.get(name) {
                return Ok((ty, depth));
            }
            match scope.parent.as_deref() {
                Some(parent) => {
                    scope = parent;
                    depth += 1;
                }
                None => {
                    return Err(Error::construction(format!(
                        "could not resolve reference '{}'",
                        name
                    )))
                }
            }
        }
    }

    pub fn with_attribute(mut self, name: &str, ty: AttributeType) -> DatasetType {
        self.attributes.insert(name.to_string(), ty);
        self
    }

    pub fn keep_only(&self, names: &[String]) -> DatasetType {
        DatasetType {
            attributes: self
                .attributes
                .iter()
                .filter(|(n, _)| names.iter().any(|k| k == *n))
                .map(|(n, t)| (n.clone(), t.clone()))
                .collect(),
            parent: self.parent.clone(),
        }
    }
}

/// How a physical column was derived when the source is rolled up.
///
/// Recorded per attribute so the plan compiler can recognize when a logical
/// aggregate is redundant with an existing rollup (a logical `count()`
/// becomes `sum()` over the pre-aggregated count column).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Maker {
    Count,
    Sum { column: String },
    Min { column: String },
    Max { column: String },
    /// The column stores time already floored to `duration`; finer-grained
    /// filters and splits against it are unanswerable.
    TimeFloor { duration: crate::values::Duration },
}

/// Declared attribute of a remote source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: AttributeType,
    /// Backend-native storage type, when it matters for emission
    /// (e.g. `hyperUnique` selects a sketch-backed distinct count).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub native_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maker: Option<Maker>,
}

impl AttributeInfo {
    pub fn new(name: &str, ty: AttributeType) -> AttributeInfo {
        AttributeInfo {
            name: name.to_string(),
            ty,
            native_type: None,
            maker: None,
        }
    }

    pub fn with_native_type(mut self, native: &str) -> AttributeInfo {
        self.native_type = Some(native.to_string());
        self
    }

    pub fn with_maker(mut self, maker: Maker) -> AttributeInfo {
        self.maker = Some(maker);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_tag_round_trip() {
        for tag in ["NUMBER", "STRING", "TIME", "SET/STRING", "SET/NUMBER_RANGE"] {
            assert_eq!(AttributeType::from_tag(tag).unwrap().tag(), tag);
        }
        assert!(AttributeType::from_tag("WIDGET").is_err());
    }

    #[test]
    fn test_scope_chain_resolution() {
        let outer = DatasetType::from_pairs(vec![
            ("channel", AttributeType::String),
            ("added", AttributeType::Number),
        ]);
        let inner = DatasetType::from_pairs(vec![("Count", AttributeType::Number)])
            .nest_under(&outer);

        assert_eq!(
            inner.resolve_at("Count", 0).unwrap(),
            &AttributeType::Number
        );
        assert_eq!(
            inner.resolve_at("channel", 1).unwrap(),
            &AttributeType::String
        );
        assert!(inner.resolve_at("channel", 2).is_err());

        let (ty, depth) = inner.resolve("channel").unwrap();
        assert_eq!(ty, &AttributeType::String);
        assert_eq!(depth, 1);
    }

    #[test]
    fn test_dataset_type_equality_ignores_parent() {
        let outer = DatasetType::from_pairs(vec![("x", AttributeType::Number)]);
        let a = DatasetType::from_pairs(vec![("y", AttributeType::String)]);
        let b = a.clone().nest_under(&outer);
        assert_eq!(a, b);
    }
}
