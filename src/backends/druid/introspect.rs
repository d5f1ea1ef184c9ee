//! Source introspection.
//!
//! A `segmentMetadata` query describes the physical columns; their native
//! type names normalize into the logical type system. Sketch columns keep
//! their native name so aggregation emission can pick the right estimator.

use serde_json::{json, Value as Json};

use crate::backends::logical_type;
use crate::error::{Error, Result};
use crate::types::{AttributeInfo, AttributeType};

pub fn query(source: &str) -> Json {
    json!({
        "queryType": "segmentMetadata",
        "dataSource": source,
        "merge": true,
        "analysisTypes": [],
        "lenientAggregatorMerge": true,
    })
}

pub fn attributes(response: &Json) -> Result<Vec<AttributeInfo>> {
    let merged = response
        .as_array()
        .and_then(|a| a.first())
        .ok_or_else(|| Error::Transport("empty segment metadata response".to_string()))?;
    let columns = merged["columns"]
        .as_object()
        .ok_or_else(|| Error::Transport("segment metadata has no columns".to_string()))?;
    let mut out = Vec::new();
    for (name, info) in columns {
        let native = info["type"].as_str().unwrap_or("");
        let ty = if name == "__time" {
            AttributeType::Time
        } else {
            logical_type(native)
        };
        out.push(AttributeInfo::new(name, ty).with_native_type(native));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_types_normalize() {
        let response = json!([{
            "columns": {
                "__time": { "type": "LONG" },
                "channel": { "type": "STRING" },
                "added": { "type": "LONG" },
                "delta": { "type": "DOUBLE" },
                "unique_users": { "type": "hyperUnique" },
            }
        }]);
        let attrs = attributes(&response).unwrap();
        let get = |n: &str| attrs.iter().find(|a| a.name == n).unwrap();
        assert_eq!(get("__time").ty, AttributeType::Time);
        assert_eq!(get("channel").ty, AttributeType::String);
        assert_eq!(get("added").ty, AttributeType::Number);
        assert_eq!(get("delta").ty, AttributeType::Number);
        // unknown native types come through untyped but keep the name
        assert_eq!(get("unique_users").ty, AttributeType::Null);
        assert_eq!(get("unique_users").native_type.as_deref(), Some("hyperUnique"));
    }
}
