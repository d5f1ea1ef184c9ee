//! Backend dispatch.
//!
//! A compiled plan names its engine by id; the registry maps ids to
//! concrete engines and is passed explicitly wherever queries are emitted
//! or responses normalized. There is no process-wide default.

use std::collections::BTreeMap;

use serde_json::Value as Json;

use crate::error::{Error, Result};
use crate::remote::RemoteDataset;
use crate::types::{AttributeInfo, AttributeType};
use crate::values::Dataset;

pub mod druid;
pub mod sql;

pub use sql::{InflateKind, Inflater, SqlDialect, SqlQuery};

/// Default native version assumed when neither the engine entry nor the
/// plan pins one.
pub const DEFAULT_DRUID_VERSION: &str = "0.20.0";

#[derive(Debug, Clone, PartialEq)]
pub enum Engine {
    /// The native JSON query API.
    DruidNative { version: String },
    /// A SQL endpoint.
    Sql { dialect: SqlDialect },
}

#[derive(Debug, Clone, Default)]
pub struct EngineRegistry {
    engines: BTreeMap<String, Engine>,
}

impl EngineRegistry {
    pub fn new() -> EngineRegistry {
        EngineRegistry::default()
    }

    pub fn register(&mut self, id: &str, engine: Engine) {
        self.engines.insert(id.to_string(), engine);
    }

    pub fn get(&self, id: &str) -> Result<&Engine> {
        self.engines
            .get(id)
            .ok_or_else(|| Error::construction(format!("unknown engine '{}'", id)))
    }

    /// A registry preloaded with one engine of each flavor, for tests and
    /// dry runs.
    pub fn simulation() -> EngineRegistry {
        let mut r = EngineRegistry::new();
        r.register(
            "druid",
            Engine::DruidNative {
                version: DEFAULT_DRUID_VERSION.to_string(),
            },
        );
        r.register(
            "druidsql",
            Engine::Sql {
                dialect: SqlDialect::Druid,
            },
        );
        r.register(
            "sql",
            Engine::Sql {
                dialect: SqlDialect::Generic,
            },
        );
        r
    }
}

/// What gets sent over the wire for one plan.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryPayload {
    Native(Json),
    Sql(SqlQuery),
}

pub fn compile(remote: &RemoteDataset, registry: &EngineRegistry) -> Result<QueryPayload> {
    match registry.get(&remote.engine)? {
        Engine::DruidNative { version } => {
            // a version pinned on the plan (from introspection) wins
            let version = remote.version.as_deref().unwrap_or(version);
            Ok(QueryPayload::Native(druid::emit(remote, version)?))
        }
        Engine::Sql { dialect } => Ok(QueryPayload::Sql(sql::emit(remote, *dialect)?)),
    }
}

pub fn normalize(
    remote: &RemoteDataset,
    payload: &QueryPayload,
    response: &Json,
) -> Result<Dataset> {
    match payload {
        QueryPayload::Native(_) => druid::normalize(remote, response),
        QueryPayload::Sql(query) => sql::normalize(query, response),
    }
}

pub fn introspection_query(engine: &Engine, source: &str) -> QueryPayload {
    match engine {
        Engine::DruidNative { .. } => QueryPayload::Native(druid::introspect::query(source)),
        Engine::Sql { .. } => QueryPayload::Sql(sql::introspection_query(source)),
    }
}

pub fn introspected_attributes(engine: &Engine, response: &Json) -> Result<Vec<AttributeInfo>> {
    match engine {
        Engine::DruidNative { .. } => druid::introspect::attributes(response),
        Engine::Sql { .. } => sql::attributes(response),
    }
}

/// Native column type names normalize into the logical type system;
/// anything unrecognized (sketches and other complex columns) comes
/// through untyped.
pub fn logical_type(native: &str) -> AttributeType {
    match native.to_ascii_uppercase().as_str() {
        "TIMESTAMP" | "TIME" | "DATE" => AttributeType::Time,
        "VARCHAR" | "STRING" | "CHAR" => AttributeType::String,
        "BIGINT" | "LONG" | "INTEGER" | "INT" | "FLOAT" | "DOUBLE" | "DECIMAL" | "REAL" => {
            AttributeType::Number
        }
        _ => AttributeType::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup() {
        let registry = EngineRegistry::simulation();
        assert!(matches!(
            registry.get("druid").unwrap(),
            Engine::DruidNative { .. }
        ));
        let err = registry.get("presto").unwrap_err();
        assert!(err.to_string().contains("presto"));
    }

    #[test]
    fn test_logical_types() {
        assert_eq!(logical_type("TIMESTAMP"), AttributeType::Time);
        assert_eq!(logical_type("VARCHAR"), AttributeType::String);
        assert_eq!(logical_type("BIGINT"), AttributeType::Number);
        assert_eq!(logical_type("DOUBLE"), AttributeType::Number);
        assert_eq!(logical_type("hyperUnique"), AttributeType::Null);
    }

    #[test]
    fn test_compile_dispatches_by_engine() {
        use crate::expressions::ChainOp;
        use crate::types::AttributeInfo;

        let registry = EngineRegistry::simulation();
        let attrs = vec![
            AttributeInfo::new("__time", AttributeType::Time),
            AttributeInfo::new("added", AttributeType::Number),
        ];

        let mut native = RemoteDataset::new("druid", "wikipedia").with_attributes(attrs.clone());
        native.capabilities.allow_eternity = true;
        let native = native.add_operation(&ChainOp::Count).unwrap();
        match compile(&native, &registry).unwrap() {
            QueryPayload::Native(q) => assert_eq!(q["queryType"], "timeseries"),
            other => panic!("expected a native payload, got {:?}", other),
        }

        let via_sql = RemoteDataset::new("druidsql", "wikipedia")
            .with_attributes(attrs)
            .add_operation(&ChainOp::Count)
            .unwrap();
        match compile(&via_sql, &registry).unwrap() {
            QueryPayload::Sql(q) => assert!(q.sql.starts_with("SELECT COUNT(*)")),
            other => panic!("expected a sql payload, got {:?}", other),
        }
    }
}
