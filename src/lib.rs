//! A composable query algebra that compiles to analytic backends.
//!
//! Queries are built as immutable [`Expression`] trees over typed dataset
//! scopes. Simplification folds operations bottom-up; operations that land
//! on a remote-dataset literal are pushed into its query plan when the
//! backend can honor them and stay in the tree otherwise. Finalized plans
//! emit native JSON or SQL, and responses normalize back into the value
//! model, so the same expression answers identically wherever it runs.
//!
//! ```no_run
//! use std::sync::Arc;
//! use lattice_core::{
//!     execute, Datum, EngineRegistry, Expression, RemoteDataset,
//!     SimulationRequester,
//! };
//! use lattice_core::types::{AttributeInfo, AttributeType};
//!
//! # async fn demo() -> lattice_core::Result<()> {
//! let mut wiki = RemoteDataset::new("druid", "wikipedia").with_attributes(vec![
//!     AttributeInfo::new("__time", AttributeType::Time),
//!     AttributeInfo::new("added", AttributeType::Number),
//! ]);
//! wiki.capabilities.allow_eternity = true;
//! let total = Expression::literal(Datum::Remote(Arc::new(wiki)))
//!     .sum(Expression::reference_typed("added", AttributeType::Number))?;
//! let registry = EngineRegistry::simulation();
//! let answer = execute(&total, &registry, &SimulationRequester).await?;
//! # Ok(())
//! # }
//! ```

pub mod backends;
pub mod error;
pub mod expressions;
pub mod remote;
pub mod transport;
pub mod types;
pub mod values;

pub use backends::{Engine, EngineRegistry, QueryPayload, SqlDialect, SqlQuery};
pub use error::{Error, Result};
pub use expressions::{ChainOp, Direction, Expression, SplitKey};
pub use remote::{QueryMode, RemoteDataset};
pub use transport::{execute, row_stream, Requester, SimulationRequester};
pub use values::{Dataset, Datum, Duration, NumberRange, Row, Set, TimeRange};
