//! Crate-wide error type.
//!
//! Three classes of failure exist in the core:
//! - construction errors, raised while building or resolving an expression
//!   tree and never recovered locally;
//! - emission errors, raised when a finalized plan has no representation in
//!   the target backend;
//! - transport errors, wrapping collaborator failures in the plan runner.
//!
//! Push-down rejection is *not* an error: the plan compiler returns `None`
//! and the simplifier leaves the remaining operations for the reference
//! engine.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum Error {
    /// Malformed node shape, unresolvable reference, incompatible operand
    /// types, or invalid tuning parameters.
    #[error("construction error: {0}")]
    Construction(String),

    /// A finalized plan contains a construct the target backend cannot
    /// express.
    #[error("{backend} cannot express {construct}")]
    Unsupported { construct: String, backend: String },

    /// A physical query failed or was cancelled by the transport.
    #[error("transport error: {0}")]
    Transport(String),
}

impl Error {
    pub fn construction(msg: impl Into<String>) -> Self {
        Error::Construction(msg.into())
    }

    pub fn unsupported(construct: impl Into<String>, backend: impl Into<String>) -> Self {
        Error::Unsupported {
            construct: construct.into(),
            backend: backend.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
