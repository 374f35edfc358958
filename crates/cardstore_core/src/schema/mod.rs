//! In-process JSON Schema evaluation.
//!
//! # Responsibility
//! - Validate documents with full error collection (`validator`).
//! - Strip documents down to what a schema declares (`filter`).
//! - Conjunctively merge schemas (`merge`).
//! - Provide the generic card schema and built-in type schemas
//!   (`card_schema`).
//!
//! # Invariants
//! - Every schema accepted here is also accepted by `sql::compile_filter`,
//!   and the two agree on which documents match.

pub mod card_schema;
mod filter;
mod merge;
mod validator;

use std::fmt;
use thiserror::Error;

pub use filter::{filter, FilterOptions, SchemaFilter};
pub use merge::merge;
pub use validator::{is_valid, validate, SchemaMatcher};

pub type SchemaResult<T> = Result<T, SchemaError>;

#[derive(Debug, Clone, Error)]
pub enum SchemaError {
    #[error("document does not match schema ({} issues)", .issues.len())]
    Mismatch { issues: Vec<ValidationIssue> },
    #[error("incompatible schemas: {0}")]
    Incompatible(String),
    #[error("invalid schema: {0}")]
    InvalidSchema(String),
}

/// One failed keyword check at one document location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    /// JSON pointer into the document; empty for the root.
    pub path: String,
    pub keyword: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(
        path: impl Into<String>,
        keyword: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            keyword: keyword.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = if self.path.is_empty() { "/" } else { &self.path };
        write!(f, "{path}: {} [{}]", self.message, self.keyword)
    }
}
