//! JSON Schema to SQL compilation.
//!
//! # Responsibility
//! - Turn a schema into a relational predicate over the `cards` table
//!   (`compiler`), built from `expression` primitives.
//! - Turn a schema with `$$links` into a single graph query (`graph`).
//!
//! # Invariants
//! - Generated SQL only references the fixed column set and JSON1 functions
//!   available on every connection opened by `db::open`.
//! - A schema keyword is either compiled or explicitly ignored; there is no
//!   silent fallthrough.

mod compiler;
pub mod expression;
pub mod graph;
pub mod keywords;

use thiserror::Error;

pub use compiler::{compile_filter, CompileOptions, CompiledFilter};
pub use expression::{Filter, JsonType, PropertyPath, SqlFragment, ValueRef};
pub use graph::{
    compile_query, nest_linked_rows, CompiledQuery, QueryOptions, SortDirection,
    LINK_DIRECTION_COLUMN, LINK_TYPE_COLUMN, PARENT_ID_COLUMN,
};

pub type CompileResult<T> = Result<T, CompileError>;

/// Failure to translate a schema or query options.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("schema must be an object or a boolean, got `{0}`")]
    InvalidSchema(String),
    #[error("invalid `{keyword}` keyword: {reason}")]
    InvalidKeyword {
        keyword: &'static str,
        reason: String,
    },
    #[error("invalid query option `{option}`: {reason}")]
    InvalidOption {
        option: &'static str,
        reason: String,
    },
}

impl CompileError {
    pub(crate) fn keyword(keyword: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidKeyword {
            keyword,
            reason: reason.into(),
        }
    }

    pub(crate) fn option(option: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidOption {
            option,
            reason: reason.into(),
        }
    }
}
