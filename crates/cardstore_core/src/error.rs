//! Public error taxonomy for core operations.
//!
//! # Responsibility
//! - Map layer-specific errors (db, repo, compiler, schema) onto the closed
//!   set of kinds callers are expected to branch on.
//!
//! # Invariants
//! - Every public kernel operation fails with exactly one `CoreError` kind.
//! - `CoreError` is `Clone` so one in-flight result can be handed to every
//!   waiter of a deduplicated fetch.

use crate::db::DbError;
use crate::repo::card_repo::RepoError;
use crate::schema::{SchemaError, ValidationIssue};
use crate::sql::CompileError;
use std::sync::Arc;
use thiserror::Error;

/// Result type used across kernel-facing APIs.
pub type CoreResult<T> = Result<T, CoreError>;

/// Error kinds surfaced by the kernel and its compilers.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// Document does not satisfy a schema. Carries every issue found.
    #[error("schema mismatch: {}", render_issues(.issues))]
    SchemaMismatch { issues: Vec<ValidationIssue> },
    /// Schema merge produced contradictory constraints.
    #[error("incompatible schemas: {0}")]
    IncompatibleSchemas(String),
    /// Referenced type card does not exist.
    #[error("unknown card type: {0}")]
    UnknownCardType(String),
    /// Missing session, actor or referenced element.
    #[error("no such element: {0}")]
    NoElement(String),
    /// Session exists but its expiration is in the past.
    #[error("session expired: {0}")]
    SessionExpired(String),
    /// Caller has no applicable role view, or may not touch a record.
    #[error("permissions error: {0}")]
    PermissionsError(String),
    /// Contract violation such as a malformed option or schema payload.
    #[error("internal assertion failed: {0}")]
    InternalAssertion(String),
    /// Storage failure. Not retried by this layer.
    #[error(transparent)]
    Db(Arc<DbError>),
}

impl CoreError {
    /// Stable short code used in log lines.
    pub fn code(&self) -> &'static str {
        match self {
            Self::SchemaMismatch { .. } => "schema_mismatch",
            Self::IncompatibleSchemas(_) => "incompatible_schemas",
            Self::UnknownCardType(_) => "unknown_card_type",
            Self::NoElement(_) => "no_element",
            Self::SessionExpired(_) => "session_expired",
            Self::PermissionsError(_) => "permissions_error",
            Self::InternalAssertion(_) => "internal_assertion",
            Self::Db(_) => "db_error",
        }
    }
}

fn render_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<DbError> for CoreError {
    fn from(value: DbError) -> Self {
        Self::Db(Arc::new(value))
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(Arc::new(DbError::Sqlite(value)))
    }
}

impl From<RepoError> for CoreError {
    fn from(value: RepoError) -> Self {
        match value {
            RepoError::Db(err) => Self::Db(Arc::new(err)),
            RepoError::InvalidData(message) => Self::InternalAssertion(message),
            RepoError::Conflict(key) => Self::InternalAssertion(format!("card already exists: {key}")),
        }
    }
}

impl From<SchemaError> for CoreError {
    fn from(value: SchemaError) -> Self {
        match value {
            SchemaError::Mismatch { issues } => Self::SchemaMismatch { issues },
            SchemaError::Incompatible(reason) => Self::IncompatibleSchemas(reason),
            SchemaError::InvalidSchema(reason) => Self::InternalAssertion(reason),
        }
    }
}

impl From<CompileError> for CoreError {
    fn from(value: CompileError) -> Self {
        Self::InternalAssertion(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::CoreError;
    use crate::schema::ValidationIssue;

    #[test]
    fn schema_mismatch_renders_every_issue() {
        let err = CoreError::SchemaMismatch {
            issues: vec![
                ValidationIssue::new("/data/email", "required", "missing property `email`"),
                ValidationIssue::new("/slug", "pattern", "does not match `^[a-z]+$`"),
            ],
        };
        let rendered = err.to_string();
        assert!(rendered.contains("email"));
        assert!(rendered.contains("/slug"));
        assert_eq!(err.code(), "schema_mismatch");
    }
}
