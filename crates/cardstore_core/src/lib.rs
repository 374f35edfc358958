//! Schema-driven card store.
//!
//! Cards are JSON records whose shape is declared by type cards. Every read
//! is a JSON Schema compiled to SQL, scoped by the caller's role views and
//! markers before it reaches storage.

pub mod config;
pub mod db;
pub mod error;
pub mod kernel;
pub mod logging;
pub mod model;
pub mod permission;
pub mod repo;
pub mod schema;
pub mod sql;

pub use config::{DatabaseLocation, KernelConfig};
pub use db::{open_db, open_db_in_memory, DbError};
pub use error::{CoreError, CoreResult};
pub use kernel::{CardEvent, CardStream, Kernel};
pub use logging::{default_log_level, init_logging, logging_status};
pub use model::card::{Card, CardId};
pub use permission::{AccessMode, PermissionFilter, PermissionScope};
pub use repo::card_repo::{CardRepository, RepoError, RepoResult, SqliteCardRepository};
pub use schema::{filter, is_valid, merge, validate, FilterOptions, SchemaError, SchemaMatcher};
pub use sql::{compile_filter, compile_query, CompileOptions, QueryOptions};

/// Crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::core_version;

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
