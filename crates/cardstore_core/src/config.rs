//! Kernel configuration.
//!
//! Values come from a serialized config file or from `CARDSTORE_*`
//! environment variables; anything unset falls back to defaults.

use crate::logging::default_log_level;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Env var holding the SQLite file path; unset means in-memory.
pub const DB_PATH_ENV: &str = "CARDSTORE_DB_PATH";
/// Env var holding the log level.
pub const LOG_LEVEL_ENV: &str = "CARDSTORE_LOG_LEVEL";
/// Env var holding the absolute log directory; unset disables file logging.
pub const LOG_DIR_ENV: &str = "CARDSTORE_LOG_DIR";
/// Actor that bypasses marker visibility.
pub const DEFAULT_PRIVILEGED_ACTOR: &str = "user-admin";

/// Where cards are stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "path")]
pub enum DatabaseLocation {
    Memory,
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub database: DatabaseLocation,
    pub privileged_actor: String,
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            database: DatabaseLocation::Memory,
            privileged_actor: DEFAULT_PRIVILEGED_ACTOR.to_string(),
            log_level: default_log_level().to_string(),
            log_dir: None,
        }
    }
}

impl KernelConfig {
    /// Reads `CARDSTORE_*` variables from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let set = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let mut config = Self::default();
        if let Some(path) = set(DB_PATH_ENV) {
            config.database = DatabaseLocation::File(PathBuf::from(path));
        }
        if let Some(level) = set(LOG_LEVEL_ENV) {
            config.log_level = level;
        }
        config.log_dir = set(LOG_DIR_ENV).map(PathBuf::from);
        config
    }
}

#[cfg(test)]
mod tests {
    use super::{DatabaseLocation, KernelConfig, DB_PATH_ENV, LOG_LEVEL_ENV};
    use std::collections::HashMap;
    use std::path::PathBuf;

    #[test]
    fn lookup_overrides_defaults() {
        let vars = HashMap::from([
            (DB_PATH_ENV, "/tmp/cards.sqlite3"),
            (LOG_LEVEL_ENV, "warn"),
        ]);
        let config = KernelConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(
            config.database,
            DatabaseLocation::File(PathBuf::from("/tmp/cards.sqlite3"))
        );
        assert_eq!(config.log_level, "warn");
        assert_eq!(config.log_dir, None);
        assert_eq!(config.privileged_actor, "user-admin");
    }

    #[test]
    fn blank_values_are_ignored() {
        let config = KernelConfig::from_lookup(|_| Some("  ".to_string()));
        assert_eq!(config, KernelConfig::default());
    }

    #[test]
    fn deserializes_partial_config() {
        let config: KernelConfig = serde_json::from_value(serde_json::json!({
            "database": { "kind": "file", "path": "/var/lib/cards.db" }
        }))
        .unwrap();
        assert_eq!(
            config.database,
            DatabaseLocation::File(PathBuf::from("/var/lib/cards.db"))
        );
        assert_eq!(config.privileged_actor, "user-admin");
    }
}
