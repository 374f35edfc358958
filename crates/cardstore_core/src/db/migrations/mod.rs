//! Card store schema history.
//!
//! # Responsibility
//! - Keep the ordered list of card store schema steps.
//! - Bring a connection from its recorded version to the latest one in a
//!   single transaction.
//!
//! # Invariants
//! - A step's version is its 1-based position in `STEPS`; steps are only
//!   ever appended.
//! - `PRAGMA user_version` always names the last step fully applied.

use crate::db::{DbError, DbResult};
use log::{debug, info};
use rusqlite::Connection;

/// `(name, sql)` per schema step.
const STEPS: &[(&str, &str)] = &[
    ("cards", include_str!("0001_cards.sql")),
    ("links", include_str!("0002_links.sql")),
    ("full_text", include_str!("0003_full_text.sql")),
];

/// Latest schema version this build can write.
pub fn latest_version() -> u32 {
    version_at(STEPS.len())
}

/// Schema version recorded in the database.
pub fn schema_version(conn: &Connection) -> DbResult<u32> {
    Ok(conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?)
}

/// Applies every step newer than the recorded version.
///
/// # Errors
/// - `UnsupportedSchemaVersion` when the database is newer than this build.
/// - `Migration` naming the first step that failed; nothing is applied then.
pub fn apply_migrations(conn: &mut Connection) -> DbResult<()> {
    let from = schema_version(conn)?;
    let pending = pending_steps(from)?;
    if pending.is_empty() {
        return Ok(());
    }

    let tx = conn.transaction()?;
    for (version, name, sql) in pending {
        debug!("event=db_migrate_step module=db status=start version={version} name={name}");
        tx.execute_batch(sql)
            .and_then(|()| tx.pragma_update(None, "user_version", version))
            .map_err(|source| DbError::Migration {
                version,
                name,
                source,
            })?;
    }
    tx.commit()?;

    info!(
        "event=db_migrate module=db status=ok from_version={from} to_version={}",
        latest_version()
    );
    Ok(())
}

fn pending_steps(from: u32) -> DbResult<Vec<(u32, &'static str, &'static str)>> {
    let latest = latest_version();
    if from > latest {
        return Err(DbError::UnsupportedSchemaVersion {
            db_version: from,
            latest_supported: latest,
        });
    }
    Ok(STEPS
        .iter()
        .enumerate()
        .map(|(index, (name, sql))| (version_at(index + 1), *name, *sql))
        .filter(|(version, _, _)| *version > from)
        .collect())
}

fn version_at(position: usize) -> u32 {
    u32::try_from(position).unwrap_or(u32::MAX)
}
