//! Card repository contract and SQLite implementation.
//!
//! # Responsibility
//! - Persist cards into the fixed-column `cards` table.
//! - Mirror `link` cards into `links` and indexed text into `cards_fts` in
//!   the same transaction as the card row.
//! - Execute compiled queries and publish a change event per write.
//!
//! # Invariants
//! - Writes are atomic per card: row, link mirror and full-text entries
//!   commit together or not at all.
//! - Read paths reject invalid persisted state instead of masking it.
//! - A change event is published only after its transaction commits.

use crate::db::DbError;
use crate::model::card::{Card, CardId};
use crate::model::link::{LinkRecord, LINK_TYPE};
use crate::sql::CompiledQuery;
use log::{debug, info};
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension, Row, Transaction};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

const CARD_SELECT_SQL: &str = "SELECT
    id,
    version,
    slug,
    type,
    tags,
    markers,
    name,
    links,
    created_at,
    active,
    requires,
    capabilities,
    data
FROM cards";

const UPSERT_SQL: &str = "INSERT INTO cards (
    id, version, slug, type, tags, markers, name, links,
    created_at, active, requires, capabilities, data
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
ON CONFLICT(id) DO UPDATE SET
    version = excluded.version,
    slug = excluded.slug,
    type = excluded.type,
    tags = excluded.tags,
    markers = excluded.markers,
    name = excluded.name,
    links = excluded.links,
    active = excluded.active,
    requires = excluded.requires,
    capabilities = excluded.capabilities,
    data = excluded.data;";

/// Capacity of the change channel; slow subscribers observe `Lagged`.
const CHANGE_CHANNEL_CAPACITY: usize = 256;

pub type RepoResult<T> = Result<T, RepoError>;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("invalid persisted card data: {0}")]
    InvalidData(String),
    #[error("card already exists: {0}")]
    Conflict(String),
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
}

/// Published on the change stream after each committed write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardChange {
    pub kind: ChangeKind,
    pub id: CardId,
    pub card_type: String,
}

/// Storage contract the kernel runs against.
///
/// Implementations are shared across blocking worker threads.
pub trait CardRepository: Send + Sync {
    /// Inserts a new card; fails with `Conflict` when its id or slug is taken.
    ///
    /// `full_text` lists the key paths of the card's type that are indexed
    /// for full-text search.
    fn insert_card(&self, card: &Card, full_text: &BTreeSet<Vec<String>>) -> RepoResult<()>;
    /// Inserts or replaces a card by id.
    fn upsert_card(&self, card: &Card, full_text: &BTreeSet<Vec<String>>) -> RepoResult<ChangeKind>;
    fn get_card_by_id(&self, id: CardId) -> RepoResult<Option<Card>>;
    fn get_card_by_slug(&self, slug: &str) -> RepoResult<Option<Card>>;
    /// Cards reachable from `id` through `verb`, in either link direction.
    fn linked_cards(&self, id: CardId, verb: &str) -> RepoResult<Vec<Card>>;
    /// Runs a compiled query and decodes every row.
    fn query(&self, query: &CompiledQuery) -> RepoResult<Vec<Map<String, Value>>>;
    /// Subscribes to changes committed after this call.
    fn subscribe(&self) -> broadcast::Receiver<CardChange>;
}

/// SQLite-backed card repository owning one connection.
pub struct SqliteCardRepository {
    conn: Mutex<Connection>,
    changes: broadcast::Sender<CardChange>,
}

impl SqliteCardRepository {
    /// Wraps a connection returned by `db::open_db*`.
    pub fn new(conn: Connection) -> RepoResult<Self> {
        ensure_card_connection_ready(&conn)?;
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self {
            conn: Mutex::new(conn),
            changes,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(
        &self,
        card: &Card,
        full_text: &BTreeSet<Vec<String>>,
        allow_replace: bool,
    ) -> RepoResult<ChangeKind> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let exists = tx
            .query_row("SELECT 1 FROM cards WHERE id = ?1;", [card.id.to_string()], |_| Ok(()))
            .optional()?
            .is_some();
        if exists && !allow_replace {
            return Err(RepoError::Conflict(card.id.to_string()));
        }

        let value = card.to_value();
        let json = |key: &str| value.get(key).map(Value::to_string).unwrap_or_default();
        let result = tx.execute(
            UPSERT_SQL,
            params![
                card.id.to_string(),
                card.version,
                card.slug,
                card.card_type,
                json("tags"),
                json("markers"),
                card.name,
                json("links"),
                card.created_at,
                card.active,
                json("requires"),
                json("capabilities"),
                json("data"),
            ],
        );
        if let Err(err) = result {
            if err.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) {
                return Err(RepoError::Conflict(card.slug.clone()));
            }
            return Err(err.into());
        }

        match LinkRecord::from_card(card) {
            Some(link) => write_link(&tx, &link)?,
            None if card.card_type == LINK_TYPE => {
                tx.execute("DELETE FROM links WHERE id = ?1;", [card.id.to_string()])?;
            }
            None => {}
        }
        write_full_text(&tx, card.id, &value, full_text)?;
        tx.commit()?;

        let kind = if exists {
            ChangeKind::Update
        } else {
            ChangeKind::Insert
        };
        info!(
            "event=card_write module=repo status=ok kind={kind:?} type={} id={}",
            card.card_type, card.id
        );
        let change = CardChange {
            kind,
            id: card.id,
            card_type: card.card_type.clone(),
        };
        if self.changes.send(change).is_err() {
            debug!("event=card_change module=repo status=skipped reason=no_subscribers");
        }
        Ok(kind)
    }

    fn select_one(&self, clause: &str, key: &str) -> RepoResult<Option<Card>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!("{CARD_SELECT_SQL} WHERE {clause};"))?;
        let mut rows = stmt.query([key])?;
        let card = match rows.next()? {
            Some(row) => Some(parse_card_row(row)?),
            None => None,
        };
        Ok(card)
    }
}

impl CardRepository for SqliteCardRepository {
    fn insert_card(&self, card: &Card, full_text: &BTreeSet<Vec<String>>) -> RepoResult<()> {
        self.write(card, full_text, false).map(|_| ())
    }

    fn upsert_card(&self, card: &Card, full_text: &BTreeSet<Vec<String>>) -> RepoResult<ChangeKind> {
        self.write(card, full_text, true)
    }

    fn get_card_by_id(&self, id: CardId) -> RepoResult<Option<Card>> {
        self.select_one("id = ?1", &id.to_string())
    }

    fn get_card_by_slug(&self, slug: &str) -> RepoResult<Option<Card>> {
        self.select_one("slug = ?1", slug)
    }

    fn linked_cards(&self, id: CardId, verb: &str) -> RepoResult<Vec<Card>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "{CARD_SELECT_SQL}
             WHERE id IN (
                SELECT to_id FROM links WHERE from_id = ?1 AND name = ?2
                UNION
                SELECT from_id FROM links WHERE to_id = ?1 AND inverse_name = ?2
             )
             ORDER BY created_at ASC, id ASC;"
        ))?;
        let mut rows = stmt.query(params![id.to_string(), verb])?;
        let mut cards = Vec::new();
        while let Some(row) = rows.next()? {
            cards.push(parse_card_row(row)?);
        }
        Ok(cards)
    }

    fn query(&self, query: &CompiledQuery) -> RepoResult<Vec<Map<String, Value>>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&query.sql)?;
        let rows = stmt.query_map(params_from_iter(query.params.iter()), |row| query.decode_row(row))?;
        let rows = rows.collect::<Result<Vec<_>, _>>()?;
        debug!(
            "event=card_query module=repo status=ok rows={} links={}",
            rows.len(),
            query.links_requested
        );
        Ok(rows)
    }

    fn subscribe(&self) -> broadcast::Receiver<CardChange> {
        self.changes.subscribe()
    }
}

fn ensure_card_connection_ready(conn: &Connection) -> RepoResult<()> {
    for table in ["cards", "links", "cards_fts"] {
        let found = conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE name = ?1;",
                [table],
                |_| Ok(()),
            )
            .optional()?;
        if found.is_none() {
            return Err(RepoError::InvalidData(format!(
                "table `{table}` is missing; open the database with db::open_db"
            )));
        }
    }
    Ok(())
}

fn write_link(tx: &Transaction<'_>, link: &LinkRecord) -> RepoResult<()> {
    tx.execute(
        "INSERT INTO links (id, name, inverse_name, from_id, to_id)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            inverse_name = excluded.inverse_name,
            from_id = excluded.from_id,
            to_id = excluded.to_id;",
        params![
            link.id.to_string(),
            link.name,
            link.inverse_name,
            link.from_id.to_string(),
            link.to_id.to_string(),
        ],
    )?;
    Ok(())
}

fn write_full_text(
    tx: &Transaction<'_>,
    id: CardId,
    card: &Value,
    full_text: &BTreeSet<Vec<String>>,
) -> RepoResult<()> {
    tx.execute("DELETE FROM cards_fts WHERE card_id = ?1;", [id.to_string()])?;
    for path in full_text {
        let value = path.iter().try_fold(card, |value, key| value.get(key));
        let content = match value {
            Some(Value::String(text)) => text.clone(),
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(" "),
            _ => continue,
        };
        tx.execute(
            "INSERT INTO cards_fts (card_id, path, content) VALUES (?1, ?2, ?3);",
            params![id.to_string(), path.join("."), content],
        )?;
    }
    Ok(())
}

fn parse_card_row(row: &Row<'_>) -> RepoResult<Card> {
    let id: String = row.get(0)?;
    Uuid::parse_str(&id).map_err(|err| RepoError::InvalidData(format!("invalid id `{id}`: {err}")))?;

    let json_column = |index: usize, name: &str| -> RepoResult<Value> {
        let text: String = row.get(index)?;
        serde_json::from_str(&text)
            .map_err(|err| RepoError::InvalidData(format!("invalid `{name}` on card {id}: {err}")))
    };

    let mut map = Map::new();
    map.insert("id".to_string(), Value::String(id.clone()));
    map.insert("version".to_string(), Value::String(row.get(1)?));
    map.insert("slug".to_string(), Value::String(row.get(2)?));
    map.insert("type".to_string(), Value::String(row.get(3)?));
    map.insert("tags".to_string(), json_column(4, "tags")?);
    map.insert("markers".to_string(), json_column(5, "markers")?);
    if let Some(name) = row.get::<_, Option<String>>(6)? {
        map.insert("name".to_string(), Value::String(name));
    }
    map.insert("links".to_string(), json_column(7, "links")?);
    map.insert("created_at".to_string(), Value::String(row.get(8)?));
    map.insert("active".to_string(), Value::Bool(row.get(9)?));
    map.insert("requires".to_string(), json_column(10, "requires")?);
    map.insert("capabilities".to_string(), json_column(11, "capabilities")?);
    map.insert("data".to_string(), json_column(12, "data")?);

    Card::from_value(Value::Object(map))
        .map_err(|err| RepoError::InvalidData(format!("invalid card {id}: {err}")))
}

#[cfg(test)]
mod tests {
    use super::{CardRepository, ChangeKind, RepoError, SqliteCardRepository};
    use crate::db::open_db_in_memory;
    use crate::model::card::Card;
    use crate::model::link::{link_card, ATTACHED_INVERSE_VERB, ATTACHED_VERB};
    use serde_json::json;
    use std::collections::BTreeSet;

    fn repo() -> SqliteCardRepository {
        SqliteCardRepository::new(open_db_in_memory().unwrap()).unwrap()
    }

    #[test]
    fn round_trips_cards_by_id_and_slug() {
        let repo = repo();
        let card = Card::new("card", json!({"n": 1})).with_slug("first").with_name("First");
        repo.insert_card(&card, &BTreeSet::new()).unwrap();

        assert_eq!(repo.get_card_by_id(card.id).unwrap(), Some(card.clone()));
        assert_eq!(repo.get_card_by_slug("first").unwrap(), Some(card));
        assert_eq!(repo.get_card_by_slug("missing").unwrap(), None);
    }

    #[test]
    fn insert_rejects_taken_ids_and_slugs() {
        let repo = repo();
        let card = Card::new("card", json!({})).with_slug("taken");
        repo.insert_card(&card, &BTreeSet::new()).unwrap();

        let same_id = repo.insert_card(&card, &BTreeSet::new());
        assert!(matches!(same_id, Err(RepoError::Conflict(_))));
        let same_slug = repo.insert_card(&Card::new("card", json!({})).with_slug("taken"), &BTreeSet::new());
        assert!(matches!(same_slug, Err(RepoError::Conflict(_))));
    }

    #[test]
    fn upsert_reports_kind_and_publishes_changes() {
        let repo = repo();
        let mut changes = repo.subscribe();
        let mut card = Card::new("card", json!({}));
        assert_eq!(repo.upsert_card(&card, &BTreeSet::new()).unwrap(), ChangeKind::Insert);
        card.data = json!({"edited": true});
        assert_eq!(repo.upsert_card(&card, &BTreeSet::new()).unwrap(), ChangeKind::Update);

        assert_eq!(changes.try_recv().unwrap().kind, ChangeKind::Insert);
        let update = changes.try_recv().unwrap();
        assert_eq!(update.kind, ChangeKind::Update);
        assert_eq!(update.id, card.id);
    }

    #[test]
    fn link_cards_are_traversable_from_both_ends() {
        let repo = repo();
        let message = Card::new("card", json!({}));
        let thread = Card::new("card", json!({}));
        repo.insert_card(&message, &BTreeSet::new()).unwrap();
        repo.insert_card(&thread, &BTreeSet::new()).unwrap();
        let link = link_card(&message, ATTACHED_VERB, ATTACHED_INVERSE_VERB, &thread);
        repo.insert_card(&link, &BTreeSet::new()).unwrap();

        let attached = repo.linked_cards(thread.id, ATTACHED_INVERSE_VERB).unwrap();
        assert_eq!(attached, vec![message.clone()]);
        let targets = repo.linked_cards(message.id, ATTACHED_VERB).unwrap();
        assert_eq!(targets, vec![thread]);
    }
}
