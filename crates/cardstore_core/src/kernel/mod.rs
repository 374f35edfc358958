//! Kernel: permission-checked card writes, queries and subscriptions.
//!
//! # Responsibility
//! - Bootstrap built-in records on connect.
//! - Validate writes against the generic card schema and the card's type.
//! - Route every read and write through the caller's permission scope.
//! - Keep fields a caller cannot see intact across replacements.
//!
//! # Invariants
//! - Storage calls run on the blocking pool, never on async workers.
//! - Query results only carry fields visible to the caller.
//! - A replacement never changes `id` or `created_at`.
//! - Concurrent overriding writes to one id are last-write-wins.

mod builtins;
mod loader;
mod stream;

pub use builtins::{type_card, ADMIN_SESSION_SLUG};
pub use loader::{CardLoader, LoadKey};
pub use stream::{CardEvent, CardStream};

use crate::config::{DatabaseLocation, KernelConfig};
use crate::db::{open_db, open_db_in_memory};
use crate::error::{CoreError, CoreResult};
use crate::logging::init_logging;
use crate::model::card::{apply_defaults, Card, CardId};
use crate::model::link::{link_card, ATTACHED_INVERSE_VERB, ATTACHED_VERB, LINK_TYPE};
use crate::permission::{AccessMode, PermissionFilter};
use crate::repo::card_repo::{CardRepository, SqliteCardRepository};
use crate::schema::card_schema::{card_schema, full_text_paths};
use crate::schema::{FilterOptions, SchemaFilter, SchemaMatcher};
use crate::sql::keywords::LINKS_KEYWORD;
use crate::sql::{
    compile_query, nest_linked_rows, CompileOptions, QueryOptions, LINK_DIRECTION_COLUMN,
    LINK_TYPE_COLUMN, PARENT_ID_COLUMN,
};
use log::{info, warn};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;
use uuid::Uuid;

/// Type slug of type cards.
pub const TYPE_TYPE: &str = "type";

const METADATA_COLUMNS: [&str; 3] = [LINK_DIRECTION_COLUMN, LINK_TYPE_COLUMN, PARENT_ID_COLUMN];

/// Handle to an open card store. Cheap to clone.
#[derive(Clone)]
pub struct Kernel {
    inner: Arc<KernelInner>,
    loader: Arc<CardLoader>,
}

struct KernelInner {
    repo: Arc<dyn CardRepository>,
    privileged_actor: String,
    card_matcher: SchemaMatcher,
    /// Full-text key paths per type slug.
    full_text: RwLock<BTreeMap<String, BTreeSet<Vec<String>>>>,
    admin_session: CardId,
}

impl Kernel {
    /// Opens the configured database and bootstraps it.
    pub async fn open(config: &KernelConfig) -> CoreResult<Self> {
        if let Some(log_dir) = &config.log_dir {
            init_logging(&config.log_level, log_dir)
                .map_err(|err| CoreError::InternalAssertion(err.to_string()))?;
        }

        let database = config.database.clone();
        let conn = tokio::task::spawn_blocking(move || match database {
            DatabaseLocation::Memory => open_db_in_memory(),
            DatabaseLocation::File(path) => open_db(path),
        })
        .await
        .map_err(join_error)??;

        let repo = SqliteCardRepository::new(conn)?;
        Self::with_repository(Arc::new(repo), config).await
    }

    /// Bootstraps `repo` and wraps it in a kernel.
    pub async fn with_repository(
        repo: Arc<dyn CardRepository>,
        config: &KernelConfig,
    ) -> CoreResult<Self> {
        let started = Instant::now();
        let privileged_actor = config.privileged_actor.clone();
        let inner = tokio::task::spawn_blocking(move || -> CoreResult<KernelInner> {
            let admin_session = builtins::bootstrap(repo.as_ref(), &privileged_actor)?;
            let full_text = load_full_text(repo.as_ref())?;
            Ok(KernelInner {
                repo,
                privileged_actor,
                card_matcher: SchemaMatcher::new(&card_schema())?,
                full_text: RwLock::new(full_text),
                admin_session,
            })
        })
        .await
        .map_err(join_error)??;

        info!(
            "event=kernel_open module=kernel status=ok duration_ms={}",
            started.elapsed().as_millis()
        );
        Ok(Self {
            inner: Arc::new(inner),
            loader: Arc::new(CardLoader::new()),
        })
    }

    /// Session of the privileged actor created at bootstrap.
    pub fn admin_session(&self) -> CardId {
        self.inner.admin_session
    }

    /// Validates and stores a new card.
    ///
    /// # Errors
    /// - `SchemaMismatch` when the card fails the generic or its type schema.
    /// - `UnknownCardType` when its type has no type card.
    /// - `PermissionsError` when the caller may not write such a card.
    /// - `InternalAssertion` when its id or slug is already taken.
    pub async fn insert_card(&self, session: CardId, card: Value) -> CoreResult<Card> {
        self.blocking(move |inner| inner.write(session, card, false))
            .await
    }

    /// Upserts a card, keeping every stored field the caller cannot see.
    pub async fn replace_card(&self, session: CardId, card: Value) -> CoreResult<Card> {
        self.blocking(move |inner| inner.write(session, card, true))
            .await
    }

    /// Cards matching `schema` that the caller may read.
    pub async fn query(
        &self,
        session: CardId,
        schema: &Value,
        options: QueryOptions,
    ) -> CoreResult<Vec<Value>> {
        let schema = schema.clone();
        self.blocking(move |inner| inner.query(session, &schema, &options))
            .await
    }

    pub async fn get_card_by_id(&self, session: CardId, id: CardId) -> CoreResult<Option<Value>> {
        let schema = by_key("id", &id.to_string());
        Ok(self
            .query(session, &schema, QueryOptions::default())
            .await?
            .into_iter()
            .next())
    }

    pub async fn get_card_by_slug(&self, session: CardId, slug: &str) -> CoreResult<Option<Value>> {
        let schema = by_key("slug", slug);
        Ok(self
            .query(session, &schema, QueryOptions::default())
            .await?
            .into_iter()
            .next())
    }

    /// Card `id` with `links` expanded for `verbs`.
    ///
    /// Concurrent calls with the same session, id and verb set share one
    /// fetch.
    pub async fn get_card_with_links(
        &self,
        session: CardId,
        id: CardId,
        verbs: &[&str],
    ) -> CoreResult<Option<Value>> {
        let key = LoadKey::new(session, id, verbs);
        let mut schema = by_key("id", &id.to_string());
        if !key.verbs().is_empty() {
            let links = key
                .verbs()
                .iter()
                .map(|verb| (verb.clone(), json!({ "type": "object" })))
                .collect::<Map<_, _>>();
            if let Value::Object(map) = &mut schema {
                map.insert(LINKS_KEYWORD.to_string(), Value::Object(links));
            }
        }

        let kernel = self.clone();
        self.loader
            .load(key, async move {
                let cards = kernel
                    .query(session, &schema, QueryOptions::default())
                    .await?;
                Ok(cards.into_iter().next())
            })
            .await
    }

    /// Subscribes to changes of cards matching `schema`.
    ///
    /// Fails immediately when the caller has no read scope.
    pub async fn stream(&self, session: CardId, schema: Value) -> CoreResult<CardStream> {
        let changes = self.inner.repo.subscribe();
        self.blocking(move |inner| inner.permissions().scope(session, AccessMode::Read).map(|_| ()))
            .await?;
        Ok(CardStream::new(self.clone(), session, schema, changes))
    }

    async fn blocking<T, F>(&self, task: F) -> CoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&KernelInner) -> CoreResult<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || task(&inner))
            .await
            .map_err(join_error)?
    }
}

impl KernelInner {
    fn permissions(&self) -> PermissionFilter<'_> {
        PermissionFilter::new(self.repo.as_ref(), &self.privileged_actor)
    }

    fn compile_options(&self) -> CompileOptions {
        let registry = self.full_text.read().unwrap_or_else(PoisonError::into_inner);
        CompileOptions {
            full_text_paths: registry.values().flatten().cloned().collect(),
        }
    }

    fn query(&self, session: CardId, schema: &Value, options: &QueryOptions) -> CoreResult<Vec<Value>> {
        let started = Instant::now();
        let scope = self.permissions().scope(session, AccessMode::Read)?;

        let schema = scope.render(schema)?;
        // Rows are stripped in memory, so fetch every column.
        let mut scoped = scope.apply(&schema);
        if let Value::Object(map) = &mut scoped {
            map.insert("additionalProperties".to_string(), Value::Bool(true));
        }
        let compiled = compile_query(&scoped, options, &self.compile_options(), &|linked| {
            scope.apply(linked)
        })?;
        let rows = self.repo.query(&compiled)?;

        let visible = SchemaFilter::new(scope.schema(), FilterOptions::default())?;
        let total = rows.len();
        let rows = rows
            .into_iter()
            .filter_map(|row| strip_row(&visible, row))
            .collect::<Vec<_>>();
        if rows.len() != total {
            warn!(
                "event=card_query module=kernel status=filtered dropped={}",
                total - rows.len()
            );
        }

        let cards = if compiled.links_requested {
            nest_linked_rows(rows)
        } else {
            rows.into_iter().map(Value::Object).collect()
        };
        info!(
            "event=card_query module=kernel status=ok actor={} rows={} duration_ms={}",
            scope.actor().card.slug,
            cards.len(),
            started.elapsed().as_millis()
        );
        Ok(cards)
    }

    fn write(&self, session: CardId, mut value: Value, replace: bool) -> CoreResult<Card> {
        let started = Instant::now();
        let stored = if replace {
            self.find_existing(&value)?
        } else {
            None
        };
        apply_defaults(&mut value);

        let scope = self.permissions().scope(session, AccessMode::Write)?;
        if let Some(stored) = &stored {
            let stored_value = stored.to_value();
            let visible = SchemaFilter::new(scope.schema(), FilterOptions::default())?
                .filter(&stored_value)
                .ok_or_else(|| {
                    CoreError::PermissionsError(format!("card {} is not writable", stored.slug))
                })?;
            restore_hidden(&mut value, &stored_value, &visible);
            if let Value::Object(map) = &mut value {
                map.insert("id".to_string(), Value::String(stored.id.to_string()));
                map.insert(
                    "created_at".to_string(),
                    Value::String(stored.created_at.clone()),
                );
            }
        }

        self.card_matcher.ensure(&value)?;
        let card_type = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::InternalAssertion("card has no type".to_string()))?;
        let type_card = self
            .repo
            .get_card_by_slug(card_type)?
            .filter(|card| card.card_type == TYPE_TYPE && card.active)
            .ok_or_else(|| CoreError::UnknownCardType(card_type.to_string()))?;
        let type_schema = type_card
            .data_field("schema")
            .cloned()
            .unwrap_or_else(|| json!({}));
        SchemaMatcher::new(&type_schema)?.ensure(&value)?;

        if !SchemaMatcher::new(scope.schema())?.is_valid(&value) {
            return Err(CoreError::PermissionsError(format!(
                "actor {} may not write this card",
                scope.actor().card.slug
            )));
        }

        let card = Card::from_value(value)
            .map_err(|err| CoreError::InternalAssertion(format!("card does not decode: {err}")))?;
        let target = self.resolve_target(&card)?;

        let full_text = full_text_paths(&type_schema);
        let kind = if replace {
            Some(self.repo.upsert_card(&card, &full_text)?)
        } else {
            self.repo.insert_card(&card, &full_text)?;
            None
        };

        if card.card_type == TYPE_TYPE {
            let paths = card
                .data_field("schema")
                .map(full_text_paths)
                .unwrap_or_default();
            self.full_text
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(card.slug.clone(), paths);
        }
        if let Some(target) = target {
            self.attach(&card, &target)?;
        }

        info!(
            "event=card_insert module=kernel status=ok replace={replace} kind={kind:?} type={} actor={} duration_ms={}",
            card.card_type,
            scope.actor().card.slug,
            started.elapsed().as_millis()
        );
        Ok(card)
    }

    fn find_existing(&self, value: &Value) -> CoreResult<Option<Card>> {
        let id = value
            .get("id")
            .and_then(Value::as_str)
            .and_then(|id| Uuid::parse_str(id).ok());
        if let Some(id) = id {
            if let Some(card) = self.repo.get_card_by_id(id)? {
                return Ok(Some(card));
            }
        }
        match value.get("slug").and_then(Value::as_str) {
            Some(slug) => Ok(self.repo.get_card_by_slug(slug)?),
            None => Ok(None),
        }
    }

    /// Card named by `data.target`, by id or slug.
    fn resolve_target(&self, card: &Card) -> CoreResult<Option<Card>> {
        if card.card_type == LINK_TYPE {
            return Ok(None);
        }
        let Some(target) = card.data_field("target").and_then(Value::as_str) else {
            return Ok(None);
        };
        let found = match Uuid::parse_str(target) {
            Ok(id) => self.repo.get_card_by_id(id)?,
            Err(_) => self.repo.get_card_by_slug(target)?,
        };
        found
            .map(Some)
            .ok_or_else(|| CoreError::NoElement(format!("target {target}")))
    }

    fn attach(&self, card: &Card, target: &Card) -> CoreResult<()> {
        let linked = self.repo.linked_cards(card.id, ATTACHED_VERB)?;
        if linked.iter().any(|existing| existing.id == target.id) {
            return Ok(());
        }
        let link = link_card(card, ATTACHED_VERB, ATTACHED_INVERSE_VERB, target);
        self.repo.insert_card(&link, &BTreeSet::new())?;
        Ok(())
    }
}

fn load_full_text(repo: &dyn CardRepository) -> CoreResult<BTreeMap<String, BTreeSet<Vec<String>>>> {
    let schema = json!({
        "type": "object",
        "required": ["type"],
        "properties": { "type": { "const": TYPE_TYPE } },
        "additionalProperties": true
    });
    let compiled = compile_query(
        &schema,
        &QueryOptions::default(),
        &CompileOptions::default(),
        &|linked| linked.clone(),
    )?;

    let mut registry = BTreeMap::new();
    for row in repo.query(&compiled)? {
        let slug = row.get("slug").and_then(Value::as_str);
        let schema = row.get("data").and_then(|data| data.get("schema"));
        if let (Some(slug), Some(schema)) = (slug, schema) {
            let paths = full_text_paths(schema);
            if !paths.is_empty() {
                registry.insert(slug.to_string(), paths);
            }
        }
    }
    Ok(registry)
}

fn by_key(key: &str, value: &str) -> Value {
    json!({
        "type": "object",
        "required": [key],
        "properties": { key: { "const": value } }
    })
}

/// Strips `row` down to what `visible` admits, keeping link metadata.
fn strip_row(visible: &SchemaFilter, mut row: Map<String, Value>) -> Option<Map<String, Value>> {
    let metadata = METADATA_COLUMNS
        .iter()
        .filter_map(|name| row.remove(*name).map(|value| (name.to_string(), value)))
        .collect::<Vec<_>>();
    match visible.filter(&Value::Object(row))? {
        Value::Object(mut stripped) => {
            stripped.extend(metadata);
            Some(stripped)
        }
        _ => None,
    }
}

/// Copies onto `incoming` every part of `stored` missing from `visible`.
fn restore_hidden(incoming: &mut Value, stored: &Value, visible: &Value) {
    let (Some(incoming), Some(stored)) = (incoming.as_object_mut(), stored.as_object()) else {
        return;
    };
    let visible = visible.as_object();
    for (key, stored_value) in stored {
        match visible.and_then(|visible| visible.get(key)) {
            None => {
                incoming.insert(key.clone(), stored_value.clone());
            }
            Some(visible_value) => {
                if let Some(next) = incoming.get_mut(key) {
                    restore_hidden(next, stored_value, visible_value);
                }
            }
        }
    }
}

fn join_error(err: tokio::task::JoinError) -> CoreError {
    CoreError::InternalAssertion(format!("storage task failed: {err}"))
}
