//! Permission filter: the caller-visible schema for a session.
//!
//! # Responsibility
//! - Resolve a session to its actor, roles and markers.
//! - Load the actor's role views and evaluate actor templates inside them.
//! - Combine role views, caller schema and marker clause into one schema.
//!
//! # Invariants
//! - A caller without any resolvable role view is rejected before storage
//!   is queried.
//! - Linked sub-schemas requested through `$$links` are scoped by the same
//!   role and marker clause as the root.
//! - The privileged actor bypasses the marker clause only.

pub mod markers;
pub mod template;

use crate::error::{CoreError, CoreResult};
use crate::model::card::{Card, CardId};
use crate::repo::card_repo::CardRepository;
use crate::schema::merge;
use crate::sql::keywords::LINKS_KEYWORD;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde_json::{json, Map, Value};
use std::fmt::{Display, Formatter};
use uuid::Uuid;

pub use markers::{actor_markers, marker_clause};
pub use template::{evaluate, render, TemplateError};

/// Type slug of session cards.
pub const SESSION_TYPE: &str = "session";
/// Type slug of view cards.
pub const VIEW_TYPE: &str = "view";

/// Whether a scope is computed for reading or for writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}

impl Display for AccessMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => f.write_str("read"),
            Self::Write => f.write_str("write"),
        }
    }
}

/// Identity behind a session.
#[derive(Debug, Clone)]
pub struct Actor {
    pub card: Card,
    /// Actor slug first, then declared roles, deduplicated.
    pub roles: Vec<String>,
    pub markers: Vec<String>,
}

/// Schema every card visible to one caller must satisfy.
#[derive(Debug, Clone)]
pub struct PermissionScope {
    actor: Actor,
    mode: AccessMode,
    schema: Value,
    /// `{ user: <actor card> }`, the input of actor templates.
    context: Value,
}

impl PermissionScope {
    pub fn actor(&self) -> &Actor {
        &self.actor
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Role and marker clause without any caller constraint.
    pub fn schema(&self) -> &Value {
        &self.schema
    }

    /// Evaluates actor templates in a caller schema, `$$links` included.
    pub fn render(&self, caller: &Value) -> CoreResult<Value> {
        render(caller, &self.context)
            .map_err(|err| CoreError::InternalAssertion(format!("caller schema: {err}")))
    }

    /// Intersects an already rendered `caller` with the scope.
    ///
    /// The caller's `$$links` are lifted to the root of the result so the
    /// graph generator still sees them; each linked schema is scoped in turn
    /// when the generator asks for it.
    pub fn apply(&self, caller: &Value) -> Value {
        let (body, links) = split_links(caller);
        let mut scoped = Map::new();
        scoped.insert("allOf".to_string(), json!([self.schema.clone(), body]));
        if let Some(links) = links {
            scoped.insert(LINKS_KEYWORD.to_string(), links);
        }
        Value::Object(scoped)
    }
}

fn split_links(schema: &Value) -> (Value, Option<Value>) {
    match schema {
        Value::Object(map) if map.contains_key(LINKS_KEYWORD) => {
            let mut body = map.clone();
            let links = body.remove(LINKS_KEYWORD);
            (Value::Object(body), links)
        }
        other => (other.clone(), None),
    }
}

/// Computes permission scopes against a card repository.
pub struct PermissionFilter<'r> {
    repo: &'r dyn CardRepository,
    privileged_actor: &'r str,
}

impl<'r> PermissionFilter<'r> {
    pub fn new(repo: &'r dyn CardRepository, privileged_actor: &'r str) -> Self {
        Self {
            repo,
            privileged_actor,
        }
    }

    /// Final schema for `caller` under `session`.
    pub fn get_query(&self, session: CardId, caller: &Value, mode: AccessMode) -> CoreResult<Value> {
        let scope = self.scope(session, mode)?;
        let caller = scope.render(caller)?;
        Ok(scope.apply(&caller))
    }

    /// Resolves the permission scope of `session`.
    ///
    /// # Errors
    /// - `NoElement` when the session or its actor is missing.
    /// - `SessionExpired` when the session expiration has passed.
    /// - `PermissionsError` when no role view resolves.
    pub fn scope(&self, session: CardId, mode: AccessMode) -> CoreResult<PermissionScope> {
        let actor = self.resolve_actor(session)?;
        let context = json!({ "user": actor.card.to_value() });

        let mut role_schemas = Vec::new();
        for role in &actor.roles {
            let read = self.role_view(&format!("view-read-{role}"), &context)?;
            let view = match mode {
                AccessMode::Read => read,
                AccessMode::Write => {
                    let write = self.role_view(&format!("view-write-{role}"), &context)?;
                    match (read, write) {
                        (Some(read), Some(write)) => Some(json!({ "allOf": [read, write] })),
                        (read, write) => write.or(read),
                    }
                }
            };
            role_schemas.extend(view);
        }

        if role_schemas.is_empty() {
            warn!(
                "event=permission_scope module=permission status=error mode={mode} actor={} error_code=no_role_views",
                actor.card.slug
            );
            return Err(CoreError::PermissionsError(format!(
                "actor {} has no {mode} views",
                actor.card.slug
            )));
        }

        let roles = json!({ "type": "object", "anyOf": role_schemas });
        let schema = if actor.card.slug == self.privileged_actor {
            roles
        } else {
            json!({ "allOf": [roles, marker_clause(&actor.markers)] })
        };
        debug!(
            "event=permission_scope module=permission status=ok mode={mode} actor={} roles={} markers={}",
            actor.card.slug,
            actor.roles.len(),
            actor.markers.len()
        );

        Ok(PermissionScope {
            actor,
            mode,
            schema,
            context,
        })
    }

    /// Resolves the actor behind `session`.
    pub fn resolve_actor(&self, session: CardId) -> CoreResult<Actor> {
        let session_card = self
            .repo
            .get_card_by_id(session)?
            .filter(|card| card.card_type == SESSION_TYPE && card.active)
            .ok_or_else(|| CoreError::NoElement(format!("session {session}")))?;

        if let Some(expiration) = session_card.data_field("expiration").and_then(Value::as_str) {
            let expires_at = DateTime::parse_from_rfc3339(expiration).map_err(|err| {
                CoreError::InternalAssertion(format!("session {session} has invalid expiration: {err}"))
            })?;
            if expires_at.with_timezone(&Utc) < Utc::now() {
                return Err(CoreError::SessionExpired(session.to_string()));
            }
        }

        let actor_id = session_card
            .data_field("actor")
            .and_then(Value::as_str)
            .and_then(|id| Uuid::parse_str(id).ok())
            .ok_or_else(|| CoreError::NoElement(format!("actor of session {session}")))?;
        let card = self
            .repo
            .get_card_by_id(actor_id)?
            .filter(|card| card.active)
            .ok_or_else(|| CoreError::NoElement(format!("actor {actor_id}")))?;

        let mut roles = vec![card.slug.clone()];
        let declared = card
            .data_field("roles")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str);
        for role in declared {
            if !roles.iter().any(|known| known == role) {
                roles.push(role.to_string());
            }
        }
        let markers = actor_markers(self.repo, &card)?;

        Ok(Actor {
            card,
            roles,
            markers,
        })
    }

    fn role_view(&self, slug: &str, context: &Value) -> CoreResult<Option<Value>> {
        let Some(view) = self
            .repo
            .get_card_by_slug(slug)?
            .filter(|card| card.card_type == VIEW_TYPE && card.active)
        else {
            return Ok(None);
        };
        view_schema(&view, context).map(Some)
    }
}

/// Schema of a view card: its `allOf` fragments plus one disjunction of its
/// `anyOf` fragments, with actor templates evaluated.
pub fn view_schema(view: &Card, context: &Value) -> CoreResult<Value> {
    let fragments = |key: &str| -> CoreResult<Vec<Value>> {
        view.data_field(key)
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|fragment| fragment.get("schema"))
            .map(|schema| {
                render(schema, context).map_err(|err| {
                    CoreError::InternalAssertion(format!("view {}: {err}", view.slug))
                })
            })
            .collect()
    };

    let mut parts = fragments("allOf")?;
    let branches = fragments("anyOf")?;
    if !branches.is_empty() {
        parts.push(json!({ "anyOf": branches }));
    }
    if parts.is_empty() {
        return Err(CoreError::InternalAssertion(format!(
            "view {} declares no schema fragments",
            view.slug
        )));
    }
    Ok(merge(&parts)?)
}

#[cfg(test)]
mod tests {
    use super::{view_schema, AccessMode, PermissionScope, Actor};
    use crate::model::card::Card;
    use serde_json::json;

    fn scope(schema: serde_json::Value) -> PermissionScope {
        PermissionScope {
            actor: Actor {
                card: Card::new("user", json!({})).with_slug("user-jane"),
                roles: vec!["user-jane".to_string()],
                markers: vec!["user-jane".to_string()],
            },
            mode: AccessMode::Read,
            schema,
            context: json!({ "user": { "slug": "user-jane" } }),
        }
    }

    #[test]
    fn render_evaluates_caller_templates_inside_links() {
        let scope = scope(json!({ "type": "object" }));
        let caller = json!({
            "$$links": {
                "is member of": { "properties": { "slug": { "const": { "$eval": "'org-' + user.slug" } } } }
            }
        });

        let rendered = scope.render(&caller).unwrap();

        assert_eq!(
            rendered["$$links"]["is member of"]["properties"]["slug"]["const"],
            json!("org-user-jane")
        );
        assert!(scope.render(&json!({ "const": { "$eval": "'open" } })).is_err());
    }

    #[test]
    fn apply_lifts_links_to_root() {
        let scope = scope(json!({ "type": "object" }));
        let caller = json!({
            "properties": { "type": { "const": "message" } },
            "$$links": { "is attached to": { "type": "object" } }
        });

        let scoped = scope.apply(&caller);

        assert_eq!(scoped["allOf"][0], json!({ "type": "object" }));
        assert_eq!(
            scoped["allOf"][1],
            json!({ "properties": { "type": { "const": "message" } } })
        );
        assert_eq!(
            scoped["$$links"],
            json!({ "is attached to": { "type": "object" } })
        );
    }

    #[test]
    fn view_schema_combines_fragments_and_templates() {
        let view = Card::new(
            "view",
            json!({
                "allOf": [{ "name": "active", "schema": { "type": "object", "properties": { "active": { "const": true } } } }],
                "anyOf": [
                    { "name": "own", "schema": { "type": "object", "properties": { "slug": { "const": { "$eval": "user.slug" } } } } },
                    { "name": "public", "schema": { "type": "object", "properties": { "markers": { "maxItems": 0 } } } }
                ]
            }),
        )
        .with_slug("view-read-user-jane");
        let context = json!({ "user": { "slug": "user-jane" } });

        let schema = view_schema(&view, &context).unwrap();
        let text = schema.to_string();

        assert!(text.contains("\"user-jane\""));
        assert!(!text.contains("$eval"));
        assert!(text.contains("anyOf"));
    }
}
