//! Records every store starts with.

use crate::error::CoreResult;
use crate::model::card::{Card, CardId};
use crate::repo::card_repo::CardRepository;
use crate::schema::card_schema::builtin_type_schemas;
use log::info;
use serde_json::{json, Value};
use std::collections::BTreeSet;

/// Slug of the session handed to the privileged actor.
pub const ADMIN_SESSION_SLUG: &str = "session-admin";
const ADMIN_EMAIL: &str = "admin@cardstore.local";

/// Inserts whatever built-in records are missing.
///
/// Returns the id of the privileged actor's session.
pub(crate) fn bootstrap(repo: &dyn CardRepository, privileged_actor: &str) -> CoreResult<CardId> {
    let mut created = 0usize;
    let mut ensure = |card: Card| -> CoreResult<Card> {
        if let Some(existing) = repo.get_card_by_slug(&card.slug)? {
            return Ok(existing);
        }
        repo.insert_card(&card, &BTreeSet::new())?;
        created += 1;
        Ok(card)
    };

    for (slug, schema) in builtin_type_schemas() {
        ensure(type_card(slug, schema))?;
    }

    let actor = ensure(
        Card::new("user", json!({ "email": ADMIN_EMAIL, "roles": [] }))
            .with_slug(privileged_actor)
            .with_name("Administrator"),
    )?;
    let session = ensure(
        Card::new("session", json!({ "actor": actor.id.to_string() })).with_slug(ADMIN_SESSION_SLUG),
    )?;
    for scope in ["read", "write"] {
        ensure(unrestricted_view(&format!("view-{scope}-{privileged_actor}")))?;
    }

    info!("event=kernel_bootstrap module=kernel status=ok created={created}");
    Ok(session.id)
}

/// Type card declaring `schema`.
pub fn type_card(slug: &str, schema: Value) -> Card {
    Card::new("type", json!({ "schema": schema }))
        .with_slug(slug)
        .with_name(slug)
}

fn unrestricted_view(slug: &str) -> Card {
    Card::new(
        "view",
        json!({
            "allOf": [{
                "name": "all cards",
                "schema": { "type": "object", "additionalProperties": true }
            }]
        }),
    )
    .with_slug(slug)
}
