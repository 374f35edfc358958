use cardstore_core::db::open_db_in_memory;
use cardstore_core::model::card::{Card, CardId};
use cardstore_core::model::link::{link_card, HAS_MEMBER_VERB, MEMBER_OF_VERB};
use cardstore_core::permission::{AccessMode, PermissionFilter};
use cardstore_core::schema::is_valid;
use cardstore_core::sql::{compile_query, CompileOptions, QueryOptions};
use cardstore_core::{CardRepository, CoreError, SqliteCardRepository};
use serde_json::{json, Value};
use std::collections::BTreeSet;

const PRIVILEGED: &str = "user-admin";

struct Fixture {
    repo: SqliteCardRepository,
    session: CardId,
}

fn insert(repo: &SqliteCardRepository, card: Card) -> Card {
    repo.insert_card(&card, &BTreeSet::new()).unwrap();
    card
}

fn view(slug: &str, schema: Value) -> Card {
    Card::new("view", json!({ "allOf": [{ "name": slug, "schema": schema }] })).with_slug(slug)
}

fn fixture() -> Fixture {
    let repo = SqliteCardRepository::new(open_db_in_memory().unwrap()).unwrap();

    let jane = insert(
        &repo,
        Card::new("user", json!({ "email": "jane@example.com", "roles": ["user-community"] }))
            .with_slug("user-jane"),
    );
    let acme = insert(&repo, Card::new("org", json!({})).with_slug("org-acme"));
    insert(&repo, link_card(&jane, MEMBER_OF_VERB, HAS_MEMBER_VERB, &acme));
    let session = insert(
        &repo,
        Card::new("session", json!({ "actor": jane.id.to_string() })).with_slug("session-jane"),
    );

    insert(
        &repo,
        view(
            "view-read-user-jane",
            json!({
                "type": "object",
                "required": ["type"],
                "properties": { "type": { "const": "note" } }
            }),
        ),
    );
    insert(
        &repo,
        view(
            "view-read-user-community",
            json!({
                "type": "object",
                "required": ["type", "data"],
                "properties": {
                    "type": { "const": "task" },
                    "data": {
                        "type": "object",
                        "required": ["owner"],
                        "properties": { "owner": { "const": { "$eval": "user.slug" } } }
                    }
                }
            }),
        ),
    );
    insert(
        &repo,
        view(
            "view-write-user-jane",
            json!({
                "type": "object",
                "properties": {
                    "data": { "type": "object", "properties": { "locked": { "const": false } } }
                }
            }),
        ),
    );

    Fixture {
        repo,
        session: session.id,
    }
}

fn caller_schema() -> Value {
    json!({
        "type": "object",
        "required": ["data"],
        "properties": { "data": { "type": "object", "required": ["title"] } }
    })
}

fn candidates() -> Vec<(Card, bool)> {
    vec![
        (Card::new("note", json!({ "title": "a" })).with_slug("note-open"), true),
        (
            Card::new("task", json!({ "title": "b", "owner": "user-jane" }))
                .with_slug("task-own")
                .with_markers(&["user-jane"]),
            true,
        ),
        (
            Card::new("task", json!({ "title": "c", "owner": "user-bob" })).with_slug("task-other"),
            false,
        ),
        (Card::new("event", json!({ "title": "d" })).with_slug("event-any"), false),
        (Card::new("note", json!({})).with_slug("note-untitled"), false),
        (
            Card::new("note", json!({ "title": "e" }))
                .with_slug("note-foreign")
                .with_markers(&["org-globex"]),
            false,
        ),
        (
            Card::new("note", json!({ "title": "f" }))
                .with_slug("note-shared")
                .with_markers(&["org-acme+user-bob"]),
            true,
        ),
    ]
}

#[test]
fn read_query_is_role_views_and_caller_and_markers() {
    let fixture = fixture();
    let filter = PermissionFilter::new(&fixture.repo, PRIVILEGED);
    let query = filter
        .get_query(fixture.session, &caller_schema(), AccessMode::Read)
        .unwrap();

    let mut expected = Vec::new();
    for (card, visible) in candidates() {
        assert_eq!(
            is_valid(&query, &card.to_value()).unwrap(),
            visible,
            "{}",
            card.slug
        );
        if visible {
            expected.push(card.slug.clone());
        }
        insert(&fixture.repo, card);
    }

    let mut schema = query;
    schema
        .as_object_mut()
        .unwrap()
        .insert("additionalProperties".to_string(), json!(true));
    let compiled = compile_query(&schema, &QueryOptions::default(), &CompileOptions::default(), &|linked| {
        linked.clone()
    })
    .unwrap();
    let mut found = fixture
        .repo
        .query(&compiled)
        .unwrap()
        .into_iter()
        .map(|row| row["slug"].as_str().unwrap().to_string())
        .collect::<Vec<_>>();
    found.sort();
    expected.sort();
    assert_eq!(found, expected);
}

#[test]
fn caller_templates_resolve_against_the_actor() {
    let fixture = fixture();
    let filter = PermissionFilter::new(&fixture.repo, PRIVILEGED);
    let caller = json!({
        "type": "object",
        "required": ["data"],
        "properties": {
            "data": {
                "type": "object",
                "required": ["owner"],
                "properties": { "owner": { "const": { "$eval": "user.slug" } } }
            }
        }
    });

    let query = filter
        .get_query(fixture.session, &caller, AccessMode::Read)
        .unwrap();

    let own = Card::new("task", json!({ "title": "b", "owner": "user-jane" }))
        .with_markers(&["user-jane"])
        .to_value();
    let other = Card::new("task", json!({ "title": "b", "owner": "user-bob" }))
        .with_markers(&["user-jane"])
        .to_value();
    assert!(is_valid(&query, &own).unwrap());
    assert!(!is_valid(&query, &other).unwrap());
    assert_eq!(
        query["allOf"][1]["properties"]["data"]["properties"]["owner"]["const"],
        json!("user-jane")
    );
}

#[test]
fn actor_roles_and_markers_are_resolved() {
    let fixture = fixture();
    let filter = PermissionFilter::new(&fixture.repo, PRIVILEGED);

    let actor = filter.resolve_actor(fixture.session).unwrap();

    assert_eq!(actor.roles, vec!["user-jane", "user-community"]);
    assert_eq!(actor.markers, vec!["user-jane", "org-acme"]);
}

#[test]
fn write_scope_adds_the_write_view() {
    let fixture = fixture();
    let filter = PermissionFilter::new(&fixture.repo, PRIVILEGED);
    let locked = Card::new("note", json!({ "title": "a", "locked": true })).to_value();

    let read = filter.scope(fixture.session, AccessMode::Read).unwrap();
    let write = filter.scope(fixture.session, AccessMode::Write).unwrap();

    assert!(is_valid(read.schema(), &locked).unwrap());
    assert!(!is_valid(write.schema(), &locked).unwrap());
}

#[test]
fn actor_without_views_is_rejected() {
    let fixture = fixture();
    let bob = insert(
        &fixture.repo,
        Card::new("user", json!({ "email": "bob@example.com", "roles": [] })).with_slug("user-bob"),
    );
    let session = insert(
        &fixture.repo,
        Card::new("session", json!({ "actor": bob.id.to_string() })),
    );

    let err = PermissionFilter::new(&fixture.repo, PRIVILEGED)
        .get_query(session.id, &json!({ "type": "object" }), AccessMode::Read)
        .unwrap_err();
    assert!(matches!(err, CoreError::PermissionsError(_)));
}

#[test]
fn broken_sessions_are_rejected() {
    let fixture = fixture();
    let filter = PermissionFilter::new(&fixture.repo, PRIVILEGED);

    let missing = filter.scope(uuid::Uuid::new_v4(), AccessMode::Read).unwrap_err();
    assert!(matches!(missing, CoreError::NoElement(_)));

    let actor = fixture.repo.get_card_by_slug("user-jane").unwrap().unwrap();
    let expired = insert(
        &fixture.repo,
        Card::new(
            "session",
            json!({ "actor": actor.id.to_string(), "expiration": "2000-01-01T00:00:00Z" }),
        ),
    );
    let err = filter.scope(expired.id, AccessMode::Read).unwrap_err();
    assert!(matches!(err, CoreError::SessionExpired(_)));

    let orphan = insert(
        &fixture.repo,
        Card::new("session", json!({ "actor": uuid::Uuid::new_v4().to_string() })),
    );
    let err = filter.scope(orphan.id, AccessMode::Read).unwrap_err();
    assert!(matches!(err, CoreError::NoElement(_)));
}

#[test]
fn privileged_actor_skips_the_marker_clause() {
    let repo = SqliteCardRepository::new(open_db_in_memory().unwrap()).unwrap();
    let admin = insert(
        &repo,
        Card::new("user", json!({ "email": "admin@example.com", "roles": [] })).with_slug(PRIVILEGED),
    );
    let session = insert(
        &repo,
        Card::new("session", json!({ "actor": admin.id.to_string() })),
    );
    insert(
        &repo,
        view("view-read-user-admin", json!({ "type": "object", "additionalProperties": true })),
    );

    let scope = PermissionFilter::new(&repo, PRIVILEGED)
        .scope(session.id, AccessMode::Read)
        .unwrap();
    let foreign = Card::new("note", json!({})).with_markers(&["org-globex"]).to_value();

    assert!(is_valid(scope.schema(), &foreign).unwrap());
}
