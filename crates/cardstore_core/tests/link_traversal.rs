use cardstore_core::db::open_db_in_memory;
use cardstore_core::model::card::Card;
use cardstore_core::model::link::{link_card, ATTACHED_INVERSE_VERB, ATTACHED_VERB};
use cardstore_core::sql::{
    compile_query, nest_linked_rows, CompileOptions, QueryOptions, LINK_DIRECTION_COLUMN,
    LINK_TYPE_COLUMN, PARENT_ID_COLUMN,
};
use cardstore_core::{CardRepository, SqliteCardRepository};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;

struct Seeded {
    repo: SqliteCardRepository,
    first: Card,
}

fn insert(repo: &SqliteCardRepository, card: Card) -> Card {
    repo.insert_card(&card, &BTreeSet::new()).unwrap();
    card
}

fn seed() -> Seeded {
    let repo = SqliteCardRepository::new(open_db_in_memory().unwrap()).unwrap();
    let first = insert(&repo, Card::new("thread", json!({})).with_slug("thread-1"));
    let second = insert(&repo, Card::new("thread", json!({})).with_slug("thread-2"));
    for (slug, thread) in [("message-a", &first), ("message-b", &first), ("message-c", &second)] {
        let message = insert(&repo, Card::new("message", json!({})).with_slug(slug));
        insert(
            &repo,
            link_card(&message, ATTACHED_VERB, ATTACHED_INVERSE_VERB, thread),
        );
    }
    Seeded { repo, first }
}

fn threads_with_messages() -> Value {
    json!({
        "type": "object",
        "required": ["type"],
        "properties": { "type": { "const": "thread" } },
        "$$links": {
            "has attached element": {
                "type": "object",
                "properties": { "type": { "const": "message" } }
            }
        }
    })
}

fn run(repo: &SqliteCardRepository, schema: &Value, options: Value) -> Vec<Map<String, Value>> {
    let options = QueryOptions::from_value(&options).unwrap();
    let compiled = compile_query(schema, &options, &CompileOptions::default(), &|linked| {
        linked.clone()
    })
    .unwrap();
    assert!(compiled.links_requested);
    repo.query(&compiled).unwrap()
}

#[test]
fn linked_rows_are_tagged_with_direction_verb_and_parent() {
    let seeded = seed();
    let rows = run(
        &seeded.repo,
        &threads_with_messages(),
        json!({ "sortBy": "slug", "limit": 1 }),
    );

    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0]["slug"], json!("thread-1"));
    assert_eq!(rows[0][PARENT_ID_COLUMN], Value::Null);

    let mut linked = rows[1..]
        .iter()
        .map(|row| row["slug"].as_str().unwrap().to_string())
        .collect::<Vec<_>>();
    linked.sort();
    assert_eq!(linked, vec!["message-a", "message-b"]);
    for row in &rows[1..] {
        assert_eq!(row[LINK_DIRECTION_COLUMN], json!("incoming"));
        assert_eq!(row[LINK_TYPE_COLUMN], json!(ATTACHED_INVERSE_VERB));
        assert_eq!(row[PARENT_ID_COLUMN], json!(seeded.first.id.to_string()));
    }
}

#[test]
fn paging_applies_to_roots_only() {
    let seeded = seed();

    let all = run(&seeded.repo, &threads_with_messages(), Value::Null);
    assert_eq!(all.len(), 5);

    let skipped = run(
        &seeded.repo,
        &threads_with_messages(),
        json!({ "sortBy": "slug", "skip": 1, "limit": 1 }),
    );
    let slugs = skipped
        .iter()
        .map(|row| row["slug"].as_str().unwrap())
        .collect::<Vec<_>>();
    assert_eq!(slugs, vec!["thread-2", "message-c"]);
}

#[test]
fn links_are_traversable_from_both_ends() {
    let seeded = seed();
    let schema = json!({
        "type": "object",
        "properties": { "slug": { "const": "message-a" } },
        "$$links": { "is attached to": { "type": "object" } }
    });

    let rows = run(&seeded.repo, &schema, Value::Null);

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1]["slug"], json!("thread-1"));
    assert_eq!(rows[1][LINK_DIRECTION_COLUMN], json!("outgoing"));
}

#[test]
fn nested_links_expand_recursively_into_cards() {
    let seeded = seed();
    let schema = json!({
        "type": "object",
        "properties": { "slug": { "const": "message-a" } },
        "$$links": {
            "is attached to": {
                "type": "object",
                "$$links": { "has attached element": { "type": "object" } }
            }
        }
    });

    let cards = nest_linked_rows(run(&seeded.repo, &schema, Value::Null));

    assert_eq!(cards.len(), 1);
    let thread = &cards[0]["links"]["is attached to"][0];
    assert_eq!(thread["slug"], json!("thread-1"));
    assert!(thread.get(PARENT_ID_COLUMN).is_none());
    let siblings = thread["links"]["has attached element"].as_array().unwrap();
    assert_eq!(siblings.len(), 2);
}

#[test]
fn linked_filter_restricts_linked_rows_only() {
    let seeded = seed();
    let schema = json!({
        "type": "object",
        "properties": { "slug": { "const": "thread-1" } },
        "$$links": {
            "has attached element": {
                "type": "object",
                "properties": { "slug": { "const": "message-b" } }
            }
        }
    });

    let rows = run(&seeded.repo, &schema, Value::Null);

    let slugs = rows
        .iter()
        .map(|row| row["slug"].as_str().unwrap())
        .collect::<Vec<_>>();
    assert_eq!(slugs, vec!["thread-1", "message-b"]);
}

#[test]
fn deactivated_links_are_no_longer_traversed() {
    let seeded = seed();
    let message = insert(&seeded.repo, Card::new("message", json!({})).with_slug("message-d"));
    let mut link = insert(
        &seeded.repo,
        link_card(&message, ATTACHED_VERB, ATTACHED_INVERSE_VERB, &seeded.first),
    );
    assert_eq!(seeded.repo.linked_cards(message.id, ATTACHED_VERB).unwrap().len(), 1);

    link.active = false;
    seeded.repo.upsert_card(&link, &BTreeSet::new()).unwrap();

    assert!(seeded
        .repo
        .linked_cards(message.id, ATTACHED_VERB)
        .unwrap()
        .is_empty());
    let rows = run(&seeded.repo, &threads_with_messages(), json!({ "sortBy": "slug", "limit": 1 }));
    let mut linked = rows[1..]
        .iter()
        .map(|row| row["slug"].as_str().unwrap())
        .collect::<Vec<_>>();
    linked.sort();
    assert_eq!(rows[0]["slug"], json!("thread-1"));
    assert_eq!(linked, vec!["message-a", "message-b"]);
}
