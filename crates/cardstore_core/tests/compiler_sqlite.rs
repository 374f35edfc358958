use cardstore_core::db::open_db_in_memory;
use cardstore_core::model::card::Card;
use cardstore_core::sql::{compile_query, CompileOptions, QueryOptions};
use cardstore_core::{CardRepository, SqliteCardRepository};
use serde_json::{json, Value};
use std::collections::BTreeSet;

fn repo() -> SqliteCardRepository {
    SqliteCardRepository::new(open_db_in_memory().unwrap()).unwrap()
}

fn seed(repo: &SqliteCardRepository, slug: &str, data: Value) {
    let card = Card::new("thing", data).with_slug(slug);
    repo.insert_card(&card, &BTreeSet::new()).unwrap();
}

fn matching_slugs(repo: &SqliteCardRepository, schema: Value, options: &CompileOptions) -> Vec<String> {
    let mut schema = schema;
    schema
        .as_object_mut()
        .unwrap()
        .insert("additionalProperties".to_string(), json!(true));
    let compiled = compile_query(&schema, &QueryOptions::default(), options, &|linked| {
        linked.clone()
    })
    .unwrap();
    let mut slugs = repo
        .query(&compiled)
        .unwrap()
        .into_iter()
        .map(|row| row["slug"].as_str().unwrap().to_string())
        .collect::<Vec<_>>();
    slugs.sort();
    slugs
}

fn data_schema(data: Value) -> Value {
    json!({
        "type": "object",
        "properties": { "type": { "const": "thing" }, "data": data }
    })
}

#[test]
fn integer_type_accepts_integral_reals_only() {
    let repo = repo();
    seed(&repo, "three", json!({ "n": 3 }));
    seed(&repo, "three-point-zero", json!({ "n": 3.0 }));
    seed(&repo, "three-and-a-half", json!({ "n": 3.5 }));
    seed(&repo, "text-three", json!({ "n": "3" }));

    let schema = data_schema(json!({
        "type": "object",
        "required": ["n"],
        "properties": { "n": { "type": "integer" } }
    }));

    assert_eq!(
        matching_slugs(&repo, schema, &CompileOptions::default()),
        vec!["three", "three-point-zero"]
    );
}

#[test]
fn enum_matches_listed_values_and_absent_fields() {
    let repo = repo();
    seed(&repo, "red", json!({ "color": "red" }));
    seed(&repo, "green", json!({ "color": "green" }));
    seed(&repo, "colorless", json!({}));

    let schema = data_schema(json!({
        "type": "object",
        "properties": { "color": { "enum": ["red", "blue"] } }
    }));

    assert_eq!(
        matching_slugs(&repo, schema, &CompileOptions::default()),
        vec!["colorless", "red"]
    );
}

#[test]
fn pattern_ignores_non_strings_unless_typed() {
    let repo = repo();
    seed(&repo, "greeting", json!({ "title": "hello world" }));
    seed(&repo, "farewell", json!({ "title": "bye" }));
    seed(&repo, "numeric", json!({ "title": 5 }));

    let untyped = data_schema(json!({
        "type": "object",
        "properties": { "title": { "pattern": "^hello" } }
    }));
    assert_eq!(
        matching_slugs(&repo, untyped, &CompileOptions::default()),
        vec!["greeting", "numeric"]
    );

    let typed = data_schema(json!({
        "type": "object",
        "properties": { "title": { "type": "string", "pattern": "^hello" } }
    }));
    assert_eq!(
        matching_slugs(&repo, typed, &CompileOptions::default()),
        vec!["greeting"]
    );
}

#[test]
fn required_fields_must_exist() {
    let repo = repo();
    seed(&repo, "titled", json!({ "title": "a" }));
    seed(&repo, "untitled", json!({ "body": "b" }));

    let schema = data_schema(json!({ "type": "object", "required": ["title"] }));

    assert_eq!(
        matching_slugs(&repo, schema, &CompileOptions::default()),
        vec!["titled"]
    );
}

#[test]
fn numeric_and_length_bounds_skip_other_types() {
    let repo = repo();
    seed(&repo, "small", json!({ "n": 2, "code": "ab" }));
    seed(&repo, "large", json!({ "n": 20, "code": "abcdef" }));
    seed(&repo, "textual", json!({ "n": "twenty" }));

    let bounded = data_schema(json!({
        "type": "object",
        "properties": { "n": { "minimum": 10 } }
    }));
    assert_eq!(
        matching_slugs(&repo, bounded, &CompileOptions::default()),
        vec!["large", "textual"]
    );

    let short = data_schema(json!({
        "type": "object",
        "properties": { "code": { "maxLength": 3 } }
    }));
    assert_eq!(
        matching_slugs(&repo, short, &CompileOptions::default()),
        vec!["small", "textual"]
    );
}

#[test]
fn any_of_and_not_combine_branches() {
    let repo = repo();
    seed(&repo, "red", json!({ "color": "red" }));
    seed(&repo, "blue", json!({ "color": "blue" }));
    seed(&repo, "green", json!({ "color": "green" }));

    let schema = data_schema(json!({
        "type": "object",
        "required": ["color"],
        "anyOf": [
            { "properties": { "color": { "const": "red" } } },
            { "properties": { "color": { "not": { "enum": ["red", "green"] } } } }
        ]
    }));

    assert_eq!(
        matching_slugs(&repo, schema, &CompileOptions::default()),
        vec!["blue", "red"]
    );
}

#[test]
fn items_and_contains_scan_array_elements() {
    let repo = repo();
    seed(&repo, "tagged", json!({ "labels": ["urgent", "bug"] }));
    seed(&repo, "calm", json!({ "labels": ["idea"] }));
    seed(&repo, "mixed", json!({ "labels": ["bug", 7] }));

    let contains = data_schema(json!({
        "type": "object",
        "properties": { "labels": { "type": "array", "contains": { "const": "bug" } } }
    }));
    assert_eq!(
        matching_slugs(&repo, contains, &CompileOptions::default()),
        vec!["mixed", "tagged"]
    );

    let strings = data_schema(json!({
        "type": "object",
        "properties": { "labels": { "type": "array", "items": { "type": "string" } } }
    }));
    assert_eq!(
        matching_slugs(&repo, strings, &CompileOptions::default()),
        vec!["calm", "tagged"]
    );
}

#[test]
fn full_text_paths_use_the_search_index() {
    let repo = repo();
    let full_text: BTreeSet<Vec<String>> = [vec!["data".to_string(), "body".to_string()]]
        .into_iter()
        .collect();
    for (slug, body) in [("fox", "the quick brown fox"), ("dog", "a lazy dog")] {
        let card = Card::new("thing", json!({ "body": body })).with_slug(slug);
        repo.insert_card(&card, &full_text).unwrap();
    }

    let schema = data_schema(json!({
        "type": "object",
        "properties": { "body": { "contains": { "const": "quick" } } }
    }));
    let options = CompileOptions::default().with_full_text_path(&["data", "body"]);

    assert_eq!(matching_slugs(&repo, schema.clone(), &options), vec!["fox"]);
    assert_eq!(
        matching_slugs(&repo, schema, &CompileOptions::default()),
        vec!["dog", "fox"]
    );
}

#[test]
fn skip_limit_and_sort_apply_to_roots() {
    let repo = repo();
    for (slug, order) in [("first", 1), ("second", 2), ("third", 3)] {
        seed(&repo, slug, json!({ "order": order }));
    }
    let schema = json!({
        "type": "object",
        "properties": { "type": { "const": "thing" } },
        "additionalProperties": true
    });
    let options = QueryOptions::from_value(&json!({
        "skip": 1,
        "limit": 1,
        "sortBy": ["data", "order"],
        "sortDir": "desc"
    }))
    .unwrap();

    let compiled = compile_query(&schema, &options, &CompileOptions::default(), &|linked| {
        linked.clone()
    })
    .unwrap();
    let rows = repo.query(&compiled).unwrap();

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["slug"], json!("second"));
}

#[test]
fn malformed_options_are_rejected() {
    assert!(QueryOptions::from_value(&json!({ "limit": -1 })).is_err());
    assert!(QueryOptions::from_value(&json!({ "skip": "2" })).is_err());
    assert!(QueryOptions::from_value(&json!({ "sortDir": "sideways" })).is_err());
    assert!(QueryOptions::from_value(&json!({ "page": 2 })).is_err());
}

#[test]
fn date_formats_agree_with_the_validator() {
    let repo = repo();
    let values = [
        ("day", json!("2024-02-29")),
        ("impossible-day", json!("2023-02-29")),
        ("julian-number", json!("2451545")),
        ("stamp", json!("2024-03-01T10:15:00Z")),
        ("stamp-offset", json!("2024-03-01T23:15:00.25-02:00")),
        ("stamp-no-zone", json!("2024-03-01T10:15:00")),
        ("not-a-string", json!(20240301)),
    ];
    for (slug, when) in &values {
        seed(&repo, slug, json!({ "when": when }));
    }

    for format in ["date", "date-time"] {
        let field = json!({ "type": "object", "properties": { "when": { "format": format } } });
        let expected = values
            .iter()
            .filter(|(_, when)| {
                cardstore_core::is_valid(&field, &json!({ "when": when })).unwrap()
            })
            .map(|(slug, _)| slug.to_string())
            .collect::<BTreeSet<_>>();

        let found = matching_slugs(&repo, data_schema(field.clone()), &CompileOptions::default())
            .into_iter()
            .collect::<BTreeSet<_>>();
        assert_eq!(found, expected, "format {format}");
    }
}

#[test]
fn keys_containing_double_quotes_are_addressable() {
    let repo = repo();
    seed(&repo, "quoted", json!({ "say \"hi\"": { "n": 1 }, "flag \"x\"": true }));
    seed(&repo, "other", json!({ "say \"hi\"": { "n": 2 } }));
    seed(&repo, "absent", json!({ "plain": 1 }));

    let nested = data_schema(json!({
        "type": "object",
        "required": ["say \"hi\""],
        "properties": {
            "say \"hi\"": {
                "type": "object",
                "properties": { "n": { "const": 1 } }
            }
        }
    }));
    assert_eq!(
        matching_slugs(&repo, nested, &CompileOptions::default()),
        vec!["quoted"]
    );

    let boolean = data_schema(json!({
        "type": "object",
        "required": ["flag \"x\""],
        "properties": { "flag \"x\"": { "type": "boolean" } }
    }));
    assert_eq!(
        matching_slugs(&repo, boolean, &CompileOptions::default()),
        vec!["quoted"]
    );
}
