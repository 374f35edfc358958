use cardstore_core::schema::{filter, FilterOptions, SchemaFilter};
use proptest::prelude::*;
use serde_json::{json, Value};

fn closed_schema() -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "properties": {
            "a": { "type": "integer" },
            "b": {
                "type": "object",
                "additionalProperties": false,
                "properties": { "title": { "type": "string" } }
            },
            "c": {}
        }
    })
}

fn branching_schema() -> Value {
    json!({
        "type": "object",
        "anyOf": [
            {
                "required": ["a"],
                "properties": { "a": { "const": 1 }, "b": {} }
            },
            {
                "properties": {
                    "c": { "type": "array", "items": { "type": "object", "properties": { "title": {} } } }
                }
            }
        ]
    })
}

fn arb_json() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        (-5i64..5).prop_map(Value::from),
        "[a-c]{0,3}".prop_map(Value::String),
    ];
    leaf.prop_recursive(3, 32, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map(
                prop::sample::select(vec!["a", "b", "c", "title"]).prop_map(str::to_string),
                inner,
                0..4,
            )
            .prop_map(|members| Value::Object(members.into_iter().collect())),
        ]
    })
}

/// Every field of `stripped` exists in `original`; leaves are equal.
fn is_subset(stripped: &Value, original: &Value) -> bool {
    match (stripped, original) {
        (Value::Object(kept), Value::Object(all)) => kept
            .iter()
            .all(|(key, value)| all.get(key).is_some_and(|source| is_subset(value, source))),
        (Value::Array(kept), Value::Array(all)) => {
            kept.len() == all.len() && kept.iter().zip(all).all(|(value, source)| is_subset(value, source))
        }
        (kept, source) => kept == source,
    }
}

proptest! {
    #[test]
    fn filtering_is_idempotent_and_never_invents_fields(document in arb_json()) {
        for schema in [closed_schema(), branching_schema()] {
            let stripper = SchemaFilter::new(&schema, FilterOptions::default()).unwrap();
            if let Some(stripped) = stripper.filter(&document) {
                prop_assert!(is_subset(&stripped, &document));
                prop_assert_eq!(stripper.filter(&stripped), Some(stripped.clone()));
            }
        }
    }
}

#[test]
fn single_document_and_array_keep_their_shape() {
    let schema = closed_schema();

    let stripped = filter(&schema, &json!({ "a": 1, "z": true }), FilterOptions::default()).unwrap();
    assert_eq!(stripped, json!({ "a": 1 }));

    let rejected = filter(&schema, &json!({ "a": "one" }), FilterOptions::default()).unwrap();
    assert_eq!(rejected, Value::Null);

    let many = filter(
        &schema,
        &json!([{ "a": 1, "z": 1 }, { "a": "x" }, { "b": { "title": "t", "body": "b" } }]),
        FilterOptions::default(),
    )
    .unwrap();
    assert_eq!(many, json!([{ "a": 1 }, { "b": { "title": "t" } }]));

    let none = filter(&schema, &json!([{ "a": "x" }]), FilterOptions::default()).unwrap();
    assert_eq!(none, json!([]));
}

#[test]
fn branches_do_not_leak_fields_into_each_other() {
    let stripper = SchemaFilter::new(&branching_schema(), FilterOptions::default()).unwrap();

    let first = stripper
        .filter(&json!({ "a": 1, "b": "kept", "c": [{ "title": "x" }] }))
        .unwrap();
    assert_eq!(first, json!({ "a": 1, "b": "kept" }));

    let second = stripper
        .filter(&json!({ "a": 2, "b": "dropped", "c": [{ "title": "x", "body": "y" }] }))
        .unwrap();
    assert_eq!(second, json!({ "c": [{ "title": "x" }] }));
}

#[test]
fn force_strips_explicitly_open_objects() {
    let schema = json!({
        "type": "object",
        "properties": { "slug": { "type": "string" } },
        "additionalProperties": true
    });
    let document = json!({ "slug": "a", "extra": 1 });

    let open = filter(&schema, &document, FilterOptions::default()).unwrap();
    assert_eq!(open, document);

    let forced = filter(&schema, &document, FilterOptions { force: true }).unwrap();
    assert_eq!(forced, json!({ "slug": "a" }));
}

#[test]
fn object_schemas_without_additional_properties_are_closed() {
    let schema = json!({
        "type": "object",
        "properties": { "data": { "type": "object" } }
    });
    let document = json!({ "data": { "a": 1 }, "extra": 2 });

    for force in [false, true] {
        let stripped = filter(&schema, &document, FilterOptions { force }).unwrap();
        assert_eq!(stripped, json!({ "data": {} }));
    }
}
