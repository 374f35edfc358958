//! Generic card schema and the schemas of built-in types.

use serde_json::{json, Value};
use std::collections::BTreeSet;

/// Slug syntax shared by every card.
pub const SLUG_PATTERN: &str = "^[a-z0-9-]+$";

/// Schema every stored card satisfies, regardless of its type.
pub fn card_schema() -> Value {
    json!({
        "type": "object",
        "required": [
            "id", "version", "slug", "type", "tags", "markers", "links",
            "created_at", "active", "requires", "capabilities", "data"
        ],
        "properties": {
            "id": {"type": "string", "format": "uuid"},
            "version": {"type": "string", "pattern": "^\\d+\\.\\d+\\.\\d+$"},
            "slug": {"type": "string", "pattern": SLUG_PATTERN},
            "type": {"type": "string", "pattern": SLUG_PATTERN},
            "tags": {"type": "array", "items": {"type": "string"}},
            "markers": {"type": "array", "items": {"type": "string", "pattern": "^[a-zA-Z0-9_+-]+$"}},
            "name": {"type": "string"},
            "links": {"type": "object"},
            "created_at": {"type": "string", "format": "date-time"},
            "active": {"type": "boolean"},
            "requires": {"type": "array", "items": {"type": "object"}},
            "capabilities": {"type": "array", "items": {"type": "object"}},
            "data": {"type": "object"}
        },
        "additionalProperties": false
    })
}

/// `(slug, schema)` of every built-in type.
pub fn builtin_type_schemas() -> Vec<(&'static str, Value)> {
    vec![
        ("card", json!({"type": "object"})),
        (
            "type",
            json!({
                "type": "object",
                "required": ["slug", "data"],
                "properties": {
                    "data": {
                        "type": "object",
                        "required": ["schema"],
                        "properties": {"schema": {"type": "object"}}
                    }
                }
            }),
        ),
        (
            "session",
            json!({
                "type": "object",
                "properties": {
                    "data": {
                        "type": "object",
                        "required": ["actor"],
                        "properties": {
                            "actor": {"type": "string", "format": "uuid"},
                            "expiration": {"type": "string", "format": "date-time"}
                        }
                    }
                }
            }),
        ),
        (
            "user",
            json!({
                "type": "object",
                "properties": {
                    "slug": {"type": "string", "pattern": "^user-[a-z0-9-]+$"},
                    "data": {
                        "type": "object",
                        "required": ["email", "roles"],
                        "properties": {
                            "email": {"type": "string", "format": "email"},
                            "roles": {"type": "array", "items": {"type": "string"}},
                            "hash": {"type": "string"}
                        }
                    }
                }
            }),
        ),
        (
            "view",
            json!({
                "type": "object",
                "properties": {
                    "data": {
                        "type": "object",
                        "properties": {
                            "allOf": {"type": "array", "items": view_fragment()},
                            "anyOf": {"type": "array", "items": view_fragment()}
                        },
                        "anyOf": [{"required": ["allOf"]}, {"required": ["anyOf"]}]
                    }
                }
            }),
        ),
        (
            "action",
            json!({
                "type": "object",
                "properties": {
                    "data": {
                        "type": "object",
                        "required": ["filter", "arguments"],
                        "properties": {
                            "filter": {"type": "object"},
                            "arguments": {"type": "object"}
                        }
                    }
                }
            }),
        ),
        (
            "event",
            json!({
                "type": "object",
                "properties": {
                    "data": {
                        "type": "object",
                        "required": ["timestamp", "target", "actor", "payload"],
                        "properties": {
                            "timestamp": {"type": "string", "format": "date-time"},
                            "target": {"type": "string"},
                            "actor": {"type": "string"},
                            "payload": {}
                        }
                    }
                }
            }),
        ),
        (
            "link",
            json!({
                "type": "object",
                "required": ["name"],
                "properties": {
                    "name": {"type": "string"},
                    "data": {
                        "type": "object",
                        "required": ["inverseName", "from", "to"],
                        "properties": {
                            "inverseName": {"type": "string"},
                            "from": link_endpoint(),
                            "to": link_endpoint()
                        }
                    }
                }
            }),
        ),
        (
            "org",
            json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string"},
                    "data": {"type": "object"}
                }
            }),
        ),
    ]
}

fn view_fragment() -> Value {
    json!({
        "type": "object",
        "required": ["name", "schema"],
        "properties": {
            "name": {"type": "string"},
            "schema": {"type": "object"}
        }
    })
}

fn link_endpoint() -> Value {
    json!({
        "type": "object",
        "required": ["id", "type"],
        "properties": {
            "id": {"type": "string"},
            "type": {"type": "string"}
        }
    })
}

/// Key paths (from the card root) whose subschema sets `fullTextSearch`.
pub fn full_text_paths(schema: &Value) -> BTreeSet<Vec<String>> {
    let mut paths = BTreeSet::new();
    collect_full_text(schema, &mut Vec::new(), &mut paths);
    paths
}

fn collect_full_text(schema: &Value, prefix: &mut Vec<String>, out: &mut BTreeSet<Vec<String>>) {
    let Some(map) = schema.as_object() else {
        return;
    };
    if map.get("fullTextSearch") == Some(&Value::Bool(true)) && !prefix.is_empty() {
        out.insert(prefix.clone());
    }
    for (key, subschema) in map
        .get("properties")
        .and_then(Value::as_object)
        .into_iter()
        .flatten()
    {
        prefix.push(key.clone());
        collect_full_text(subschema, prefix, out);
        prefix.pop();
    }
    for member in ["allOf", "anyOf", "oneOf"]
        .iter()
        .filter_map(|key| map.get(*key).and_then(Value::as_array))
        .flatten()
    {
        collect_full_text(member, prefix, out);
    }
}

#[cfg(test)]
mod tests {
    use super::{builtin_type_schemas, card_schema, full_text_paths};
    use crate::model::card::Card;
    use crate::schema::is_valid;
    use serde_json::json;

    #[test]
    fn defaulted_cards_match_the_generic_schema() {
        let card = Card::new("card", json!({"x": 1})).with_slug("hello-world");
        assert!(is_valid(&card_schema(), &card.to_value()).unwrap());
        let mut broken = card.to_value();
        broken["slug"] = json!("Hello World");
        assert!(!is_valid(&card_schema(), &broken).unwrap());
    }

    #[test]
    fn every_builtin_type_is_listed_once() {
        let slugs: Vec<&str> = builtin_type_schemas().iter().map(|(slug, _)| *slug).collect();
        assert_eq!(
            slugs,
            vec!["card", "type", "session", "user", "view", "action", "event", "link", "org"]
        );
    }

    #[test]
    fn finds_full_text_paths() {
        let schema = json!({
            "properties": {
                "data": {
                    "properties": {
                        "body": {"type": "string", "fullTextSearch": true},
                        "title": {"type": "string"}
                    }
                }
            }
        });
        let paths = full_text_paths(&schema);
        assert_eq!(paths.len(), 1);
        assert!(paths.contains(&vec!["data".to_string(), "body".to_string()]));
    }
}
