//! Document stripping against a schema.
//!
//! # Responsibility
//! - Return the first `anyOf` branch-compatible view of a document with
//!   every property the branch does not declare removed.
//!
//! # Invariants
//! - An object schema strips every undeclared property unless it
//!   explicitly allows additional properties and `force` is off. A schema
//!   with no object keywords at all, such as `{}`, keeps the value as is.
//! - Names listed in `required` are kept, so a stripped document still
//!   matches the branch it was stripped by and stripping is idempotent.
//! - The input schema is never mutated.

use super::validator::SchemaMatcher;
use super::SchemaResult;
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Stripping behaviour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterOptions {
    /// Strip undeclared properties even where a schema explicitly allows
    /// additional ones.
    pub force: bool,
}

/// Filters a document, or each element of an array of documents.
///
/// A single non-matching document yields `null`; non-matching array
/// elements are dropped.
pub fn filter(schema: &Value, documents: &Value, options: FilterOptions) -> SchemaResult<Value> {
    let prepared = SchemaFilter::new(schema, options)?;
    Ok(match documents {
        Value::Array(list) => Value::Array(prepared.filter_all(list)),
        single => prepared.filter(single).unwrap_or(Value::Null),
    })
}

/// A schema prepared for repeated filtering, one matcher per `anyOf` branch.
#[derive(Debug, Clone)]
pub struct SchemaFilter {
    branches: Vec<SchemaMatcher>,
    force: bool,
}

impl SchemaFilter {
    pub fn new(schema: &Value, options: FilterOptions) -> SchemaResult<Self> {
        let branches = split_branches(schema)
            .iter()
            .map(SchemaMatcher::new)
            .collect::<SchemaResult<_>>()?;
        Ok(Self {
            branches,
            force: options.force,
        })
    }

    /// Stripped document, or `None` if no branch matches.
    pub fn filter(&self, document: &Value) -> Option<Value> {
        self.branches
            .iter()
            .find(|branch| branch.is_valid(document))
            .map(|branch| {
                let stripper = Stripper {
                    matcher: branch,
                    force: self.force,
                };
                stripper.strip(&[branch.schema()], document)
            })
    }

    pub fn filter_all(&self, documents: &[Value]) -> Vec<Value> {
        documents
            .iter()
            .filter_map(|document| self.filter(document))
            .collect()
    }

    pub fn matches(&self, document: &Value) -> bool {
        self.branches.iter().any(|branch| branch.is_valid(document))
    }
}

fn split_branches(schema: &Value) -> Vec<Value> {
    let Some(map) = schema.as_object() else {
        return vec![schema.clone()];
    };
    let Some(Value::Array(branches)) = map.get("anyOf") else {
        return vec![schema.clone()];
    };
    if branches.is_empty() {
        return vec![schema.clone()];
    }

    let mut rest = map.clone();
    rest.remove("anyOf");
    branches
        .iter()
        .map(|branch| {
            if rest.is_empty() {
                branch.clone()
            } else {
                let mut combined = Map::new();
                combined.insert(
                    "allOf".to_string(),
                    Value::Array(vec![Value::Object(rest.clone()), branch.clone()]),
                );
                Value::Object(combined)
            }
        })
        .collect()
}

struct Stripper<'m> {
    matcher: &'m SchemaMatcher,
    force: bool,
}

impl Stripper<'_> {
    /// Strips `value` by the conjunction of `group`.
    fn strip(&self, group: &[&Value], value: &Value) -> Value {
        let mut flat = Vec::new();
        for schema in group {
            self.flatten(schema, value, &mut flat);
        }

        match value {
            Value::Object(object) => self.strip_object(&flat, object),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .enumerate()
                    .map(|(index, item)| {
                        let subschemas: Vec<&Value> = flat
                            .iter()
                            .filter_map(|schema| item_schema(schema, index))
                            .collect();
                        self.strip(&subschemas, item)
                    })
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Expands combinators into the object schemas that apply to `value`.
    fn flatten<'s>(&self, schema: &'s Value, value: &Value, out: &mut Vec<&'s Map<String, Value>>) {
        let Value::Object(map) = schema else {
            return;
        };
        out.push(map);

        for member in map.get("allOf").and_then(Value::as_array).into_iter().flatten() {
            self.flatten(member, value, out);
        }
        for key in ["anyOf", "oneOf"] {
            let branches = map.get(key).and_then(Value::as_array);
            if let Some(branch) = branches
                .into_iter()
                .flatten()
                .find(|branch| self.matcher.matches(branch, value))
            {
                self.flatten(branch, value, out);
            }
        }
        if let Some(condition) = map.get("if") {
            let branch = if self.matcher.matches(condition, value) {
                map.get("then")
            } else {
                map.get("else")
            };
            if let Some(branch) = branch {
                self.flatten(branch, value, out);
            }
        }
    }

    fn strip_object(&self, flat: &[&Map<String, Value>], object: &Map<String, Value>) -> Value {
        let mut declared = BTreeSet::new();
        let mut patterns = Vec::new();
        let mut constrained = false;
        let mut open = Vec::new();
        for schema in flat {
            constrained |= is_object_schema(schema);
            if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
                declared.extend(properties.keys().map(String::as_str));
            }
            if let Some(required) = schema.get("required").and_then(Value::as_array) {
                declared.extend(required.iter().filter_map(Value::as_str));
            }
            if let Some(pattern_properties) = schema.get("patternProperties").and_then(Value::as_object) {
                patterns.extend(
                    pattern_properties
                        .keys()
                        .filter_map(|source| self.matcher.regex(source)),
                );
            }
            match schema.get("additionalProperties") {
                Some(Value::Bool(false)) | None => {}
                Some(additional) if !self.force => open.push(additional),
                Some(_) => {}
            }
        }

        let mut out = Map::new();
        for (key, value) in object {
            let is_declared = declared.contains(key.as_str())
                || patterns.iter().any(|regex| regex.is_match(key));
            if constrained && !is_declared && open.is_empty() {
                continue;
            }

            let mut subschemas = Vec::new();
            for schema in flat {
                if let Some(subschema) = schema
                    .get("properties")
                    .and_then(Value::as_object)
                    .and_then(|properties| properties.get(key))
                {
                    subschemas.push(subschema);
                }
                for (source, subschema) in schema
                    .get("patternProperties")
                    .and_then(Value::as_object)
                    .into_iter()
                    .flatten()
                {
                    if self.matcher.regex(source).is_some_and(|regex| regex.is_match(key)) {
                        subschemas.push(subschema);
                    }
                }
            }
            if !is_declared {
                subschemas.extend(open.iter().copied());
            }
            out.insert(key.clone(), self.strip(&subschemas, value));
        }
        Value::Object(out)
    }
}

/// Whether `schema` says anything about object members.
fn is_object_schema(schema: &Map<String, Value>) -> bool {
    let typed_object = match schema.get("type") {
        Some(Value::String(name)) => name == "object",
        Some(Value::Array(names)) => names.iter().any(|name| name == "object"),
        _ => false,
    };
    typed_object
        || ["properties", "required", "patternProperties", "additionalProperties"]
            .iter()
            .any(|key| schema.contains_key(*key))
}

fn item_schema<'s>(schema: &'s Map<String, Value>, index: usize) -> Option<&'s Value> {
    match schema.get("items")? {
        Value::Array(positional) => positional
            .get(index)
            .or_else(|| schema.get("additionalItems")),
        single => Some(single),
    }
}

#[cfg(test)]
mod tests {
    use super::{filter, FilterOptions, SchemaFilter};
    use serde_json::json;

    #[test]
    fn strips_undeclared_properties() {
        let schema = json!({
            "type": "object",
            "properties": {"slug": {"type": "string"}, "data": {"properties": {"email": {}}}},
            "additionalProperties": true
        });
        let document = json!({"slug": "a", "secret": 1, "data": {"email": "x", "hash": "y"}});
        let forced = FilterOptions { force: true };
        assert_eq!(
            filter(&schema, &document, forced).unwrap(),
            json!({"slug": "a", "data": {"email": "x"}})
        );
        assert_eq!(
            filter(&schema, &document, FilterOptions::default()).unwrap(),
            json!({"slug": "a", "secret": 1, "data": {"email": "x"}})
        );
    }

    #[test]
    fn keeps_required_names_and_untyped_values() {
        let schema = json!({"required": ["id"], "properties": {"data": {"type": "object"}, "raw": {}}});
        let document = json!({"id": "1", "other": true, "data": {"anything": [1]}, "raw": {"x": 1}});
        assert_eq!(
            filter(&schema, &document, FilterOptions::default()).unwrap(),
            json!({"id": "1", "data": {}, "raw": {"x": 1}})
        );
    }

    #[test]
    fn picks_the_first_matching_branch() {
        let prepared = SchemaFilter::new(&json!({
            "anyOf": [
                {"properties": {"kind": {"const": "a"}, "a": {}}, "required": ["kind"]},
                {"properties": {"kind": {"const": "b"}, "b": {}}, "required": ["kind"]}
            ]
        }), FilterOptions::default())
        .unwrap();
        let document = json!({"kind": "b", "a": 1, "b": 2});
        assert_eq!(prepared.filter(&document), Some(json!({"kind": "b", "b": 2})));
        assert_eq!(prepared.filter(&json!({"kind": "c"})), None);
    }

    #[test]
    fn strips_inside_arrays_and_all_of() {
        let schema = json!({
            "allOf": [
                {"properties": {"items": {"items": {"properties": {"id": {}}}}}},
                {"properties": {"name": {}}}
            ]
        });
        let document = json!({"name": "n", "items": [{"id": 1, "x": 2}], "drop": 0});
        assert_eq!(
            filter(&schema, &document, FilterOptions::default()).unwrap(),
            json!({"name": "n", "items": [{"id": 1}]})
        );
    }

    #[test]
    fn arrays_of_documents_drop_non_matching_elements() {
        let schema = json!({"properties": {"a": {"type": "integer"}}, "required": ["a"]});
        let documents = json!([{"a": 1, "b": 2}, {"b": 3}]);
        assert_eq!(
            filter(&schema, &documents, FilterOptions::default()).unwrap(),
            json!([{"a": 1}])
        );
        assert_eq!(
            filter(&schema, &json!({"b": 3}), FilterOptions::default()).unwrap(),
            serde_json::Value::Null
        );
    }
}
