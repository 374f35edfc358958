//! Conjunctive schema merge.
//!
//! # Invariants
//! - A document matches `merge(list)` iff it matches every schema in `list`,
//!   for the keywords merged structurally. Keywords that cannot be combined
//!   in place are kept side by side under `allOf`.
//! - Detectable contradictions fail with `SchemaError::Incompatible`
//!   instead of producing an unsatisfiable schema.

use super::validator::json_equal;
use super::{SchemaError, SchemaResult};
use serde_json::{Map, Value};

const LOWER_BOUNDS: &[&str] = &["minimum", "exclusiveMinimum", "minLength", "minItems", "minProperties"];
const UPPER_BOUNDS: &[&str] = &["maximum", "exclusiveMaximum", "maxLength", "maxItems", "maxProperties"];
const BOUND_PAIRS: &[(&str, &str)] = &[
    ("minimum", "maximum"),
    ("minLength", "maxLength"),
    ("minItems", "maxItems"),
    ("minProperties", "maxProperties"),
];

/// Merges `schemas` into one schema matching their conjunction.
///
/// A single schema that already declares `type` is returned untouched, and
/// one whose only keyword is a single-branch `anyOf` is unwrapped.
pub fn merge(schemas: &[Value]) -> SchemaResult<Value> {
    match schemas {
        [] => Ok(Value::Object(Map::new())),
        [single] => match single_branch(single) {
            Some(only) => merge(std::slice::from_ref(only)),
            None => Ok(single.clone()),
        },
        _ => schemas
            .iter()
            .map(|schema| single_branch(schema).unwrap_or(schema))
            .try_fold(Value::Bool(true), |merged, next| merge_pair(&merged, next)),
    }
}

/// The branch of a schema whose only keyword is a one-branch `anyOf`.
fn single_branch(schema: &Value) -> Option<&Value> {
    let map = schema.as_object()?;
    if map.len() != 1 {
        return None;
    }
    match map.get("anyOf")?.as_array()?.as_slice() {
        [only] => Some(only),
        _ => None,
    }
}

fn merge_pair(left: &Value, right: &Value) -> SchemaResult<Value> {
    match (left, right) {
        (Value::Bool(false), _) | (_, Value::Bool(false)) => Ok(Value::Bool(false)),
        (Value::Bool(true), other) | (other, Value::Bool(true)) => Ok(other.clone()),
        (Value::Object(left), Value::Object(right)) => merge_objects(left, right).map(Value::Object),
        _ => Err(SchemaError::InvalidSchema(
            "schemas must be objects or booleans".to_string(),
        )),
    }
}

fn merge_objects(left: &Map<String, Value>, right: &Map<String, Value>) -> SchemaResult<Map<String, Value>> {
    let mut out = left.clone();
    let mut side_by_side = Vec::new();

    for (key, incoming) in right {
        let Some(existing) = out.get(key).cloned() else {
            out.insert(key.clone(), incoming.clone());
            continue;
        };

        let merged = match key.as_str() {
            "type" => Some(intersect_types(&existing, incoming)?),
            "properties" | "patternProperties" | "definitions" | "$$links" => {
                Some(merge_members(&existing, incoming)?)
            }
            "required" => Some(union_names(&existing, incoming)),
            "enum" => Some(intersect_enums(&existing, incoming)?),
            "const" => {
                if !json_equal(&existing, incoming) {
                    return Err(SchemaError::Incompatible(format!(
                        "const {existing} conflicts with const {incoming}"
                    )));
                }
                Some(existing)
            }
            "allOf" => {
                let mut members = existing.as_array().cloned().unwrap_or_default();
                members.extend(incoming.as_array().into_iter().flatten().cloned());
                Some(Value::Array(members))
            }
            "not" => Some(single_key("anyOf", Value::Array(vec![
                existing.clone(),
                incoming.clone(),
            ]))),
            "additionalProperties" | "additionalItems" | "propertyNames" => {
                Some(merge_pair(&existing, incoming)?)
            }
            "items" if existing.is_object() && incoming.is_object() => {
                Some(merge_pair(&existing, incoming)?)
            }
            name if LOWER_BOUNDS.contains(&name) && both_numbers(&existing, incoming) => {
                Some(pick_number(&existing, incoming, f64::max))
            }
            name if UPPER_BOUNDS.contains(&name) && both_numbers(&existing, incoming) => {
                Some(pick_number(&existing, incoming, f64::min))
            }
            "uniqueItems" => Some(Value::Bool(
                existing.as_bool().unwrap_or(false) || incoming.as_bool().unwrap_or(false),
            )),
            "title" | "description" | "$id" | "$schema" | "$comment" | "default" | "examples" => {
                Some(existing)
            }
            _ if json_equal(&existing, incoming) => Some(existing),
            _ => None,
        };

        match merged {
            Some(value) => {
                out.insert(key.clone(), value);
            }
            None => side_by_side.push(single_key(key, incoming.clone())),
        }
    }

    if !side_by_side.is_empty() {
        let mut members = out
            .remove("allOf")
            .and_then(|value| value.as_array().cloned())
            .unwrap_or_default();
        members.extend(side_by_side);
        out.insert("allOf".to_string(), Value::Array(members));
    }

    check_consistency(&out)?;
    Ok(out)
}

fn single_key(key: &str, value: Value) -> Value {
    let mut map = Map::new();
    map.insert(key.to_string(), value);
    Value::Object(map)
}

fn type_names(value: &Value) -> Vec<String> {
    match value {
        Value::String(name) => vec![name.clone()],
        Value::Array(list) => list.iter().filter_map(Value::as_str).map(str::to_string).collect(),
        _ => Vec::new(),
    }
}

fn intersect_types(left: &Value, right: &Value) -> SchemaResult<Value> {
    let right_names = type_names(right);
    let admits = |name: &str| {
        right_names.iter().any(|other| other == name)
            || (name == "integer" && right_names.iter().any(|other| other == "number"))
    };
    let left_names = type_names(left);

    let mut common: Vec<String> = left_names.iter().filter(|name| admits(name.as_str())).cloned().collect();
    // `number` on the left narrowed by `integer` on the right.
    if left_names.iter().any(|name| name == "number")
        && right_names.iter().any(|name| name == "integer")
        && !common.iter().any(|name| name == "integer")
    {
        common.push("integer".to_string());
    }
    common.retain(|name| name != "number" || right_names.iter().any(|other| other == "number"));

    match common.len() {
        0 => Err(SchemaError::Incompatible(format!(
            "type {left} conflicts with type {right}"
        ))),
        1 => Ok(Value::String(common.remove(0))),
        _ => Ok(Value::Array(common.into_iter().map(Value::String).collect())),
    }
}

fn merge_members(left: &Value, right: &Value) -> SchemaResult<Value> {
    let (Some(left), Some(right)) = (left.as_object(), right.as_object()) else {
        return Err(SchemaError::InvalidSchema("expected a map of schemas".to_string()));
    };
    let mut out = left.clone();
    for (name, schema) in right {
        let merged = match out.get(name) {
            Some(existing) => merge_pair(existing, schema)?,
            None => schema.clone(),
        };
        out.insert(name.clone(), merged);
    }
    Ok(Value::Object(out))
}

fn union_names(left: &Value, right: &Value) -> Value {
    let mut names: Vec<Value> = left.as_array().cloned().unwrap_or_default();
    for name in right.as_array().into_iter().flatten() {
        if !names.contains(name) {
            names.push(name.clone());
        }
    }
    Value::Array(names)
}

fn intersect_enums(left: &Value, right: &Value) -> SchemaResult<Value> {
    let right = right.as_array().map(Vec::as_slice).unwrap_or_default();
    let common: Vec<Value> = left
        .as_array()
        .into_iter()
        .flatten()
        .filter(|value| right.iter().any(|other| json_equal(value, other)))
        .cloned()
        .collect();
    if common.is_empty() {
        return Err(SchemaError::Incompatible("enum lists have no common value".to_string()));
    }
    Ok(Value::Array(common))
}

fn both_numbers(left: &Value, right: &Value) -> bool {
    left.is_number() && right.is_number()
}

fn pick_number(left: &Value, right: &Value, pick: fn(f64, f64) -> f64) -> Value {
    let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) else {
        return left.clone();
    };
    if pick(l, r) == l {
        left.clone()
    } else {
        right.clone()
    }
}

fn check_consistency(schema: &Map<String, Value>) -> SchemaResult<()> {
    for (lower, upper) in BOUND_PAIRS {
        if let (Some(min), Some(max)) = (
            schema.get(*lower).and_then(Value::as_f64),
            schema.get(*upper).and_then(Value::as_f64),
        ) {
            if min > max {
                return Err(SchemaError::Incompatible(format!("{lower} {min} exceeds {upper} {max}")));
            }
        }
    }

    if let (Some(constant), Some(allowed)) = (schema.get("const"), schema.get("enum").and_then(Value::as_array)) {
        if !allowed.iter().any(|value| json_equal(value, constant)) {
            return Err(SchemaError::Incompatible(format!("const {constant} is not in enum")));
        }
    }

    if let (Some(constant), Some(types)) = (schema.get("const"), schema.get("type")) {
        let types = type_names(types);
        let holds = types.iter().any(|name| {
            super::validate(&single_key("type", Value::String(name.clone())), constant)
                .is_ok_and(|issues| issues.is_empty())
        });
        if !holds {
            return Err(SchemaError::Incompatible(format!(
                "const {constant} is not of type {}",
                types.join(" or ")
            )));
        }
    }
    Ok(())
}
