//! Draft-7 subset validator with full issue collection.
//!
//! # Responsibility
//! - Check documents against a schema and report every failing keyword.
//!
//! # Invariants
//! - Regular expressions are compiled once, when the matcher is built.
//! - Numbers compare by value: `3` and `3.0` are equal and both integers.
//! - Keywords without a validation rule (annotations, `$$links`) pass.

use super::{SchemaError, SchemaResult, ValidationIssue};
use crate::sql::keywords::Keyword;
use chrono::{DateTime, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Number, Value};
use std::collections::HashMap;
use uuid::Uuid;

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("valid email regex"));

/// Validates `instance` against `schema`, returning every issue found.
pub fn validate(schema: &Value, instance: &Value) -> SchemaResult<Vec<ValidationIssue>> {
    Ok(SchemaMatcher::new(schema)?.validate(instance))
}

/// Shorthand for `validate(..)?.is_empty()`.
pub fn is_valid(schema: &Value, instance: &Value) -> SchemaResult<bool> {
    Ok(SchemaMatcher::new(schema)?.is_valid(instance))
}

/// A schema prepared for repeated validation.
#[derive(Debug, Clone)]
pub struct SchemaMatcher {
    schema: Value,
    regexes: HashMap<String, Regex>,
}

impl SchemaMatcher {
    pub fn new(schema: &Value) -> SchemaResult<Self> {
        let mut regexes = HashMap::new();
        collect_regexes(schema, &mut regexes)?;
        Ok(Self {
            schema: schema.clone(),
            regexes,
        })
    }

    pub fn schema(&self) -> &Value {
        &self.schema
    }

    pub fn validate(&self, instance: &Value) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        self.check(&self.schema, instance, "", &mut issues);
        issues
    }

    pub fn is_valid(&self, instance: &Value) -> bool {
        self.matches(&self.schema, instance)
    }

    /// Fails with `SchemaError::Mismatch` carrying every issue.
    pub fn ensure(&self, instance: &Value) -> SchemaResult<()> {
        let issues = self.validate(instance);
        if issues.is_empty() {
            Ok(())
        } else {
            Err(SchemaError::Mismatch { issues })
        }
    }

    pub(crate) fn matches(&self, schema: &Value, instance: &Value) -> bool {
        let mut issues = Vec::new();
        self.check(schema, instance, "", &mut issues);
        issues.is_empty()
    }

    pub(crate) fn regex(&self, source: &str) -> Option<&Regex> {
        self.regexes.get(source)
    }

    fn check(&self, schema: &Value, instance: &Value, path: &str, issues: &mut Vec<ValidationIssue>) {
        let map = match schema {
            Value::Bool(true) => return,
            Value::Bool(false) => {
                issues.push(ValidationIssue::new(path, "false", "no value is allowed here"));
                return;
            }
            Value::Object(map) => map,
            _ => {
                issues.push(ValidationIssue::new(path, "schema", "schema is not an object"));
                return;
            }
        };

        for (key, argument) in map {
            self.keyword(map, key, argument, instance, path, issues);
        }
    }

    fn keyword(
        &self,
        schema: &Map<String, Value>,
        key: &str,
        argument: &Value,
        instance: &Value,
        path: &str,
        issues: &mut Vec<ValidationIssue>,
    ) {
        match key {
            "type" => {
                let names: Vec<&str> = match argument {
                    Value::String(name) => vec![name.as_str()],
                    Value::Array(list) => list.iter().filter_map(Value::as_str).collect(),
                    _ => Vec::new(),
                };
                if !names.iter().any(|name| has_type(instance, name)) {
                    push_issue(issues, path, key, format!("expected {}, got {}", names.join(" or "), type_name(instance)));
                }
            }
            "const" => {
                if !json_equal(argument, instance) {
                    push_issue(issues, path, key, format!("expected constant {argument}"));
                }
            }
            "enum" => {
                let allowed = argument.as_array().map(Vec::as_slice).unwrap_or_default();
                if !allowed.iter().any(|value| json_equal(value, instance)) {
                    push_issue(issues, path, key, format!("value is not one of {argument}"));
                }
            }
            "pattern" | "regexp" => {
                if let Value::String(text) = instance {
                    let matched = pattern_source(key, argument)
                        .and_then(|source| self.regex(&source))
                        .is_some_and(|regex| regex.is_match(text));
                    if !matched {
                        push_issue(issues, path, key, format!("`{text}` does not match {argument}"));
                    }
                }
            }
            "required" => {
                if let Value::Object(object) = instance {
                    for name in argument.as_array().into_iter().flatten().filter_map(Value::as_str) {
                        if !object.contains_key(name) {
                            push_issue(issues, path, key, format!("missing property `{name}`"));
                        }
                    }
                }
            }
            "properties" => {
                if let (Value::Object(object), Some(properties)) = (instance, argument.as_object()) {
                    for (name, subschema) in properties {
                        if let Some(value) = object.get(name) {
                            self.check(subschema, value, &child_path(path, name), issues);
                        }
                    }
                }
            }
            "patternProperties" => {
                if let (Value::Object(object), Some(patterns)) = (instance, argument.as_object()) {
                    for (source, subschema) in patterns {
                        let Some(regex) = self.regex(source) else {
                            continue;
                        };
                        for (name, value) in object.iter().filter(|(name, _)| regex.is_match(name)) {
                            self.check(subschema, value, &child_path(path, name), issues);
                        }
                    }
                }
            }
            "additionalProperties" => {
                let Value::Object(object) = instance else {
                    return;
                };
                let declared = schema.get("properties").and_then(Value::as_object);
                let patterns: Vec<&Regex> = schema
                    .get("patternProperties")
                    .and_then(Value::as_object)
                    .map(|patterns| patterns.keys().filter_map(|source| self.regex(source)).collect())
                    .unwrap_or_default();
                for (name, value) in object {
                    let is_declared = declared.is_some_and(|declared| declared.contains_key(name));
                    if is_declared || patterns.iter().any(|regex| regex.is_match(name)) {
                        continue;
                    }
                    if argument == &Value::Bool(false) {
                        push_issue(issues, path, key, format!("additional property `{name}` is not allowed"));
                    } else {
                        self.check(argument, value, &child_path(path, name), issues);
                    }
                }
            }
            "propertyNames" => {
                if let Value::Object(object) = instance {
                    for name in object.keys() {
                        self.check(argument, &Value::String(name.clone()), &child_path(path, name), issues);
                    }
                }
            }
            "dependencies" => {
                let (Value::Object(object), Some(dependencies)) = (instance, argument.as_object()) else {
                    return;
                };
                for (name, dependency) in dependencies.iter().filter(|(name, _)| object.contains_key(*name)) {
                    match dependency {
                        Value::Array(names) => {
                            for needed in names.iter().filter_map(Value::as_str) {
                                if !object.contains_key(needed) {
                                    push_issue(issues, path, key, format!("`{name}` requires property `{needed}`"));
                                }
                            }
                        }
                        subschema => self.check(subschema, instance, path, issues),
                    }
                }
            }
            "minProperties" | "maxProperties" => {
                if let (Value::Object(object), Some(limit)) = (instance, argument.as_u64()) {
                    let count = object.len() as u64;
                    if (key == "minProperties" && count < limit) || (key == "maxProperties" && count > limit) {
                        push_issue(issues, path, key, format!("object has {count} properties, limit is {limit}"));
                    }
                }
            }
            "items" => {
                let Value::Array(items) = instance else {
                    return;
                };
                match argument {
                    Value::Array(positional) => {
                        for (index, (subschema, item)) in positional.iter().zip(items).enumerate() {
                            self.check(subschema, item, &child_path(path, &index.to_string()), issues);
                        }
                    }
                    subschema => {
                        for (index, item) in items.iter().enumerate() {
                            self.check(subschema, item, &child_path(path, &index.to_string()), issues);
                        }
                    }
                }
            }
            "additionalItems" => {
                let (Value::Array(items), Some(Value::Array(positional))) = (instance, schema.get("items")) else {
                    return;
                };
                for (index, item) in items.iter().enumerate().skip(positional.len()) {
                    self.check(argument, item, &child_path(path, &index.to_string()), issues);
                }
            }
            "contains" => {
                if let Value::Array(items) = instance {
                    if !items.iter().any(|item| self.matches(argument, item)) {
                        push_issue(issues, path, key, "no element matches `contains`".to_string());
                    }
                }
            }
            "minItems" | "maxItems" => {
                if let (Value::Array(items), Some(limit)) = (instance, argument.as_u64()) {
                    let count = items.len() as u64;
                    if (key == "minItems" && count < limit) || (key == "maxItems" && count > limit) {
                        push_issue(issues, path, key, format!("array has {count} items, limit is {limit}"));
                    }
                }
            }
            "uniqueItems" => {
                if let (Value::Array(items), Value::Bool(true)) = (instance, argument) {
                    let duplicated = items
                        .iter()
                        .enumerate()
                        .any(|(index, item)| items[..index].iter().any(|seen| json_equal(seen, item)));
                    if duplicated {
                        push_issue(issues, path, key, "array items are not unique".to_string());
                    }
                }
            }
            "minLength" | "maxLength" => {
                if let (Value::String(text), Some(limit)) = (instance, argument.as_u64()) {
                    let count = text.chars().count() as u64;
                    if (key == "minLength" && count < limit) || (key == "maxLength" && count > limit) {
                        push_issue(issues, path, key, format!("string has {count} characters, limit is {limit}"));
                    }
                }
            }
            "minimum" | "maximum" | "exclusiveMinimum" | "exclusiveMaximum" => {
                let (Some(value), Some(bound)) = (instance.as_f64(), argument.as_f64()) else {
                    return;
                };
                let exclusive_flag = |flag: &str| schema.get(flag) == Some(&Value::Bool(true));
                let holds = match key {
                    "minimum" if exclusive_flag("exclusiveMinimum") => value > bound,
                    "minimum" => value >= bound,
                    "maximum" if exclusive_flag("exclusiveMaximum") => value < bound,
                    "maximum" => value <= bound,
                    "exclusiveMinimum" => value > bound,
                    _ => value < bound,
                };
                if !holds {
                    push_issue(issues, path, key, format!("{value} violates {key} {bound}"));
                }
            }
            "multipleOf" => {
                if let (Some(value), Some(factor)) = (instance.as_f64(), argument.as_f64()) {
                    let quotient = value / factor;
                    if factor <= 0.0 || (quotient - quotient.round()).abs() >= 1e-9 {
                        push_issue(issues, path, key, format!("{value} is not a multiple of {factor}"));
                    }
                }
            }
            "format" => {
                if let (Value::String(text), Some(format)) = (instance, argument.as_str()) {
                    if !format_holds(format, text) {
                        push_issue(issues, path, key, format!("`{text}` is not a valid {format}"));
                    }
                }
            }
            "formatMinimum" | "formatMaximum" | "formatExclusiveMinimum" | "formatExclusiveMaximum" => {
                let (Value::String(text), Some(bound)) = (instance, argument.as_str()) else {
                    return;
                };
                let format = schema.get("format").and_then(Value::as_str).unwrap_or_default();
                let Some(ordering) = compare_formatted(format, text, bound) else {
                    return;
                };
                let holds = match key {
                    "formatMinimum" => ordering.is_ge(),
                    "formatMaximum" => ordering.is_le(),
                    "formatExclusiveMinimum" => ordering.is_gt(),
                    _ => ordering.is_lt(),
                };
                if !holds {
                    push_issue(issues, path, key, format!("`{text}` violates {key} `{bound}`"));
                }
            }
            "allOf" => {
                for subschema in argument.as_array().into_iter().flatten() {
                    self.check(subschema, instance, path, issues);
                }
            }
            "anyOf" => {
                let branches = argument.as_array().map(Vec::as_slice).unwrap_or_default();
                if !branches.iter().any(|branch| self.matches(branch, instance)) {
                    push_issue(issues, path, key, "value matches no `anyOf` branch".to_string());
                }
            }
            "oneOf" => {
                let branches = argument.as_array().map(Vec::as_slice).unwrap_or_default();
                let matched = branches.iter().filter(|branch| self.matches(branch, instance)).count();
                if matched != 1 {
                    push_issue(issues, path, key, format!("value matches {matched} `oneOf` branches"));
                }
            }
            "not" => {
                if self.matches(argument, instance) {
                    push_issue(issues, path, key, "value matches a `not` schema".to_string());
                }
            }
            "if" => {
                let branch = if self.matches(argument, instance) {
                    schema.get("then")
                } else {
                    schema.get("else")
                };
                if let Some(branch) = branch {
                    self.check(branch, instance, path, issues);
                }
            }
            _ => {}
        }
    }
}

fn push_issue(issues: &mut Vec<ValidationIssue>, path: &str, key: &str, message: String) {
    issues.push(ValidationIssue::new(path, key, message));
}

fn child_path(path: &str, key: &str) -> String {
    format!("{path}/{}", key.replace('~', "~0").replace('/', "~1"))
}

fn pattern_source(key: &str, argument: &Value) -> Option<String> {
    match Keyword::parse(key, argument).ok()? {
        Keyword::Pattern(source) => Some(source),
        _ => None,
    }
}

/// Compiles every regex reachable through subschema positions.
fn collect_regexes(schema: &Value, regexes: &mut HashMap<String, Regex>) -> SchemaResult<()> {
    let Value::Object(map) = schema else {
        return Ok(());
    };
    let compile = |source: String, regexes: &mut HashMap<String, Regex>| -> SchemaResult<()> {
        if !regexes.contains_key(&source) {
            let regex = Regex::new(&source).map_err(|err| SchemaError::InvalidSchema(err.to_string()))?;
            regexes.insert(source, regex);
        }
        Ok(())
    };

    for (key, value) in map {
        match key.as_str() {
            "pattern" | "regexp" => {
                let source = pattern_source(key, value)
                    .ok_or_else(|| SchemaError::InvalidSchema(format!("invalid `{key}`: {value}")))?;
                compile(source, regexes)?;
            }
            "patternProperties" => {
                for (source, subschema) in value.as_object().into_iter().flatten() {
                    compile(source.clone(), regexes)?;
                    collect_regexes(subschema, regexes)?;
                }
            }
            "properties" | "definitions" | "dependencies" | "$$links" => {
                for subschema in value.as_object().into_iter().flat_map(|map| map.values()) {
                    collect_regexes(subschema, regexes)?;
                }
            }
            "items" | "allOf" | "anyOf" | "oneOf" => match value {
                Value::Array(list) => {
                    for subschema in list {
                        collect_regexes(subschema, regexes)?;
                    }
                }
                subschema => collect_regexes(subschema, regexes)?,
            },
            "additionalProperties" | "additionalItems" | "contains" | "not" | "if" | "then"
            | "else" | "propertyNames" => collect_regexes(value, regexes)?,
            _ => {}
        }
    }
    Ok(())
}

fn has_type(instance: &Value, name: &str) -> bool {
    match name {
        "null" => instance.is_null(),
        "boolean" => instance.is_boolean(),
        "integer" => instance.as_number().is_some_and(is_integral),
        "number" => instance.is_number(),
        "string" => instance.is_string(),
        "array" => instance.is_array(),
        "object" => instance.is_object(),
        _ => false,
    }
}

fn is_integral(number: &Number) -> bool {
    number.is_i64()
        || number.is_u64()
        || number.as_f64().is_some_and(|value| value.is_finite() && value.fract() == 0.0)
}

fn type_name(instance: &Value) -> &'static str {
    match instance {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(number) if is_integral(number) => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Structural equality where numbers compare by value.
pub(crate) fn json_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(left), Value::Number(right)) => match (left.as_i64(), right.as_i64()) {
            (Some(left), Some(right)) => left == right,
            _ => left.as_f64() == right.as_f64(),
        },
        (Value::Array(left), Value::Array(right)) => {
            left.len() == right.len() && left.iter().zip(right).all(|(l, r)| json_equal(l, r))
        }
        (Value::Object(left), Value::Object(right)) => {
            left.len() == right.len()
                && left
                    .iter()
                    .all(|(key, value)| right.get(key).is_some_and(|other| json_equal(value, other)))
        }
        _ => left == right,
    }
}

fn format_holds(format: &str, text: &str) -> bool {
    match format {
        "date-time" => DateTime::parse_from_rfc3339(text).is_ok(),
        "date" => NaiveDate::parse_from_str(text, "%Y-%m-%d").is_ok(),
        "email" => EMAIL_RE.is_match(text),
        "uuid" => Uuid::parse_str(text).is_ok(),
        _ => true,
    }
}

fn compare_formatted(format: &str, left: &str, right: &str) -> Option<std::cmp::Ordering> {
    match format {
        "date-time" => {
            let left = DateTime::parse_from_rfc3339(left).ok()?;
            let right = DateTime::parse_from_rfc3339(right).ok()?;
            Some(left.cmp(&right))
        }
        "date" => {
            let left = NaiveDate::parse_from_str(left, "%Y-%m-%d").ok()?;
            let right = NaiveDate::parse_from_str(right, "%Y-%m-%d").ok()?;
            Some(left.cmp(&right))
        }
        _ => Some(left.cmp(right)),
    }
}

#[cfg(test)]
mod tests {
    use super::{json_equal, validate, SchemaMatcher};
    use serde_json::json;

    #[test]
    fn collects_every_issue() {
        let schema = json!({
            "type": "object",
            "required": ["slug", "data"],
            "properties": {"slug": {"type": "string", "pattern": "^[a-z]+$"}}
        });
        let issues = validate(&schema, &json!({"slug": "Nope1"})).unwrap();
        assert_eq!(issues.len(), 2);
        assert!(issues.iter().any(|issue| issue.keyword == "required"));
        assert!(issues.iter().any(|issue| issue.path == "/slug" && issue.keyword == "pattern"));
    }

    #[test]
    fn integers_compare_by_value() {
        let matcher = SchemaMatcher::new(&json!({"type": "integer"})).unwrap();
        assert!(matcher.is_valid(&json!(3)));
        assert!(matcher.is_valid(&json!(3.0)));
        assert!(!matcher.is_valid(&json!(3.5)));
        assert!(!matcher.is_valid(&json!("3")));
        assert!(json_equal(&json!([1, {"a": 2.0}]), &json!([1.0, {"a": 2}])));
    }

    #[test]
    fn combinators_and_conditionals() {
        let matcher = SchemaMatcher::new(&json!({
            "oneOf": [{"type": "string"}, {"minLength": 2}],
            "if": {"type": "string"}, "then": {"maxLength": 3}
        }))
        .unwrap();
        assert!(matcher.is_valid(&json!(7)));
        assert!(matcher.is_valid(&json!("a")));
        assert!(!matcher.is_valid(&json!("abcd")));
        assert!(!matcher.is_valid(&json!("ab")));
    }

    #[test]
    fn formats_and_format_bounds() {
        let matcher = SchemaMatcher::new(&json!({
            "type": "string",
            "format": "date-time",
            "formatMinimum": "2024-01-01T00:00:00Z"
        }))
        .unwrap();
        assert!(matcher.is_valid(&json!("2024-06-01T12:00:00.000Z")));
        assert!(!matcher.is_valid(&json!("2023-06-01T12:00:00Z")));
        assert!(!matcher.is_valid(&json!("yesterday")));
    }

    #[test]
    fn additional_properties_respect_patterns() {
        let matcher = SchemaMatcher::new(&json!({
            "properties": {"a": {}},
            "patternProperties": {"^x-": {"type": "string"}},
            "additionalProperties": false
        }))
        .unwrap();
        assert!(matcher.is_valid(&json!({"a": 1, "x-b": "ok"})));
        assert!(!matcher.is_valid(&json!({"a": 1, "x-b": 2})));
        assert!(!matcher.is_valid(&json!({"c": 1})));
    }

    #[test]
    fn invalid_patterns_are_rejected_up_front() {
        assert!(SchemaMatcher::new(&json!({"properties": {"a": {"pattern": "("}}})).is_err());
    }
}
