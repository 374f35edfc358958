//! Actor-templated placeholders inside stored view schemas.
//!
//! A placeholder is any object whose only key is `$eval`. Its string value is
//! a small expression over the actor context: dotted paths with `[n]`
//! indices, single-quoted string literals, integer literals and `+`.
//!
//! # Invariants
//! - Rendering never mutates its input and never touches storage.
//! - A path that does not resolve evaluates to `null`.

use serde_json::{Map, Value};
use thiserror::Error;

/// Key marking an actor-templated placeholder.
pub const EVAL_KEY: &str = "$eval";

/// Malformed placeholder expression.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid template `{expression}`: {reason}")]
pub struct TemplateError {
    pub expression: String,
    pub reason: String,
}

/// Replaces every placeholder in `schema` with its value under `context`.
pub fn render(schema: &Value, context: &Value) -> Result<Value, TemplateError> {
    match schema {
        Value::Object(map) => {
            if let Some(expression) = placeholder(map) {
                return evaluate(expression, context);
            }
            let mut rendered = Map::with_capacity(map.len());
            for (key, value) in map {
                rendered.insert(key.clone(), render(value, context)?);
            }
            Ok(Value::Object(rendered))
        }
        Value::Array(items) => items
            .iter()
            .map(|item| render(item, context))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        other => Ok(other.clone()),
    }
}

/// Evaluates one expression against `context`.
///
/// `+` joins arrays, adds integers and concatenates anything else as text.
pub fn evaluate(expression: &str, context: &Value) -> Result<Value, TemplateError> {
    let invalid = |reason: String| TemplateError {
        expression: expression.to_string(),
        reason,
    };

    let mut result: Option<Value> = None;
    for term in split_terms(expression).map_err(invalid)? {
        let value = term_value(term.trim(), context).map_err(invalid)?;
        result = Some(match result {
            None => value,
            Some(left) => concat(left, value),
        });
    }
    result.ok_or_else(|| invalid("empty expression".to_string()))
}

fn placeholder(map: &Map<String, Value>) -> Option<&str> {
    if map.len() != 1 {
        return None;
    }
    map.get(EVAL_KEY)?.as_str()
}

fn split_terms(expression: &str) -> Result<Vec<&str>, String> {
    let mut terms = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    for (index, ch) in expression.char_indices() {
        match ch {
            '\'' => quoted = !quoted,
            '+' if !quoted => {
                terms.push(&expression[start..index]);
                start = index + 1;
            }
            _ => {}
        }
    }
    if quoted {
        return Err("unterminated string literal".to_string());
    }
    terms.push(&expression[start..]);
    if terms.iter().any(|term| term.trim().is_empty()) {
        return Err("empty operand".to_string());
    }
    Ok(terms)
}

fn term_value(term: &str, context: &Value) -> Result<Value, String> {
    if let Some(literal) = term.strip_prefix('\'') {
        return literal
            .strip_suffix('\'')
            .map(|text| Value::String(text.to_string()))
            .ok_or_else(|| format!("malformed string literal {term}"));
    }
    if let Ok(number) = term.parse::<i64>() {
        return Ok(Value::from(number));
    }
    lookup(term, context)
}

fn lookup(path: &str, context: &Value) -> Result<Value, String> {
    let mut current = context;
    for segment in path.split('.') {
        let (name, mut indices) = match segment.find('[') {
            Some(at) => (&segment[..at], &segment[at..]),
            None => (segment, ""),
        };
        if name.is_empty() || !name.chars().all(is_identifier_char) {
            return Err(format!("invalid path segment `{segment}`"));
        }
        current = match current.get(name) {
            Some(value) => value,
            None => return Ok(Value::Null),
        };

        while !indices.is_empty() {
            let close = indices
                .find(']')
                .ok_or_else(|| format!("unclosed index in `{segment}`"))?;
            let index: usize = indices[1..close]
                .trim()
                .parse()
                .map_err(|_| format!("invalid index in `{segment}`"))?;
            current = match current.get(index) {
                Some(value) => value,
                None => return Ok(Value::Null),
            };
            indices = &indices[close + 1..];
            if !indices.is_empty() && !indices.starts_with('[') {
                return Err(format!("unexpected text after index in `{segment}`"));
            }
        }
    }
    Ok(current.clone())
}

fn is_identifier_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '$')
}

fn concat(left: Value, right: Value) -> Value {
    match (left, right) {
        (Value::Array(mut items), Value::Array(more)) => {
            items.extend(more);
            Value::Array(items)
        }
        (Value::Array(mut items), other) => {
            items.push(other);
            Value::Array(items)
        }
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => Value::from(a.saturating_add(b)),
            _ => Value::from(a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0)),
        },
        (left, right) => Value::String(format!("{}{}", as_text(&left), as_text(&right))),
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
