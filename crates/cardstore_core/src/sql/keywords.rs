//! Closed set of schema keywords understood by the compiler.
//!
//! Parsing a schema object yields one `Keyword` per recognised key with its
//! argument already type-checked, so handlers never see malformed input.

use super::expression::JsonType;
use super::{CompileError, CompileResult};
use regex::Regex;
use serde_json::{Map, Value};

/// Key under which linked sub-schemas are declared.
pub const LINKS_KEYWORD: &str = "$$links";

/// `items` takes either one schema for every element or a positional list.
#[derive(Debug, Clone, Copy)]
pub enum Items<'s> {
    Single(&'s Value),
    Tuple(&'s [Value]),
}

/// Draft-4 boolean form or draft-6+ numeric form.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Exclusive {
    Flag(bool),
    Bound(f64),
}

#[derive(Debug, Clone)]
pub enum Keyword<'s> {
    Type(Vec<JsonType>),
    Const(&'s Value),
    Enum(&'s [Value]),
    /// Regular expression source, flags already folded in.
    Pattern(String),
    Required(Vec<&'s str>),
    Properties(&'s Map<String, Value>),
    PatternProperties(&'s Map<String, Value>),
    AdditionalProperties(&'s Value),
    Items(Items<'s>),
    AdditionalItems(&'s Value),
    Contains(&'s Value),
    AllOf(&'s [Value]),
    AnyOf(&'s [Value]),
    OneOf(&'s [Value]),
    Not(&'s Value),
    Minimum(f64),
    Maximum(f64),
    ExclusiveMinimum(Exclusive),
    ExclusiveMaximum(Exclusive),
    MultipleOf(f64),
    MinLength(u64),
    MaxLength(u64),
    MinItems(u64),
    MaxItems(u64),
    MinProperties(u64),
    MaxProperties(u64),
    Format(&'s str),
    FormatMinimum(&'s str),
    FormatMaximum(&'s str),
    FormatExclusiveMinimum(&'s str),
    FormatExclusiveMaximum(&'s str),
    Links(&'s Map<String, Value>),
    /// Keys that never constrain a value (`title`, `$id`, ...).
    Annotation,
    Unknown(&'s str),
}

const ANNOTATIONS: &[&str] = &[
    "$id",
    "$schema",
    "$comment",
    "title",
    "description",
    "default",
    "examples",
    "readOnly",
    "writeOnly",
    "definitions",
    "$defs",
];

impl<'s> Keyword<'s> {
    /// Parses every key of a schema object, in key order.
    pub fn parse_all(schema: &'s Map<String, Value>) -> CompileResult<Vec<Keyword<'s>>> {
        schema
            .iter()
            .map(|(key, value)| Keyword::parse(key, value))
            .collect()
    }

    pub fn parse(key: &'s str, value: &'s Value) -> CompileResult<Keyword<'s>> {
        let keyword = match key {
            "type" => Keyword::Type(parse_types(value)?),
            "const" => Keyword::Const(value),
            "enum" => Keyword::Enum(array(value, "enum")?),
            "pattern" => Keyword::Pattern(checked_regex(string(value, "pattern")?, "pattern")?),
            "regexp" => Keyword::Pattern(parse_regexp(value)?),
            "required" => Keyword::Required(
                array(value, "required")?
                    .iter()
                    .map(|name| {
                        name.as_str()
                            .ok_or_else(|| CompileError::keyword("required", "names must be strings"))
                    })
                    .collect::<CompileResult<_>>()?,
            ),
            "properties" => Keyword::Properties(object(value, "properties")?),
            "patternProperties" => {
                let patterns = object(value, "patternProperties")?;
                for pattern in patterns.keys() {
                    checked_regex(pattern, "patternProperties")?;
                }
                Keyword::PatternProperties(patterns)
            }
            "additionalProperties" => Keyword::AdditionalProperties(subschema(value, "additionalProperties")?),
            "items" => match value {
                Value::Array(list) => Keyword::Items(Items::Tuple(list)),
                other => Keyword::Items(Items::Single(subschema(other, "items")?)),
            },
            "additionalItems" => Keyword::AdditionalItems(subschema(value, "additionalItems")?),
            "contains" => Keyword::Contains(subschema(value, "contains")?),
            "allOf" => Keyword::AllOf(array(value, "allOf")?),
            "anyOf" => Keyword::AnyOf(array(value, "anyOf")?),
            "oneOf" => Keyword::OneOf(array(value, "oneOf")?),
            "not" => Keyword::Not(subschema(value, "not")?),
            "minimum" => Keyword::Minimum(number(value, "minimum")?),
            "maximum" => Keyword::Maximum(number(value, "maximum")?),
            "exclusiveMinimum" => Keyword::ExclusiveMinimum(exclusive(value, "exclusiveMinimum")?),
            "exclusiveMaximum" => Keyword::ExclusiveMaximum(exclusive(value, "exclusiveMaximum")?),
            "multipleOf" => {
                let factor = number(value, "multipleOf")?;
                if factor <= 0.0 {
                    return Err(CompileError::keyword("multipleOf", "must be positive"));
                }
                Keyword::MultipleOf(factor)
            }
            "minLength" => Keyword::MinLength(count(value, "minLength")?),
            "maxLength" => Keyword::MaxLength(count(value, "maxLength")?),
            "minItems" => Keyword::MinItems(count(value, "minItems")?),
            "maxItems" => Keyword::MaxItems(count(value, "maxItems")?),
            "minProperties" => Keyword::MinProperties(count(value, "minProperties")?),
            "maxProperties" => Keyword::MaxProperties(count(value, "maxProperties")?),
            "format" => Keyword::Format(string(value, "format")?),
            "formatMinimum" => Keyword::FormatMinimum(string(value, "formatMinimum")?),
            "formatMaximum" => Keyword::FormatMaximum(string(value, "formatMaximum")?),
            "formatExclusiveMinimum" => {
                Keyword::FormatExclusiveMinimum(string(value, "formatExclusiveMinimum")?)
            }
            "formatExclusiveMaximum" => {
                Keyword::FormatExclusiveMaximum(string(value, "formatExclusiveMaximum")?)
            }
            LINKS_KEYWORD => Keyword::Links(object(value, "$$links")?),
            other if ANNOTATIONS.contains(&other) => Keyword::Annotation,
            other => Keyword::Unknown(other),
        };
        Ok(keyword)
    }
}

/// Types named by a `type` keyword, if it is well-formed.
pub fn declared_types(schema: &Map<String, Value>) -> Option<Vec<JsonType>> {
    schema.get("type").and_then(|value| parse_types(value).ok())
}

fn parse_types(value: &Value) -> CompileResult<Vec<JsonType>> {
    let names: Vec<&str> = match value {
        Value::String(name) => vec![name.as_str()],
        Value::Array(list) => list
            .iter()
            .map(|item| {
                item.as_str()
                    .ok_or_else(|| CompileError::keyword("type", "type names must be strings"))
            })
            .collect::<CompileResult<_>>()?,
        _ => return Err(CompileError::keyword("type", "expected a string or an array")),
    };
    names
        .into_iter()
        .map(|name| {
            JsonType::parse(name)
                .ok_or_else(|| CompileError::keyword("type", format!("unknown type `{name}`")))
        })
        .collect()
}

/// Accepts `"/source/flags"`, a bare source, or `{pattern, flags}`.
fn parse_regexp(value: &Value) -> CompileResult<String> {
    let (source, flags) = match value {
        Value::String(text) => match text.strip_prefix('/').and_then(|rest| rest.rsplit_once('/')) {
            Some((source, flags)) => (source.to_string(), flags.to_string()),
            None => (text.clone(), String::new()),
        },
        Value::Object(map) => (
            string(map.get("pattern").unwrap_or(&Value::Null), "regexp")?.to_string(),
            map.get("flags")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        ),
        _ => return Err(CompileError::keyword("regexp", "expected a string or an object")),
    };

    let inline: String = flags.chars().filter(|flag| matches!(flag, 'i' | 'm' | 's')).collect();
    let source = if inline.is_empty() {
        source
    } else {
        format!("(?{inline}){source}")
    };
    checked_regex(&source, "regexp")
}

fn checked_regex(source: &str, keyword: &'static str) -> CompileResult<String> {
    Regex::new(source)
        .map(|_| source.to_string())
        .map_err(|err| CompileError::keyword(keyword, err.to_string()))
}

fn array<'s>(value: &'s Value, keyword: &'static str) -> CompileResult<&'s [Value]> {
    value
        .as_array()
        .map(Vec::as_slice)
        .ok_or_else(|| CompileError::keyword(keyword, "expected an array"))
}

fn object<'s>(value: &'s Value, keyword: &'static str) -> CompileResult<&'s Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| CompileError::keyword(keyword, "expected an object"))
}

fn string<'s>(value: &'s Value, keyword: &'static str) -> CompileResult<&'s str> {
    value
        .as_str()
        .ok_or_else(|| CompileError::keyword(keyword, "expected a string"))
}

fn number(value: &Value, keyword: &'static str) -> CompileResult<f64> {
    value
        .as_f64()
        .ok_or_else(|| CompileError::keyword(keyword, "expected a number"))
}

fn count(value: &Value, keyword: &'static str) -> CompileResult<u64> {
    value
        .as_u64()
        .ok_or_else(|| CompileError::keyword(keyword, "expected a non-negative integer"))
}

fn exclusive(value: &Value, keyword: &'static str) -> CompileResult<Exclusive> {
    match value {
        Value::Bool(flag) => Ok(Exclusive::Flag(*flag)),
        other => number(other, keyword).map(Exclusive::Bound),
    }
}

fn subschema<'s>(value: &'s Value, keyword: &'static str) -> CompileResult<&'s Value> {
    match value {
        Value::Bool(_) | Value::Object(_) => Ok(value),
        _ => Err(CompileError::keyword(keyword, "expected a schema")),
    }
}
