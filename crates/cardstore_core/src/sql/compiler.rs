//! Recursive schema walk producing a single row predicate.
//!
//! # Responsibility
//! - Dispatch every schema keyword to its handler and AND the results.
//! - Record which top-level card fields the schema references so the graph
//!   generator can project only those columns.
//!
//! # Invariants
//! - A row satisfies the compiled predicate iff its card document validates
//!   against the schema, for every keyword this module compiles.
//! - Unknown keywords and annotations compile to `true`.

use super::expression::{
    exists, is_not_of_type, is_of_type, not_exists, Filter, JsonType, PropertyPath, SqlFragment,
    ValueRef,
};
use super::keywords::{declared_types, Exclusive, Items, Keyword};
use super::{CompileError, CompileResult};
use crate::model::card::{card_column, ColumnKind, CARD_COLUMNS};
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Knobs that change how some keywords compile.
#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    /// Row-relative key paths (e.g. `["data", "body"]`) backed by the
    /// full-text index; `contains: {const: <text>}` on them becomes a
    /// full-text match.
    pub full_text_paths: BTreeSet<Vec<String>>,
}

impl CompileOptions {
    pub fn with_full_text_path(mut self, path: &[&str]) -> Self {
        self.full_text_paths
            .insert(path.iter().map(|key| key.to_string()).collect());
        self
    }
}

/// Row predicate plus the top-level columns it touched.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledFilter {
    pub filter: Filter,
    pub keys: BTreeSet<String>,
}

/// Compiles `schema` into a predicate over the `cards` row aliased `table`.
pub fn compile_filter(
    schema: &Value,
    table: &str,
    options: &CompileOptions,
) -> CompileResult<CompiledFilter> {
    let mut walker = Walker {
        options,
        keys: BTreeSet::new(),
        next_alias: 0,
        table: table.to_string(),
    };
    let filter = walker.walk(schema, &PropertyPath::row(table))?;
    Ok(CompiledFilter {
        filter,
        keys: walker.keys,
    })
}

struct Walker<'o> {
    options: &'o CompileOptions,
    keys: BTreeSet<String>,
    next_alias: usize,
    table: String,
}

impl Walker<'_> {
    fn walk(&mut self, schema: &Value, path: &PropertyPath) -> CompileResult<Filter> {
        let map = match schema {
            Value::Bool(value) => return Ok(Filter::Const(*value)),
            Value::Object(map) => map,
            other => return Err(CompileError::InvalidSchema(other.to_string())),
        };

        let mut filters = Vec::new();
        for keyword in Keyword::parse_all(map)? {
            let filter = self.keyword(keyword, map, path)?;
            if filter.is_const(false) {
                return Ok(Filter::FALSE);
            }
            filters.push(filter);
        }
        Ok(Filter::and(filters))
    }

    fn keyword(
        &mut self,
        keyword: Keyword<'_>,
        schema: &Map<String, Value>,
        path: &PropertyPath,
    ) -> CompileResult<Filter> {
        match keyword {
            Keyword::Type(types) => {
                // `const` fixes the type already.
                if schema.contains_key("const") {
                    return Ok(Filter::TRUE);
                }
                let target = self.resolve(path);
                Ok(Filter::or(types.into_iter().map(|json_type| is_of_type(&target, json_type))))
            }
            Keyword::Const(value) => Ok(self.const_filter(path, value)),
            Keyword::Enum(values) => Ok(self.enum_filter(path, values)),
            Keyword::Pattern(source) => Ok(self.pattern(path, schema, &source)),
            Keyword::Required(names) => Ok(self.required(path, schema, &names)),
            Keyword::Properties(properties) => self.properties(path, schema, properties),
            Keyword::PatternProperties(patterns) => self.pattern_properties(path, patterns),
            Keyword::AdditionalProperties(additional) => {
                self.additional_properties(path, schema, additional)
            }
            Keyword::Items(items) => self.items(path, items),
            Keyword::AdditionalItems(additional) => self.additional_items(path, schema, additional),
            Keyword::Contains(subschema) => self.contains(path, subschema),
            Keyword::AllOf(branches) => {
                let filters = branches
                    .iter()
                    .map(|branch| self.walk(branch, path))
                    .collect::<CompileResult<Vec<_>>>()?;
                Ok(Filter::and(filters))
            }
            Keyword::AnyOf(branches) => {
                let filters = branches
                    .iter()
                    .map(|branch| self.walk(branch, path))
                    .collect::<CompileResult<Vec<_>>>()?;
                Ok(Filter::or(filters))
            }
            Keyword::OneOf(branches) => {
                let filters = branches
                    .iter()
                    .map(|branch| self.walk(branch, path))
                    .collect::<CompileResult<Vec<_>>>()?;
                Ok(exactly_one(&filters))
            }
            Keyword::Not(subschema) => Ok(!self.walk(subschema, path)?),
            Keyword::Minimum(bound) => {
                let op = if schema.get("exclusiveMinimum") == Some(&Value::Bool(true)) {
                    ">"
                } else {
                    ">="
                };
                Ok(self.numeric_bound(path, op, bound))
            }
            Keyword::Maximum(bound) => {
                let op = if schema.get("exclusiveMaximum") == Some(&Value::Bool(true)) {
                    "<"
                } else {
                    "<="
                };
                Ok(self.numeric_bound(path, op, bound))
            }
            Keyword::ExclusiveMinimum(Exclusive::Bound(bound)) => Ok(self.numeric_bound(path, ">", bound)),
            Keyword::ExclusiveMaximum(Exclusive::Bound(bound)) => Ok(self.numeric_bound(path, "<", bound)),
            Keyword::ExclusiveMinimum(Exclusive::Flag(_))
            | Keyword::ExclusiveMaximum(Exclusive::Flag(_)) => Ok(Filter::TRUE),
            Keyword::MultipleOf(factor) => Ok(self.multiple_of(path, factor)),
            Keyword::MinLength(limit) => Ok(self.string_length(path, ">=", limit)),
            Keyword::MaxLength(limit) => Ok(self.string_length(path, "<=", limit)),
            Keyword::MinItems(limit) => Ok(self.array_length(path, ">=", limit)),
            Keyword::MaxItems(limit) => Ok(self.array_length(path, "<=", limit)),
            Keyword::MinProperties(limit) => Ok(self.property_count(path, ">=", limit)),
            Keyword::MaxProperties(limit) => Ok(self.property_count(path, "<=", limit)),
            Keyword::Format(format) => Ok(self.format(path, format)),
            Keyword::FormatMinimum(bound) => Ok(self.format_bound(path, schema, ">=", bound)),
            Keyword::FormatMaximum(bound) => Ok(self.format_bound(path, schema, "<=", bound)),
            Keyword::FormatExclusiveMinimum(bound) => Ok(self.format_bound(path, schema, ">", bound)),
            Keyword::FormatExclusiveMaximum(bound) => Ok(self.format_bound(path, schema, "<", bound)),
            // Traversal is planned by the graph generator.
            Keyword::Links(_) => Ok(Filter::TRUE),
            Keyword::Annotation => Ok(Filter::TRUE),
            Keyword::Unknown(name) => {
                log::debug!("event=schema_compile module=sql status=ignored keyword={name}");
                Ok(Filter::TRUE)
            }
        }
    }

    fn resolve(&mut self, path: &PropertyPath) -> ValueRef {
        let target = path.resolve();
        if let Some(key) = path.top_level_key() {
            if card_column(key).is_some() {
                self.keys.insert(key.to_string());
            }
        }
        target
    }

    fn alias(&mut self, prefix: &str) -> String {
        let alias = format!("{prefix}_{}", self.next_alias);
        self.next_alias += 1;
        alias
    }

    fn const_filter(&mut self, path: &PropertyPath, value: &Value) -> Filter {
        let target = self.resolve(path);
        match &target {
            ValueRef::Missing => Filter::FALSE,
            ValueRef::Row { .. } => match value {
                Value::Object(members) => {
                    let mut filters = Vec::new();
                    for (key, expected) in members {
                        filters.push(self.const_filter(&path.child(key), expected));
                    }
                    // Every stored row has the same key set; a partial
                    // object can only match if it lists all of them.
                    let present = CARD_COLUMNS
                        .iter()
                        .filter(|column| column.required)
                        .all(|column| members.contains_key(column.name));
                    if !present {
                        return Filter::FALSE;
                    }
                    if !members.contains_key("name") {
                        filters.push(not_exists(&self.resolve(&path.child("name"))));
                    }
                    Filter::and(filters)
                }
                _ => Filter::FALSE,
            },
            ValueRef::Column { expr, column } => column_equals(expr, column.kind, column.required, value),
            ValueRef::Json { doc, path: json_path } => {
                let type_expr = SqlFragment::call("json_type", &[doc, json_path]);
                let extracted = SqlFragment::call("json_extract", &[doc, json_path]);
                match value {
                    Value::Null => type_equals(&type_expr, "'null'"),
                    Value::Bool(true) => type_equals(&type_expr, "'true'"),
                    Value::Bool(false) => type_equals(&type_expr, "'false'"),
                    Value::Number(number) => {
                        let mut equals = extracted;
                        equals.push_sql(" = ").push(&SqlFragment::number(number));
                        Filter::and([is_of_type(&target, JsonType::Number), Filter::Sql(equals)])
                    }
                    Value::String(text) => {
                        let mut equals = extracted;
                        equals.push_sql(" = ").push(&SqlFragment::text(text));
                        Filter::and([type_equals(&type_expr, "'text'"), Filter::Sql(equals)])
                    }
                    Value::Array(items) => {
                        let mut length = SqlFragment::call("json_array_length", &[doc, json_path]);
                        length.push_sql(" = ").push(&SqlFragment::count(items.len()));
                        let mut filters = vec![type_equals(&type_expr, "'array'"), Filter::Sql(length)];
                        for (index, item) in items.iter().enumerate() {
                            filters.push(self.const_filter(&path.index(index), item));
                        }
                        Filter::and(filters)
                    }
                    Value::Object(members) => {
                        let mut count = SqlFragment::raw("(SELECT count(*) FROM ");
                        count
                            .push(&SqlFragment::call("json_each", &[doc, json_path]))
                            .push_sql(") = ")
                            .push(&SqlFragment::count(members.len()));
                        let mut filters = vec![type_equals(&type_expr, "'object'"), Filter::Sql(count)];
                        for (key, expected) in members {
                            filters.push(self.const_filter(&path.child(key), expected));
                        }
                        Filter::and(filters)
                    }
                }
            }
        }
    }

    fn enum_filter(&mut self, path: &PropertyPath, values: &[Value]) -> Filter {
        let target = self.resolve(path);
        let strings: Option<Vec<&str>> = values.iter().map(Value::as_str).collect();

        let matched = match (&target, strings) {
            (ValueRef::Column { expr, column }, Some(strings))
                if column.kind == ColumnKind::Text && !strings.is_empty() =>
            {
                let mut out = expr.clone();
                out.push_sql(" IN (").push(&text_list(&strings)).push_sql(")");
                Filter::Sql(out)
            }
            (ValueRef::Json { .. }, Some(strings)) if !strings.is_empty() => {
                let Some(mut out) = target.value_expr() else {
                    return Filter::FALSE;
                };
                out.push_sql(" IN (").push(&text_list(&strings)).push_sql(")");
                Filter::and([is_of_type(&target, JsonType::String), Filter::Sql(out)])
            }
            _ => {
                let mut filters = Vec::new();
                for value in values {
                    filters.push(self.const_filter(path, value));
                }
                Filter::or(filters)
            }
        };

        // An empty array among the allowed values also admits an absent one.
        if values.iter().any(|value| value.as_array().is_some_and(Vec::is_empty)) {
            Filter::or([not_exists(&target), matched])
        } else {
            matched
        }
    }

    fn pattern(&mut self, path: &PropertyPath, schema: &Map<String, Value>, source: &str) -> Filter {
        let target = self.resolve(path);
        match &target {
            ValueRef::Row { .. } | ValueRef::Missing => Filter::TRUE,
            ValueRef::Column { expr, column } => match column.kind {
                ColumnKind::Text => Filter::Sql(regexp(source, expr)),
                _ => Filter::TRUE,
            },
            ValueRef::Json { .. } => {
                let Some(value) = target.value_expr() else {
                    return Filter::TRUE;
                };
                let matched = Filter::Sql(regexp(source, &value));
                let declared_string = declared_types(schema)
                    .is_some_and(|types| types == [JsonType::String]);
                if declared_string {
                    Filter::and([is_of_type(&target, JsonType::String), matched])
                } else {
                    Filter::or([is_not_of_type(&target, JsonType::String), matched])
                }
            }
        }
    }

    fn required(&mut self, path: &PropertyPath, schema: &Map<String, Value>, names: &[&str]) -> Filter {
        let declared = schema.get("properties").and_then(Value::as_object);
        let mut filters = Vec::new();
        for name in names {
            // Declared properties enforce presence in `properties`.
            if declared.is_some_and(|properties| properties.contains_key(*name)) {
                continue;
            }
            filters.push(exists(&self.resolve(&path.child(name))));
        }
        if filters.is_empty() {
            return Filter::TRUE;
        }
        let target = self.resolve(path);
        filters.insert(0, is_of_type(&target, JsonType::Object));
        Filter::and(filters)
    }

    fn properties(
        &mut self,
        path: &PropertyPath,
        schema: &Map<String, Value>,
        properties: &Map<String, Value>,
    ) -> CompileResult<Filter> {
        let required: BTreeSet<&str> = schema
            .get("required")
            .and_then(Value::as_array)
            .map(|names| names.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let mut filters = Vec::new();
        for (key, subschema) in properties {
            let child = path.child(key);
            let target = self.resolve(&child);
            let inner = self.walk(subschema, &child)?;
            let filter = if required.contains(key.as_str()) {
                Filter::and([exists(&target), inner])
            } else {
                Filter::or([not_exists(&target), inner])
            };
            if filter.is_const(false) {
                return Ok(Filter::FALSE);
            }
            filters.push(filter);
        }
        Ok(Filter::and(filters))
    }

    fn pattern_properties(
        &mut self,
        path: &PropertyPath,
        patterns: &Map<String, Value>,
    ) -> CompileResult<Filter> {
        let target = self.resolve(path);
        match &target {
            ValueRef::Row { .. } => {
                let mut filters = Vec::new();
                for (source, subschema) in patterns {
                    let regex = Regex::new(source)
                        .map_err(|err| CompileError::keyword("patternProperties", err.to_string()))?;
                    for column in CARD_COLUMNS.iter().filter(|c| regex.is_match(c.name)) {
                        let child = path.child(column.name);
                        let member = self.resolve(&child);
                        let inner = self.walk(subschema, &child)?;
                        filters.push(Filter::or([not_exists(&member), inner]));
                    }
                }
                Ok(Filter::and(filters))
            }
            ValueRef::Json { doc, path: json_path } => {
                let cursor = self.alias("member");
                let member = PropertyPath::element(doc.clone(), &cursor);
                let key = SqlFragment::raw(format!("{cursor}.key"));
                let mut checks = Vec::new();
                for (source, subschema) in patterns {
                    let inner = self.walk(subschema, &member)?;
                    let applies = Filter::Sql(regexp(source, &key));
                    checks.push(Filter::or([!applies, inner]));
                }
                let violation = !Filter::and(checks);
                Ok(Filter::or([
                    is_not_of_type(&target, JsonType::Object),
                    no_element(doc, json_path, &cursor, violation),
                ]))
            }
            ValueRef::Column { .. } | ValueRef::Missing => Ok(Filter::TRUE),
        }
    }

    fn additional_properties(
        &mut self,
        path: &PropertyPath,
        schema: &Map<String, Value>,
        additional: &Value,
    ) -> CompileResult<Filter> {
        if additional == &Value::Bool(true) {
            return Ok(Filter::TRUE);
        }

        let declared: Vec<&str> = schema
            .get("properties")
            .and_then(Value::as_object)
            .map(|properties| properties.keys().map(String::as_str).collect())
            .unwrap_or_default();
        let patterns: Vec<&str> = schema
            .get("patternProperties")
            .and_then(Value::as_object)
            .map(|patterns| patterns.keys().map(String::as_str).collect())
            .unwrap_or_default();

        let target = self.resolve(path);
        match &target {
            ValueRef::Row { .. } => {
                // Row keys are fixed; `false` rejects nothing that can be stored.
                if additional == &Value::Bool(false) {
                    return Ok(Filter::TRUE);
                }
                let compiled: Vec<Regex> = patterns
                    .iter()
                    .map(|source| Regex::new(source))
                    .collect::<Result<_, _>>()
                    .map_err(|err| CompileError::keyword("patternProperties", err.to_string()))?;
                let mut filters = Vec::new();
                for column in CARD_COLUMNS {
                    if declared.contains(&column.name) || compiled.iter().any(|r| r.is_match(column.name)) {
                        continue;
                    }
                    let child = path.child(column.name);
                    let member = self.resolve(&child);
                    let inner = self.walk(additional, &child)?;
                    filters.push(Filter::or([not_exists(&member), inner]));
                }
                Ok(Filter::and(filters))
            }
            ValueRef::Json { doc, path: json_path } => {
                let cursor = self.alias("member");
                let member = PropertyPath::element(doc.clone(), &cursor);
                let key = SqlFragment::raw(format!("{cursor}.key"));

                let mut conditions = Vec::new();
                if !declared.is_empty() {
                    let mut not_declared = key.clone();
                    not_declared
                        .push_sql(" NOT IN (")
                        .push(&text_list(&declared))
                        .push_sql(")");
                    conditions.push(Filter::Sql(not_declared));
                }
                for source in &patterns {
                    conditions.push(!Filter::Sql(regexp(source, &key)));
                }
                conditions.push(!self.walk(additional, &member)?);

                Ok(Filter::or([
                    is_not_of_type(&target, JsonType::Object),
                    no_element(doc, json_path, &cursor, Filter::and(conditions)),
                ]))
            }
            ValueRef::Column { .. } | ValueRef::Missing => Ok(Filter::TRUE),
        }
    }

    fn items(&mut self, path: &PropertyPath, items: Items<'_>) -> CompileResult<Filter> {
        let target = self.resolve(path);
        let ValueRef::Json { doc, path: json_path } = &target else {
            return Ok(Filter::TRUE);
        };
        match items {
            Items::Single(subschema) => {
                let cursor = self.alias("item");
                let element = PropertyPath::element(doc.clone(), &cursor);
                let inner = self.walk(subschema, &element)?;
                if inner.is_const(true) {
                    return Ok(Filter::TRUE);
                }
                Ok(Filter::or([
                    is_not_of_type(&target, JsonType::Array),
                    no_element(doc, json_path, &cursor, !inner),
                ]))
            }
            Items::Tuple(list) => {
                let length = SqlFragment::call("json_array_length", &[doc, json_path]);
                // A `false` position caps the length at that index.
                let cutoff = list.iter().position(|entry| entry == &Value::Bool(false));
                let checked = cutoff.unwrap_or(list.len());

                let mut filters = Vec::new();
                if let Some(cutoff) = cutoff {
                    let mut capped = length.clone();
                    capped.push_sql(" <= ").push(&SqlFragment::count(cutoff));
                    filters.push(Filter::Sql(capped));
                }
                for (index, subschema) in list.iter().enumerate().take(checked) {
                    let inner = self.walk(subschema, &path.index(index))?;
                    let mut shorter = length.clone();
                    shorter.push_sql(" <= ").push(&SqlFragment::count(index));
                    filters.push(Filter::or([Filter::Sql(shorter), inner]));
                }
                Ok(Filter::or([
                    is_not_of_type(&target, JsonType::Array),
                    Filter::and(filters),
                ]))
            }
        }
    }

    fn additional_items(
        &mut self,
        path: &PropertyPath,
        schema: &Map<String, Value>,
        additional: &Value,
    ) -> CompileResult<Filter> {
        // Only positional `items` leaves room for additional elements.
        let Some(Value::Array(list)) = schema.get("items") else {
            return Ok(Filter::TRUE);
        };
        let target = self.resolve(path);
        let ValueRef::Json { doc, path: json_path } = &target else {
            return Ok(Filter::TRUE);
        };

        let cursor = self.alias("item");
        let element = PropertyPath::element(doc.clone(), &cursor);
        let inner = self.walk(additional, &element)?;
        if inner.is_const(true) {
            return Ok(Filter::TRUE);
        }
        let mut beyond = SqlFragment::raw(format!("{cursor}.key >= "));
        beyond.push(&SqlFragment::count(list.len()));
        Ok(Filter::or([
            is_not_of_type(&target, JsonType::Array),
            no_element(doc, json_path, &cursor, Filter::and([Filter::Sql(beyond), !inner])),
        ]))
    }

    fn contains(&mut self, path: &PropertyPath, subschema: &Value) -> CompileResult<Filter> {
        if let Some(filter) = self.full_text_contains(path, subschema) {
            return Ok(filter);
        }

        let target = self.resolve(path);
        let ValueRef::Json { doc, path: json_path } = &target else {
            return Ok(Filter::TRUE);
        };
        let cursor = self.alias("item");
        let element = PropertyPath::element(doc.clone(), &cursor);
        let inner = self.walk(subschema, &element)?;

        let mut found = SqlFragment::raw("EXISTS (SELECT 1 FROM ");
        found
            .push(&SqlFragment::call("json_each", &[doc, json_path]))
            .push_sql(&format!(" AS {cursor} WHERE "))
            .push(&inner.to_fragment())
            .push_sql(")");
        Ok(Filter::or([
            is_not_of_type(&target, JsonType::Array),
            Filter::Sql(found),
        ]))
    }

    fn full_text_contains(&mut self, path: &PropertyPath, subschema: &Value) -> Option<Filter> {
        let keys = path.row_keys()?;
        if !self.options.full_text_paths.contains(&keys) {
            return None;
        }
        let term = subschema.as_object()?.get("const")?.as_str()?;
        if subschema.as_object().is_some_and(|map| map.len() != 1) {
            return None;
        }
        self.resolve(path);

        let table = path.table().unwrap_or(&self.table);
        let mut sql = SqlFragment::raw(format!(
            "EXISTS (SELECT 1 FROM cards_fts WHERE cards_fts.card_id = {table}.id AND cards_fts.path = "
        ));
        sql.push(&SqlFragment::text(keys.join(".")))
            .push_sql(" AND cards_fts MATCH ")
            .push(&SqlFragment::text(full_text_term(term)))
            .push_sql(")");
        Some(Filter::Sql(sql))
    }

    fn numeric_bound(&mut self, path: &PropertyPath, op: &str, bound: f64) -> Filter {
        let target = self.resolve(path);
        let ValueRef::Json { .. } = target else {
            return Filter::TRUE;
        };
        let Some(mut value) = target.value_expr() else {
            return Filter::TRUE;
        };
        value.push_sql(&format!(" {op} ")).push(&SqlFragment::real(bound));
        Filter::or([is_not_of_type(&target, JsonType::Number), Filter::Sql(value)])
    }

    fn multiple_of(&mut self, path: &PropertyPath, factor: f64) -> Filter {
        let target = self.resolve(path);
        let ValueRef::Json { .. } = target else {
            return Filter::TRUE;
        };
        let Some(value) = target.value_expr() else {
            return Filter::TRUE;
        };
        let mut quotient = SqlFragment::raw("(CAST(");
        quotient
            .push(&value)
            .push_sql(" AS REAL) / ")
            .push(&SqlFragment::real(factor))
            .push_sql(")");
        let mut check = SqlFragment::raw("abs(");
        check
            .push(&quotient)
            .push_sql(" - round(")
            .push(&quotient)
            .push_sql(")) < 1e-9");
        Filter::or([is_not_of_type(&target, JsonType::Number), Filter::Sql(check)])
    }

    fn string_length(&mut self, path: &PropertyPath, op: &str, limit: u64) -> Filter {
        let target = self.resolve(path);
        let limit = SqlFragment::count(limit);
        match &target {
            ValueRef::Column { expr, column } if column.kind == ColumnKind::Text => {
                let mut check = SqlFragment::call("length", &[expr]);
                check.push_sql(&format!(" {op} ")).push(&limit);
                Filter::Sql(check)
            }
            ValueRef::Json { .. } => {
                let Some(value) = target.value_expr() else {
                    return Filter::TRUE;
                };
                let mut check = SqlFragment::call("length", &[&value]);
                check.push_sql(&format!(" {op} ")).push(&limit);
                Filter::or([is_not_of_type(&target, JsonType::String), Filter::Sql(check)])
            }
            _ => Filter::TRUE,
        }
    }

    fn array_length(&mut self, path: &PropertyPath, op: &str, limit: u64) -> Filter {
        let target = self.resolve(path);
        let ValueRef::Json { doc, path: json_path } = &target else {
            return Filter::TRUE;
        };
        let mut check = SqlFragment::call("json_array_length", &[doc, json_path]);
        check
            .push_sql(&format!(" {op} "))
            .push(&SqlFragment::count(limit));
        Filter::or([is_not_of_type(&target, JsonType::Array), Filter::Sql(check)])
    }

    fn property_count(&mut self, path: &PropertyPath, op: &str, limit: u64) -> Filter {
        let target = self.resolve(path);
        match &target {
            ValueRef::Row { .. } => {
                // Only `name` is optional, so a row has either n or n + 1 keys.
                let fixed = CARD_COLUMNS.iter().filter(|c| c.required).count() as u64;
                let name = self.resolve(&path.child("name"));
                let (with_name, without_name) = (fixed + 1, fixed);
                let holds = |count: u64| match op {
                    ">=" => count >= limit,
                    _ => count <= limit,
                };
                match (holds(with_name), holds(without_name)) {
                    (true, true) => Filter::TRUE,
                    (false, false) => Filter::FALSE,
                    (true, false) => exists(&name),
                    (false, true) => not_exists(&name),
                }
            }
            ValueRef::Json { doc, path: json_path } => {
                let mut check = SqlFragment::raw("(SELECT count(*) FROM ");
                check
                    .push(&SqlFragment::call("json_each", &[doc, json_path]))
                    .push_sql(&format!(") {op} "))
                    .push(&SqlFragment::count(limit));
                Filter::or([is_not_of_type(&target, JsonType::Object), Filter::Sql(check)])
            }
            ValueRef::Column { .. } | ValueRef::Missing => Filter::TRUE,
        }
    }

    fn format(&mut self, path: &PropertyPath, format: &str) -> Filter {
        if !matches!(format, "date" | "date-time") {
            log::debug!("event=schema_compile module=sql status=ignored format={format}");
            return Filter::TRUE;
        }
        let target = self.resolve(path);
        let Some(value) = string_value(&target) else {
            return Filter::TRUE;
        };
        let shape = if format == "date" { DATE_SHAPE } else { DATE_TIME_SHAPE };
        // SQLite normalises impossible days such as 02-30, so a real day
        // survives a round trip through `date`.
        let day = SqlFragment::call("substr", &[&value, &SqlFragment::integer(1), &SqlFragment::integer(10)]);
        let mut calendar = SqlFragment::call("date", &[&day]);
        calendar.push_sql(" = ").push(&day);
        guard_string(
            &target,
            Filter::and([Filter::Sql(regexp(shape, &value)), Filter::Sql(calendar)]),
        )
    }

    fn format_bound(
        &mut self,
        path: &PropertyPath,
        schema: &Map<String, Value>,
        op: &str,
        bound: &str,
    ) -> Filter {
        let target = self.resolve(path);
        let Some(value) = string_value(&target) else {
            return Filter::TRUE;
        };
        let temporal = matches!(
            schema.get("format").and_then(Value::as_str),
            Some("date" | "date-time")
        );
        let check = if temporal {
            let mut check = SqlFragment::call("julianday", &[&value]);
            check
                .push_sql(&format!(" {op} "))
                .push(&SqlFragment::call("julianday", &[&SqlFragment::text(bound)]));
            check
        } else {
            let mut check = value;
            check.push_sql(&format!(" {op} ")).push(&SqlFragment::text(bound));
            check
        };
        guard_string(&target, Filter::Sql(check))
    }
}

/// Scalar text expression for string-valued locations.
const DATE_SHAPE: &str = r"^[0-9]{4}-[0-9]{2}-[0-9]{2}$";
const DATE_TIME_SHAPE: &str = r"^[0-9]{4}-[0-9]{2}-[0-9]{2}[Tt ]([01][0-9]|2[0-3]):[0-5][0-9]:([0-5][0-9]|60)(\.[0-9]+)?([Zz]|[+-]([01][0-9]|2[0-3]):[0-5][0-9])$";

fn string_value(target: &ValueRef) -> Option<SqlFragment> {
    match target {
        ValueRef::Column { expr, column } if column.kind == ColumnKind::Text => Some(expr.clone()),
        ValueRef::Json { .. } => target.value_expr(),
        _ => None,
    }
}

fn guard_string(target: &ValueRef, check: Filter) -> Filter {
    match target {
        ValueRef::Json { .. } => Filter::or([is_not_of_type(target, JsonType::String), check]),
        _ => check,
    }
}

fn column_equals(expr: &SqlFragment, kind: ColumnKind, required: bool, value: &Value) -> Filter {
    match (kind, value) {
        (ColumnKind::Text, Value::String(text)) => {
            let mut out = expr.clone();
            out.push_sql(" = ").push(&SqlFragment::text(text));
            Filter::Sql(out)
        }
        (ColumnKind::Boolean, Value::Bool(flag)) => {
            let mut out = expr.clone();
            out.push_sql(if *flag { " = 1" } else { " = 0" });
            Filter::Sql(out)
        }
        (_, Value::Null) if !required => {
            let mut out = expr.clone();
            out.push_sql(" IS NULL");
            Filter::Sql(out)
        }
        _ => Filter::FALSE,
    }
}

fn type_equals(type_expr: &SqlFragment, literal: &str) -> Filter {
    let mut out = type_expr.clone();
    out.push_sql(" = ").push_sql(literal);
    Filter::Sql(out)
}

fn text_list(values: &[&str]) -> SqlFragment {
    let mut out = SqlFragment::new();
    for (index, value) in values.iter().enumerate() {
        if index > 0 {
            out.push_sql(", ");
        }
        out.push(&SqlFragment::text(*value));
    }
    out
}

fn regexp(source: &str, subject: &SqlFragment) -> SqlFragment {
    SqlFragment::call("regexp", &[&SqlFragment::text(source), subject])
}

/// `NOT EXISTS (SELECT 1 FROM json_each(doc, path) AS cursor WHERE violation)`.
fn no_element(doc: &SqlFragment, path: &SqlFragment, cursor: &str, violation: Filter) -> Filter {
    if violation.is_const(false) {
        return Filter::TRUE;
    }
    let mut out = SqlFragment::raw("NOT EXISTS (SELECT 1 FROM ");
    out.push(&SqlFragment::call("json_each", &[doc, path]))
        .push_sql(&format!(" AS {cursor} WHERE "))
        .push(&violation.to_fragment())
        .push_sql(")");
    Filter::Sql(out)
}

/// Exactly one of `filters` holds.
fn exactly_one(filters: &[Filter]) -> Filter {
    Filter::or((0..filters.len()).map(|chosen| {
        Filter::and(filters.iter().enumerate().map(|(index, filter)| {
            if index == chosen {
                filter.clone()
            } else {
                !filter.clone()
            }
        }))
    }))
}

/// Quotes a user term as a single FTS5 phrase.
fn full_text_term(term: &str) -> String {
    format!("\"{}\"", term.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::{compile_filter, CompileOptions};
    use crate::sql::expression::Filter;
    use serde_json::json;

    fn compile(schema: serde_json::Value) -> super::CompiledFilter {
        compile_filter(&schema, "card_0", &CompileOptions::default()).unwrap()
    }

    #[test]
    fn boolean_schemas_fold_to_constants() {
        assert_eq!(compile(json!(true)).filter, Filter::TRUE);
        assert_eq!(compile(json!(false)).filter, Filter::FALSE);
        assert_eq!(compile(json!({})).filter, Filter::TRUE);
    }

    #[test]
    fn root_additional_properties_false_is_vacuous() {
        assert_eq!(compile(json!({"additionalProperties": false})).filter, Filter::TRUE);
    }

    #[test]
    fn records_referenced_top_level_keys() {
        let compiled = compile(json!({
            "type": "object",
            "required": ["slug"],
            "properties": {"data": {"type": "object"}, "type": {"const": "user"}}
        }));
        let keys: Vec<&str> = compiled.keys.iter().map(String::as_str).collect();
        assert_eq!(keys, vec!["data", "slug", "type"]);
    }

    #[test]
    fn unknown_top_level_property_required_is_unsatisfiable() {
        assert_eq!(compile(json!({"required": ["nope"]})).filter, Filter::FALSE);
    }

    #[test]
    fn literals_are_bound_not_spliced() {
        let compiled = compile(json!({"properties": {"slug": {"const": "x'); DROP TABLE cards; --"}}}));
        let fragment = compiled.filter.to_fragment();
        assert!(!fragment.sql().contains("DROP"));
        assert_eq!(fragment.params().len(), 1);
    }

    #[test]
    fn non_schema_values_are_rejected() {
        assert!(compile_filter(&json!(3), "card_0", &CompileOptions::default()).is_err());
    }
}
