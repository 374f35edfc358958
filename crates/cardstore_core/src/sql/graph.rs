//! Single-statement queries over cards and the cards linked to them.
//!
//! # Responsibility
//! - Compile a root schema plus its `$$links` tree into one SQL statement:
//!   one CTE per traversal level, joined through the `links` table in both
//!   directions.
//! - Pick the projected columns and decode result rows.
//! - Reassemble flat result rows into nested cards.
//!
//! # Invariants
//! - Paging (`skip`/`limit`) and sorting apply to root rows only; every
//!   linked row of a returned root row is returned.
//! - Root rows come first, in sort order, followed by linked rows level by
//!   level.
//! - Link traversal does not detect cycles; depth is bounded by the
//!   schema's own nesting.

use super::compiler::{compile_filter, CompileOptions};
use super::expression::{PropertyPath, SqlFragment};
use super::keywords::LINKS_KEYWORD;
use super::{CompileError, CompileResult};
use crate::model::card::{card_column, CardColumn, ColumnKind, CARD_COLUMNS};
use rusqlite::types::{Type, Value as SqlValue};
use rusqlite::Row;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Result column: `"outgoing"` or `"incoming"` for linked rows.
pub const LINK_DIRECTION_COLUMN: &str = "$link direction$";
/// Result column: verb a linked row was reached through.
pub const LINK_TYPE_COLUMN: &str = "$link type$";
/// Result column: id of the row a linked row hangs off.
pub const PARENT_ID_COLUMN: &str = "$parent id$";

const DEPTH_COLUMN: &str = "$depth$";
const ORDER_COLUMN: &str = "$order$";
const METADATA_COLUMNS: [&str; 3] = [LINK_DIRECTION_COLUMN, LINK_TYPE_COLUMN, PARENT_ID_COLUMN];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    fn as_sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// Paging and ordering for root rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOptions {
    pub skip: Option<u64>,
    pub limit: Option<u64>,
    /// Key path from the card root, e.g. `["data", "order"]`.
    pub sort_by: Option<Vec<String>>,
    pub sort_dir: SortDirection,
}

impl QueryOptions {
    /// Parses `{skip, limit, sortBy, sortDir}`; `null` means defaults.
    pub fn from_value(value: &Value) -> CompileResult<Self> {
        let map = match value {
            Value::Null => return Ok(Self::default()),
            Value::Object(map) => map,
            _ => return Err(CompileError::option("options", "expected an object")),
        };

        let mut options = Self::default();
        for (key, value) in map {
            match key.as_str() {
                "skip" => options.skip = Some(non_negative(value, "skip")?),
                "limit" => options.limit = Some(non_negative(value, "limit")?),
                "sortBy" => {
                    let path = match value {
                        Value::String(key) => vec![key.clone()],
                        Value::Array(keys) => keys
                            .iter()
                            .map(|key| {
                                key.as_str().map(str::to_string).ok_or_else(|| {
                                    CompileError::option("sortBy", "path entries must be strings")
                                })
                            })
                            .collect::<CompileResult<_>>()?,
                        _ => return Err(CompileError::option("sortBy", "expected a string or an array")),
                    };
                    if path.is_empty() {
                        return Err(CompileError::option("sortBy", "path is empty"));
                    }
                    options.sort_by = Some(path);
                }
                "sortDir" => {
                    options.sort_dir = match value.as_str() {
                        Some("asc") => SortDirection::Asc,
                        Some("desc") => SortDirection::Desc,
                        _ => return Err(CompileError::option("sortDir", "expected `asc` or `desc`")),
                    }
                }
                _ => {
                    return Err(CompileError::InvalidOption {
                        option: "options",
                        reason: format!("unknown option `{key}`"),
                    })
                }
            }
        }
        Ok(options)
    }
}

fn non_negative(value: &Value, option: &'static str) -> CompileResult<u64> {
    value
        .as_u64()
        .ok_or_else(|| CompileError::option(option, "expected a non-negative integer"))
}

/// Executable statement plus what is needed to decode its rows.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub sql: String,
    pub params: Vec<SqlValue>,
    pub columns: Vec<&'static CardColumn>,
    /// Rows carry link metadata columns after the card columns.
    pub links_requested: bool,
}

impl CompiledQuery {
    /// Decodes one result row into a (possibly partial) card object.
    pub fn decode_row(&self, row: &Row<'_>) -> rusqlite::Result<Map<String, Value>> {
        let mut out = Map::new();
        for (index, column) in self.columns.iter().enumerate() {
            let value = match column.kind {
                ColumnKind::Text => match row.get::<_, Option<String>>(index)? {
                    Some(text) => Value::String(text),
                    None => continue,
                },
                ColumnKind::Boolean => Value::Bool(row.get::<_, bool>(index)?),
                ColumnKind::JsonArray | ColumnKind::JsonObject => {
                    let text: String = row.get(index)?;
                    serde_json::from_str(&text).map_err(|err| {
                        rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(err))
                    })?
                }
            };
            out.insert(column.name.to_string(), value);
        }

        if self.links_requested {
            for (offset, name) in METADATA_COLUMNS.iter().enumerate() {
                let value = row
                    .get::<_, Option<String>>(self.columns.len() + offset)?
                    .map(Value::String)
                    .unwrap_or(Value::Null);
                out.insert(name.to_string(), value);
            }
        }
        Ok(out)
    }
}

/// Compiles `schema` and its `$$links` tree into one statement.
///
/// `subquery` rewrites every linked sub-schema before it is compiled; the
/// permission layer uses it to scope linked cards to what the caller may
/// read. Pass an identity closure when no scoping applies.
pub fn compile_query(
    schema: &Value,
    options: &QueryOptions,
    compile_options: &CompileOptions,
    subquery: &dyn Fn(&Value) -> Value,
) -> CompileResult<CompiledQuery> {
    let root = compile_filter(schema, "card_0", compile_options)?;
    let links = links_of(schema)?;
    let columns = projection(schema, &root.keys, links.is_some());
    let order = order_clause(options, "card_0")?;

    let Some(links) = links else {
        let mut sql = SqlFragment::raw("SELECT ");
        sql.push_sql(&select_list(&columns, "card_0"))
            .push_sql(" FROM cards AS card_0 WHERE ")
            .push(&root.filter.to_fragment())
            .push_sql(" ORDER BY ")
            .push(&order)
            .push(&paging_clause(options));
        let (sql, params) = sql.into_parts();
        return Ok(CompiledQuery {
            sql,
            params,
            columns,
            links_requested: false,
        });
    };

    let mut root_level = SqlFragment::raw("\"level_0\" AS (SELECT ");
    root_level
        .push_sql(&select_list(&columns, "card_0"))
        .push_sql(&format!(
            ", NULL AS \"{LINK_DIRECTION_COLUMN}\", NULL AS \"{LINK_TYPE_COLUMN}\", NULL AS \"{PARENT_ID_COLUMN}\", 0 AS \"{DEPTH_COLUMN}\", ROW_NUMBER() OVER (ORDER BY "
        ))
        .push(&order)
        .push_sql(&format!(") AS \"{ORDER_COLUMN}\" FROM cards AS card_0 WHERE "))
        .push(&root.filter.to_fragment())
        .push_sql(" ORDER BY ")
        .push(&order)
        .push(&paging_clause(options))
        .push_sql(")");

    let mut planner = LinkPlanner {
        compile_options,
        subquery,
        columns: &columns,
        levels: vec![root_level],
        next_level: 1,
    };
    planner.plan("level_0", links, 1)?;

    let mut sql = SqlFragment::raw("WITH ");
    for (index, level) in planner.levels.iter().enumerate() {
        if index > 0 {
            sql.push_sql(", ");
        }
        sql.push(level);
    }
    let level_count = planner.levels.len();
    let union = (0..level_count)
        .map(|index| format!("SELECT * FROM \"level_{index}\""))
        .collect::<Vec<_>>()
        .join(" UNION ALL ");
    let outer_columns = columns
        .iter()
        .map(|column| format!("\"{}\"", column.name))
        .chain(METADATA_COLUMNS.iter().map(|name| format!("\"{name}\"")))
        .collect::<Vec<_>>()
        .join(", ");
    sql.push_sql(&format!(
        " SELECT {outer_columns} FROM ({union}) ORDER BY \"{DEPTH_COLUMN}\" ASC, \"{ORDER_COLUMN}\" ASC, \"created_at\" ASC, \"id\" ASC"
    ));

    let (sql, params) = sql.into_parts();
    Ok(CompiledQuery {
        sql,
        params,
        columns,
        links_requested: true,
    })
}

struct LinkPlanner<'a> {
    compile_options: &'a CompileOptions,
    subquery: &'a dyn Fn(&Value) -> Value,
    columns: &'a [&'static CardColumn],
    levels: Vec<SqlFragment>,
    next_level: usize,
}

impl LinkPlanner<'_> {
    fn plan(&mut self, parent: &str, links: &Map<String, Value>, depth: usize) -> CompileResult<()> {
        for (verb, linked) in links {
            let scoped = (self.subquery)(linked);
            let level = self.next_level;
            self.next_level += 1;

            let alias = format!("card_{level}");
            let link_alias = format!("link_{level}");
            let filter = compile_filter(&scoped, &alias, self.compile_options)?
                .filter
                .to_fragment();

            let mut cte = SqlFragment::raw(format!("\"level_{level}\" AS ("));
            for (index, (direction, near, far, verb_column)) in [
                ("outgoing", "from_id", "to_id", "name"),
                ("incoming", "to_id", "from_id", "inverse_name"),
            ]
            .into_iter()
            .enumerate()
            {
                if index > 0 {
                    cte.push_sql(" UNION ALL ");
                }
                cte.push_sql("SELECT ")
                    .push_sql(&select_list(self.columns, &alias))
                    .push_sql(&format!(", '{direction}' AS \"{LINK_DIRECTION_COLUMN}\", "))
                    .push(&SqlFragment::text(verb.as_str()))
                    .push_sql(&format!(
                        " AS \"{LINK_TYPE_COLUMN}\", parent.id AS \"{PARENT_ID_COLUMN}\", {depth} AS \"{DEPTH_COLUMN}\", NULL AS \"{ORDER_COLUMN}\" FROM \"{parent}\" AS parent INNER JOIN links AS {link_alias} ON {link_alias}.{near} = parent.id AND {link_alias}.{verb_column} = "
                    ))
                    .push(&SqlFragment::text(verb.as_str()))
                    .push_sql(&format!(
                        " INNER JOIN cards AS {alias} ON {alias}.id = {link_alias}.{far} WHERE "
                    ))
                    .push(&filter);
            }
            cte.push_sql(")");
            self.levels.push(cte);

            if let Some(nested) = links_of(&scoped)? {
                self.plan(&format!("level_{level}"), nested, depth + 1)?;
            }
        }
        Ok(())
    }
}

fn links_of(schema: &Value) -> CompileResult<Option<&Map<String, Value>>> {
    match schema.get(LINKS_KEYWORD) {
        None => Ok(None),
        Some(Value::Object(links)) if links.is_empty() => Ok(None),
        Some(Value::Object(links)) => Ok(Some(links)),
        Some(_) => Err(CompileError::keyword("$$links", "expected an object")),
    }
}

/// Columns to select: everything when additional properties or links are
/// requested, else referenced keys, else required keys, else everything.
fn projection(schema: &Value, keys: &BTreeSet<String>, links: bool) -> Vec<&'static CardColumn> {
    let everything = || CARD_COLUMNS.iter().collect::<Vec<_>>();
    if links || schema.get("additionalProperties") == Some(&Value::Bool(true)) {
        return everything();
    }

    let referenced: Vec<_> = CARD_COLUMNS
        .iter()
        .filter(|column| keys.contains(column.name))
        .collect();
    if !referenced.is_empty() {
        return referenced;
    }

    let required: BTreeSet<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|names| names.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    let required: Vec<_> = CARD_COLUMNS
        .iter()
        .filter(|column| required.contains(column.name))
        .collect();
    if !required.is_empty() {
        return required;
    }
    everything()
}

fn select_list(columns: &[&'static CardColumn], alias: &str) -> String {
    columns
        .iter()
        .map(|column| format!("{alias}.{name} AS \"{name}\"", name = column.name))
        .collect::<Vec<_>>()
        .join(", ")
}

fn order_clause(options: &QueryOptions, alias: &str) -> CompileResult<SqlFragment> {
    let direction = options.sort_dir.as_sql();
    let Some(path) = &options.sort_by else {
        return Ok(SqlFragment::raw(format!(
            "{alias}.created_at {direction}, {alias}.id {direction}"
        )));
    };

    let (first, rest) = path
        .split_first()
        .ok_or_else(|| CompileError::option("sortBy", "path is empty"))?;
    let column = card_column(first)
        .ok_or_else(|| CompileError::option("sortBy", format!("unknown field `{first}`")))?;
    let qualified = SqlFragment::raw(format!("{alias}.{}", column.name));
    let mut order = if column.kind.is_json() {
        let path = rest
            .iter()
            .fold(PropertyPath::row(alias).child(first), |path, key| path.child(key));
        path.resolve()
            .value_expr()
            .ok_or_else(|| CompileError::option("sortBy", format!("field `{first}` is not addressable")))?
    } else if rest.is_empty() {
        qualified
    } else {
        return Err(CompileError::option(
            "sortBy",
            format!("field `{first}` has no nested keys"),
        ));
    };
    order.push_sql(&format!(" {direction}, {alias}.id ASC"));
    Ok(order)
}

fn paging_clause(options: &QueryOptions) -> SqlFragment {
    let mut out = SqlFragment::new();
    match (options.limit, options.skip) {
        (None, None) => {}
        (limit, skip) => {
            out.push_sql(" LIMIT ")
                .push(&limit.map_or_else(|| SqlFragment::integer(-1), SqlFragment::count))
                .push_sql(" OFFSET ")
                .push(&SqlFragment::count(skip.unwrap_or(0)));
        }
    }
    out
}

/// Folds flat rows from a linked query into root cards whose `links` map
/// holds the linked cards per verb. Metadata columns are stripped.
pub fn nest_linked_rows(rows: Vec<Map<String, Value>>) -> Vec<Value> {
    let mut roots = Vec::new();
    let mut children: BTreeMap<String, Vec<(String, Map<String, Value>)>> = BTreeMap::new();
    for row in rows {
        let parent = row
            .get(PARENT_ID_COLUMN)
            .and_then(Value::as_str)
            .map(str::to_string);
        match parent {
            Some(parent) => {
                let verb = row
                    .get(LINK_TYPE_COLUMN)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                children.entry(parent).or_default().push((verb, row));
            }
            None => roots.push(row),
        }
    }

    let mut ancestors = Vec::new();
    roots
        .into_iter()
        .map(|row| attach(row, &children, &mut ancestors))
        .collect()
}

fn attach(
    mut card: Map<String, Value>,
    children: &BTreeMap<String, Vec<(String, Map<String, Value>)>>,
    ancestors: &mut Vec<String>,
) -> Value {
    for name in METADATA_COLUMNS {
        card.remove(name);
    }
    let id = card.get("id").and_then(Value::as_str).map(str::to_string);
    let Some(id) = id else {
        return Value::Object(card);
    };
    let Some(linked) = children.get(&id) else {
        return Value::Object(card);
    };
    if ancestors.contains(&id) {
        return Value::Object(card);
    }

    ancestors.push(id);
    let mut by_verb: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for (verb, row) in linked {
        let nested = attach(row.clone(), children, ancestors);
        by_verb.entry(verb.clone()).or_default().push(nested);
    }
    ancestors.pop();

    let links = card
        .entry("links")
        .or_insert_with(|| Value::Object(Map::new()));
    if !links.is_object() {
        *links = Value::Object(Map::new());
    }
    if let Value::Object(links) = links {
        for (verb, cards) in by_verb {
            links.insert(verb, Value::Array(cards));
        }
    }
    Value::Object(card)
}
