//! Relational predicate fragments addressed by property paths.
//!
//! # Responsibility
//! - Resolve a property path to a column, a JSON document location, the
//!   whole row, or nothing.
//! - Build type-test and existence predicates over resolved locations.
//! - Combine predicates with constant folding.
//!
//! # Invariants
//! - Literal values are bound as positional parameters, never spliced into
//!   SQL text. Text and params of combined fragments stay in step.
//! - A predicate over a missing value evaluates to SQL NULL or false, and
//!   negation treats NULL as "not satisfied" (`IS NOT 1`).

use crate::model::card::{card_column, CardColumn, ColumnKind};
use rusqlite::types::Value as SqlValue;
use serde_json::Number;
use std::ops::Not;

/// SQL text with the positional parameters it references, in order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlFragment {
    sql: String,
    params: Vec<SqlValue>,
}

impl SqlFragment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fragment of trusted SQL text without parameters.
    pub fn raw(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Single `?` placeholder bound to `value`.
    pub fn param(value: SqlValue) -> Self {
        Self {
            sql: "?".to_string(),
            params: vec![value],
        }
    }

    pub fn text(value: impl Into<String>) -> Self {
        Self::param(SqlValue::Text(value.into()))
    }

    pub fn integer(value: i64) -> Self {
        Self::param(SqlValue::Integer(value))
    }

    /// Binds a length or count, saturating at `i64::MAX`.
    pub fn count<T: TryInto<i64>>(value: T) -> Self {
        Self::integer(value.try_into().unwrap_or(i64::MAX))
    }

    /// Binds a JSON number, keeping integers integral.
    pub fn number(value: &Number) -> Self {
        match value.as_i64() {
            Some(integer) => Self::integer(integer),
            None => Self::param(SqlValue::Real(value.as_f64().unwrap_or(f64::NAN))),
        }
    }

    pub fn real(value: f64) -> Self {
        Self::param(SqlValue::Real(value))
    }

    /// `name(arg, ...)`.
    pub fn call(name: &str, args: &[&SqlFragment]) -> Self {
        let mut out = Self::raw(name);
        out.push_sql("(");
        for (index, arg) in args.iter().enumerate() {
            if index > 0 {
                out.push_sql(", ");
            }
            out.push(arg);
        }
        out.push_sql(")");
        out
    }

    pub fn push_sql(&mut self, sql: &str) -> &mut Self {
        self.sql.push_str(sql);
        self
    }

    pub fn push(&mut self, other: &SqlFragment) -> &mut Self {
        self.sql.push_str(&other.sql);
        self.params.extend(other.params.iter().cloned());
        self
    }

    pub fn push_param(&mut self, value: SqlValue) -> &mut Self {
        self.sql.push('?');
        self.params.push(value);
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[SqlValue] {
        &self.params
    }

    pub fn into_parts(self) -> (String, Vec<SqlValue>) {
        (self.sql, self.params)
    }
}

/// Boolean predicate: a folded constant or a SQL expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Const(bool),
    Sql(SqlFragment),
}

impl Filter {
    pub const TRUE: Filter = Filter::Const(true);
    pub const FALSE: Filter = Filter::Const(false);

    /// Conjunction. Empty input is `true`.
    pub fn and(filters: impl IntoIterator<Item = Filter>) -> Filter {
        Self::combine(filters, " AND ", false)
    }

    /// Disjunction. Empty input is `false`.
    pub fn or(filters: impl IntoIterator<Item = Filter>) -> Filter {
        Self::combine(filters, " OR ", true)
    }

    fn combine(filters: impl IntoIterator<Item = Filter>, joiner: &str, absorbing: bool) -> Filter {
        let mut parts = Vec::new();
        for filter in filters {
            match filter {
                Filter::Const(value) if value == absorbing => return Filter::Const(absorbing),
                Filter::Const(_) => {}
                Filter::Sql(fragment) => parts.push(fragment),
            }
        }

        match parts.len() {
            0 => Filter::Const(!absorbing),
            1 => Filter::Sql(parts.remove(0)),
            _ => {
                let mut out = SqlFragment::new();
                for (index, part) in parts.iter().enumerate() {
                    if index > 0 {
                        out.push_sql(joiner);
                    }
                    out.push_sql("(").push(part).push_sql(")");
                }
                Filter::Sql(out)
            }
        }
    }

    pub fn sql(fragment: SqlFragment) -> Filter {
        Filter::Sql(fragment)
    }

    pub fn is_const(&self, value: bool) -> bool {
        matches!(self, Filter::Const(current) if *current == value)
    }

    /// Renders the predicate; constants become `1`/`0`.
    pub fn to_fragment(&self) -> SqlFragment {
        match self {
            Filter::Const(true) => SqlFragment::raw("1"),
            Filter::Const(false) => SqlFragment::raw("0"),
            Filter::Sql(fragment) => fragment.clone(),
        }
    }
}

impl Not for Filter {
    type Output = Filter;

    fn not(self) -> Filter {
        match self {
            Filter::Const(value) => Filter::Const(!value),
            Filter::Sql(fragment) => {
                let mut out = SqlFragment::raw("(");
                out.push(&fragment).push_sql(") IS NOT 1");
                Filter::Sql(out)
            }
        }
    }
}

/// JSON Schema primitive types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum JsonType {
    Null,
    Boolean,
    Integer,
    Number,
    String,
    Array,
    Object,
}

impl JsonType {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "null" => Some(Self::Null),
            "boolean" => Some(Self::Boolean),
            "integer" => Some(Self::Integer),
            "number" => Some(Self::Number),
            "string" => Some(Self::String),
            "array" => Some(Self::Array),
            "object" => Some(Self::Object),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Boolean => "boolean",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::String => "string",
            Self::Array => "array",
            Self::Object => "object",
        }
    }

    /// Names `json_type()` reports for values of this type.
    fn sqlite_names(self) -> &'static [&'static str] {
        match self {
            Self::Null => &["null"],
            Self::Boolean => &["true", "false"],
            Self::Integer => &["integer"],
            Self::Number => &["integer", "real"],
            Self::String => &["text"],
            Self::Array => &["array"],
            Self::Object => &["object"],
        }
    }
}

/// One step of a property path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

/// Anchor a property path is resolved against.
#[derive(Debug, Clone, PartialEq)]
pub enum PathBase {
    /// A `cards` row bound to `table`.
    Row { table: String },
    /// The current row of a `json_each` over `doc`; `cursor` is its alias.
    Element { doc: SqlFragment, cursor: String },
}

/// Ordered property reference: an anchor plus the keys/indices below it.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyPath {
    base: PathBase,
    segments: Vec<Segment>,
}

impl PropertyPath {
    pub fn row(table: impl Into<String>) -> Self {
        Self {
            base: PathBase::Row {
                table: table.into(),
            },
            segments: Vec::new(),
        }
    }

    pub fn element(doc: SqlFragment, cursor: impl Into<String>) -> Self {
        Self {
            base: PathBase::Element {
                doc,
                cursor: cursor.into(),
            },
            segments: Vec::new(),
        }
    }

    pub fn child(&self, key: &str) -> Self {
        let mut next = self.clone();
        next.segments.push(Segment::Key(key.to_string()));
        next
    }

    pub fn index(&self, index: usize) -> Self {
        let mut next = self.clone();
        next.segments.push(Segment::Index(index));
        next
    }

    /// Whole-row path (no segments below a row anchor).
    pub fn is_root(&self) -> bool {
        matches!(self.base, PathBase::Row { .. }) && self.segments.is_empty()
    }

    /// Row table alias, if anchored on a row.
    pub fn table(&self) -> Option<&str> {
        match &self.base {
            PathBase::Row { table } => Some(table),
            PathBase::Element { .. } => None,
        }
    }

    /// First key below a row anchor.
    pub fn top_level_key(&self) -> Option<&str> {
        match (&self.base, self.segments.first()) {
            (PathBase::Row { .. }, Some(Segment::Key(key))) => Some(key),
            _ => None,
        }
    }

    /// Keys from the row root, when every segment is a key.
    pub fn row_keys(&self) -> Option<Vec<String>> {
        if !matches!(self.base, PathBase::Row { .. }) {
            return None;
        }
        self.segments
            .iter()
            .map(|segment| match segment {
                Segment::Key(key) => Some(key.clone()),
                Segment::Index(_) => None,
            })
            .collect()
    }

    pub fn resolve(&self) -> ValueRef {
        match &self.base {
            PathBase::Row { table } => {
                let Some((first, rest)) = self.segments.split_first() else {
                    return ValueRef::Row {
                        table: table.clone(),
                    };
                };
                let Segment::Key(key) = first else {
                    return ValueRef::Missing;
                };
                let Some(column) = card_column(key) else {
                    return ValueRef::Missing;
                };
                let qualified = SqlFragment::raw(format!("{table}.{}", column.name));
                if column.kind.is_json() {
                    locate(qualified, None, rest)
                } else if rest.is_empty() {
                    ValueRef::Column {
                        expr: qualified,
                        column,
                    }
                } else {
                    ValueRef::Missing
                }
            }
            PathBase::Element { doc, cursor } => locate(
                doc.clone(),
                Some(SqlFragment::raw(format!("{cursor}.fullkey"))),
                &self.segments,
            ),
        }
    }
}

/// JSON location of `segments` below `anchor` (`$` when `None`) in `doc`.
///
/// SQLite paths cannot spell a key containing `"`, so such a key is looked
/// up with `json_each` and its value re-rooted as `$[0]` of a one-element
/// array.
fn locate(doc: SqlFragment, anchor: Option<SqlFragment>, segments: &[Segment]) -> ValueRef {
    let quoted = segments
        .iter()
        .position(|segment| matches!(segment, Segment::Key(key) if key.contains('"')));
    let Some(split) = quoted else {
        return ValueRef::Json {
            path: join_path(anchor, segments),
            doc,
        };
    };
    let (head, tail) = segments.split_at(split);
    let Some((Segment::Key(key), rest)) = tail.split_first() else {
        return ValueRef::Missing;
    };

    let parent = join_path(anchor, head);
    let mut member = SqlFragment::raw(
        "(SELECT CASE member.type WHEN 'true' THEN '[true]' WHEN 'false' THEN '[false]' \
         WHEN 'null' THEN '[null]' WHEN 'object' THEN json_array(json(member.value)) \
         WHEN 'array' THEN json_array(json(member.value)) ELSE json_array(member.value) END FROM ",
    );
    member
        .push(&SqlFragment::call("json_each", &[&doc, &parent]))
        .push_sql(" AS member WHERE member.key = ")
        .push(&SqlFragment::text(key.as_str()))
        .push_sql(")");
    locate(member, Some(SqlFragment::text("$[0]")), rest)
}

fn join_path(anchor: Option<SqlFragment>, segments: &[Segment]) -> SqlFragment {
    match anchor {
        None => SqlFragment::text(json_path(segments)),
        Some(anchor) if segments.is_empty() => anchor,
        Some(anchor) => {
            let suffix = json_path(segments);
            let mut path = SqlFragment::raw("(");
            path.push(&anchor)
                .push_sql(" || ")
                .push(&SqlFragment::text(&suffix[1..]))
                .push_sql(")");
            path
        }
    }
}

/// Renders segments as a SQLite JSON path (`$.a."b c"[0]`).
pub fn json_path(segments: &[Segment]) -> String {
    let mut out = String::from("$");
    for segment in segments {
        match segment {
            Segment::Key(key) if is_plain_key(key) => {
                out.push('.');
                out.push_str(key);
            }
            Segment::Key(key) => {
                out.push_str(".\"");
                out.push_str(key);
                out.push('"');
            }
            Segment::Index(index) => {
                out.push('[');
                out.push_str(&index.to_string());
                out.push(']');
            }
        }
    }
    out
}

fn is_plain_key(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(first) if first.is_ascii_alphabetic() || first == '_')
        && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

/// What a property path denotes in storage.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueRef {
    /// The whole row (always an object).
    Row { table: String },
    /// A scalar card column.
    Column {
        expr: SqlFragment,
        column: &'static CardColumn,
    },
    /// A location inside a JSON document.
    Json { doc: SqlFragment, path: SqlFragment },
    /// A location that can never hold a value.
    Missing,
}

impl ValueRef {
    /// SQL scalar value of the location, if it has one.
    pub fn value_expr(&self) -> Option<SqlFragment> {
        match self {
            Self::Column { expr, .. } => Some(expr.clone()),
            Self::Json { doc, path } => Some(SqlFragment::call("json_extract", &[doc, path])),
            Self::Row { .. } | Self::Missing => None,
        }
    }

    /// `json_type(doc, path)` for JSON locations.
    pub fn type_expr(&self) -> Option<SqlFragment> {
        match self {
            Self::Json { doc, path } => Some(SqlFragment::call("json_type", &[doc, path])),
            _ => None,
        }
    }
}

/// Predicate: the value at `target` has JSON type `json_type`.
pub fn is_of_type(target: &ValueRef, json_type: JsonType) -> Filter {
    match target {
        ValueRef::Row { .. } => Filter::Const(json_type == JsonType::Object),
        ValueRef::Missing => Filter::FALSE,
        ValueRef::Column { expr, column } => match (column.kind, json_type) {
            (ColumnKind::Text, JsonType::String) | (ColumnKind::Boolean, JsonType::Boolean) => {
                if column.required {
                    Filter::TRUE
                } else {
                    let mut out = expr.clone();
                    out.push_sql(" IS NOT NULL");
                    Filter::Sql(out)
                }
            }
            _ => Filter::FALSE,
        },
        ValueRef::Json { .. } => {
            let Some(type_expr) = target.type_expr() else {
                return Filter::FALSE;
            };
            let names = json_type.sqlite_names();
            let mut out = type_expr.clone();
            if names.len() == 1 {
                out.push_sql(&format!(" = '{}'", names[0]));
            } else {
                let quoted: Vec<String> = names.iter().map(|name| format!("'{name}'")).collect();
                out.push_sql(&format!(" IN ({})", quoted.join(", ")));
            }
            if json_type != JsonType::Integer {
                return Filter::Sql(out);
            }

            // A real with no fractional part still counts as an integer.
            let Some(value) = target.value_expr() else {
                return Filter::Sql(out);
            };
            let mut integral = type_expr;
            integral
                .push_sql(" = 'real' AND ")
                .push(&value)
                .push_sql(" = CAST(")
                .push(&value)
                .push_sql(" AS INTEGER)");
            Filter::or([Filter::Sql(out), Filter::Sql(integral)])
        }
    }
}

/// Predicate: the value at `target` is absent or of another type.
pub fn is_not_of_type(target: &ValueRef, json_type: JsonType) -> Filter {
    !is_of_type(target, json_type)
}

/// Predicate: a value is present at `target`.
pub fn exists(target: &ValueRef) -> Filter {
    match target {
        ValueRef::Row { .. } => Filter::TRUE,
        ValueRef::Missing => Filter::FALSE,
        ValueRef::Column { expr, column } => {
            if column.required {
                Filter::TRUE
            } else {
                let mut out = expr.clone();
                out.push_sql(" IS NOT NULL");
                Filter::Sql(out)
            }
        }
        ValueRef::Json { .. } => match target.type_expr() {
            Some(mut out) => {
                out.push_sql(" IS NOT NULL");
                Filter::Sql(out)
            }
            None => Filter::FALSE,
        },
    }
}

pub fn not_exists(target: &ValueRef) -> Filter {
    !exists(target)
}
