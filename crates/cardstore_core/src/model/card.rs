//! Card domain model.
//!
//! # Responsibility
//! - Define the universal record every type, session, view and user is
//!   stored as.
//! - Apply creation defaults before validation.
//! - Describe the fixed column set the query compiler addresses.
//!
//! # Invariants
//! - `id` is stable and never reused for another card.
//! - `data` must validate against the schema of the card's type at every write.
//! - `active` is the source of truth for soft-delete state.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Stable identifier for every card.
pub type CardId = Uuid;

/// Version assigned to cards created without one.
pub const DEFAULT_CARD_VERSION: &str = "1.0.0";

/// Canonical stored record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Card {
    pub id: CardId,
    pub slug: String,
    pub version: String,
    /// Serialized as `type`; names the governing type card's slug.
    #[serde(rename = "type")]
    pub card_type: String,
    pub tags: Vec<String>,
    pub markers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Placeholder populated only when a query requests link expansion.
    pub links: Map<String, Value>,
    /// RFC 3339 UTC timestamp.
    pub created_at: String,
    pub active: bool,
    pub requires: Vec<Value>,
    pub capabilities: Vec<Value>,
    pub data: Value,
}

impl Card {
    /// Creates an active card of `card_type` with generated id and slug.
    pub fn new(card_type: impl Into<String>, data: Value) -> Self {
        let id = Uuid::new_v4();
        let card_type = card_type.into();
        Self {
            id,
            slug: default_slug(&card_type, id),
            version: DEFAULT_CARD_VERSION.to_string(),
            card_type,
            tags: Vec::new(),
            markers: Vec::new(),
            name: None,
            links: Map::new(),
            created_at: now_timestamp(),
            active: true,
            requires: Vec::new(),
            capabilities: Vec::new(),
            data,
        }
    }

    /// Replaces the generated slug.
    pub fn with_slug(mut self, slug: impl Into<String>) -> Self {
        self.slug = slug.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_markers(mut self, markers: &[&str]) -> Self {
        self.markers = markers.iter().map(|marker| marker.to_string()).collect();
        self
    }

    /// Parses a fully-defaulted JSON card.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Renders the card as a JSON object keyed by column name.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("id".to_string(), Value::String(self.id.to_string()));
        map.insert("slug".to_string(), Value::String(self.slug.clone()));
        map.insert("version".to_string(), Value::String(self.version.clone()));
        map.insert("type".to_string(), Value::String(self.card_type.clone()));
        map.insert("tags".to_string(), string_array(&self.tags));
        map.insert("markers".to_string(), string_array(&self.markers));
        if let Some(name) = &self.name {
            map.insert("name".to_string(), Value::String(name.clone()));
        }
        map.insert("links".to_string(), Value::Object(self.links.clone()));
        map.insert(
            "created_at".to_string(),
            Value::String(self.created_at.clone()),
        );
        map.insert("active".to_string(), Value::Bool(self.active));
        map.insert("requires".to_string(), Value::Array(self.requires.clone()));
        map.insert(
            "capabilities".to_string(),
            Value::Array(self.capabilities.clone()),
        );
        map.insert("data".to_string(), self.data.clone());
        Value::Object(map)
    }

    /// Returns `data.<field>` when `data` is an object.
    pub fn data_field(&self, field: &str) -> Option<&Value> {
        self.data.as_object().and_then(|data| data.get(field))
    }
}

/// Fills creation defaults on a partial JSON card.
///
/// Existing values are never overwritten. Non-object input is left untouched
/// so validation can report it.
pub fn apply_defaults(card: &mut Value) {
    let Some(map) = card.as_object_mut() else {
        return;
    };

    let id = match map.get("id").and_then(Value::as_str) {
        Some(existing) => Uuid::parse_str(existing).ok(),
        None => {
            let id = Uuid::new_v4();
            map.insert("id".to_string(), Value::String(id.to_string()));
            Some(id)
        }
    };

    if !map.contains_key("slug") {
        if let (Some(card_type), Some(id)) = (map.get("type").and_then(Value::as_str), id) {
            let slug = default_slug(card_type, id);
            map.insert("slug".to_string(), Value::String(slug));
        }
    }

    let defaults = [
        ("version", Value::String(DEFAULT_CARD_VERSION.to_string())),
        ("active", Value::Bool(true)),
        ("tags", Value::Array(Vec::new())),
        ("markers", Value::Array(Vec::new())),
        ("links", Value::Object(Map::new())),
        ("requires", Value::Array(Vec::new())),
        ("capabilities", Value::Array(Vec::new())),
        ("data", Value::Object(Map::new())),
        ("created_at", Value::String(now_timestamp())),
    ];
    for (key, value) in defaults {
        map.entry(key.to_string()).or_insert(value);
    }
}

/// Current time in the format stored in `created_at`.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn default_slug(card_type: &str, id: CardId) -> String {
    let prefix: String = card_type
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() {
                ch.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    format!("{prefix}-{id}")
}

fn string_array(values: &[String]) -> Value {
    Value::Array(values.iter().cloned().map(Value::String).collect())
}

/// Storage shape of one fixed card column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Boolean,
    JsonArray,
    JsonObject,
}

impl ColumnKind {
    /// Whether the column holds a JSON document addressed with JSON1 functions.
    pub fn is_json(self) -> bool {
        matches!(self, Self::JsonArray | Self::JsonObject)
    }
}

/// One entry of the fixed card column set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardColumn {
    pub name: &'static str,
    pub kind: ColumnKind,
    /// Required columns always exist on a stored row.
    pub required: bool,
}

const fn column(name: &'static str, kind: ColumnKind, required: bool) -> CardColumn {
    CardColumn {
        name,
        kind,
        required,
    }
}

/// Fixed column set of the `cards` table, in storage order.
pub const CARD_COLUMNS: &[CardColumn] = &[
    column("id", ColumnKind::Text, true),
    column("version", ColumnKind::Text, true),
    column("slug", ColumnKind::Text, true),
    column("type", ColumnKind::Text, true),
    column("tags", ColumnKind::JsonArray, true),
    column("markers", ColumnKind::JsonArray, true),
    column("name", ColumnKind::Text, false),
    column("links", ColumnKind::JsonObject, true),
    column("created_at", ColumnKind::Text, true),
    column("active", ColumnKind::Boolean, true),
    column("requires", ColumnKind::JsonArray, true),
    column("capabilities", ColumnKind::JsonArray, true),
    column("data", ColumnKind::JsonObject, true),
];

/// Looks up a fixed column by name.
pub fn card_column(name: &str) -> Option<&'static CardColumn> {
    CARD_COLUMNS.iter().find(|column| column.name == name)
}
