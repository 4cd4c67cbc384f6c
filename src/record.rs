// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Source-store record data structures.
//!
//! A [`Record`] is what a [`SourceStore`](crate::storage::traits::SourceStore)
//! returns: a model name, a primary key and typed [`FieldValue`]s. Relation
//! fields hold either a bare id or the loaded related record.
//!
//! # Example
//!
//! ```
//! use model_cache_sync::record::{FieldValue, Record, RecordId, RelatedRef};
//!
//! let owner = Record::new("User", RecordId(7)).with("name", FieldValue::Text("Ann".into()));
//! let task = Record::new("Task", RecordId(1))
//!     .with("status", FieldValue::Text("new".into()))
//!     .with("owner", FieldValue::Ref(RelatedRef::Loaded(Box::new(owner))));
//!
//! assert_eq!(task.get("owner").and_then(FieldValue::related_id), Some(RecordId(7)));
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::schema::ID_FIELD;

/// Field name → value, ordered for stable serialization.
pub type FieldMap = BTreeMap<String, FieldValue>;

/// A cached record: field name → JSON value.
pub type Mapping = Map<String, Value>;

/// Primary key of a record in the source store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub i64);

impl RecordId {
    /// Extract an id from a JSON value: a bare integer or a mapping with an
    /// integer `id`.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(Self),
            Value::Object(map) => Self::from_mapping(map),
            _ => None,
        }
    }

    /// Extract the `id` of a cached mapping.
    #[must_use]
    pub fn from_mapping(map: &Map<String, Value>) -> Option<Self> {
        map.get(ID_FIELD).and_then(Value::as_i64).map(Self)
    }

    /// Extract ids from a list of mappings or bare integers, skipping
    /// anything without an id.
    #[must_use]
    pub fn collect_from(values: &[Value]) -> Vec<Self> {
        values.iter().filter_map(Self::from_value).collect()
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for RecordId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Reference to a related record.
#[derive(Debug, Clone, PartialEq)]
pub enum RelatedRef {
    /// Only the foreign key is known.
    Id(RecordId),
    /// The related record was loaded alongside.
    Loaded(Box<Record>),
}

impl RelatedRef {
    #[must_use]
    pub fn id(&self) -> RecordId {
        match self {
            Self::Id(id) => *id,
            Self::Loaded(record) => record.id,
        }
    }

    /// Drop the loaded record, keeping only the id.
    #[must_use]
    pub fn to_id(&self) -> Self {
        Self::Id(self.id())
    }
}

/// Typed field value as produced by the source store.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Decimal(Decimal),
    Text(String),
    DateTime(DateTime<Utc>),
    Date(NaiveDate),
    Json(Value),
    Ref(RelatedRef),
    RefMany(Vec<RelatedRef>),
}

impl FieldValue {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// The id of a single-valued relation.
    #[must_use]
    pub fn related_id(&self) -> Option<RecordId> {
        match self {
            Self::Ref(r) => Some(r.id()),
            _ => None,
        }
    }

    /// Variant name, used in error messages.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Int(_) => "integer",
            Self::Float(_) => "float",
            Self::Decimal(_) => "decimal",
            Self::Text(_) => "text",
            Self::DateTime(_) => "datetime",
            Self::Date(_) => "date",
            Self::Json(_) => "json",
            Self::Ref(_) => "relation",
            Self::RefMany(_) => "relation list",
        }
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<Decimal> for FieldValue {
    fn from(v: Decimal) -> Self {
        Self::Decimal(v)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(v: DateTime<Utc>) -> Self {
        Self::DateTime(v)
    }
}

/// A record of one model, as read from or written to the source store.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub model: String,
    pub id: RecordId,
    pub fields: FieldMap,
}

impl Record {
    pub fn new(model: impl Into<String>, id: RecordId) -> Self {
        Self {
            model: model.into(),
            id,
            fields: FieldMap::new(),
        }
    }

    /// Builder-style field setter.
    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    #[must_use]
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    /// Copy of this record with every relation reduced to its id.
    #[must_use]
    pub fn shallow(&self) -> Self {
        let fields = self
            .fields
            .iter()
            .map(|(name, value)| {
                let value = match value {
                    FieldValue::Ref(r) => FieldValue::Ref(r.to_id()),
                    FieldValue::RefMany(refs) => {
                        FieldValue::RefMany(refs.iter().map(RelatedRef::to_id).collect())
                    }
                    other => other.clone(),
                };
                (name.clone(), value)
            })
            .collect();
        Self {
            model: self.model.clone(),
            id: self.id,
            fields,
        }
    }
}

impl From<RelatedRef> for FieldValue {
    fn from(v: RelatedRef) -> Self {
        Self::Ref(v)
    }
}
