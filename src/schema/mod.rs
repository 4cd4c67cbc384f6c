// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Model schema descriptors.
//!
//! The engine never inspects host types. Every cached model is described by a
//! [`ModelSchema`]: an ordered list of fields, each with a declared
//! [`FieldType`], nullability, an optional set of allowed values and an
//! optional default applied when a created record omits the field.
//!
//! # Example
//!
//! ```
//! use model_cache_sync::schema::{FieldDef, FieldType, ModelSchema};
//!
//! let task = ModelSchema::new("Task")
//!     .with_field(FieldDef::new("status", FieldType::Text))
//!     .with_field(FieldDef::new("price", FieldType::Decimal))
//!     .with_field(FieldDef::new("owner", FieldType::ForeignKey("User".into())).nullable())
//!     .with_field(FieldDef::new("tags", FieldType::ManyToMany("Tag".into())));
//!
//! assert!(task.field("owner").unwrap().field_type.is_relation());
//! assert_eq!(task.field("id").unwrap().field_type, FieldType::Integer);
//! assert_eq!(task.table(), "task");
//! ```
//!
//! # Design
//!
//! - **Primary key**: every schema carries a non-nullable integer `id` field.
//! - **Relations**: [`FieldType::ForeignKey`] (single-valued) and
//!   [`FieldType::ManyToMany`] (multi-valued) name the related model.
//! - **Key safety**: model names may not contain `:` or glob metacharacters,
//!   keeping `{prefix}:{model}:{id}` keys collision-free.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Name of the primary key field in every schema and every cached mapping.
pub const ID_FIELD: &str = "id";

/// Characters that may not appear in a prefix or model name.
pub(crate) const RESERVED_KEY_CHARS: &[char] = &[':', '*', '?', '[', ']', '\\'];

/// Declared type of a model field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    Integer,
    Float,
    /// Exact decimal, cached as a string to avoid float rounding.
    Decimal,
    Text,
    Boolean,
    /// UTC timestamp, cached as RFC 3339.
    DateTime,
    /// Calendar date, cached as `YYYY-MM-DD`.
    Date,
    /// Opaque JSON document.
    Json,
    /// Single-valued relation to the named model.
    ForeignKey(String),
    /// Multi-valued relation to the named model.
    ManyToMany(String),
}

impl FieldType {
    #[must_use]
    pub fn is_relation(&self) -> bool {
        matches!(self, Self::ForeignKey(_) | Self::ManyToMany(_))
    }

    #[must_use]
    pub fn is_many(&self) -> bool {
        matches!(self, Self::ManyToMany(_))
    }

    #[must_use]
    pub fn related_model(&self) -> Option<&str> {
        match self {
            Self::ForeignKey(model) | Self::ManyToMany(model) => Some(model),
            _ => None,
        }
    }

    /// Whether `gt`/`gte`/`lt`/`lte`/`range` are defined for this type.
    #[must_use]
    pub fn is_ordered(&self) -> bool {
        matches!(
            self,
            Self::Integer | Self::Float | Self::Decimal | Self::DateTime | Self::Date
        )
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Integer => write!(f, "integer"),
            Self::Float => write!(f, "float"),
            Self::Decimal => write!(f, "decimal"),
            Self::Text => write!(f, "text"),
            Self::Boolean => write!(f, "boolean"),
            Self::DateTime => write!(f, "datetime"),
            Self::Date => write!(f, "date"),
            Self::Json => write!(f, "json"),
            Self::ForeignKey(model) => write!(f, "foreign key to {}", model),
            Self::ManyToMany(model) => write!(f, "many-to-many to {}", model),
        }
    }
}

/// A single field declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    #[serde(default)]
    pub nullable: bool,
    /// Allowed values (cache encoding), if restricted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<Value>>,
    /// Value (cache encoding) used by `create` when the field is omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            nullable: false,
            choices: None,
            default: None,
        }
    }

    #[must_use]
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    #[must_use]
    pub fn with_choices(mut self, choices: Vec<Value>) -> Self {
        self.choices = Some(choices);
        self
    }

    #[must_use]
    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }
}

/// Schema of one model: its name, source table and fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSchema {
    name: String,
    table: String,
    fields: Vec<FieldDef>,
}

impl ModelSchema {
    /// Create a schema with only the `id` primary key.
    /// The source table defaults to the lowercased model name.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            table: name.to_lowercase(),
            name,
            fields: vec![FieldDef::new(ID_FIELD, FieldType::Integer)],
        }
    }

    #[must_use]
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    /// Add (or replace) a field declaration.
    #[must_use]
    pub fn with_field(mut self, field: FieldDef) -> Self {
        if let Some(pos) = self.fields.iter().position(|f| f.name == field.name) {
            self.fields[pos] = field;
        } else {
            self.fields.push(field);
        }
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// All fields, `id` first.
    #[must_use]
    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    #[must_use]
    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    /// Fields other than the primary key.
    pub fn data_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| f.name != ID_FIELD)
    }

    /// Check the schema can be used to build cache keys and SQL identifiers.
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("model name is empty".into());
        }
        if self.name.contains(RESERVED_KEY_CHARS) {
            return Err(format!(
                "model name '{}' contains a reserved key character",
                self.name
            ));
        }
        for field in &self.fields {
            if field.name.is_empty() || field.name.contains("__") {
                return Err(format!("invalid field name '{}'", field.name));
            }
        }
        match self.field(ID_FIELD) {
            Some(id) if id.default.is_some() => Err("the 'id' field cannot have a default".into()),
            Some(id) if id.field_type == FieldType::Integer && !id.nullable => Ok(()),
            _ => Err("the 'id' field must be a non-nullable integer".into()),
        }
    }
}
