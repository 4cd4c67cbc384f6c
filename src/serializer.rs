// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Record ⇄ cache mapping conversion.
//!
//! # Encoding
//!
//! | Field type | Cached as |
//! |------------|-----------|
//! | integer, float | JSON number (non-finite floats are rejected) |
//! | decimal | string, exact precision (`"10.50"`) |
//! | text, boolean, json | as is |
//! | datetime | RFC 3339 UTC string (`2024-05-01T12:00:00Z`) |
//! | date | `YYYY-MM-DD` |
//! | foreign key | related id, or the related mapping when expanded |
//! | many-to-many | array of related ids or mappings, source order |
//!
//! Relation expansion goes one level deep: relations inside an expanded record
//! are always written as ids. Values that cannot be coerced to their declared
//! type, nulls in non-nullable fields and values outside declared choices are
//! reported as [`DeserializationError`]; the caller decides whether to skip.

use std::collections::{BTreeSet, HashMap};

use chrono::SecondsFormat;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{Number, Value};
use tracing::debug;

use crate::config::ModelCacheConfig;
use crate::error::DeserializationError;
use crate::query::matcher::{parse_date, parse_datetime, parse_decimal, SchemaLookup};
use crate::record::{FieldMap, FieldValue, Mapping, Record, RecordId, RelatedRef};
use crate::schema::{FieldDef, FieldType, ModelSchema, ID_FIELD};

/// Schemas plus per-model exclusions, for expanding related records.
pub trait ModelCatalog: SchemaLookup {
    fn exclude_fields(&self, model: &str) -> Option<&BTreeSet<String>>;
}

impl ModelCatalog for HashMap<String, ModelSchema> {
    fn exclude_fields(&self, _model: &str) -> Option<&BTreeSet<String>> {
        None
    }
}

#[derive(Clone, Copy)]
struct Encoding<'a> {
    catalog: &'a dyn ModelCatalog,
    excludes: Option<&'a BTreeSet<String>>,
    expand: bool,
    related_excludes: bool,
}

/// Build the cached mapping for `record`: excluded fields dropped, relations
/// expanded one level when `save_related_models` is set.
pub fn serialize(
    record: &Record,
    schema: &ModelSchema,
    config: &ModelCacheConfig,
    catalog: &dyn ModelCatalog,
) -> Result<Mapping, DeserializationError> {
    encode_record(
        record,
        schema,
        Encoding {
            catalog,
            excludes: Some(&config.exclude_fields),
            expand: config.save_related_models,
            related_excludes: true,
        },
    )
}

/// Every field, relations expanded wherever loaded. Used to evaluate filters,
/// which may read fields the cached mapping leaves out.
pub fn match_view(
    record: &Record,
    schema: &ModelSchema,
    catalog: &dyn ModelCatalog,
) -> Result<Mapping, DeserializationError> {
    encode_record(
        record,
        schema,
        Encoding {
            catalog,
            excludes: None,
            expand: true,
            related_excludes: false,
        },
    )
}

/// Drop the fields of `view` the cached mapping would not carry.
///
/// Only valid for a view built by [`match_view`] from the same record.
pub(crate) fn project(
    mut view: Mapping,
    schema: &ModelSchema,
    config: &ModelCacheConfig,
    catalog: &dyn ModelCatalog,
) -> Mapping {
    view.retain(|name, _| !config.exclude_fields.contains(name));
    for def in schema.fields() {
        let Some(model) = def.field_type.related_model() else {
            continue;
        };
        let Some(value) = view.get_mut(&def.name) else {
            continue;
        };
        let related_excludes = catalog.exclude_fields(model);
        let reduce = |v: &mut Value| {
            if let Value::Object(nested) = v {
                if !config.save_related_models {
                    if let Some(id) = RecordId::from_mapping(nested) {
                        *v = Value::from(id.0);
                    }
                } else if let Some(excludes) = related_excludes {
                    nested.retain(|name, _| !excludes.contains(name));
                }
            }
        };
        match value {
            Value::Array(items) => items.iter_mut().for_each(reduce),
            other => reduce(other),
        }
    }
    view
}

fn encode_record(
    record: &Record,
    schema: &ModelSchema,
    enc: Encoding<'_>,
) -> Result<Mapping, DeserializationError> {
    for name in record.fields.keys() {
        if !schema.has_field(name) {
            debug!(model = %schema.name(), field = %name, "Ignoring field not declared in schema");
        }
    }

    let mut out = Mapping::new();
    for def in schema.fields() {
        if enc.excludes.is_some_and(|ex| ex.contains(&def.name)) {
            continue;
        }
        let value = if def.name == ID_FIELD {
            Value::from(record.id.0)
        } else {
            encode_field(schema.name(), def, record.fields.get(&def.name), enc)?
        };
        out.insert(def.name.clone(), value);
    }
    Ok(out)
}

fn encode_field(
    model: &str,
    def: &FieldDef,
    raw: Option<&FieldValue>,
    enc: Encoding<'_>,
) -> Result<Value, DeserializationError> {
    let err = |reason: String| {
        DeserializationError::new(model, &def.name, def.field_type.to_string(), reason)
    };

    let value = match raw {
        None if def.field_type.is_many() => return Ok(Value::Array(Vec::new())),
        None | Some(FieldValue::Null) if def.nullable => return Ok(Value::Null),
        None => return Err(err("missing value".into())),
        Some(FieldValue::Null) => return Err(err("null in a non-nullable field".into())),
        Some(v) => encode_value(&def.field_type, v, enc).map_err(err)?,
    };
    check_choices(def, &value).map_err(err)?;
    Ok(value)
}

fn finite(f: f64) -> Result<Value, String> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| format!("non-finite float {}", f))
}

fn encode_value(ty: &FieldType, v: &FieldValue, enc: Encoding<'_>) -> Result<Value, String> {
    match (ty, v) {
        (FieldType::Integer, FieldValue::Int(i)) => Ok(Value::from(*i)),
        (FieldType::Integer, FieldValue::Text(s)) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|e| format!("'{}': {}", s, e)),

        (FieldType::Float, FieldValue::Float(f)) => finite(*f),
        (FieldType::Float, FieldValue::Int(i)) => finite(*i as f64),
        (FieldType::Float, FieldValue::Decimal(d)) => d
            .to_f64()
            .ok_or_else(|| format!("{} does not fit a float", d))
            .and_then(finite),

        (FieldType::Decimal, FieldValue::Decimal(d)) => Ok(Value::String(d.to_string())),
        (FieldType::Decimal, FieldValue::Int(i)) => Ok(Value::String(Decimal::from(*i).to_string())),
        (FieldType::Decimal, FieldValue::Float(f)) => Decimal::try_from(*f)
            .map(|d| Value::String(d.to_string()))
            .map_err(|e| e.to_string()),
        (FieldType::Decimal, FieldValue::Text(s)) => parse_decimal(s)
            .map(|d| Value::String(d.to_string()))
            .ok_or_else(|| format!("'{}' is not a decimal", s)),

        (FieldType::Text, FieldValue::Text(s)) => Ok(Value::String(s.clone())),

        (FieldType::Boolean, FieldValue::Bool(b)) => Ok(Value::Bool(*b)),
        (FieldType::Boolean, FieldValue::Int(i @ (0 | 1))) => Ok(Value::Bool(*i == 1)),

        (FieldType::DateTime, FieldValue::DateTime(dt)) => {
            Ok(Value::String(dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)))
        }
        (FieldType::DateTime, FieldValue::Text(s)) => parse_datetime(s)
            .map(|dt| Value::String(dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)))
            .ok_or_else(|| format!("'{}' is not a timestamp", s)),

        (FieldType::Date, FieldValue::Date(d)) => Ok(Value::String(d.format("%Y-%m-%d").to_string())),
        (FieldType::Date, FieldValue::Text(s)) => parse_date(s)
            .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
            .ok_or_else(|| format!("'{}' is not a date", s)),

        (FieldType::Json, FieldValue::Json(v)) => Ok(v.clone()),
        (FieldType::Json, FieldValue::Text(s)) => Ok(Value::String(s.clone())),
        (FieldType::Json, FieldValue::Int(i)) => Ok(Value::from(*i)),
        (FieldType::Json, FieldValue::Float(f)) => finite(*f),
        (FieldType::Json, FieldValue::Bool(b)) => Ok(Value::Bool(*b)),

        (FieldType::ForeignKey(model), FieldValue::Ref(r)) => encode_related(model, r, enc),
        (FieldType::ForeignKey(_), FieldValue::Int(i)) => Ok(Value::from(*i)),
        (FieldType::ManyToMany(model), FieldValue::RefMany(refs)) => refs
            .iter()
            .map(|r| encode_related(model, r, enc))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),

        (_, other) => Err(format!("got {}", other.type_name())),
    }
}

fn encode_related(model: &str, r: &RelatedRef, enc: Encoding<'_>) -> Result<Value, String> {
    let record = match r {
        RelatedRef::Loaded(record) if enc.expand => record,
        _ => return Ok(Value::from(r.id().0)),
    };
    if record.model != model {
        return Err(format!("related record is a {}, expected {}", record.model, model));
    }
    let Some(schema) = enc.catalog.schema(model) else {
        debug!(related = %model, "No schema for related model, caching id only");
        return Ok(Value::from(record.id.0));
    };
    let nested = Encoding {
        catalog: enc.catalog,
        excludes: if enc.related_excludes {
            enc.catalog.exclude_fields(model)
        } else {
            None
        },
        expand: false,
        related_excludes: false,
    };
    encode_record(record, schema, nested)
        .map(Value::Object)
        .map_err(|e| format!("related {}: {}", model, e))
}

fn check_choices(def: &FieldDef, value: &Value) -> Result<(), String> {
    match &def.choices {
        Some(choices) if !value.is_null() && !choices.contains(value) => {
            Err(format!("{} is not one of the allowed choices", value))
        }
        _ => Ok(()),
    }
}

/// Rebuild a record from its cached mapping. Fields absent from the mapping
/// (excluded ones) are left out; relations come back as ids.
pub fn deserialize(mapping: &Mapping, schema: &ModelSchema) -> Result<Record, DeserializationError> {
    let id = RecordId::from_mapping(mapping).ok_or_else(|| {
        DeserializationError::new(
            schema.name(),
            ID_FIELD,
            FieldType::Integer.to_string(),
            "missing or non-integer id",
        )
    })?;
    let mut record = Record::new(schema.name(), id);
    for def in schema.data_fields() {
        if let Some(value) = mapping.get(&def.name) {
            let decoded = decode_value(schema.name(), def, value)?;
            record.fields.insert(def.name.clone(), decoded);
        }
    }
    Ok(record)
}

/// Decode caller-supplied field values for a source-store write.
///
/// Unknown fields and the primary key are rejected.
pub fn decode_fields(schema: &ModelSchema, fields: &Mapping) -> Result<FieldMap, DeserializationError> {
    let mut out = FieldMap::new();
    for (name, value) in fields {
        let def = schema.field(name).ok_or_else(|| {
            DeserializationError::new(schema.name(), name, "a declared field", "not a field of the model")
        })?;
        if def.name == ID_FIELD {
            return Err(DeserializationError::new(
                schema.name(),
                ID_FIELD,
                FieldType::Integer.to_string(),
                "the primary key is assigned by the source store",
            ));
        }
        out.insert(name.clone(), decode_value(schema.name(), def, value)?);
    }
    Ok(out)
}

fn decode_value(model: &str, def: &FieldDef, value: &Value) -> Result<FieldValue, DeserializationError> {
    let err = |reason: String| {
        DeserializationError::new(model, &def.name, def.field_type.to_string(), reason)
    };
    if value.is_null() {
        return if def.nullable {
            Ok(FieldValue::Null)
        } else {
            Err(err("null in a non-nullable field".into()))
        };
    }

    let decoded = match (&def.field_type, value) {
        (FieldType::Integer, Value::Number(n)) => n.as_i64().map(FieldValue::Int),
        (FieldType::Float, Value::Number(n)) => n.as_f64().map(FieldValue::Float),
        (FieldType::Decimal, Value::String(s)) => parse_decimal(s).map(FieldValue::Decimal),
        (FieldType::Decimal, Value::Number(n)) => parse_decimal(&n.to_string()).map(FieldValue::Decimal),
        (FieldType::Text, Value::String(s)) => Some(FieldValue::Text(s.clone())),
        (FieldType::Boolean, Value::Bool(b)) => Some(FieldValue::Bool(*b)),
        (FieldType::DateTime, Value::String(s)) => parse_datetime(s).map(FieldValue::DateTime),
        (FieldType::Date, Value::String(s)) => parse_date(s).map(FieldValue::Date),
        (FieldType::Json, v) => Some(FieldValue::Json(v.clone())),
        (FieldType::ForeignKey(_), v) => {
            RecordId::from_value(v).map(|id| FieldValue::Ref(RelatedRef::Id(id)))
        }
        (FieldType::ManyToMany(_), Value::Array(items)) => items
            .iter()
            .map(|v| RecordId::from_value(v).map(RelatedRef::Id))
            .collect::<Option<Vec<_>>>()
            .map(FieldValue::RefMany),
        _ => None,
    };
    let decoded = decoded.ok_or_else(|| err(format!("cannot read {}", value)))?;
    check_choices(def, value).map_err(err)?;
    Ok(decoded)
}
