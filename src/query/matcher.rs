// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Predicate evaluation against cached mappings.
//!
//! Predicates are compiled once against a [`ModelSchema`]: paths are resolved,
//! operators are checked against the field type and operands are coerced to
//! it. A compiled query then evaluates infallibly; a cached value that cannot
//! be coerced simply does not match.
//!
//! # Coercion table
//!
//! | Field type | Accepted operand | Operators |
//! |------------|------------------|-----------|
//! | integer | integer, integer string | exact, in, gt/gte/lt/lte, range, isnull |
//! | float | number, numeric string | exact, in, gt/gte/lt/lte, range, isnull |
//! | decimal | number, decimal string | exact, in, gt/gte/lt/lte, range, isnull |
//! | text | string, number (as text) | exact, in, contains, iexact, (i)contains, (i)startswith, (i)endswith, isnull |
//! | boolean | bool, `"true"`/`"false"` | exact, in, isnull |
//! | datetime | RFC 3339, `YYYY-MM-DD[ T]HH:MM:SS` (UTC), `YYYY-MM-DD` | exact, in, gt/gte/lt/lte, range, isnull |
//! | date | `YYYY-MM-DD` | exact, in, gt/gte/lt/lte, range, isnull |
//! | json | any | exact, contains (array element, object key, substring), isnull |
//! | foreign key | id or mapping with `id` | exact, in, isnull, one hop |
//! | many-to-many | id or mapping with `id` | contains |
//!
//! `exact` with a null operand behaves as `isnull=true`. Anything outside the
//! table is a [`PredicateError`].

use std::cmp::Ordering;
use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;

use super::lookup::{LookupOp, LookupPredicate};
use crate::error::PredicateError;
use crate::record::{Mapping, RecordId};
use crate::schema::{FieldType, ModelSchema};

/// Related mappings keyed by `(model, id)`, used to follow unexpanded relations.
pub type RelatedMappings = HashMap<(String, RecordId), Mapping>;

/// Resolves related model schemas for one-hop lookups.
pub trait SchemaLookup {
    fn schema(&self, model: &str) -> Option<&ModelSchema>;
}

impl SchemaLookup for HashMap<String, ModelSchema> {
    fn schema(&self, model: &str) -> Option<&ModelSchema> {
        self.get(model)
    }
}

static NULL: Value = Value::Null;

/// A value coerced to a field's declared type.
#[derive(Debug, Clone, PartialEq)]
enum Scalar {
    Int(i64),
    Float(f64),
    Decimal(Decimal),
    Text(String),
    Bool(bool),
    DateTime(DateTime<Utc>),
    Date(NaiveDate),
    Json(Value),
}

impl Scalar {
    fn compare(&self, other: &Scalar) -> Option<Ordering> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Some(a.cmp(b)),
            (Self::Float(a), Self::Float(b)) => a.partial_cmp(b),
            (Self::Decimal(a), Self::Decimal(b)) => Some(a.cmp(b)),
            (Self::Text(a), Self::Text(b)) => Some(a.cmp(b)),
            (Self::Bool(a), Self::Bool(b)) => Some(a.cmp(b)),
            (Self::DateTime(a), Self::DateTime(b)) => Some(a.cmp(b)),
            (Self::Date(a), Self::Date(b)) => Some(a.cmp(b)),
            (Self::Json(a), Self::Json(b)) => (a == b).then_some(Ordering::Equal),
            _ => None,
        }
    }
}

pub(crate) fn parse_decimal(s: &str) -> Option<Decimal> {
    let s = s.trim();
    Decimal::from_str(s)
        .or_else(|_| Decimal::from_scientific(s))
        .ok()
}

pub(crate) fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }
    parse_date(s)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

pub(crate) fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
}

fn coerce(field_type: &FieldType, value: &Value) -> Option<Scalar> {
    match field_type {
        FieldType::Integer => match value {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
        .map(Scalar::Int),
        FieldType::Float => match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
            _ => None,
        }
        .map(Scalar::Float),
        FieldType::Decimal => match value {
            Value::Number(n) => parse_decimal(&n.to_string()),
            Value::String(s) => parse_decimal(s),
            _ => None,
        }
        .map(Scalar::Decimal),
        FieldType::Text => match value {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
        .map(Scalar::Text),
        FieldType::Boolean => match value {
            Value::Bool(b) => Some(*b),
            Value::String(s) if s.eq_ignore_ascii_case("true") => Some(true),
            Value::String(s) if s.eq_ignore_ascii_case("false") => Some(false),
            _ => None,
        }
        .map(Scalar::Bool),
        FieldType::DateTime => value.as_str().and_then(parse_datetime).map(Scalar::DateTime),
        FieldType::Date => value.as_str().and_then(parse_date).map(Scalar::Date),
        FieldType::Json => Some(Scalar::Json(value.clone())),
        FieldType::ForeignKey(_) => RecordId::from_value(value).map(|id| Scalar::Int(id.0)),
        FieldType::ManyToMany(_) => None,
    }
}

fn describe(value: &Value) -> String {
    let text = value.to_string();
    if text.len() > 64 {
        format!("{}...", &text[..text.char_indices().nth(61).map_or(text.len(), |(i, _)| i)])
    } else {
        text
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Null,
    One(Scalar),
    Many(Vec<Scalar>),
    Between(Scalar, Scalar),
    /// Lowercased for the case-insensitive operators
    Text(String),
    Flag(bool),
    Json(Value),
    Id(RecordId),
}

#[derive(Debug, Clone, PartialEq)]
struct Hop {
    model: String,
    field: String,
}

/// One predicate, resolved and coerced.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledPredicate {
    model: String,
    field: String,
    hop: Option<Hop>,
    field_type: FieldType,
    op: LookupOp,
    operand: Operand,
}

impl CompiledPredicate {
    fn compile(
        schema: &ModelSchema,
        schemas: &dyn SchemaLookup,
        predicate: &LookupPredicate,
    ) -> Result<Self, PredicateError> {
        let path = &predicate.path;
        let field = schema
            .field(&path.field)
            .ok_or_else(|| PredicateError::UnknownField {
                model: schema.name().to_string(),
                field: path.field.clone(),
            })?;

        let (field_type, hop) = match &path.related {
            None => (field.field_type.clone(), None),
            Some(related_field) => {
                let related_model = match &field.field_type {
                    FieldType::ForeignKey(model) => model,
                    _ => {
                        return Err(PredicateError::InvalidHop {
                            lookup: path.to_string(),
                            field: field.name.clone(),
                        })
                    }
                };
                let related_schema = schemas.schema(related_model).ok_or_else(|| {
                    PredicateError::UnknownRelatedModel {
                        model: related_model.clone(),
                    }
                })?;
                let target = related_schema.field(related_field).ok_or_else(|| {
                    PredicateError::UnknownField {
                        model: related_model.clone(),
                        field: related_field.clone(),
                    }
                })?;
                let hop = Hop {
                    model: related_model.clone(),
                    field: related_field.clone(),
                };
                (target.field_type.clone(), Some(hop))
            }
        };

        let operand = build_operand(&path.to_string(), &field_type, predicate.op, &predicate.value)?;
        Ok(Self {
            model: schema.name().to_string(),
            field: field.name.clone(),
            hop,
            field_type,
            op: predicate.op,
            operand,
        })
    }

    fn evaluate(&self, mapping: &Mapping, related: Option<&RelatedMappings>) -> bool {
        let own = mapping.get(&self.field).unwrap_or(&NULL);
        let value = match &self.hop {
            None => own,
            Some(hop) => match own {
                Value::Object(nested) => nested.get(&hop.field).unwrap_or(&NULL),
                Value::Null => &NULL,
                other => {
                    let nested = RecordId::from_value(other)
                        .and_then(|id| related?.get(&(hop.model.clone(), id)));
                    match nested {
                        Some(nested) => nested.get(&hop.field).unwrap_or(&NULL),
                        // Broken reference
                        None => return false,
                    }
                }
            },
        };
        self.test(value)
    }

    fn test(&self, value: &Value) -> bool {
        match &self.operand {
            Operand::Flag(want_null) => return value.is_null() == *want_null,
            Operand::Null => return value.is_null(),
            _ if value.is_null() => return false,
            _ => {}
        }

        match &self.operand {
            Operand::One(expected) => {
                let Some(ord) = coerce(&self.field_type, value).and_then(|a| a.compare(expected)) else {
                    return false;
                };
                match self.op {
                    LookupOp::Exact => ord == Ordering::Equal,
                    LookupOp::Gt => ord == Ordering::Greater,
                    LookupOp::Gte => ord != Ordering::Less,
                    LookupOp::Lt => ord == Ordering::Less,
                    LookupOp::Lte => ord != Ordering::Greater,
                    _ => false,
                }
            }
            Operand::Many(options) => coerce(&self.field_type, value).is_some_and(|actual| {
                options
                    .iter()
                    .any(|o| actual.compare(o) == Some(Ordering::Equal))
            }),
            Operand::Between(low, high) => coerce(&self.field_type, value).is_some_and(|actual| {
                matches!(actual.compare(low), Some(Ordering::Greater | Ordering::Equal))
                    && matches!(actual.compare(high), Some(Ordering::Less | Ordering::Equal))
            }),
            Operand::Text(needle) => {
                let Some(text) = value.as_str() else {
                    return false;
                };
                match self.op {
                    LookupOp::IExact => text.to_lowercase() == *needle,
                    LookupOp::Contains => text.contains(needle.as_str()),
                    LookupOp::IContains => text.to_lowercase().contains(needle.as_str()),
                    LookupOp::StartsWith => text.starts_with(needle.as_str()),
                    LookupOp::IStartsWith => text.to_lowercase().starts_with(needle.as_str()),
                    LookupOp::EndsWith => text.ends_with(needle.as_str()),
                    LookupOp::IEndsWith => text.to_lowercase().ends_with(needle.as_str()),
                    _ => false,
                }
            }
            Operand::Id(id) => value
                .as_array()
                .is_some_and(|items| items.iter().filter_map(RecordId::from_value).any(|r| r == *id)),
            Operand::Json(needle) => match value {
                Value::Array(items) => items.contains(needle),
                Value::Object(map) => needle.as_str().is_some_and(|k| map.contains_key(k)),
                Value::String(s) => needle.as_str().is_some_and(|n| s.contains(n)),
                _ => false,
            },
            Operand::Flag(_) | Operand::Null => false,
        }
    }
}

fn build_operand(
    field: &str,
    field_type: &FieldType,
    op: LookupOp,
    value: &Value,
) -> Result<Operand, PredicateError> {
    let unsupported = || PredicateError::UnsupportedOperator {
        field: field.to_string(),
        operator: op.to_string(),
        field_type: field_type.to_string(),
    };
    let invalid = |expected: &str, got: &Value| PredicateError::InvalidValue {
        field: field.to_string(),
        operator: op.to_string(),
        expected: expected.to_string(),
        got: describe(got),
    };
    let one = |v: &Value| coerce(field_type, v).ok_or_else(|| invalid(&field_type.to_string(), v));

    match op {
        LookupOp::IsNull => value
            .as_bool()
            .map(Operand::Flag)
            .ok_or_else(|| invalid("a boolean", value)),
        _ if field_type.is_many() => match (op, RecordId::from_value(value)) {
            (LookupOp::Contains, Some(id)) => Ok(Operand::Id(id)),
            (LookupOp::Contains, None) => Err(invalid("a related id", value)),
            _ => Err(unsupported()),
        },
        LookupOp::Exact if value.is_null() => Ok(Operand::Null),
        LookupOp::Exact => one(value).map(Operand::One),
        LookupOp::In => {
            let items = value.as_array().ok_or_else(|| invalid("a list", value))?;
            items
                .iter()
                .filter(|v| !v.is_null())
                .map(one)
                .collect::<Result<Vec<_>, _>>()
                .map(Operand::Many)
        }
        LookupOp::Gt | LookupOp::Gte | LookupOp::Lt | LookupOp::Lte => {
            if !field_type.is_ordered() {
                return Err(unsupported());
            }
            one(value).map(Operand::One)
        }
        LookupOp::Range => {
            if !field_type.is_ordered() {
                return Err(unsupported());
            }
            match value.as_array().map(Vec::as_slice) {
                Some([low, high]) => Ok(Operand::Between(one(low)?, one(high)?)),
                _ => Err(invalid("a [low, high] pair", value)),
            }
        }
        LookupOp::Contains => match field_type {
            FieldType::Text => value
                .as_str()
                .map(|s| Operand::Text(s.to_string()))
                .ok_or_else(|| invalid("a string", value)),
            FieldType::Json => Ok(Operand::Json(value.clone())),
            _ => Err(unsupported()),
        },
        LookupOp::IExact
        | LookupOp::IContains
        | LookupOp::StartsWith
        | LookupOp::IStartsWith
        | LookupOp::EndsWith
        | LookupOp::IEndsWith => {
            if *field_type != FieldType::Text {
                return Err(unsupported());
            }
            let text = value.as_str().ok_or_else(|| invalid("a string", value))?;
            let case_insensitive = matches!(
                op,
                LookupOp::IExact | LookupOp::IContains | LookupOp::IStartsWith | LookupOp::IEndsWith
            );
            Ok(Operand::Text(if case_insensitive {
                text.to_lowercase()
            } else {
                text.to_string()
            }))
        }
    }
}

/// A predicate list compiled against one model (AND semantics).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompiledQuery {
    predicates: Vec<CompiledPredicate>,
}

impl CompiledQuery {
    /// Resolve and type-check every predicate. Fails on the first bad one.
    pub fn compile(
        schema: &ModelSchema,
        schemas: &dyn SchemaLookup,
        predicates: &[LookupPredicate],
    ) -> Result<Self, PredicateError> {
        let predicates = predicates
            .iter()
            .map(|p| CompiledPredicate::compile(schema, schemas, p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { predicates })
    }

    /// True when every predicate holds. An empty query matches everything.
    #[must_use]
    pub fn matches(&self, mapping: &Mapping, related: Option<&RelatedMappings>) -> bool {
        self.predicates.iter().all(|p| p.evaluate(mapping, related))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    /// `(relation field, related model)` for every one-hop predicate.
    pub fn hops(&self) -> impl Iterator<Item = (&str, &str)> {
        self.predicates
            .iter()
            .filter_map(|p| p.hop.as_ref().map(|h| (p.field.as_str(), h.model.as_str())))
    }

    /// `(model, field)` for every field a predicate reads.
    #[must_use]
    pub fn referenced_fields(&self) -> Vec<(&str, &str)> {
        let mut fields = Vec::with_capacity(self.predicates.len());
        for p in &self.predicates {
            fields.push((p.model.as_str(), p.field.as_str()));
            if let Some(hop) = &p.hop {
                fields.push((hop.model.as_str(), hop.field.as_str()));
            }
        }
        fields
    }
}

/// One-shot evaluation of predicates against mappings of a single model.
pub struct QueryMatcher<'a> {
    schema: &'a ModelSchema,
    schemas: &'a dyn SchemaLookup,
    related: Option<&'a RelatedMappings>,
}

impl<'a> QueryMatcher<'a> {
    pub fn new(schema: &'a ModelSchema, schemas: &'a dyn SchemaLookup) -> Self {
        Self {
            schema,
            schemas,
            related: None,
        }
    }

    #[must_use]
    pub fn with_related(mut self, related: &'a RelatedMappings) -> Self {
        self.related = Some(related);
        self
    }

    pub fn matches(
        &self,
        mapping: &Mapping,
        predicates: &[LookupPredicate],
    ) -> Result<bool, PredicateError> {
        let query = CompiledQuery::compile(self.schema, self.schemas, predicates)?;
        Ok(query.matches(mapping, self.related))
    }
}
