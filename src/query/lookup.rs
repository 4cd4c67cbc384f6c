// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Lookup predicates: `(field_path, operator, value)`.
//!
//! Predicates are written the way the host already writes them for its ORM:
//! `"status"` (exact), `"status__in"`, `"price__gte"`, `"owner__name__icontains"`.
//! A path may traverse at most one relation hop.
//!
//! # Example
//!
//! ```rust
//! use model_cache_sync::query::{Lookups, LookupOp, LookupPredicate};
//! use serde_json::json;
//!
//! // Parsed from ORM-style keys
//! let p = LookupPredicate::parse("owner__name__icontains", json!("ann")).unwrap();
//! assert_eq!(p.path.field, "owner");
//! assert_eq!(p.path.related.as_deref(), Some("name"));
//! assert_eq!(p.op, LookupOp::IContains);
//!
//! // Or built fluently
//! let lookups = Lookups::new()
//!     .exact("owner", json!(7))
//!     .is_in("status", json!(["checking", "completed"]))
//!     .build();
//! assert_eq!(lookups.len(), 2);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PredicateError;
use crate::schema::ID_FIELD;

/// Lookup operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LookupOp {
    Exact,
    IExact,
    In,
    Gt,
    Gte,
    Lt,
    Lte,
    /// Inclusive `[low, high]`
    Range,
    Contains,
    IContains,
    StartsWith,
    IStartsWith,
    EndsWith,
    IEndsWith,
    IsNull,
}

impl LookupOp {
    /// Parse an operator suffix. Returns `None` for anything else.
    #[must_use]
    pub fn from_suffix(s: &str) -> Option<Self> {
        Some(match s {
            "exact" => Self::Exact,
            "iexact" => Self::IExact,
            "in" => Self::In,
            "gt" => Self::Gt,
            "gte" => Self::Gte,
            "lt" => Self::Lt,
            "lte" => Self::Lte,
            "range" => Self::Range,
            "contains" => Self::Contains,
            "icontains" => Self::IContains,
            "startswith" => Self::StartsWith,
            "istartswith" => Self::IStartsWith,
            "endswith" => Self::EndsWith,
            "iendswith" => Self::IEndsWith,
            "isnull" => Self::IsNull,
            _ => return None,
        })
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::IExact => "iexact",
            Self::In => "in",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::Range => "range",
            Self::Contains => "contains",
            Self::IContains => "icontains",
            Self::StartsWith => "startswith",
            Self::IStartsWith => "istartswith",
            Self::EndsWith => "endswith",
            Self::IEndsWith => "iendswith",
            Self::IsNull => "isnull",
        }
    }

    /// Ordering comparisons, defined only for ordered field types.
    #[must_use]
    pub fn is_ordering(&self) -> bool {
        matches!(self, Self::Gt | Self::Gte | Self::Lt | Self::Lte | Self::Range)
    }

    /// Text-only operators.
    #[must_use]
    pub fn is_text_only(&self) -> bool {
        matches!(
            self,
            Self::IExact
                | Self::IContains
                | Self::StartsWith
                | Self::IStartsWith
                | Self::EndsWith
                | Self::IEndsWith
        )
    }
}

impl std::fmt::Display for LookupOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A field reference, optionally through one relation hop.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldPath {
    /// Field on the model itself
    pub field: String,
    /// Field on the related model, when `field` is a relation
    pub related: Option<String>,
}

impl FieldPath {
    pub fn direct(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            related: None,
        }
    }

    pub fn hop(field: impl Into<String>, related: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            related: Some(related.into()),
        }
    }

    #[must_use]
    pub fn is_hop(&self) -> bool {
        self.related.is_some()
    }
}

impl std::fmt::Display for FieldPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.related {
            Some(related) => write!(f, "{}__{}", self.field, related),
            None => f.write_str(&self.field),
        }
    }
}

/// One lookup. A record matches a predicate list when it matches all of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookupPredicate {
    pub path: FieldPath,
    pub op: LookupOp,
    pub value: Value,
}

impl LookupPredicate {
    pub fn new(path: FieldPath, op: LookupOp, value: Value) -> Self {
        Self { path, op, value }
    }

    /// Parse an ORM-style lookup key: `field[__related][__op]`.
    ///
    /// The last segment is taken as the operator when it names one. Paths
    /// deeper than one relation hop are rejected.
    pub fn parse(lookup: &str, value: Value) -> Result<Self, PredicateError> {
        if lookup.is_empty() {
            return Err(PredicateError::EmptyLookup);
        }
        let mut segments: Vec<&str> = lookup.split("__").collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(PredicateError::EmptyLookup);
        }

        let op = match segments.last().and_then(|s| LookupOp::from_suffix(s)) {
            Some(op) if segments.len() > 1 => {
                segments.pop();
                op
            }
            _ => LookupOp::Exact,
        };

        let path = match segments.as_slice() {
            [field] => FieldPath::direct(*field),
            [field, related] => FieldPath::hop(*field, *related),
            // `a__b__c`: either a deeper path or a misspelled operator
            [_, _, last] if looks_like_operator(last) => {
                return Err(PredicateError::UnknownOperator {
                    lookup: lookup.to_string(),
                    operator: last.to_string(),
                })
            }
            _ => {
                return Err(PredicateError::TooManyHops {
                    lookup: lookup.to_string(),
                })
            }
        };

        Ok(Self { path, op, value })
    }

    /// Parse a set of `(lookup, value)` pairs.
    pub fn parse_all<I, K>(pairs: I) -> Result<Vec<Self>, PredicateError>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: AsRef<str>,
    {
        pairs
            .into_iter()
            .map(|(k, v)| Self::parse(k.as_ref(), v))
            .collect()
    }

    pub fn exact(field: impl Into<String>, value: Value) -> Self {
        Self::new(FieldPath::direct(field), LookupOp::Exact, value)
    }

    /// The id this predicate pins, if it is `id = <integer>`.
    #[must_use]
    pub fn pinned_id(&self) -> Option<i64> {
        (self.op == LookupOp::Exact && !self.path.is_hop() && self.path.field == ID_FIELD)
            .then(|| self.value.as_i64())
            .flatten()
    }
}

impl std::fmt::Display for LookupPredicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}__{}={}", self.path, self.op, self.value)
    }
}

/// ORM lookups that exist elsewhere but are not supported here.
fn looks_like_operator(segment: &str) -> bool {
    matches!(
        segment,
        "eq" | "ne" | "le" | "ge" | "like" | "ilike" | "not" | "between"
            | "regex" | "iregex" | "year" | "month" | "day" | "week_day"
            | "hour" | "minute" | "second" | "date" | "time" | "search"
            | "contained_by" | "overlap" | "has_key"
    )
}

/// Fluent builder for predicate lists (AND semantics).
#[derive(Debug, Default, Clone)]
pub struct Lookups {
    predicates: Vec<LookupPredicate>,
}

impl Lookups {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, field: impl Into<String>, op: LookupOp, value: Value) -> Self {
        self.predicates
            .push(LookupPredicate::new(FieldPath::direct(field), op, value));
        self
    }

    pub fn exact(self, field: impl Into<String>, value: Value) -> Self {
        self.push(field, LookupOp::Exact, value)
    }

    pub fn is_in(self, field: impl Into<String>, values: Value) -> Self {
        self.push(field, LookupOp::In, values)
    }

    pub fn gte(self, field: impl Into<String>, value: Value) -> Self {
        self.push(field, LookupOp::Gte, value)
    }

    pub fn lte(self, field: impl Into<String>, value: Value) -> Self {
        self.push(field, LookupOp::Lte, value)
    }

    pub fn gt(self, field: impl Into<String>, value: Value) -> Self {
        self.push(field, LookupOp::Gt, value)
    }

    pub fn lt(self, field: impl Into<String>, value: Value) -> Self {
        self.push(field, LookupOp::Lt, value)
    }

    pub fn contains(self, field: impl Into<String>, value: Value) -> Self {
        self.push(field, LookupOp::Contains, value)
    }

    /// Lookup on a field of a related record (one hop).
    pub fn related(
        mut self,
        field: impl Into<String>,
        related: impl Into<String>,
        op: LookupOp,
        value: Value,
    ) -> Self {
        self.predicates
            .push(LookupPredicate::new(FieldPath::hop(field, related), op, value));
        self
    }

    pub fn id(self, id: i64) -> Self {
        self.exact(ID_FIELD, Value::from(id))
    }

    pub fn build(self) -> Vec<LookupPredicate> {
        self.predicates
    }
}
