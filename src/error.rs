// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error taxonomy for the cache-sync engine.
//!
//! | Error | Raised by | Scope |
//! |-------|-----------|-------|
//! | [`CacheSyncError::Configuration`] | registration | fatal, surfaced immediately |
//! | [`PredicateError`] | lookups in `get` and reconciliation filters | aborts that call / pass |
//! | [`DeserializationError`] | serializer (both directions) | per record, see `ignore_deserialization_errors` |
//! | [`CacheSyncError::WriteNotAllowed`] | CRUD writes | always surfaced |
//! | [`CacheSyncError::SourceUnavailable`] / [`CacheSyncError::CacheUnavailable`] | backends | aborts current operation |

use thiserror::Error;

use crate::record::RecordId;
use crate::storage::traits::StorageError;

/// Result type for engine operations.
pub type SyncResult<T> = Result<T, CacheSyncError>;

#[derive(Error, Debug)]
pub enum CacheSyncError {
    /// Invalid registration or root configuration.
    #[error("configuration error for '{model}': {reason}")]
    Configuration { model: String, reason: String },

    /// Malformed or type-incompatible lookup.
    #[error(transparent)]
    Predicate(#[from] PredicateError),

    /// A cached or fetched value could not be coerced to its declared type.
    #[error(transparent)]
    Deserialization(#[from] DeserializationError),

    /// CRUD write against a model without write-through enabled.
    #[error("writes are not allowed for '{model}': write-through to the source store is disabled")]
    WriteNotAllowed { model: String },

    #[error("model '{0}' is not registered")]
    UnknownModel(String),

    #[error("{model} {id} not found in the source store")]
    NotFound { model: String, id: RecordId },

    #[error("source store unavailable: {0}")]
    SourceUnavailable(StorageError),

    #[error("cache store unavailable: {0}")]
    CacheUnavailable(StorageError),
}

impl CacheSyncError {
    pub(crate) fn configuration(model: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            model: model.into(),
            reason: reason.into(),
        }
    }

    /// Short label used for metrics and log fields.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration",
            Self::Predicate(_) => "predicate",
            Self::Deserialization(_) => "deserialization",
            Self::WriteNotAllowed { .. } => "write_not_allowed",
            Self::UnknownModel(_) => "unknown_model",
            Self::NotFound { .. } => "not_found",
            Self::SourceUnavailable(_) => "source_unavailable",
            Self::CacheUnavailable(_) => "cache_unavailable",
        }
    }
}

/// Lookup errors. Unknown operators and unresolvable paths never match silently.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PredicateError {
    #[error("empty lookup key")]
    EmptyLookup,

    #[error("unknown lookup operator '{operator}' in '{lookup}'")]
    UnknownOperator { lookup: String, operator: String },

    #[error("'{model}' has no field '{field}'")]
    UnknownField { model: String, field: String },

    #[error("'{model}.{field}' is excluded from the cache and cannot be looked up")]
    ExcludedField { model: String, field: String },

    #[error("lookup '{lookup}' traverses more than one relation")]
    TooManyHops { lookup: String },

    #[error("lookup '{lookup}' traverses '{field}', which is not a single-valued relation")]
    InvalidHop { lookup: String, field: String },

    #[error("schema for related model '{model}' is not registered")]
    UnknownRelatedModel { model: String },

    #[error("operator '{operator}' is not supported for field '{field}' of type {field_type}")]
    UnsupportedOperator {
        field: String,
        operator: String,
        field_type: String,
    },

    #[error("invalid value for '{field}__{operator}': expected {expected}, got {got}")]
    InvalidValue {
        field: String,
        operator: String,
        expected: String,
        got: String,
    },
}

/// A value could not be coerced to the type declared for its field.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot deserialize '{model}.{field}' as {expected}: {reason}")]
pub struct DeserializationError {
    pub model: String,
    pub field: String,
    pub expected: String,
    pub reason: String,
}

impl DeserializationError {
    pub(crate) fn new(
        model: impl Into<String>,
        field: impl Into<String>,
        expected: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            model: model.into(),
            field: field.into(),
            expected: expected.into(),
            reason: reason.into(),
        }
    }
}
