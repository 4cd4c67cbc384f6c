// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Lookups over cached records.
//!
//! # Architecture
//!
//! ```text
//! "owner__name__icontains" = "ann"
//!     ↓ LookupPredicate::parse
//! LookupPredicate (path, op, value)
//!     ├─→ CompiledQuery (matcher) → evaluated against cached mappings
//!     └─→ SqlTranslator → WHERE clause pushed to the source store
//! ```
//!
//! The matcher is authoritative. The SQL translation only narrows what the
//! source store returns; every fetched record is re-checked in process.

pub mod lookup;
pub mod matcher;
pub mod sql_translator;

pub use lookup::{FieldPath, LookupOp, LookupPredicate, Lookups};
pub use matcher::{CompiledQuery, QueryMatcher, RelatedMappings, SchemaLookup};
pub use sql_translator::{SqlDialect, SqlParam, SqlQuery, SqlTranslator};
