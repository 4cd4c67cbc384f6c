// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Store traits and backends.
//!
//! | Backend | Trait | Notes |
//! |---------|-------|-------|
//! | [`redis::RedisCacheStore`] | [`traits::CacheStore`] | `SET EX`, `MGET`, `SCAN MATCH` |
//! | [`sql::SqlSourceStore`] | [`traits::SourceStore`] | SQLite / MySQL via sqlx `Any` |
//! | [`memory`] | both | for tests and embedded hosts |

pub mod memory;
pub mod redis;
pub mod sql;
pub mod traits;
