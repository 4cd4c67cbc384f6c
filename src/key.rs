// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache key layout: `{prefix}:{model}:{id}`.
//!
//! Neither the prefix nor the model name may contain `:` (checked at root
//! creation and registration), so a key always splits into exactly three
//! parts and keys of different models never collide.

use crate::record::RecordId;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub prefix: String,
    pub model: String,
    pub id: RecordId,
}

impl CacheKey {
    pub fn new(prefix: &str, model: &str, id: RecordId) -> Self {
        Self {
            prefix: prefix.to_string(),
            model: model.to_string(),
            id,
        }
    }

    /// Glob pattern matching every key of `model` under `prefix`.
    #[must_use]
    pub fn model_pattern(prefix: &str, model: &str) -> String {
        format!("{}:{}:*", prefix, model)
    }

    /// Parse a raw key. Returns `None` for keys not shaped like ours.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.splitn(3, ':');
        let prefix = parts.next()?;
        let model = parts.next()?;
        let id = parts.next()?.parse::<i64>().ok()?;
        Some(Self::new(prefix, model, RecordId(id)))
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.prefix, self.model, self.id)
    }
}
