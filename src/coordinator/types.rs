// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the cache root coordinator.

use std::collections::BTreeMap;

/// Phase of a model's reconciliation pass.
///
/// ```text
/// Idle → DueCheck → Fetching → Diffing → Applying → Idle
/// ```
///
/// Use [`super::CacheRoot::model_phase()`] to observe it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PassPhase {
    /// No pass running
    #[default]
    Idle,
    /// Comparing the last sync time with the TTL
    DueCheck,
    /// Waiting for (or running) the source-store query
    Fetching,
    /// Serializing, filtering and computing the key diff
    Diffing,
    /// Writing and deleting cache keys
    Applying,
}

impl std::fmt::Display for PassPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::DueCheck => write!(f, "DueCheck"),
            Self::Fetching => write!(f, "Fetching"),
            Self::Diffing => write!(f, "Diffing"),
            Self::Applying => write!(f, "Applying"),
        }
    }
}

/// Counters of one successful pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PassStats {
    /// Records returned by the source store
    pub fetched: usize,
    /// Records written to the cache
    pub upserted: usize,
    /// Stale keys removed (only with `allow_delete`)
    pub deleted: usize,
    /// Records skipped because they failed to serialize
    pub skipped: usize,
}

/// Result of one model's pass within a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// TTL not yet elapsed since the last successful pass
    NotDue,
    /// A pass for this model is still running
    Busy,
    Synced(PassStats),
    /// The pass was aborted; the cache keeps the previous pass's state
    Failed {
        /// [`crate::CacheSyncError::kind`] of the error
        kind: &'static str,
        error: String,
    },
}

impl PassOutcome {
    /// Metric label
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::NotDue => "not_due",
            Self::Busy => "busy",
            Self::Synced(_) => "synced",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Outcome of every enabled model in one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub outcomes: BTreeMap<String, PassOutcome>,
}

impl TickReport {
    #[must_use]
    pub fn outcome(&self, model: &str) -> Option<&PassOutcome> {
        self.outcomes.get(model)
    }

    /// Models whose pass completed.
    pub fn synced(&self) -> impl Iterator<Item = &str> {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, PassOutcome::Synced(_)))
            .map(|(m, _)| m.as_str())
    }

    /// Models whose pass failed.
    pub fn failed(&self) -> impl Iterator<Item = &str> {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, PassOutcome::Failed { .. }))
            .map(|(m, _)| m.as_str())
    }
}

/// Expiry applied to keys rewritten by an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TtlPolicy {
    /// The model's `ttl_secs`
    #[default]
    ModelDefault,
    /// A fixed TTL in seconds (0 = no expiry)
    Fixed(u64),
    /// No expiry
    Persist,
}

impl TtlPolicy {
    pub(super) fn resolve(self, model_ttl: Option<u64>) -> Option<u64> {
        match self {
            Self::ModelDefault => model_ttl,
            Self::Fixed(0) | Self::Persist => None,
            Self::Fixed(secs) => Some(secs),
        }
    }
}

/// Options for [`super::CacheRoot::update_with`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    pub ttl: TtlPolicy,
}
