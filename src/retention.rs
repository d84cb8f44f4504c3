//! Window retention
//!
//! A window index expires once its period ended more than `horizon` ago. Expiry is
//! enforced two ways:
//! - lazily: transactions never resolve expired windows and queries treat them as absent
//! - eagerly: `run_pass` drops expired slots from the registry (skipping pinned ones)

use crate::keyspace::IndexKey;
use crate::registry::IndexRegistry;
use chrono::{DateTime, Utc};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    horizon: chrono::Duration,
}

impl RetentionPolicy {
    pub fn new(horizon: chrono::Duration) -> Self {
        Self { horizon }
    }

    pub fn horizon(&self) -> chrono::Duration {
        self.horizon
    }

    /// Whether `key` names a window past the horizon at `now`.
    ///
    /// Non-window keys never expire. A malformed anchor counts as expired.
    pub fn is_expired(&self, key: &IndexKey, now: DateTime<Utc>) -> bool {
        match key.anchor() {
            Some(anchor) => match anchor.period_end() {
                Some(end) => end <= now - self.horizon,
                None => true,
            },
            None => false,
        }
    }
}

/// Outcome of one eviction pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub evicted: Vec<IndexKey>,
    /// Expired but pinned by an in-flight transaction; retried on the next pass.
    pub deferred: Vec<IndexKey>,
}

#[derive(Debug, Clone)]
pub struct WindowRetentionManager {
    registry: Arc<IndexRegistry>,
    policy: RetentionPolicy,
}

impl WindowRetentionManager {
    pub fn new(registry: Arc<IndexRegistry>, policy: RetentionPolicy) -> Self {
        Self { registry, policy }
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    /// Evict every unpinned window index expired at `now`. Irreversible.
    pub fn run_pass(&self, now: DateTime<Utc>) -> RetentionReport {
        let (evicted, deferred) = self.registry.evict_expired(&self.policy, now);

        if !evicted.is_empty() {
            log::info!("🧹 Retention pass evicted {} window indices", evicted.len());
            for key in &evicted {
                log::debug!("   ├─ evicted {}", key);
            }
        }
        if !deferred.is_empty() {
            log::warn!(
                "⚠️  Retention pass deferred {} pinned window indices",
                deferred.len()
            );
        }

        RetentionReport { evicted, deferred }
    }
}
