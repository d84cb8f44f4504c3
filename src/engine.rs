//! LeaderboardEngine - owns every index and wires the components together
//!
//! ## Architecture
//!
//! ```text
//! ScoreUpdate
//!     ↓
//! LeaderboardEngine::submit()
//!     ↓
//! RankingTransaction (member lock → plan → apply)
//!     ├─ per-game index      (game policy)
//!     ├─ window indices      (window policy, one per active period)
//!     └─ GlobalAggregator    (additive, sum of per-game contributions)
//!     ↓
//! ChangeEventEmitter → ChangeSink
//! ```
//!
//! Reads go through `queries()`. Retention and reconciliation are explicit calls here and
//! are also driven on intervals by `pipeline::scheduler`.

use crate::aggregator::{GlobalAggregator, ReconcileReport};
use crate::catalog::GameCatalog;
use crate::config::EngineConfig;
use crate::error::{RankingError, Result};
use crate::events::{ChangeEventEmitter, ChangeKind, ChangeSink};
use crate::keyspace::IndexKey;
use crate::locks::MemberLocks;
use crate::query::RankQueryService;
use crate::registry::IndexRegistry;
use crate::retention::{RetentionPolicy, RetentionReport, WindowRetentionManager};
use crate::transaction::RankingTransaction;
use crate::types::{system_clock, Clock, ScoreUpdate, SubmitResult};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Snapshot of engine activity counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    pub submissions: u64,
    /// Submissions that changed the per-game index.
    pub applied: u64,
    /// Accepted submissions that left the per-game index unchanged.
    pub no_ops: u64,
    /// Rejected with `InvalidScore` or `GameNotFound`.
    pub rejected: u64,
    pub transient_failures: u64,
    pub reconcile_corrections: u64,
    pub events_emitted: u64,
    pub events_dropped: u64,
    pub live_indices: usize,
}

#[derive(Debug, Default)]
struct Counters {
    submissions: AtomicU64,
    applied: AtomicU64,
    no_ops: AtomicU64,
    rejected: AtomicU64,
    transient_failures: AtomicU64,
}

/// Thread-safe entry point; share it behind an `Arc`.
pub struct LeaderboardEngine {
    config: Arc<EngineConfig>,
    registry: Arc<IndexRegistry>,
    locks: Arc<MemberLocks>,
    emitter: Arc<ChangeEventEmitter>,
    aggregator: Arc<GlobalAggregator>,
    transaction: RankingTransaction,
    queries: RankQueryService,
    retention: WindowRetentionManager,
    counters: Counters,
    clock: Clock,
}

impl LeaderboardEngine {
    /// Create an engine using the system clock.
    pub fn new(config: EngineConfig, catalog: Arc<dyn GameCatalog>, sink: Arc<dyn ChangeSink>) -> Self {
        Self::with_clock(config, catalog, sink, system_clock())
    }

    /// Create an engine with a custom clock (for deterministic retention in tests).
    pub fn with_clock(
        config: EngineConfig,
        catalog: Arc<dyn GameCatalog>,
        sink: Arc<dyn ChangeSink>,
        clock: Clock,
    ) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(IndexRegistry::new(config.tie_break));
        let locks = Arc::new(MemberLocks::new(
            config.lock_stripes,
            config.lock_retries,
            config.lock_backoff,
        ));
        let emitter = Arc::new(ChangeEventEmitter::new(sink));
        let aggregator = Arc::new(GlobalAggregator::new(
            registry.clone(),
            locks.clone(),
            emitter.clone(),
        ));
        let policy = RetentionPolicy::new(config.retention);

        let transaction = RankingTransaction::new(
            config.clone(),
            catalog,
            registry.clone(),
            locks.clone(),
            aggregator.clone(),
            emitter.clone(),
        );
        let queries = RankQueryService::new(registry.clone(), policy, clock.clone());
        let retention = WindowRetentionManager::new(registry.clone(), policy);

        log::info!(
            "🏁 Leaderboard engine ready | game policy: {} | window policy: {} | windows: {:?} | retention: {}d | tie-break: {}",
            config.game_policy.as_str(),
            config.window_policy.as_str(),
            config.windows,
            config.retention.num_days(),
            config.tie_break.as_str()
        );

        Self {
            config,
            registry,
            locks,
            emitter,
            aggregator,
            transaction,
            queries,
            retention,
            counters: Counters::default(),
            clock,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Apply one score submission.
    pub fn submit(&self, update: &ScoreUpdate) -> Result<SubmitResult> {
        self.counters.submissions.fetch_add(1, Ordering::Relaxed);
        let now = (self.clock)();

        match self.transaction.execute(update, now) {
            Ok(result) => {
                let counter = if result.per_game_changed {
                    &self.counters.applied
                } else {
                    &self.counters.no_ops
                };
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(result)
            }
            Err(e) => {
                let counter = match e {
                    RankingError::TransientFailure { .. } => &self.counters.transient_failures,
                    _ => &self.counters.rejected,
                };
                counter.fetch_add(1, Ordering::Relaxed);
                log::debug!("submission rejected for {} in {}: {}", update.member, update.game, e);
                Err(e)
            }
        }
    }

    pub fn queries(&self) -> &RankQueryService {
        &self.queries
    }

    pub fn retention(&self) -> &WindowRetentionManager {
        &self.retention
    }

    pub fn aggregator(&self) -> &GlobalAggregator {
        &self.aggregator
    }

    /// Run one eager eviction pass at the engine clock's "now".
    pub fn run_retention(&self) -> RetentionReport {
        self.retention.run_pass((self.clock)())
    }

    pub fn reconcile(&self, game: &str) -> ReconcileReport {
        self.aggregator.reconcile(game, (self.clock)())
    }

    pub fn reconcile_all(&self) -> ReconcileReport {
        self.aggregator.reconcile_all((self.clock)())
    }

    /// Remove `member` from every index and drop its global contributions.
    ///
    /// Emits one `Removed` event per index the member was in. Returns the number of
    /// indices touched, or `MemberNotFound` if the member was nowhere.
    pub fn reset_member(&self, member: &str) -> Result<usize> {
        let now = (self.clock)();
        let _guard = self.locks.acquire(member)?;

        let mut removed = 0;
        for key in self.registry.keys() {
            if matches!(key, IndexKey::Global) {
                continue;
            }
            let Some(slot) = self.registry.get(&key) else {
                continue;
            };
            let mut index = slot.write();
            let Some(entry) = index.entry_of(member) else {
                continue;
            };
            index.remove(member);
            self.emitter.emit(&slot, entry, ChangeKind::Removed, now);
            removed += 1;
        }

        if self.aggregator.clear_member(member, now) {
            removed += 1;
        }

        if removed == 0 {
            return Err(RankingError::MemberNotFound {
                member: member.to_string(),
            });
        }

        log::info!("🗑️  Reset {} across {} indices", member, removed);
        Ok(removed)
    }

    pub(crate) fn member_locks(&self) -> &MemberLocks {
        &self.locks
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            submissions: self.counters.submissions.load(Ordering::Relaxed),
            applied: self.counters.applied.load(Ordering::Relaxed),
            no_ops: self.counters.no_ops.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            transient_failures: self.counters.transient_failures.load(Ordering::Relaxed),
            reconcile_corrections: self.aggregator.corrections(),
            events_emitted: self.emitter.emitted(),
            events_dropped: self.emitter.dropped(),
            live_indices: self.registry.len(),
        }
    }
}

impl std::fmt::Debug for LeaderboardEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderboardEngine")
            .field("config", &self.config)
            .field("indices", &self.registry.len())
            .finish()
    }
}
