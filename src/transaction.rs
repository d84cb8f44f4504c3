//! RankingTransaction: one score submission applied to every affected index
//!
//! Execution is split in two phases, both inside the member's critical section:
//!
//! 1. **Plan**: evaluate the scope policy against every resolved index and compute the
//!    global delta. Any failure here (overflow) aborts with nothing written.
//! 2. **Apply**: write each index whose plan applies, emitting one change event per
//!    index that actually changed, then apply the global delta.
//!
//! Validation (`InvalidScore`, `GameNotFound`) runs before the lock is taken.

use crate::aggregator::GlobalAggregator;
use crate::catalog::GameCatalog;
use crate::config::EngineConfig;
use crate::error::{RankingError, Result};
use crate::events::{ChangeEventEmitter, ChangeKind};
use crate::keyspace::{window_keys, IndexKey};
use crate::locks::MemberLocks;
use crate::policy::{PolicyOutcome, ScoreUpdatePolicy};
use crate::registry::{IndexRegistry, SlotPin};
use crate::retention::RetentionPolicy;
use crate::types::{RankEntry, Score, ScoreUpdate, SubmitResult};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Shared collaborators every transaction runs against.
#[derive(Clone)]
pub struct RankingTransaction {
    config: Arc<EngineConfig>,
    catalog: Arc<dyn GameCatalog>,
    registry: Arc<IndexRegistry>,
    locks: Arc<MemberLocks>,
    aggregator: Arc<GlobalAggregator>,
    emitter: Arc<ChangeEventEmitter>,
    retention: RetentionPolicy,
}

/// Planned write to one index.
struct IndexPlan {
    pin: SlotPin,
    outcome: PolicyOutcome,
}

impl RankingTransaction {
    pub fn new(
        config: Arc<EngineConfig>,
        catalog: Arc<dyn GameCatalog>,
        registry: Arc<IndexRegistry>,
        locks: Arc<MemberLocks>,
        aggregator: Arc<GlobalAggregator>,
        emitter: Arc<ChangeEventEmitter>,
    ) -> Self {
        let retention = RetentionPolicy::new(config.retention);
        Self {
            config,
            catalog,
            registry,
            locks,
            aggregator,
            emitter,
            retention,
        }
    }

    /// Keys `update` touches at `now`: its per-game index, then every window that has
    /// not passed the retention horizon.
    pub fn resolve_keys(&self, update: &ScoreUpdate, now: DateTime<Utc>) -> (IndexKey, Vec<IndexKey>) {
        let windows = window_keys(&update.game, &self.config.windows, update.submitted_at)
            .into_iter()
            .filter(|key| {
                let expired = self.retention.is_expired(key, now);
                if expired {
                    log::debug!("skipping expired window {} for {}", key, update.member);
                }
                !expired
            })
            .collect();
        (IndexKey::game(update.game.as_str()), windows)
    }

    /// Run one submission to completion.
    pub fn execute(&self, update: &ScoreUpdate, now: DateTime<Utc>) -> Result<SubmitResult> {
        let score = Score::from_f64(update.raw_score)?;
        if !self.catalog.exists(&update.game) {
            return Err(RankingError::GameNotFound {
                game: update.game.clone(),
            });
        }

        let (game_key, windows) = self.resolve_keys(update, now);
        let member = update.member.as_str();
        let at_ms = update.submitted_at.timestamp_millis();

        let _guard = self.locks.acquire(member)?;

        // Pins are taken after the lock so a window resolved here stays live until
        // every write below has landed. A window swept while this transaction waited
        // for the lock is dropped rather than re-created.
        let game_policy = self.config.policy_for_game(&update.game);
        let game_plan = plan(self.registry.pin(&game_key), game_policy, member, score, at_ms)?;
        let window_plans = windows
            .iter()
            .filter_map(|key| {
                let pin = self.registry.pin_live(key, &self.retention, now);
                if pin.is_none() {
                    log::debug!("window {} expired before {} could pin it", key, member);
                }
                pin
            })
            .map(|pin| plan(pin, self.config.window_policy, member, score, at_ms))
            .collect::<Result<Vec<_>>>()?;

        let global_plan = if game_plan.outcome.applied {
            Some(
                self.aggregator
                    .plan_delta(member, &update.game, game_plan.outcome.next)?,
            )
        } else {
            None
        };

        // Nothing below can fail.
        let per_game_rank = self.apply(&game_plan, member, at_ms, now);
        for window in &window_plans {
            self.apply(window, member, at_ms, now);
        }

        let global_rank = match &global_plan {
            Some(plan) => self
                .aggregator
                .apply_delta(member, &update.game, plan, at_ms, now),
            None => self.aggregator.global_entry(member),
        };
        if global_rank.is_none() {
            log::warn!("{} has no global entry, awaiting reconciliation", member);
        }

        let per_game_rank = per_game_rank.ok_or_else(|| RankingError::MemberNotFound {
            member: member.to_string(),
        })?;

        log::debug!(
            "{} → {}: {} (changed={}, rank={}, windows={})",
            member,
            update.game,
            per_game_rank.score,
            per_game_rank.changed,
            per_game_rank.rank,
            window_plans.len()
        );

        Ok(SubmitResult {
            per_game_changed: per_game_rank.changed,
            per_game_rank,
            global_rank,
        })
    }

    /// Write one planned index and emit its change event. Returns the member's entry
    /// with `changed` set from the write.
    fn apply(&self, plan: &IndexPlan, member: &str, at_ms: i64, now: DateTime<Utc>) -> Option<RankEntry> {
        if !plan.outcome.applied {
            return plan.pin.read().entry_of(member);
        }

        let mut index = plan.pin.write();
        let upsert = index.upsert(member, plan.outcome.next, at_ms);
        let entry = index.entry_of(member)?;
        let entry = RankEntry {
            changed: upsert.applied,
            ..entry
        };
        if upsert.applied {
            self.emitter
                .emit(&plan.pin, entry.clone(), ChangeKind::Updated, now);
        }
        Some(entry)
    }
}

fn plan(
    pin: SlotPin,
    policy: ScoreUpdatePolicy,
    member: &str,
    score: Score,
    at_ms: i64,
) -> Result<IndexPlan> {
    let current = pin.read().slot(member).copied();
    let outcome = policy.evaluate(current.as_ref(), score, at_ms)?;
    Ok(IndexPlan { pin, outcome })
}

impl std::fmt::Debug for RankingTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RankingTransaction")
            .field("config", &self.config)
            .field("retention", &self.retention)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InMemoryCatalog;
    use crate::events::BufferedSink;
    use crate::index::TieBreak;
    use crate::keyspace::WindowKind;
    use std::time::Duration;

    struct Fixture {
        registry: Arc<IndexRegistry>,
        aggregator: Arc<GlobalAggregator>,
        sink: Arc<BufferedSink>,
        tx: RankingTransaction,
    }

    fn fixture(config: EngineConfig) -> Fixture {
        let config = Arc::new(config);
        let registry = Arc::new(IndexRegistry::new(config.tie_break));
        let locks = Arc::new(MemberLocks::new(16, 4, Duration::from_micros(10)));
        let sink = Arc::new(BufferedSink::new());
        let emitter = Arc::new(ChangeEventEmitter::new(sink.clone()));
        let aggregator = Arc::new(GlobalAggregator::new(
            registry.clone(),
            locks.clone(),
            emitter.clone(),
        ));
        let catalog = Arc::new(InMemoryCatalog::new(["g1", "g2"]));
        let tx = RankingTransaction::new(
            config,
            catalog,
            registry.clone(),
            locks,
            aggregator.clone(),
            emitter,
        );
        Fixture {
            registry,
            aggregator,
            sink,
            tx,
        }
    }

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn update(member: &str, game: &str, score: f64, when: &str) -> ScoreUpdate {
        ScoreUpdate::new(member, game, score, at(when))
    }

    const NOW: &str = "2026-10-17T12:00:00Z";

    #[test]
    fn test_first_submission_touches_every_index() {
        let f = fixture(EngineConfig::default());
        let result = f.tx.execute(&update("m", "g1", 50.0, NOW), at(NOW)).unwrap();

        assert!(result.per_game_changed);
        assert_eq!(result.per_game_rank.rank, 1);
        assert_eq!(result.global_rank.unwrap().score, Score::from_points(50));
        // game + daily + weekly + monthly + global
        assert_eq!(f.registry.len(), 5);
        assert_eq!(f.sink.drain().len(), 5);
    }

    #[test]
    fn test_window_best_is_independent_of_game_best() {
        let f = fixture(EngineConfig::default());
        f.tx.execute(&update("m", "g1", 90.0, "2026-10-16T12:00:00Z"), at(NOW)).unwrap();
        let result = f.tx.execute(&update("m", "g1", 40.0, NOW), at(NOW)).unwrap();

        assert!(!result.per_game_changed);
        let today = IndexKey::window("g1", WindowKind::Daily, at(NOW));
        assert_eq!(
            f.registry.get(&today).unwrap().read().score_of("m"),
            Some(Score::from_points(40))
        );
        assert_eq!(
            f.aggregator.global_entry("m").unwrap().score,
            Score::from_points(90)
        );
    }

    #[test]
    fn test_rejections_happen_before_any_write() {
        let f = fixture(EngineConfig::default());

        let err = f.tx.execute(&update("m", "g1", f64::NAN, NOW), at(NOW)).unwrap_err();
        assert!(matches!(err, RankingError::InvalidScore { .. }));

        let err = f.tx.execute(&update("m", "nope", 1.0, NOW), at(NOW)).unwrap_err();
        assert_eq!(err, RankingError::GameNotFound { game: "nope".into() });

        assert_eq!(f.registry.keys(), vec![IndexKey::global()]);
        assert!(f.sink.is_empty());
    }

    #[test]
    fn test_cumulative_overflow_leaves_state_untouched() {
        let config = EngineConfig {
            game_policy: ScoreUpdatePolicy::Cumulative,
            windows: Vec::new(),
            ..EngineConfig::default()
        };
        let f = fixture(config);
        let big = 2.0e12;

        for _ in 0..4 {
            f.tx.execute(&update("m", "g1", big, NOW), at(NOW)).unwrap();
        }
        let before = f.aggregator.global_entry("m").unwrap().score;
        f.sink.drain();

        let err = f.tx.execute(&update("m", "g1", big, NOW), at(NOW)).unwrap_err();
        assert!(matches!(err, RankingError::InvalidScore { .. }));
        assert_eq!(f.aggregator.global_entry("m").unwrap().score, before);
        assert!(f.sink.is_empty());
    }

    #[test]
    fn test_expired_windows_are_not_resolved() {
        let config = EngineConfig {
            retention: chrono::Duration::days(7),
            ..EngineConfig::default()
        };
        let f = fixture(config);
        let old = update("m", "g1", 10.0, "2026-10-01T12:00:00Z");

        let (_, windows) = f.tx.resolve_keys(&old, at(NOW));
        // Daily and weekly periods from Oct 1 ended over 7 days ago; October hasn't.
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].anchor().unwrap().kind(), WindowKind::Monthly);
    }

    #[test]
    fn test_last_write_wins_ignores_stale_submissions() {
        let config = EngineConfig {
            game_policy: ScoreUpdatePolicy::LastWriteWins,
            windows: Vec::new(),
            ..EngineConfig::default()
        };
        let f = fixture(config);
        f.tx.execute(&update("m", "g1", 30.0, NOW), at(NOW)).unwrap();
        let stale = f
            .tx
            .execute(&update("m", "g1", 99.0, "2026-10-17T11:00:00Z"), at(NOW))
            .unwrap();

        assert!(!stale.per_game_changed);
        assert_eq!(stale.per_game_rank.score, Score::from_points(30));
        assert_eq!(stale.global_rank.unwrap().score, Score::from_points(30));
    }

    #[test]
    fn test_tie_break_by_member_id() {
        let config = EngineConfig {
            tie_break: TieBreak::MemberId,
            ..EngineConfig::default()
        };
        let f = fixture(config);
        f.tx.execute(&update("zoe", "g1", 5.0, NOW), at(NOW)).unwrap();
        let adam = f.tx.execute(&update("adam", "g1", 5.0, NOW), at(NOW)).unwrap();
        assert_eq!(adam.per_game_rank.rank, 1);
    }

    #[test]
    fn test_swept_window_is_not_recreated() {
        let config = EngineConfig {
            retention: chrono::Duration::days(7),
            ..EngineConfig::default()
        };
        let f = fixture(config);
        let late = update("m", "g1", 10.0, "2026-10-10T12:00:00Z");

        // Resolved as live at the transaction's clock...
        let (_, windows) = f.tx.resolve_keys(&late, at(NOW));
        let daily = IndexKey::window("g1", WindowKind::Daily, at("2026-10-10T12:00:00Z"));
        assert!(windows.contains(&daily));

        // ...but a retention pass running a day later swept past it first.
        let retention = RetentionPolicy::new(chrono::Duration::days(7));
        f.registry.evict_expired(&retention, at("2026-10-18T12:00:00Z"));

        let result = f.tx.execute(&late, at(NOW)).unwrap();
        assert!(result.per_game_changed);
        assert!(f.registry.get(&daily).is_none());
        // The monthly window is still live and gets the write.
        let monthly = IndexKey::window("g1", WindowKind::Monthly, at("2026-10-10T12:00:00Z"));
        assert_eq!(
            f.registry.get(&monthly).unwrap().read().score_of("m"),
            Some(Score::from_points(10))
        );
    }
}
