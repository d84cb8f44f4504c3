//! Global aggregation: sum of per-game scores across games
//!
//! Two explicit code paths maintain the global index:
//!
//! 1. **Incremental** (`plan_delta` + `apply_delta`): called by a ranking transaction
//!    while it holds the member's critical section. The member's GlobalContribution for
//!    the game is replaced by the new per-game score and the difference is added to the
//!    member's global entry.
//!
//! 2. **Reconciliation** (`reconcile`, `reconcile_all`): recomputes a member's global
//!    score from the live per-game indices, rewriting contributions and the global
//!    entry. It corrects drift left by a transaction that died between its per-game
//!    write and its global write.
//!
//! ## Merge rule
//!
//! Every contribution record carries a version drawn from one monotonic counter.
//! Reconciliation snapshots the version, computes the exact sum without holding the
//! member lock, then takes the lock and writes only if the version is unchanged. A
//! changed version means a live transaction (or reset) got there first: the pass logs a
//! `ReconciliationConflict` and retries with a fresh snapshot. Records are never
//! dropped, only emptied, so a version can't be reused.

use crate::error::{RankingError, Result};
use crate::events::{ChangeEventEmitter, ChangeKind};
use crate::keyspace::IndexKey;
use crate::locks::{self, shard_for, MemberLocks};
use crate::registry::{IndexRegistry, IndexSlot};
use crate::types::{GameId, RankEntry, Score};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Attempts per member before reconciliation gives up on a busy member.
const MAX_RECONCILE_ATTEMPTS: u32 = 3;

/// Every GlobalContribution held for one member.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberContributions {
    /// game → value currently counted in the member's global score.
    pub per_game: HashMap<GameId, Score>,
    /// 0 means "no record yet".
    pub version: u64,
}

impl MemberContributions {
    /// Exact sum of contributions, `None` on overflow.
    pub fn total(&self) -> Option<Score> {
        self.per_game
            .values()
            .try_fold(Score::ZERO, |acc, value| acc.checked_add(*value))
    }
}

/// Global-index change computed before any index is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalPlan {
    pub old_contribution: Option<Score>,
    pub new_contribution: Score,
    pub delta: Score,
    pub next_global: Score,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub examined: usize,
    /// Members whose global entry was rewritten.
    pub corrected: usize,
    /// Version conflicts hit (each was retried).
    pub conflicts: usize,
    /// Members skipped after exhausting retries or lock attempts.
    pub failed: usize,
}

impl ReconcileReport {
    fn absorb(&mut self, other: MemberOutcome) {
        self.examined += 1;
        self.conflicts += other.conflicts;
        match other.result {
            Ok(true) => self.corrected += 1,
            Ok(false) => {}
            Err(_) => self.failed += 1,
        }
    }
}

struct MemberOutcome {
    conflicts: usize,
    result: Result<bool>,
}

pub struct GlobalAggregator {
    ledger: Vec<Mutex<HashMap<String, MemberContributions>>>,
    versions: AtomicU64,
    global: Arc<IndexSlot>,
    registry: Arc<IndexRegistry>,
    locks: Arc<MemberLocks>,
    emitter: Arc<ChangeEventEmitter>,
    corrections: AtomicU64,
}

impl GlobalAggregator {
    pub fn new(
        registry: Arc<IndexRegistry>,
        locks: Arc<MemberLocks>,
        emitter: Arc<ChangeEventEmitter>,
    ) -> Self {
        let shards = locks.stripe_count();
        Self {
            ledger: (0..shards).map(|_| Mutex::new(HashMap::new())).collect(),
            versions: AtomicU64::new(0),
            global: registry.get_or_create(&IndexKey::global()),
            registry,
            locks,
            emitter,
            corrections: AtomicU64::new(0),
        }
    }

    fn shard(&self, member: &str) -> &Mutex<HashMap<String, MemberContributions>> {
        &self.ledger[shard_for(member, self.ledger.len())]
    }

    fn next_version(&self) -> u64 {
        self.versions.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn global_slot(&self) -> &Arc<IndexSlot> {
        &self.global
    }

    /// Snapshot of a member's contribution record.
    pub fn contributions(&self, member: &str) -> Option<MemberContributions> {
        locks::lock(self.shard(member)).get(member).cloned()
    }

    pub fn contribution(&self, member: &str, game: &str) -> Option<Score> {
        locks::lock(self.shard(member))
            .get(member)
            .and_then(|record| record.per_game.get(game).copied())
    }

    pub fn global_entry(&self, member: &str) -> Option<RankEntry> {
        self.global.read().entry_of(member)
    }

    /// Total global entries rewritten by reconciliation since startup.
    pub fn corrections(&self) -> u64 {
        self.corrections.load(Ordering::Relaxed)
    }

    /// Plan the global change for `member` now contributing `new_contribution` from `game`.
    ///
    /// Caller must hold the member's critical section. Fails with `InvalidScore` if the
    /// new global value would overflow; nothing is written either way.
    pub fn plan_delta(&self, member: &str, game: &str, new_contribution: Score) -> Result<GlobalPlan> {
        let old_contribution = self.contribution(member, game);
        let delta = new_contribution
            .checked_sub(old_contribution.unwrap_or(Score::ZERO))
            .ok_or(RankingError::InvalidScore {
                value: new_contribution.as_f64(),
                reason: "global delta overflow",
            })?;

        let current = self.global.read().score_of(member).unwrap_or(Score::ZERO);
        let next_global = current.checked_add(delta).ok_or(RankingError::InvalidScore {
            value: new_contribution.as_f64(),
            reason: "global score overflow",
        })?;

        Ok(GlobalPlan {
            old_contribution,
            new_contribution,
            delta,
            next_global,
        })
    }

    /// Apply a planned delta: write the global entry, then record the new contribution.
    ///
    /// Caller must hold the member's critical section and must not have released it
    /// since `plan_delta`.
    pub fn apply_delta(
        &self,
        member: &str,
        game: &str,
        plan: &GlobalPlan,
        at_ms: i64,
        now: DateTime<Utc>,
    ) -> Option<RankEntry> {
        let entry = {
            let mut index = self.global.write();
            let upsert = index.upsert(member, plan.next_global, at_ms);
            let entry = index.entry_of(member).map(|entry| RankEntry {
                changed: upsert.applied,
                ..entry
            });
            if upsert.applied {
                if let Some(entry) = &entry {
                    self.emitter
                        .emit(&self.global, entry.clone(), ChangeKind::Updated, now);
                }
            }
            entry
        };

        let version = self.next_version();
        let mut ledger = locks::lock(self.shard(member));
        let record = ledger.entry(member.to_string()).or_default();
        record.per_game.insert(game.to_string(), plan.new_contribution);
        record.version = version;

        log::debug!(
            "global delta {} for {} from {} (contribution {:?} → {})",
            plan.delta,
            member,
            game,
            plan.old_contribution,
            plan.new_contribution
        );

        entry
    }

    /// Drop every contribution for `member` and its global entry.
    ///
    /// Caller must hold the member's critical section. Returns whether anything existed.
    pub(crate) fn clear_member(&self, member: &str, now: DateTime<Utc>) -> bool {
        let had_record = {
            let version = self.next_version();
            let mut ledger = locks::lock(self.shard(member));
            match ledger.get_mut(member) {
                Some(record) => {
                    let had = !record.per_game.is_empty();
                    record.per_game.clear();
                    record.version = version;
                    had
                }
                None => false,
            }
        };

        let mut index = self.global.write();
        let entry = index.entry_of(member);
        let removed = index.remove(member);
        if let Some(entry) = entry {
            self.emitter.emit(&self.global, entry, ChangeKind::Removed, now);
        }

        had_record || removed
    }

    /// Recompute every member with a contribution from (or an entry in) `game`.
    pub fn reconcile(&self, game: &str, now: DateTime<Utc>) -> ReconcileReport {
        let mut members = BTreeSet::new();
        if let Some(slot) = self.registry.get(&IndexKey::game(game)) {
            members.extend(slot.read().members().map(|(member, _)| member.to_string()));
        }
        for shard in &self.ledger {
            let ledger = locks::lock(shard);
            members.extend(
                ledger
                    .iter()
                    .filter(|(_, record)| record.per_game.contains_key(game))
                    .map(|(member, _)| member.clone()),
            );
        }

        self.reconcile_members(members, now, Some(game))
    }

    /// Recompute every member known to any per-game index, the ledger, or the global index.
    pub fn reconcile_all(&self, now: DateTime<Utc>) -> ReconcileReport {
        let mut members = BTreeSet::new();
        for key in self.registry.game_keys() {
            if let Some(slot) = self.registry.get(&key) {
                members.extend(slot.read().members().map(|(member, _)| member.to_string()));
            }
        }
        for shard in &self.ledger {
            members.extend(locks::lock(shard).keys().cloned());
        }
        members.extend(
            self.global
                .read()
                .members()
                .map(|(member, _)| member.to_string()),
        );

        self.reconcile_members(members, now, None)
    }

    fn reconcile_members(
        &self,
        members: BTreeSet<String>,
        now: DateTime<Utc>,
        scope: Option<&str>,
    ) -> ReconcileReport {
        let started = std::time::Instant::now();
        let mut report = ReconcileReport::default();

        for member in &members {
            report.absorb(self.reconcile_member(member, now));
        }

        self.corrections
            .fetch_add(report.corrected as u64, Ordering::Relaxed);

        let label = scope.map(|g| format!("game {}", g)).unwrap_or_else(|| "all games".to_string());
        if report.corrected > 0 || report.failed > 0 {
            log::warn!(
                "🔧 Reconciled {}: {} members, {} corrected, {} conflicts, {} failed | {}ms",
                label,
                report.examined,
                report.corrected,
                report.conflicts,
                report.failed,
                started.elapsed().as_millis()
            );
        } else {
            log::info!(
                "✅ Reconciled {}: {} members, no drift | {}ms",
                label,
                report.examined,
                started.elapsed().as_millis()
            );
        }

        report
    }

    /// Exact per-game values for `member`, read from the live per-game indices.
    fn per_game_scores(&self, member: &str) -> HashMap<GameId, Score> {
        self.registry
            .game_keys()
            .into_iter()
            .filter_map(|key| {
                let slot = self.registry.get(&key)?;
                let score = slot.read().score_of(member)?;
                Some((key.game_id()?.to_string(), score))
            })
            .collect()
    }

    fn reconcile_member(&self, member: &str, now: DateTime<Utc>) -> MemberOutcome {
        let mut conflicts = 0;

        for attempt in 1..=MAX_RECONCILE_ATTEMPTS {
            let expected = self.contributions(member).map(|r| r.version).unwrap_or(0);
            let per_game = self.per_game_scores(member);
            let fresh = MemberContributions {
                per_game,
                version: expected,
            };
            let Some(total) = fresh.total() else {
                log::error!("global score overflow while reconciling {}", member);
                return MemberOutcome {
                    conflicts,
                    result: Err(RankingError::InvalidScore {
                        value: f64::INFINITY,
                        reason: "global score overflow",
                    }),
                };
            };

            let _guard = match self.locks.acquire(member) {
                Ok(guard) => guard,
                Err(e) => {
                    log::warn!("reconcile skipped {}: {}", member, e);
                    return MemberOutcome {
                        conflicts,
                        result: Err(e),
                    };
                }
            };

            let actual = self.contributions(member).map(|r| r.version).unwrap_or(0);
            if actual != expected {
                conflicts += 1;
                let conflict = RankingError::ReconciliationConflict {
                    member: member.to_string(),
                    expected,
                    actual,
                };
                log::warn!("{} (attempt {}/{})", conflict, attempt, MAX_RECONCILE_ATTEMPTS);
                if attempt == MAX_RECONCILE_ATTEMPTS {
                    return MemberOutcome {
                        conflicts,
                        result: Err(conflict),
                    };
                }
                continue;
            }

            let corrected = self.overwrite(member, fresh.per_game, total, now);
            return MemberOutcome {
                conflicts,
                result: Ok(corrected),
            };
        }

        MemberOutcome {
            conflicts,
            result: Ok(false),
        }
    }

    /// Write reconciled state. Caller holds the member lock with a verified version.
    fn overwrite(
        &self,
        member: &str,
        per_game: HashMap<GameId, Score>,
        total: Score,
        now: DateTime<Utc>,
    ) -> bool {
        let empty = per_game.is_empty();
        {
            let version = self.next_version();
            let mut ledger = locks::lock(self.shard(member));
            let record = ledger.entry(member.to_string()).or_default();
            record.per_game = per_game;
            record.version = version;
        }

        let mut index = self.global.write();
        if empty {
            let entry = index.entry_of(member);
            if index.remove(member) {
                if let Some(entry) = entry {
                    self.emitter.emit(&self.global, entry, ChangeKind::Removed, now);
                }
                return true;
            }
            return false;
        }

        if index.score_of(member) == Some(total) {
            return false;
        }

        log::debug!(
            "reconcile {}: global {:?} → {}",
            member,
            index.score_of(member),
            total
        );
        index.upsert(member, total, now.timestamp_millis());
        if let Some(entry) = index.entry_of(member) {
            self.emitter.emit(
                &self.global,
                RankEntry {
                    changed: true,
                    ..entry
                },
                ChangeKind::Updated,
                now,
            );
        }
        true
    }
}

impl std::fmt::Debug for GlobalAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalAggregator")
            .field("shards", &self.ledger.len())
            .field("corrections", &self.corrections())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BufferedSink;
    use crate::index::TieBreak;
    use std::time::Duration;

    struct Fixture {
        registry: Arc<IndexRegistry>,
        locks: Arc<MemberLocks>,
        sink: Arc<BufferedSink>,
        aggregator: GlobalAggregator,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(IndexRegistry::new(TieBreak::MemberId));
        let locks = Arc::new(MemberLocks::new(8, 4, Duration::from_micros(10)));
        let sink = Arc::new(BufferedSink::new());
        let emitter = Arc::new(ChangeEventEmitter::new(sink.clone()));
        let aggregator = GlobalAggregator::new(registry.clone(), locks.clone(), emitter);
        Fixture {
            registry,
            locks,
            sink,
            aggregator,
        }
    }

    fn pts(points: i64) -> Score {
        Score::from_points(points)
    }

    /// Per-game write plus global delta, the way a transaction does it.
    fn submit(f: &Fixture, member: &str, game: &str, points: i64) {
        let _guard = f.locks.acquire(member).unwrap();
        f.registry
            .get_or_create(&IndexKey::game(game))
            .write()
            .upsert(member, pts(points), 0);
        let plan = f.aggregator.plan_delta(member, game, pts(points)).unwrap();
        f.aggregator.apply_delta(member, game, &plan, 0, Utc::now());
    }

    #[test]
    fn test_delta_replaces_contribution() {
        let f = fixture();
        submit(&f, "m", "g1", 50);
        submit(&f, "m", "g2", 70);
        submit(&f, "m", "g1", 90);

        assert_eq!(f.aggregator.contribution("m", "g1"), Some(pts(90)));
        assert_eq!(f.aggregator.global_entry("m").unwrap().score, pts(160));
        assert_eq!(f.aggregator.contributions("m").unwrap().total(), Some(pts(160)));
        assert_eq!(f.sink.drain().len(), 3);
    }

    #[test]
    fn test_plan_reports_exact_delta() {
        let f = fixture();
        submit(&f, "m", "g1", 50);
        let plan = f.aggregator.plan_delta("m", "g1", pts(80)).unwrap();
        assert_eq!(plan.old_contribution, Some(pts(50)));
        assert_eq!(plan.delta, pts(30));
        assert_eq!(plan.next_global, pts(80));
    }

    #[test]
    fn test_reconcile_repairs_interrupted_transaction() {
        let f = fixture();
        submit(&f, "m", "g1", 50);

        // Per-game write landed but the global step never ran.
        f.registry
            .get_or_create(&IndexKey::game("g2"))
            .write()
            .upsert("m", pts(70), 0);
        assert_eq!(f.aggregator.global_entry("m").unwrap().score, pts(50));

        let report = f.aggregator.reconcile("g2", Utc::now());
        assert_eq!(report.examined, 1);
        assert_eq!(report.corrected, 1);
        assert_eq!(f.aggregator.global_entry("m").unwrap().score, pts(120));
        assert_eq!(f.aggregator.contribution("m", "g2"), Some(pts(70)));

        // Idempotent: a second pass changes nothing.
        let again = f.aggregator.reconcile_all(Utc::now());
        assert_eq!(again.corrected, 0);
        assert_eq!(f.aggregator.global_entry("m").unwrap().score, pts(120));
    }

    #[test]
    fn test_reconcile_all_drops_orphaned_global_entries() {
        let f = fixture();
        f.aggregator.global_slot().write().upsert("ghost", pts(10), 0);

        let report = f.aggregator.reconcile_all(Utc::now());
        assert_eq!(report.corrected, 1);
        assert!(f.aggregator.global_entry("ghost").is_none());
        assert_eq!(f.aggregator.corrections(), 1);
    }

    #[test]
    fn test_reconcile_gives_up_on_busy_member() {
        let f = fixture();
        submit(&f, "m", "g1", 5);

        let _held = f.locks.acquire("m").unwrap();
        let report = f.aggregator.reconcile_all(Utc::now());
        assert_eq!(report.failed, 1);
        assert_eq!(report.corrected, 0);
    }

    #[test]
    fn test_clear_member() {
        let f = fixture();
        submit(&f, "m", "g1", 5);
        f.sink.drain();

        assert!(f.aggregator.clear_member("m", Utc::now()));
        assert!(f.aggregator.global_entry("m").is_none());
        assert_eq!(f.aggregator.contributions("m").unwrap().per_game.len(), 0);

        let events = f.sink.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ChangeKind::Removed);
    }
}
