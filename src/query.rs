//! Read-side queries over live indices
//!
//! Single-index calls hold one read lock for one O(log N + k) lookup; `union_top_n`
//! holds the read locks of all its indices at once. Window keys past the retention horizon are reported as absent
//! even before the retention pass has evicted them.

use crate::index::OrderedScoreIndex;
use crate::keyspace::IndexKey;
use crate::registry::{IndexRegistry, IndexSlot};
use crate::retention::RetentionPolicy;
use crate::types::{Clock, RankEntry, Score};
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeSet, BinaryHeap, HashSet};
use std::sync::Arc;

/// How `union_top_n` folds one member's scores from several indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombineRule {
    Sum,
    Max,
}

/// One member's folded score across a union. Ordered like the index itself: score
/// descending, then tie stamp ascending, then member ascending (smaller is better).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Combined<'a> {
    score: Score,
    stamp: i64,
    member: &'a str,
}

impl Ord for Combined<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .score
            .cmp(&self.score)
            .then_with(|| self.stamp.cmp(&other.stamp))
            .then_with(|| self.member.cmp(other.member))
    }
}

impl PartialOrd for Combined<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<'a> From<(&'a str, Score, i64)> for Combined<'a> {
    fn from((member, score, stamp): (&'a str, Score, i64)) -> Self {
        Self {
            score,
            stamp,
            member,
        }
    }
}

/// k-way merge of the ranked walks. A member's first appearance carries its best
/// score (and the earliest stamp among equal bests), so the merge order is already
/// the combined order. Stops after `n` distinct members.
fn merge_max<'a>(indices: &[&'a OrderedScoreIndex], n: usize) -> Vec<Combined<'a>> {
    let mut cursors: Vec<_> = indices.iter().copied().map(OrderedScoreIndex::iter_ranked).collect();
    let mut heads = BinaryHeap::with_capacity(cursors.len());
    for (i, cursor) in cursors.iter_mut().enumerate() {
        if let Some(head) = cursor.next() {
            heads.push(Reverse((Combined::from(head), i)));
        }
    }

    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(n);
    while let Some(Reverse((best, i))) = heads.pop() {
        if let Some(next) = cursors[i].next() {
            heads.push(Reverse((Combined::from(next), i)));
        }
        if seen.insert(best.member) {
            out.push(best);
            if out.len() == n {
                break;
            }
        }
    }
    out
}

/// Exact sum for `member` across every index, with its earliest stamp.
fn sum_of<'a>(indices: &[&'a OrderedScoreIndex], member: &'a str) -> Combined<'a> {
    let mut score = Score::ZERO;
    let mut stamp = i64::MAX;
    for index in indices {
        if let Some(slot) = index.slot(member) {
            score = score.saturating_add(slot.score);
            stamp = stamp.min(slot.stamp);
        }
    }
    Combined {
        score,
        stamp,
        member,
    }
}

/// Threshold pass: walk every ranked list in lockstep, total each newly seen member
/// with point lookups, and stop once the `n`-th best total beats anything an unseen
/// member could still reach.
///
/// An unseen member scores at most the current head of each live list, or zero where
/// it is absent, so the bound is the sum of `max(head, 0)` over unfinished lists.
fn threshold_sum<'a>(indices: &[&'a OrderedScoreIndex], n: usize) -> Vec<Combined<'a>> {
    let mut cursors: Vec<_> = indices.iter().copied().map(OrderedScoreIndex::iter_ranked).collect();
    let mut heads: Vec<Option<Score>> = vec![None; cursors.len()];
    let mut seen = HashSet::new();
    let mut best: BTreeSet<Combined<'a>> = BTreeSet::new();

    loop {
        let mut advanced = false;
        for (cursor, head) in cursors.iter_mut().zip(heads.iter_mut()) {
            let Some((member, score, _)) = cursor.next() else {
                *head = None;
                continue;
            };
            advanced = true;
            *head = Some(score);
            if seen.insert(member) {
                best.insert(sum_of(indices, member));
                if best.len() > n {
                    best.pop_last();
                }
            }
        }
        if !advanced {
            break;
        }

        if best.len() == n {
            let bound = heads
                .iter()
                .flatten()
                .fold(Score::ZERO, |acc, head| acc.saturating_add((*head).max(Score::ZERO)));
            if best.last().is_some_and(|nth| nth.score > bound) {
                break;
            }
        }
    }

    best.into_iter().collect()
}

#[derive(Clone)]
pub struct RankQueryService {
    registry: Arc<IndexRegistry>,
    retention: RetentionPolicy,
    clock: Clock,
}

impl RankQueryService {
    pub fn new(registry: Arc<IndexRegistry>, retention: RetentionPolicy, clock: Clock) -> Self {
        Self {
            registry,
            retention,
            clock,
        }
    }

    /// The slot behind `key`, unless it is missing or expired.
    fn live(&self, key: &IndexKey) -> Option<Arc<IndexSlot>> {
        if self.retention.is_expired(key, (self.clock)()) {
            return None;
        }
        self.registry.get(key)
    }

    /// Highest-ranked `n` entries; fewer when the index is smaller.
    pub fn top_n(&self, key: &IndexKey, n: usize) -> Vec<RankEntry> {
        match self.live(key) {
            Some(slot) => {
                let index = slot.read();
                index.top(n)
            }
            None => Vec::new(),
        }
    }

    pub fn rank_of(&self, key: &IndexKey, member: &str) -> Option<RankEntry> {
        self.live(key)?.read().entry_of(member)
    }

    pub fn score_of(&self, key: &IndexKey, member: &str) -> Option<Score> {
        self.live(key)?.read().score_of(member)
    }

    pub fn size(&self, key: &IndexKey) -> usize {
        match self.live(key) {
            Some(slot) => {
                let index = slot.read();
                index.len()
            }
            None => 0,
        }
    }

    /// Ranks `[max(1, rank - before), rank + after]` around `member`; empty if absent.
    pub fn around(&self, key: &IndexKey, member: &str, before: usize, after: usize) -> Vec<RankEntry> {
        let Some(slot) = self.live(key) else {
            return Vec::new();
        };
        let index = slot.read();
        match index.rank_of(member) {
            Some(rank) => index.range(
                rank.saturating_sub(before).max(1),
                rank.saturating_add(after),
            ),
            None => Vec::new(),
        }
    }

    /// Top `n` of a combined ranking over several indices.
    ///
    /// Absent and expired keys contribute nothing; repeated keys count once. Each
    /// member's scores are folded with `rule` and ranked in the same order the indices
    /// use (score, then the configured tie-break, then member id). `Max` costs
    /// O(n·k log k) for k indices; `Sum` stops as soon as no unseen member can enter
    /// the top `n`, so it only walks as deep as the lists disagree.
    ///
    /// The read locks of every index are held together for the call. Writers only
    /// ever hold one index lock at a time, so this cannot deadlock.
    pub fn union_top_n(&self, keys: &[IndexKey], n: usize, rule: CombineRule) -> Vec<RankEntry> {
        if n == 0 {
            return Vec::new();
        }

        let mut distinct = HashSet::new();
        let slots: Vec<Arc<IndexSlot>> = keys
            .iter()
            .filter(|key| distinct.insert(*key))
            .filter_map(|key| {
                let slot = self.live(key);
                if slot.is_none() {
                    log::debug!("union skipping absent index {}", key);
                }
                slot
            })
            .collect();
        let guards: Vec<_> = slots.iter().map(|slot| slot.read()).collect();
        let indices: Vec<&OrderedScoreIndex> = guards.iter().map(|guard| &**guard).collect();

        let ranked = match rule {
            CombineRule::Max => merge_max(&indices, n),
            CombineRule::Sum => threshold_sum(&indices, n),
        };

        let entries = ranked
            .into_iter()
            .zip(1..)
            .map(|(combined, rank)| RankEntry {
                member: combined.member.to_string(),
                rank,
                score: combined.score,
                changed: false,
            })
            .collect();
        entries
    }
}

impl std::fmt::Debug for RankQueryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RankQueryService")
            .field("retention", &self.retention)
            .finish()
    }
}
