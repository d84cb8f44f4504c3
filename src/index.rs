//! OrderedScoreIndex: member → score with logarithmic rank and range queries
//!
//! Each index keeps two views of the same data:
//! - `members`: member → `MemberSlot` for O(1) point lookups
//! - `order`: an order-statistics skip list keyed by `RankKey` for rank/select
//!
//! Both views are updated together in every mutating method, so a member appears at
//! most once and the two never disagree.

use crate::skiplist::RankedSkipList;
use crate::types::{RankEntry, Score};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

/// Secondary ordering applied between members with equal scores.
///
/// Whichever rule is configured, the member id is the final tie-break, so every member
/// has a distinct, reproducible rank (sequential ranking, never dense).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// The member who reached the score first ranks higher.
    #[default]
    EarliestSubmission,
    /// Lexicographically smaller member id ranks higher.
    MemberId,
}

impl TieBreak {
    pub fn as_str(&self) -> &'static str {
        match self {
            TieBreak::EarliestSubmission => "earliest_submission",
            TieBreak::MemberId => "member_id",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "earliest_submission" | "earliest" => Some(TieBreak::EarliestSubmission),
            "member_id" | "member" => Some(TieBreak::MemberId),
            _ => None,
        }
    }

    /// Secondary sort stamp stored for a score set at `at_ms`.
    pub(crate) fn stamp(&self, at_ms: i64) -> i64 {
        match self {
            TieBreak::EarliestSubmission => at_ms,
            TieBreak::MemberId => 0,
        }
    }
}

/// Skip-list key. Smaller keys rank higher: score descending, then stamp ascending,
/// then member ascending.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RankKey {
    score: Score,
    stamp: i64,
    member: Arc<str>,
}

impl Ord for RankKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .score
            .cmp(&self.score)
            .then_with(|| self.stamp.cmp(&other.stamp))
            .then_with(|| self.member.cmp(&other.member))
    }
}

impl PartialOrd for RankKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Per-member bookkeeping held alongside the ordered view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberSlot {
    pub score: Score,
    /// Tie-break stamp recorded when `score` last changed.
    pub stamp: i64,
    /// Most recent accepted write time (ms), used by last-write-wins scopes.
    pub last_write: i64,
}

/// Result of an `upsert`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Upsert {
    pub previous: Option<Score>,
    /// `true` when the stored score changed (or the member was inserted).
    pub applied: bool,
}

/// Ordered member → score index.
#[derive(Debug)]
pub struct OrderedScoreIndex {
    name: String,
    tie_break: TieBreak,
    members: HashMap<Arc<str>, MemberSlot>,
    order: RankedSkipList<RankKey>,
}

impl OrderedScoreIndex {
    pub fn new(name: impl Into<String>, tie_break: TieBreak) -> Self {
        Self {
            name: name.into(),
            tie_break,
            members: HashMap::new(),
            order: RankedSkipList::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tie_break(&self) -> TieBreak {
        self.tie_break
    }

    /// Set `member`'s score, recording `at_ms` as the write time.
    ///
    /// Writing the score a member already holds leaves its rank (and tie stamp)
    /// untouched and reports `applied = false`; the last-write time still advances.
    pub fn upsert(&mut self, member: &str, score: Score, at_ms: i64) -> Upsert {
        let existing = self
            .members
            .get_key_value(member)
            .map(|(shared, slot)| (shared.clone(), *slot));

        if let Some((shared, current)) = existing {
            let last_write = current.last_write.max(at_ms);
            if current.score == score {
                if let Some(slot) = self.members.get_mut(member) {
                    slot.last_write = last_write;
                }
                return Upsert {
                    previous: Some(current.score),
                    applied: false,
                };
            }

            let stamp = self.tie_break.stamp(at_ms);
            self.order.remove(&RankKey {
                score: current.score,
                stamp: current.stamp,
                member: shared.clone(),
            });
            self.order.insert(RankKey {
                score,
                stamp,
                member: shared.clone(),
            });
            self.members.insert(
                shared,
                MemberSlot {
                    score,
                    stamp,
                    last_write,
                },
            );

            return Upsert {
                previous: Some(current.score),
                applied: true,
            };
        }

        let shared: Arc<str> = Arc::from(member);
        let stamp = self.tie_break.stamp(at_ms);
        self.members.insert(
            shared.clone(),
            MemberSlot {
                score,
                stamp,
                last_write: at_ms,
            },
        );
        self.order.insert(RankKey {
            score,
            stamp,
            member: shared,
        });

        Upsert {
            previous: None,
            applied: true,
        }
    }

    /// Remove `member`. Returns whether it was present.
    pub fn remove(&mut self, member: &str) -> bool {
        match self.members.remove_entry(member) {
            Some((shared, slot)) => {
                self.order.remove(&RankKey {
                    score: slot.score,
                    stamp: slot.stamp,
                    member: shared,
                });
                true
            }
            None => false,
        }
    }

    pub fn score_of(&self, member: &str) -> Option<Score> {
        self.members.get(member).map(|slot| slot.score)
    }

    pub fn slot(&self, member: &str) -> Option<&MemberSlot> {
        self.members.get(member)
    }

    /// 1-based rank by descending score.
    pub fn rank_of(&self, member: &str) -> Option<usize> {
        let (shared, slot) = self.members.get_key_value(member)?;
        self.order.rank(&RankKey {
            score: slot.score,
            stamp: slot.stamp,
            member: shared.clone(),
        })
    }

    /// Rank and score of `member` as a query result (`changed = false`).
    pub fn entry_of(&self, member: &str) -> Option<RankEntry> {
        let rank = self.rank_of(member)?;
        let score = self.score_of(member)?;
        Some(RankEntry {
            member: member.to_string(),
            rank,
            score,
            changed: false,
        })
    }

    /// Entries with ranks in `[start_rank, end_rank]` (inclusive, 1-based).
    ///
    /// Ranks past the end are clipped; an empty or inverted range yields nothing.
    pub fn range(&self, start_rank: usize, end_rank: usize) -> Vec<RankEntry> {
        let start = start_rank.max(1);
        let end = end_rank.min(self.order.len());
        if start > end {
            return Vec::new();
        }

        self.order
            .iter_from(start)
            .take(end - start + 1)
            .zip(start..)
            .map(|(key, rank)| RankEntry {
                member: key.member.to_string(),
                rank,
                score: key.score,
                changed: false,
            })
            .collect()
    }

    /// The first `n` entries.
    pub fn top(&self, n: usize) -> Vec<RankEntry> {
        if n == 0 {
            return Vec::new();
        }
        self.range(1, n)
    }

    /// Walk in rank order, yielding `(member, score, tie stamp)`.
    ///
    /// Lazy: consuming the first `k` items costs O(k).
    pub fn iter_ranked(&self) -> impl Iterator<Item = (&str, Score, i64)> + '_ {
        self.order
            .iter()
            .map(|key| (key.member.as_ref(), key.score, key.stamp))
    }

    /// Unordered walk over every member and its bookkeeping.
    pub fn members(&self) -> impl Iterator<Item = (&str, &MemberSlot)> + '_ {
        self.members.iter().map(|(member, slot)| (member.as_ref(), slot))
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
