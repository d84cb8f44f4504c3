//! Score update policies
//!
//! A policy decides, for one index, whether an incoming submission changes the
//! member's stored value. It never mutates anything itself: `evaluate` returns a
//! `PolicyOutcome` that the transaction applies once every index has been planned.

use crate::error::{RankingError, Result};
use crate::index::MemberSlot;
use crate::types::Score;
use serde::{Deserialize, Serialize};

/// Rule selected per leaderboard scope at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreUpdatePolicy {
    /// Keep the maximum. Equal scores are a no-op.
    #[default]
    BestOf,
    /// Add every submission to the stored value.
    Cumulative,
    /// Replace the stored value unless the submission is older than the last write.
    LastWriteWins,
}

/// Planned effect of one submission on one index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyOutcome {
    pub applied: bool,
    /// Value to store when `applied`; the current value otherwise.
    pub next: Score,
    /// `next - current` (absent counts as zero); zero on a no-op.
    pub delta: Score,
}

impl PolicyOutcome {
    fn no_op(current: Score) -> Self {
        Self {
            applied: false,
            next: current,
            delta: Score::ZERO,
        }
    }
}

impl ScoreUpdatePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScoreUpdatePolicy::BestOf => "best_of",
            ScoreUpdatePolicy::Cumulative => "cumulative",
            ScoreUpdatePolicy::LastWriteWins => "last_write_wins",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "best_of" | "best" | "max" => Some(ScoreUpdatePolicy::BestOf),
            "cumulative" | "sum" => Some(ScoreUpdatePolicy::Cumulative),
            "last_write_wins" | "lww" | "latest" => Some(ScoreUpdatePolicy::LastWriteWins),
            _ => None,
        }
    }

    /// Whether resubmitting the same update is harmless.
    pub fn is_idempotent(&self) -> bool {
        !matches!(self, ScoreUpdatePolicy::Cumulative)
    }

    /// Plan the effect of `incoming` (submitted at `submitted_at_ms`) against the
    /// member's current slot in one index.
    ///
    /// Fails with `InvalidScore` only when the resulting value would leave the
    /// fixed-point range, which can happen for cumulative scopes.
    pub fn evaluate(
        &self,
        current: Option<&MemberSlot>,
        incoming: Score,
        submitted_at_ms: i64,
    ) -> Result<PolicyOutcome> {
        let stored = current.map(|slot| slot.score);
        let base = stored.unwrap_or(Score::ZERO);

        let next = match (self, current) {
            (ScoreUpdatePolicy::BestOf, Some(slot)) if incoming <= slot.score => {
                return Ok(PolicyOutcome::no_op(slot.score));
            }
            (ScoreUpdatePolicy::BestOf, _) => incoming,
            (ScoreUpdatePolicy::Cumulative, _) => {
                base.checked_add(incoming).ok_or(RankingError::InvalidScore {
                    value: incoming.as_f64(),
                    reason: "cumulative score overflow",
                })?
            }
            (ScoreUpdatePolicy::LastWriteWins, Some(slot)) if submitted_at_ms < slot.last_write => {
                return Ok(PolicyOutcome::no_op(slot.score));
            }
            (ScoreUpdatePolicy::LastWriteWins, _) => incoming,
        };

        let delta = next.checked_sub(base).ok_or(RankingError::InvalidScore {
            value: incoming.as_f64(),
            reason: "score delta overflow",
        })?;

        Ok(PolicyOutcome {
            applied: true,
            next,
            delta,
        })
    }
}
