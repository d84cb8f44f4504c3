//! Core value types shared by every ranking component
//!
//! Scores are stored as fixed-point integers (micro-points) so that equal submissions
//! always compare equal and rank order never depends on float rounding.

use crate::error::{RankingError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Fixed-point scale: one point is stored as 1_000_000 micro-points.
pub const SCORE_SCALE: i64 = 1_000_000;

/// Largest magnitude accepted from raw input, in micro-points.
///
/// Leaves headroom so a cumulative sum over many games cannot wrap silently.
const MAX_INPUT_MICROS: i64 = i64::MAX / 4;

/// Opaque participant identifier, unique within an index.
pub type MemberId = String;

/// Identifier of a registered game.
pub type GameId = String;

/// Source of "now" for retention checks and event timestamps.
///
/// Injected so tests can pin time; production uses [`system_clock`].
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

/// Totally ordered fixed-point score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Score(i64);

impl Score {
    pub const ZERO: Score = Score(0);

    /// Build a score from its raw micro-point representation.
    pub const fn from_micros(micros: i64) -> Self {
        Score(micros)
    }

    /// Whole points, for tests and configuration.
    pub const fn from_points(points: i64) -> Self {
        Score(points * SCORE_SCALE)
    }

    /// Convert a raw submitted value.
    ///
    /// Returns `InvalidScore` for NaN, ±infinity, or values too large for the
    /// fixed-point range.
    pub fn from_f64(value: f64) -> Result<Self> {
        if !value.is_finite() {
            return Err(RankingError::InvalidScore {
                value,
                reason: "score must be finite",
            });
        }

        let scaled = (value * SCORE_SCALE as f64).round();
        if !scaled.is_finite() || scaled.abs() > MAX_INPUT_MICROS as f64 {
            return Err(RankingError::InvalidScore {
                value,
                reason: "score outside fixed-point range",
            });
        }

        Ok(Score(scaled as i64))
    }

    pub const fn micros(self) -> i64 {
        self.0
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / SCORE_SCALE as f64
    }

    pub fn checked_add(self, other: Score) -> Option<Score> {
        self.0.checked_add(other.0).map(Score)
    }

    pub fn checked_sub(self, other: Score) -> Option<Score> {
        self.0.checked_sub(other.0).map(Score)
    }

    pub fn saturating_add(self, other: Score) -> Score {
        Score(self.0.saturating_add(other.0))
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl TryFrom<f64> for Score {
    type Error = RankingError;

    fn try_from(value: f64) -> Result<Self> {
        Score::from_f64(value)
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let whole = abs / SCORE_SCALE as u64;
        let frac = abs % SCORE_SCALE as u64;
        if frac == 0 {
            write!(f, "{}{}", sign, whole)
        } else {
            let digits = format!("{:06}", frac);
            write!(f, "{}{}.{}", sign, whole, digits.trim_end_matches('0'))
        }
    }
}

/// One incoming score submission.
///
/// Ephemeral: it mutates index state and is then handed back alongside the
/// `SubmitResult` for an external history store to record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreUpdate {
    pub member: MemberId,
    pub game: GameId,
    pub raw_score: f64,
    pub submitted_at: DateTime<Utc>,
}

impl ScoreUpdate {
    pub fn new(
        member: impl Into<MemberId>,
        game: impl Into<GameId>,
        raw_score: f64,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            member: member.into(),
            game: game.into(),
            raw_score,
            submitted_at,
        }
    }
}

/// A member's position in one index.
///
/// `rank` is 1-based and sequential. `changed` reports whether the submission that
/// produced this entry altered the stored value; query results always carry `false`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankEntry {
    pub member: MemberId,
    pub rank: usize,
    pub score: Score,
    pub changed: bool,
}

/// Outcome of one ranking transaction.
///
/// This is the payload an external history store persists next to the original
/// `ScoreUpdate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResult {
    pub per_game_changed: bool,
    pub per_game_rank: RankEntry,
    /// `None` only while the member's global entry is missing and awaiting reconciliation.
    pub global_rank: Option<RankEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_f64_rejects_non_finite() {
        assert!(matches!(
            Score::from_f64(f64::NAN),
            Err(RankingError::InvalidScore { .. })
        ));
        assert!(Score::from_f64(f64::INFINITY).is_err());
        assert!(Score::from_f64(f64::NEG_INFINITY).is_err());
        assert!(Score::from_f64(1e300).is_err());
    }

    #[test]
    fn test_fixed_point_is_stable() {
        let a = Score::from_f64(0.1 + 0.2).unwrap();
        let b = Score::from_f64(0.3).unwrap();
        assert_eq!(a, b);
        assert_eq!(Score::from_f64(50.0).unwrap(), Score::from_points(50));
    }

    #[test]
    fn test_display() {
        assert_eq!(Score::from_points(160).to_string(), "160");
        assert_eq!(Score::from_f64(-2.5).unwrap().to_string(), "-2.5");
        assert_eq!(Score::from_micros(1).to_string(), "0.000001");
    }
}
