use thiserror::Error;

pub type Result<T> = std::result::Result<T, RankingError>;

/// Errors surfaced by the ranking engine.
///
/// Input-validation errors (`InvalidScore`, `GameNotFound`) are always raised before any
/// index is touched. `TransientFailure` is safe to retry for `BestOf` and `LastWriteWins`
/// scopes; callers of `Cumulative` scopes must dedupe retries themselves.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RankingError {
    #[error("invalid score {value}: {reason}")]
    InvalidScore { value: f64, reason: &'static str },

    #[error("game {game} is not registered")]
    GameNotFound { game: String },

    #[error("member {member} not found")]
    MemberNotFound { member: String },

    #[error("reconciliation conflict for {member}: snapshot version {expected}, current {actual}")]
    ReconciliationConflict {
        member: String,
        expected: u64,
        actual: u64,
    },

    #[error("member {member} still locked after {attempts} attempts, retry later")]
    TransientFailure { member: String, attempts: u32 },
}

impl RankingError {
    /// Whether the caller may resubmit the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RankingError::TransientFailure { .. } | RankingError::ReconciliationConflict { .. }
        )
    }
}
