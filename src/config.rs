//! Engine configuration from environment variables
//!
//! Supplied once at startup; the running engine treats it as immutable. Changing a
//! scope's policy on an existing index set requires a `reconcile_all` pass afterwards.

use crate::index::TieBreak;
use crate::keyspace::WindowKind;
use crate::policy::ScoreUpdatePolicy;
use std::collections::HashMap;
use std::env;
use std::time::Duration;

/// Configuration for the ranking engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Policy for per-game indices without an override.
    pub game_policy: ScoreUpdatePolicy,

    /// Policy for every window index.
    pub window_policy: ScoreUpdatePolicy,

    /// Per-game policy overrides (game id → policy).
    pub game_policy_overrides: HashMap<String, ScoreUpdatePolicy>,

    /// Window kinds maintained for each game.
    pub windows: Vec<WindowKind>,

    /// Window indices whose period ended more than this long ago are evicted.
    pub retention: chrono::Duration,

    pub tie_break: TieBreak,

    /// Number of per-member lock stripes (also the contribution ledger shard count).
    pub lock_stripes: usize,

    /// Retries on a contended member lock before `TransientFailure`.
    pub lock_retries: u32,

    /// First backoff delay on a contended member lock.
    pub lock_backoff: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            game_policy: ScoreUpdatePolicy::BestOf,
            window_policy: ScoreUpdatePolicy::BestOf,
            game_policy_overrides: HashMap::new(),
            windows: WindowKind::all().to_vec(),
            retention: chrono::Duration::days(35),
            tie_break: TieBreak::EarliestSubmission,
            lock_stripes: 256,
            lock_retries: 8,
            lock_backoff: Duration::from_micros(50),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `RANKFLOW_GAME_POLICY` (default: best_of)
    /// - `RANKFLOW_WINDOW_POLICY` (default: best_of)
    /// - `RANKFLOW_GAME_POLICY_OVERRIDES` (e.g. `g1=cumulative,g2=last_write_wins`)
    /// - `RANKFLOW_WINDOWS` (default: daily,weekly,monthly; empty disables windows)
    /// - `RANKFLOW_RETENTION_DAYS` (default: 35)
    /// - `RANKFLOW_TIE_BREAK` (default: earliest_submission)
    /// - `RANKFLOW_LOCK_STRIPES` (default: 256)
    /// - `RANKFLOW_LOCK_RETRIES` (default: 8)
    /// - `RANKFLOW_LOCK_BACKOFF_US` (default: 50)
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Same as [`EngineConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let policy = |name: &str, default: ScoreUpdatePolicy| match lookup(name) {
            Some(raw) => ScoreUpdatePolicy::from_str(&raw).unwrap_or_else(|| {
                log::warn!("{}={} is not a known policy, using {}", name, raw, default.as_str());
                default
            }),
            None => default,
        };

        let game_policy = policy("RANKFLOW_GAME_POLICY", defaults.game_policy);
        let window_policy = policy("RANKFLOW_WINDOW_POLICY", defaults.window_policy);

        let game_policy_overrides = lookup("RANKFLOW_GAME_POLICY_OVERRIDES")
            .map(|raw| parse_overrides(&raw))
            .unwrap_or_default();

        let windows = lookup("RANKFLOW_WINDOWS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .filter_map(|s| {
                        let kind = WindowKind::from_str(s);
                        if kind.is_none() {
                            log::warn!("ignoring unknown window kind {:?}", s);
                        }
                        kind
                    })
                    .collect()
            })
            .unwrap_or(defaults.windows);

        let retention = lookup("RANKFLOW_RETENTION_DAYS")
            .and_then(|s| s.parse::<i64>().ok())
            .filter(|days| *days >= 0)
            .map(chrono::Duration::days)
            .unwrap_or(defaults.retention);

        let tie_break = lookup("RANKFLOW_TIE_BREAK")
            .and_then(|s| TieBreak::from_str(&s))
            .unwrap_or(defaults.tie_break);

        Self {
            game_policy,
            window_policy,
            game_policy_overrides,
            windows,
            retention,
            tie_break,
            lock_stripes: lookup("RANKFLOW_LOCK_STRIPES")
                .and_then(|s| s.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.lock_stripes),
            lock_retries: lookup("RANKFLOW_LOCK_RETRIES")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.lock_retries),
            lock_backoff: lookup("RANKFLOW_LOCK_BACKOFF_US")
                .and_then(|s| s.parse().ok())
                .map(Duration::from_micros)
                .unwrap_or(defaults.lock_backoff),
        }
    }

    /// Effective policy for `game`'s per-game index.
    pub fn policy_for_game(&self, game: &str) -> ScoreUpdatePolicy {
        self.game_policy_overrides
            .get(game)
            .copied()
            .unwrap_or(self.game_policy)
    }
}

fn parse_overrides(raw: &str) -> HashMap<String, ScoreUpdatePolicy> {
    raw.split(',')
        .filter_map(|pair| {
            let (game, policy) = pair.split_once('=')?;
            let game = game.trim();
            match ScoreUpdatePolicy::from_str(policy) {
                Some(policy) if !game.is_empty() => Some((game.to_string(), policy)),
                _ => {
                    log::warn!("ignoring malformed policy override {:?}", pair);
                    None
                }
            }
        })
        .collect()
}
