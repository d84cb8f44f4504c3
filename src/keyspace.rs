//! Leaderboard key space
//!
//! Deterministic addressing of every index the engine maintains:
//! - `lb:game:{game}` per-game all-time board
//! - `lb:game:{game}:daily:2026-10-17` / `:weekly:2026-W42` / `:monthly:2026-10`
//! - `lb:global` cross-game aggregate
//!
//! `IndexKey` is an enum, so distinct scopes can never compare equal. The string form
//! escapes `%` and `:` inside game ids, which keeps it collision-free as well.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::GameId;

/// Calendar granularity of a window index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    Daily,
    Weekly,
    Monthly,
}

impl WindowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowKind::Daily => "daily",
            WindowKind::Weekly => "weekly",
            WindowKind::Monthly => "monthly",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" | "day" => Some(WindowKind::Daily),
            "weekly" | "week" => Some(WindowKind::Weekly),
            "monthly" | "month" => Some(WindowKind::Monthly),
            _ => None,
        }
    }

    pub fn all() -> [WindowKind; 3] {
        [WindowKind::Daily, WindowKind::Weekly, WindowKind::Monthly]
    }
}

/// Calendar-aligned period identifier (UTC).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PeriodAnchor {
    Day { date: NaiveDate },
    /// ISO-8601 week (`week` in 1..=53 of ISO `year`).
    Week { year: i32, week: u32 },
    Month { year: i32, month: u32 },
}

impl PeriodAnchor {
    /// Anchor of the `kind` period containing `at`.
    pub fn containing(kind: WindowKind, at: DateTime<Utc>) -> Self {
        let date = at.date_naive();
        match kind {
            WindowKind::Daily => PeriodAnchor::Day { date },
            WindowKind::Weekly => {
                let iso = date.iso_week();
                PeriodAnchor::Week {
                    year: iso.year(),
                    week: iso.week(),
                }
            }
            WindowKind::Monthly => PeriodAnchor::Month {
                year: date.year(),
                month: date.month(),
            },
        }
    }

    pub fn kind(&self) -> WindowKind {
        match self {
            PeriodAnchor::Day { .. } => WindowKind::Daily,
            PeriodAnchor::Week { .. } => WindowKind::Weekly,
            PeriodAnchor::Month { .. } => WindowKind::Monthly,
        }
    }

    /// First day of the period, if the anchor names a real calendar period.
    pub fn start_date(&self) -> Option<NaiveDate> {
        match *self {
            PeriodAnchor::Day { date } => Some(date),
            PeriodAnchor::Week { year, week } => NaiveDate::from_isoywd_opt(year, week, Weekday::Mon),
            PeriodAnchor::Month { year, month } => NaiveDate::from_ymd_opt(year, month, 1),
        }
    }

    /// First instant after the period (exclusive end), UTC midnight.
    pub fn period_end(&self) -> Option<DateTime<Utc>> {
        let start = self.start_date()?;
        let end = match *self {
            PeriodAnchor::Day { .. } => start.checked_add_signed(Duration::days(1))?,
            PeriodAnchor::Week { .. } => start.checked_add_signed(Duration::days(7))?,
            PeriodAnchor::Month { year, month } => {
                if month == 12 {
                    NaiveDate::from_ymd_opt(year + 1, 1, 1)?
                } else {
                    NaiveDate::from_ymd_opt(year, month + 1, 1)?
                }
            }
        };
        Some(Utc.from_utc_datetime(&end.and_hms_opt(0, 0, 0)?))
    }

    pub fn parse(kind: WindowKind, s: &str) -> Option<Self> {
        match kind {
            WindowKind::Daily => NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .map(|date| PeriodAnchor::Day { date }),
            WindowKind::Weekly => {
                let (year, week) = s.split_once("-W")?;
                let anchor = PeriodAnchor::Week {
                    year: year.parse().ok()?,
                    week: week.parse().ok()?,
                };
                anchor.start_date().map(|_| anchor)
            }
            WindowKind::Monthly => {
                let (year, month) = s.split_once('-')?;
                let anchor = PeriodAnchor::Month {
                    year: year.parse().ok()?,
                    month: month.parse().ok()?,
                };
                anchor.start_date().map(|_| anchor)
            }
        }
    }
}

impl fmt::Display for PeriodAnchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeriodAnchor::Day { date } => write!(f, "{}", date.format("%Y-%m-%d")),
            PeriodAnchor::Week { year, week } => write!(f, "{}-W{:02}", year, week),
            PeriodAnchor::Month { year, month } => write!(f, "{}-{:02}", year, month),
        }
    }
}

/// Address of one ordered index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum IndexKey {
    Game { game: GameId },
    Window { game: GameId, anchor: PeriodAnchor },
    Global,
}

impl IndexKey {
    pub fn game(game: impl Into<GameId>) -> Self {
        IndexKey::Game { game: game.into() }
    }

    /// Window index of `kind` for `game` containing the instant `at`.
    pub fn window(game: impl Into<GameId>, kind: WindowKind, at: DateTime<Utc>) -> Self {
        IndexKey::Window {
            game: game.into(),
            anchor: PeriodAnchor::containing(kind, at),
        }
    }

    pub fn global() -> Self {
        IndexKey::Global
    }

    pub fn game_id(&self) -> Option<&str> {
        match self {
            IndexKey::Game { game } | IndexKey::Window { game, .. } => Some(game.as_str()),
            IndexKey::Global => None,
        }
    }

    pub fn anchor(&self) -> Option<&PeriodAnchor> {
        match self {
            IndexKey::Window { anchor, .. } => Some(anchor),
            _ => None,
        }
    }

    pub fn is_window(&self) -> bool {
        matches!(self, IndexKey::Window { .. })
    }

    /// Stable string name, e.g. for transports and logs.
    pub fn name(&self) -> String {
        match self {
            IndexKey::Game { game } => format!("lb:game:{}", escape(game)),
            IndexKey::Window { game, anchor } => format!(
                "lb:game:{}:{}:{}",
                escape(game),
                anchor.kind().as_str(),
                anchor
            ),
            IndexKey::Global => "lb:global".to_string(),
        }
    }

    /// Inverse of [`IndexKey::name`].
    pub fn parse(name: &str) -> Option<Self> {
        let parts: Vec<&str> = name.split(':').collect();
        match parts.as_slice() {
            ["lb", "global"] => Some(IndexKey::Global),
            ["lb", "game", game] => Some(IndexKey::Game {
                game: unescape(game)?,
            }),
            ["lb", "game", game, kind, anchor] => {
                let kind = WindowKind::from_str(kind)?;
                Some(IndexKey::Window {
                    game: unescape(game)?,
                    anchor: PeriodAnchor::parse(kind, anchor)?,
                })
            }
            _ => None,
        }
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Window keys of the given kinds for `game` at instant `at`.
pub fn window_keys(game: &str, kinds: &[WindowKind], at: DateTime<Utc>) -> Vec<IndexKey> {
    kinds
        .iter()
        .map(|kind| IndexKey::window(game, *kind, at))
        .collect()
}

fn escape(raw: &str) -> String {
    raw.replace('%', "%25").replace(':', "%3A")
}

fn unescape(escaped: &str) -> Option<String> {
    let mut out = String::with_capacity(escaped.len());
    let mut rest = escaped;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let code = rest.get(pos + 1..pos + 3)?;
        match code {
            "25" => out.push('%'),
            "3A" => out.push(':'),
            _ => return None,
        }
        rest = &rest[pos + 3..];
    }
    out.push_str(rest);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_anchor_derivation() {
        let t = at("2026-10-17T23:59:59Z");
        assert_eq!(PeriodAnchor::containing(WindowKind::Daily, t).to_string(), "2026-10-17");
        assert_eq!(PeriodAnchor::containing(WindowKind::Weekly, t).to_string(), "2026-W42");
        assert_eq!(PeriodAnchor::containing(WindowKind::Monthly, t).to_string(), "2026-10");

        // ISO week-year differs from calendar year around new year.
        let new_year = at("2027-01-01T08:00:00Z");
        assert_eq!(
            PeriodAnchor::containing(WindowKind::Weekly, new_year).to_string(),
            "2026-W53"
        );
    }

    #[test]
    fn test_period_end() {
        let day = PeriodAnchor::containing(WindowKind::Daily, at("2026-10-17T10:00:00Z"));
        assert_eq!(day.period_end(), Some(at("2026-10-18T00:00:00Z")));

        let week = PeriodAnchor::containing(WindowKind::Weekly, at("2026-10-17T10:00:00Z"));
        assert_eq!(week.period_end(), Some(at("2026-10-19T00:00:00Z")));

        let december = PeriodAnchor::containing(WindowKind::Monthly, at("2026-12-05T10:00:00Z"));
        assert_eq!(december.period_end(), Some(at("2027-01-01T00:00:00Z")));
    }

    #[test]
    fn test_names_are_collision_free() {
        let t = at("2026-10-17T10:00:00Z");
        // A game id that looks like a window suffix must not alias the window key.
        let tricky = IndexKey::game("g1:daily:2026-10-17");
        let window = IndexKey::window("g1", WindowKind::Daily, t);
        assert_ne!(tricky.name(), window.name());

        for key in [tricky, window, IndexKey::global(), IndexKey::game("100%")] {
            assert_eq!(IndexKey::parse(&key.name()), Some(key));
        }
        assert_eq!(IndexKey::parse("lb:game:g1:hourly:2026"), None);
    }

    #[test]
    fn test_window_keys() {
        let keys = window_keys("g1", &WindowKind::all(), at("2026-10-17T10:00:00Z"));
        let names: Vec<String> = keys.iter().map(|k| k.name()).collect();
        assert_eq!(
            names,
            vec![
                "lb:game:g1:daily:2026-10-17",
                "lb:game:g1:weekly:2026-W42",
                "lb:game:g1:monthly:2026-10",
            ]
        );
    }
}
