//! # rankflow - in-memory leaderboard ranking engine
//!
//! Maintains ordered score indices at three scopes and keeps them consistent under
//! concurrent submissions:
//! - per-game: one index per registered game
//! - windowed: daily / weekly / monthly indices per game, evicted after a retention horizon
//! - global: each member's sum of per-game scores
//!
//! Rank lookups and range reads are O(log N) (plus the size of the requested range),
//! backed by an order-statistics skip list.
//!
//! ## Quick start
//!
//! ```no_run
//! use rankflow::{EngineConfig, IndexKey, InMemoryCatalog, LeaderboardEngine, NullSink, ScoreUpdate};
//! use std::sync::Arc;
//!
//! let engine = LeaderboardEngine::new(
//!     EngineConfig::from_env(),
//!     Arc::new(InMemoryCatalog::new(["chess"])),
//!     Arc::new(NullSink),
//! );
//! let result = engine.submit(&ScoreUpdate::new("alice", "chess", 1200.0, chrono::Utc::now()))?;
//! println!("rank {}", result.per_game_rank.rank);
//! let top = engine.queries().top_n(&IndexKey::global(), 10);
//! # Ok::<(), rankflow::RankingError>(())
//! ```
//!
//! ## Module Organization
//!
//! - `types` - Score (fixed-point), ScoreUpdate, RankEntry, SubmitResult
//! - `skiplist` / `index` - ordered storage with rank/select
//! - `keyspace` - IndexKey naming and window period anchors
//! - `policy` - BestOf / Cumulative / LastWriteWins
//! - `transaction` / `aggregator` - write path and global sum maintenance
//! - `query` - read path
//! - `retention` - window expiry
//! - `engine` - wires the above together
//! - `pipeline` - async ingestion, SQLite history, schedulers, event export

pub mod aggregator;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod index;
pub mod keyspace;
pub mod locks;
pub mod pipeline;
pub mod policy;
pub mod query;
pub mod registry;
pub mod retention;
pub mod skiplist;
pub mod transaction;
pub mod types;

pub use aggregator::{GlobalAggregator, ReconcileReport};
pub use catalog::{GameCatalog, InMemoryCatalog};
pub use config::EngineConfig;
pub use engine::{EngineStats, LeaderboardEngine};
pub use error::{RankingError, Result};
pub use events::{BufferedSink, ChangeEvent, ChangeKind, ChangeSink, ChannelSink, NullSink};
pub use index::{OrderedScoreIndex, TieBreak};
pub use keyspace::{IndexKey, PeriodAnchor, WindowKind};
pub use policy::ScoreUpdatePolicy;
pub use query::{CombineRule, RankQueryService};
pub use retention::{RetentionPolicy, RetentionReport, WindowRetentionManager};
pub use types::{RankEntry, Score, ScoreUpdate, SubmitResult};
