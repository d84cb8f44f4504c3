//! Durable history store and game catalog persistence
//!
//! The ranking core never writes here. Ingestion workers hand every accepted
//! `(ScoreUpdate, SubmitResult)` pair to a `HistoryRecorder` after the transaction
//! completes.
//!
//! Tables (see `/sql/`):
//! - `games` - registered games, mirrored into `InMemoryCatalog` at startup
//! - `submission_history` - INSERT only (audit / reporting fallback)

use super::error::{PipelineError, PipelineResult};
use crate::catalog::InMemoryCatalog;
use crate::locks;
use crate::types::{ScoreUpdate, SubmitResult};
use async_trait::async_trait;
use rusqlite::{params, Connection};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Sink for accepted submissions.
#[async_trait]
pub trait HistoryRecorder: Send + Sync {
    /// Append one accepted submission and the ranks it produced.
    ///
    /// SQL reference: `/sql/01_submission_history.sql`
    async fn record(&self, update: &ScoreUpdate, result: &SubmitResult) -> PipelineResult<()>;
}

/// Discards everything. Used when no database is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRecorder;

#[async_trait]
impl HistoryRecorder for NullRecorder {
    async fn record(&self, _update: &ScoreUpdate, _result: &SubmitResult) -> PipelineResult<()> {
        Ok(())
    }
}

/// Run schema migrations from SQL files
///
/// Reads all .sql files from `schema_dir` in name order and executes them. Every file
/// must use "IF NOT EXISTS" clauses so reruns are harmless.
pub fn run_schema_migrations(conn: &mut Connection, schema_dir: &str) -> PipelineResult<()> {
    let schema_path = Path::new(schema_dir);

    if !schema_path.exists() {
        return Err(PipelineError::SchemaDirMissing(schema_dir.to_string()));
    }

    let mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    log::info!("📊 SQLite journal mode: {}", mode);

    // Sorted so 00_, 01_, ... run in order
    let mut sql_files: Vec<_> = fs::read_dir(schema_path)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().and_then(|s| s.to_str()) == Some("sql"))
        .collect();
    sql_files.sort_by_key(|entry| entry.file_name());

    log::info!("🔧 Running schema migrations from: {}", schema_dir);

    for entry in sql_files {
        let filename = entry.file_name().to_string_lossy().into_owned();
        log::info!("   ├─ Executing: {}", filename);

        let sql_content = fs::read_to_string(entry.path())?;
        conn.execute_batch(&sql_content)?;

        log::info!("   └─ ✅ Success: {}", filename);
    }

    log::info!("✅ All schema migrations completed successfully");
    Ok(())
}

/// Add `game` to the `games` table. Returns `false` if it was already there.
pub fn register_game(conn: &Connection, game: &str, title: Option<&str>, created_at: i64) -> PipelineResult<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO games (game_id, title, created_at) VALUES (?, ?, ?)",
        params![game, title, created_at],
    )?;
    Ok(inserted > 0)
}

/// Build an in-memory catalog from the `games` table.
pub fn load_catalog(conn: &Connection) -> PipelineResult<InMemoryCatalog> {
    let mut stmt = conn.prepare("SELECT game_id FROM games")?;
    let games = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    log::info!("🎮 Loaded {} games into catalog", games.len());
    Ok(InMemoryCatalog::new(games))
}

/// SQLite implementation of HistoryRecorder
pub struct SqliteHistoryRecorder {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteHistoryRecorder {
    /// Open the history store.
    ///
    /// Does NOT create the schema; run `run_schema_migrations` first.
    pub fn new(db_path: &str) -> PipelineResult<Self> {
        let conn = Connection::open(db_path)?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Number of rows recorded for `member`.
    pub fn count_for(&self, member: &str) -> PipelineResult<i64> {
        let conn = locks::lock(&self.conn);
        let count = conn.query_row(
            "SELECT COUNT(*) FROM submission_history WHERE member_id = ?",
            [member],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

#[async_trait]
impl HistoryRecorder for SqliteHistoryRecorder {
    async fn record(&self, update: &ScoreUpdate, result: &SubmitResult) -> PipelineResult<()> {
        let result_json = serde_json::to_string(result)?;
        let recorded_at = chrono::Utc::now().timestamp_millis();
        let conn = locks::lock(&self.conn);

        conn.execute(
            r#"
            INSERT INTO submission_history (
                member_id, game_id, raw_score, submitted_at,
                per_game_changed, per_game_rank, per_game_score,
                global_rank, global_score, result_json, recorded_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                update.member,
                update.game,
                update.raw_score,
                update.submitted_at.timestamp_millis(),
                result.per_game_changed,
                result.per_game_rank.rank as i64,
                result.per_game_rank.score.micros(),
                result.global_rank.as_ref().map(|e| e.rank as i64),
                result.global_rank.as_ref().map(|e| e.score.micros()),
                result_json,
                recorded_at,
            ],
        )?;

        Ok(())
    }
}
