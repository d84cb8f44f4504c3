//! # Pipeline runtime around the ranking engine
//!
//! Everything outside the in-memory core that a deployment needs:
//! - Ingestion of score submissions from an async channel (sharded workers)
//! - Durable submission history in SQLite (`submission_history`)
//! - Game catalog persistence (`games`)
//! - Background retention and reconciliation schedulers
//! - Change event export to JSONL
//!
//! ## Schema Reference
//!
//! All tables are created by the SQL files in `/sql/` via `db::run_schema_migrations`.
//!
//! ## Module Organization
//!
//! - `config` - Runtime configuration from environment variables
//! - `error` - `PipelineError` for the I/O-facing collaborators
//! - `db` - History recorder trait + SQLite implementation, catalog loader
//! - `ingestion` - Channel → worker fan-out → engine → recorder
//! - `scheduler` - Retention and reconcile interval loops
//! - `jsonl_writer` - Change event export

pub mod config;
pub mod db;
pub mod error;
pub mod ingestion;
pub mod jsonl_writer;
pub mod scheduler;

// Re-export commonly used types
pub use config::PipelineConfig;
pub use db::{HistoryRecorder, NullRecorder, SqliteHistoryRecorder};
pub use error::{PipelineError, PipelineResult};
pub use ingestion::{start_ingestion, IngestionStats};
pub use jsonl_writer::{event_export_task, JsonlEventWriter};
pub use scheduler::{reconcile_task, retention_task};
