//! Errors raised by pipeline collaborators (history store, event export)

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("schema directory not found: {0}")]
    SchemaDirMissing(String),
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
