//! Rankflow Runtime - leaderboard engine with SQLite history and JSONL event export
//!
//! Reads one JSON `ScoreUpdate` per line from stdin:
//!
//! ```json
//! {"member":"alice","game":"chess","raw_score":1200.0,"submitted_at":"2026-10-17T12:00:00Z"}
//! ```
//!
//! Usage:
//!   cargo run --release --bin rankflow_runtime -- [--register <game>]... < updates.jsonl
//!
//! Environment variables:
//!   RANKFLOW_DB_PATH - SQLite database path (default: /var/lib/rankflow/rankflow.db)
//!   RANKFLOW_SCHEMA_DIR - Schema directory (default: sql)
//!   RANKFLOW_EVENTS_PATH - Change event output (default: streams/rank_events.jsonl)
//!   RANKFLOW_WORKERS - Ingestion workers (default: 4)
//!   RANKFLOW_* - Engine settings, see `EngineConfig::from_env`
//!   RUST_LOG - Logging level (optional, default: info)

use dotenv::dotenv;
use log::{error, info, warn};
use rankflow::pipeline::{
    config::PipelineConfig,
    db::{load_catalog, register_game, run_schema_migrations, HistoryRecorder, SqliteHistoryRecorder},
    event_export_task, reconcile_task, retention_task, start_ingestion, JsonlEventWriter,
};
use rankflow::{ChannelSink, EngineConfig, LeaderboardEngine, ScoreUpdate};
use rusqlite::Connection;
use std::env;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

/// Games passed as `--register <game>` (repeatable).
fn parse_register_args() -> Vec<String> {
    let args: Vec<String> = env::args().collect();
    args.windows(2)
        .filter(|pair| pair[0] == "--register")
        .map(|pair| pair[1].clone())
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    info!("🚀 Rankflow Runtime");
    info!("   └─ Version: {}", env!("CARGO_PKG_VERSION"));

    let config = PipelineConfig::from_env();
    let engine_config = EngineConfig::from_env();

    info!("✅ Configuration loaded");
    info!("   ├─ Database: {}", config.db_path);
    info!("   ├─ Events: {}", config.events_path);
    info!("   ├─ Workers: {}", config.workers);
    info!("   ├─ Retention interval: {}ms", config.retention_interval_ms);
    info!("   └─ Reconcile interval: {}ms", config.reconcile_interval_ms);

    // Initialize database
    info!("🔧 Initializing database...");
    let mut conn = Connection::open(&config.db_path)?;
    run_schema_migrations(&mut conn, &config.schema_dir)?;

    let now = chrono::Utc::now().timestamp();
    for game in parse_register_args() {
        if register_game(&conn, &game, None, now)? {
            info!("   ├─ Registered game: {}", game);
        }
    }
    let catalog = Arc::new(load_catalog(&conn)?);
    if catalog.is_empty() {
        warn!("⚠️  No games registered; every submission will be rejected (use --register <game>)");
    }
    drop(conn);

    let recorder: Arc<dyn HistoryRecorder> = Arc::new(SqliteHistoryRecorder::new(&config.db_path)?);
    info!("✅ Database initialized");

    // Engine + event export
    let (sink, events_rx) = ChannelSink::channel();
    let writer = JsonlEventWriter::new(&config.events_path)?;
    let export = tokio::spawn(event_export_task(events_rx, writer));

    let engine = Arc::new(LeaderboardEngine::new(engine_config, catalog, Arc::new(sink)));

    // Background tasks
    info!("🚀 Spawning background tasks...");
    let retention = tokio::spawn(retention_task(engine.clone(), config.retention_interval_ms));
    let reconcile = tokio::spawn(reconcile_task(engine.clone(), config.reconcile_interval_ms));

    let (tx, rx) = mpsc::channel::<ScoreUpdate>(config.channel_buffer);
    let ingestion = tokio::spawn(start_ingestion(
        rx,
        engine.clone(),
        recorder,
        config.workers,
        config.channel_buffer,
    ));
    info!("✅ All background tasks running, reading submissions from stdin");

    // Stdin reader: one JSON ScoreUpdate per line, until EOF or CTRL+C
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_no = 0u64;
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    info!("📭 End of input");
                    break;
                };
                line_no += 1;
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<ScoreUpdate>(trimmed) {
                    Ok(update) => {
                        if tx.send(update).await.is_err() {
                            error!("❌ Ingestion stopped unexpectedly");
                            break;
                        }
                    }
                    Err(e) => warn!("⚠️  Skipping line {}: {}", line_no, e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("⚠️  Received CTRL+C, shutting down...");
                break;
            }
        }
    }

    // Closing the channel drains ingestion
    drop(tx);
    let totals = ingestion.await?;
    retention.abort();
    reconcile.abort();
    let _ = retention.await;
    let _ = reconcile.await;

    // Final reconcile so the exported state is exact
    let final_engine = engine.clone();
    tokio::task::spawn_blocking(move || final_engine.reconcile_all()).await?;

    let stats = engine.stats();
    // Dropping the engine drops the last event sender, which ends the export task.
    drop(engine);
    let exported = export.await?;

    info!("📊 Final stats:");
    info!("   ├─ Submissions: {} ({} accepted, {} rejected)", totals.received, totals.accepted, totals.rejected);
    info!("   ├─ Recorded: {} ({} failures)", totals.recorded, totals.record_failures);
    info!("   ├─ Indices: {}", stats.live_indices);
    info!("   └─ Events exported: {}", exported);
    info!("✅ Rankflow runtime stopped");
    Ok(())
}
