//! Pipeline ingestion - async channel processor for score submissions
//!
//! ```text
//! mpsc<ScoreUpdate> → dispatcher ─┬─ worker 0 ─┐
//!                     (by member) ├─ worker 1 ─┼─ LeaderboardEngine::submit → HistoryRecorder
//!                                 └─ worker N ─┘
//! ```
//!
//! Routing by member hash gives every member a single writer, so workers never contend
//! on a member lock with each other; only retention/reconcile passes can. Submissions
//! run on the blocking pool, since a contended member lock backs off with a thread sleep.

use super::db::HistoryRecorder;
use crate::engine::LeaderboardEngine;
use crate::locks::shard_for;
use crate::types::ScoreUpdate;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

/// Attempts for a submission that failed with a retryable error.
const MAX_SUBMIT_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_millis(10);

/// Totals reported when ingestion shuts down.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestionStats {
    pub received: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub recorded: u64,
    pub record_failures: u64,
}

impl IngestionStats {
    fn merge(&mut self, other: &IngestionStats) {
        self.received += other.received;
        self.accepted += other.accepted;
        self.rejected += other.rejected;
        self.recorded += other.recorded;
        self.record_failures += other.record_failures;
    }
}

/// Start pipeline ingestion from the score update channel
///
/// Main loop:
/// 1. Receives updates via mpsc channel
/// 2. Routes each to the worker owning its member
/// 3. Workers submit to the engine and record accepted results
///
/// Runs until the channel is closed, then drains every worker and returns the totals.
pub async fn start_ingestion(
    mut rx: mpsc::Receiver<ScoreUpdate>,
    engine: Arc<LeaderboardEngine>,
    recorder: Arc<dyn HistoryRecorder>,
    workers: usize,
    channel_buffer: usize,
) -> IngestionStats {
    let workers = workers.max(1);
    let per_worker_buffer = (channel_buffer / workers).max(1);

    log::info!("🚀 Starting score ingestion");
    log::info!("   ├─ Workers: {}", workers);
    log::info!("   └─ Per-worker buffer: {}", per_worker_buffer);

    let mut senders = Vec::with_capacity(workers);
    let mut handles: Vec<JoinHandle<IngestionStats>> = Vec::with_capacity(workers);
    for worker_id in 0..workers {
        let (tx, worker_rx) = mpsc::channel(per_worker_buffer);
        senders.push(tx);
        handles.push(tokio::spawn(run_worker(
            worker_id,
            worker_rx,
            engine.clone(),
            recorder.clone(),
        )));
    }

    let mut dispatched = 0u64;
    let mut last_log_time = std::time::Instant::now();

    while let Some(update) = rx.recv().await {
        let shard = shard_for(&update.member, workers);
        if senders[shard].send(update).await.is_err() {
            log::error!("❌ Worker {} stopped, dropping submission", shard);
            continue;
        }
        dispatched += 1;

        // Log throughput every 10 seconds
        if last_log_time.elapsed().as_secs() >= 10 {
            let per_sec = dispatched as f64 / last_log_time.elapsed().as_secs_f64();
            log::info!(
                "📊 Ingestion rate: {:.1} submissions/sec (queued: {})",
                per_sec,
                rx.len()
            );
            last_log_time = std::time::Instant::now();
            dispatched = 0;
        }
    }

    // Closing the worker channels lets each worker drain and exit.
    drop(senders);

    let mut totals = IngestionStats::default();
    for (worker_id, handle) in handles.into_iter().enumerate() {
        match handle.await {
            Ok(stats) => totals.merge(&stats),
            Err(e) => log::error!("❌ Worker {} panicked: {}", worker_id, e),
        }
    }

    log::info!(
        "✅ Ingestion stopped | received: {} | accepted: {} | rejected: {} | recorded: {}",
        totals.received,
        totals.accepted,
        totals.rejected,
        totals.recorded
    );
    totals
}

async fn run_worker(
    worker_id: usize,
    mut rx: mpsc::Receiver<ScoreUpdate>,
    engine: Arc<LeaderboardEngine>,
    recorder: Arc<dyn HistoryRecorder>,
) -> IngestionStats {
    let mut stats = IngestionStats::default();

    'updates: while let Some(update) = rx.recv().await {
        stats.received += 1;

        let mut attempt = 1;
        let outcome = loop {
            // Lock backoff sleeps the calling thread; keep it off the runtime's workers.
            let submit_engine = engine.clone();
            let submitted = update.clone();
            match tokio::task::spawn_blocking(move || submit_engine.submit(&submitted)).await {
                Ok(Err(e)) if e.is_retryable() && attempt < MAX_SUBMIT_ATTEMPTS => {
                    log::debug!("worker {} retrying {}: {}", worker_id, update.member, e);
                    attempt += 1;
                    sleep(RETRY_DELAY).await;
                }
                Ok(other) => break other,
                Err(e) => {
                    stats.rejected += 1;
                    log::error!("❌ Worker {} submit task failed for {}: {}", worker_id, update.member, e);
                    continue 'updates;
                }
            }
        };

        let result = match outcome {
            Ok(result) => result,
            Err(e) => {
                stats.rejected += 1;
                log::warn!(
                    "⚠️  Submission rejected ({} in {}): {}",
                    update.member,
                    update.game,
                    e
                );
                continue;
            }
        };
        stats.accepted += 1;

        match recorder.record(&update, &result).await {
            Ok(()) => stats.recorded += 1,
            Err(e) => {
                stats.record_failures += 1;
                log::error!("❌ Failed to record submission for {}: {}", update.member, e);
            }
        }
    }

    log::debug!("worker {} drained ({} submissions)", worker_id, stats.received);
    stats
}
