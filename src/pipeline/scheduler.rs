//! Pipeline schedulers for background maintenance
//!
//! Both tasks run until cancelled (abort the JoinHandle on shutdown). Each pass runs on
//! the blocking pool so lock backoff never stalls a runtime worker.

use crate::engine::LeaderboardEngine;
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Retention scheduler task - periodically evict expired window indices
///
/// Complements the lazy expiry applied by transactions and queries: this is what
/// actually frees the memory.
pub async fn retention_task(engine: Arc<LeaderboardEngine>, interval_ms: u64) {
    log::info!("⏰ Starting retention scheduler (interval: {}ms)", interval_ms);

    let mut timer = interval(Duration::from_millis(interval_ms));
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        timer.tick().await;
        let pass_engine = engine.clone();
        let report = match tokio::task::spawn_blocking(move || pass_engine.run_retention()).await {
            Ok(report) => report,
            Err(e) => {
                log::error!("❌ Retention pass failed: {}", e);
                continue;
            }
        };
        log::debug!(
            "retention tick: {} evicted, {} deferred",
            report.evicted.len(),
            report.deferred.len()
        );
    }
}

/// Reconcile scheduler task - periodically recompute every global score
///
/// The first tick fires immediately, which repairs any drift left by a previous run
/// before new submissions pile up.
pub async fn reconcile_task(engine: Arc<LeaderboardEngine>, interval_ms: u64) {
    log::info!("⏰ Starting reconcile scheduler (interval: {}ms)", interval_ms);

    let mut timer = interval(Duration::from_millis(interval_ms));
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        timer.tick().await;
        // Reconcile takes member locks, whose backoff sleeps the thread.
        let pass_engine = engine.clone();
        let report = match tokio::task::spawn_blocking(move || pass_engine.reconcile_all()).await {
            Ok(report) => report,
            Err(e) => {
                log::error!("❌ Reconcile pass failed: {}", e);
                continue;
            }
        };
        if report.failed > 0 {
            log::warn!(
                "⚠️  {} members could not be reconciled this round, retrying next tick",
                report.failed
            );
        }
    }
}
