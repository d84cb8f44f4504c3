//! Integration tests for the leaderboard engine
//!
//! Key behaviours tested end to end through the public API:
//! - Global aggregation (sum of per-game bests) across games
//! - Window retention (lazy and eager)
//! - Concurrent submissions: distinct members vs. serial order, same member across games
//! - Drift repair via reconcile_all, including while submissions are in flight
//! - Async pipeline: channel → workers → engine → SQLite history + change events

#[cfg(test)]
mod engine_integration_tests {
    use chrono::{DateTime, Utc};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rankflow::pipeline::db::{run_schema_migrations, SqliteHistoryRecorder};
    use rankflow::pipeline::start_ingestion;
    use rankflow::{
        BufferedSink, ChangeKind, ChannelSink, CombineRule, EngineConfig, IndexKey,
        InMemoryCatalog, LeaderboardEngine, RankEntry, Score, ScoreUpdate, ScoreUpdatePolicy,
        TieBreak, WindowKind,
    };
    use rusqlite::Connection;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
    use std::sync::Arc;
    use std::thread;
    use tokio::sync::mpsc;

    const NOW: &str = "2026-10-17T12:00:00Z";

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn engine_with(config: EngineConfig, games: &[&str]) -> (Arc<LeaderboardEngine>, Arc<BufferedSink>) {
        let sink = Arc::new(BufferedSink::new());
        let now = at(NOW);
        let engine = LeaderboardEngine::with_clock(
            config,
            Arc::new(InMemoryCatalog::new(games.iter().copied())),
            sink.clone(),
            Arc::new(move || now),
        );
        (Arc::new(engine), sink)
    }

    fn submit(engine: &LeaderboardEngine, member: &str, game: &str, score: f64) -> rankflow::SubmitResult {
        engine
            .submit(&ScoreUpdate::new(member, game, score, at(NOW)))
            .unwrap()
    }

    fn pts(points: i64) -> Score {
        Score::from_points(points)
    }

    /// Full ordered contents of an index.
    fn dump(engine: &LeaderboardEngine, key: &IndexKey) -> Vec<RankEntry> {
        let size = engine.queries().size(key);
        engine.queries().top_n(key, size)
    }

    #[test]
    fn test_global_sum_of_per_game_bests() {
        let (engine, _) = engine_with(EngineConfig::default(), &["G1", "G2"]);
        let global = IndexKey::global();

        let r = submit(&engine, "M", "G1", 50.0);
        assert_eq!(r.global_rank.unwrap().score, pts(50));

        let r = submit(&engine, "M", "G2", 70.0);
        assert_eq!(r.global_rank.unwrap().score, pts(120));

        let r = submit(&engine, "M", "G1", 40.0);
        assert!(!r.per_game_changed);
        assert!(!r.global_rank.as_ref().unwrap().changed);
        assert_eq!(r.global_rank.unwrap().score, pts(120));

        let r = submit(&engine, "M", "G1", 90.0);
        assert!(r.per_game_changed);
        assert_eq!(r.global_rank.unwrap().score, pts(160));

        let entry = engine.queries().rank_of(&global, "M").unwrap();
        assert_eq!(entry.rank, 1);
        assert_eq!(engine.queries().score_of(&global, "M"), Some(pts(160)));
    }

    #[test]
    fn test_best_of_keeps_maximum() {
        let (engine, _) = engine_with(EngineConfig::default(), &["g1"]);
        let mut rng = StdRng::seed_from_u64(7);
        let mut best = f64::MIN;

        for _ in 0..200 {
            let score = rng.gen_range(-1_000..1_000) as f64;
            let r = submit(&engine, "m", "g1", score);
            assert_eq!(r.per_game_changed, score > best);
            best = best.max(score);
        }

        assert_eq!(
            engine.queries().score_of(&IndexKey::game("g1"), "m"),
            Some(Score::from_f64(best).unwrap())
        );
    }

    #[test]
    fn test_top_n_is_strictly_ordered_and_reproducible() {
        let config = EngineConfig {
            tie_break: TieBreak::MemberId,
            ..EngineConfig::default()
        };
        let (engine, _) = engine_with(config, &["g1"]);
        let mut rng = StdRng::seed_from_u64(11);
        for i in 0..300 {
            submit(&engine, &format!("m{:03}", i), "g1", rng.gen_range(0..50) as f64);
        }

        let key = IndexKey::game("g1");
        let top = engine.queries().top_n(&key, 100);
        assert_eq!(top.len(), 100);
        for (i, pair) in top.windows(2).enumerate() {
            assert_eq!(pair[0].rank, i + 1);
            assert!(
                pair[0].score > pair[1].score
                    || (pair[0].score == pair[1].score && pair[0].member < pair[1].member)
            );
        }
        assert_eq!(top, engine.queries().top_n(&key, 100));

        let leader = &top[0].member;
        assert_eq!(engine.queries().rank_of(&key, leader).unwrap().rank, 1);

        let around = engine.queries().around(&key, &top[1].member, 3, 3);
        assert!(around.first().unwrap().rank >= 1);
        assert!(around.len() <= 7);
    }

    #[test]
    fn test_retention_scenario() {
        let config = EngineConfig {
            retention: chrono::Duration::days(7),
            ..EngineConfig::default()
        };
        let now_ms = Arc::new(AtomicI64::new(at("2026-10-07T12:00:00Z").timestamp_millis()));
        let clock_ms = now_ms.clone();
        let engine = LeaderboardEngine::with_clock(
            config,
            Arc::new(InMemoryCatalog::new(["g1"])),
            Arc::new(BufferedSink::new()),
            Arc::new(move || {
                DateTime::from_timestamp_millis(clock_ms.load(Ordering::SeqCst)).unwrap_or_default()
            }),
        );

        let ten_days_ago = at("2026-10-07T09:00:00Z");
        let yesterday = at("2026-10-16T09:00:00Z");
        let old_daily = IndexKey::window("g1", WindowKind::Daily, ten_days_ago);
        let recent_daily = IndexKey::window("g1", WindowKind::Daily, yesterday);

        // Submitted while Oct 7 was still today, so the daily window is created.
        engine
            .submit(&ScoreUpdate::new("old", "g1", 500.0, ten_days_ago))
            .unwrap();
        assert_eq!(engine.queries().rank_of(&old_daily, "old").unwrap().rank, 1);

        now_ms.store(at(NOW).timestamp_millis(), Ordering::SeqCst);
        engine
            .submit(&ScoreUpdate::new("new", "g1", 5.0, yesterday))
            .unwrap();

        // Oct 7 ended more than 7 days ago; its week and month are still in range.
        let report = engine.run_retention();
        assert_eq!(report.evicted, vec![old_daily.clone()]);
        assert!(report.deferred.is_empty());

        assert!(engine.queries().rank_of(&old_daily, "old").is_none());
        let union = engine.queries().union_top_n(
            &[old_daily.clone(), recent_daily.clone()],
            10,
            CombineRule::Sum,
        );
        assert_eq!(union.len(), 1);
        assert_eq!(union[0].member, "new");

        // Per-game and global scopes never expire.
        assert_eq!(
            engine.queries().rank_of(&IndexKey::game("g1"), "old").unwrap().rank,
            1
        );
        assert_eq!(
            engine.queries().rank_of(&IndexKey::global(), "old").unwrap().rank,
            1
        );
    }

    #[test]
    fn test_concurrent_distinct_members_match_serial_order() {
        let games = ["g1", "g2", "g3"];
        let mut rng = StdRng::seed_from_u64(42);
        let mut per_member: HashMap<String, Vec<ScoreUpdate>> = HashMap::new();
        for i in 0..40 {
            let member = format!("m{}", i);
            let updates = (0..25)
                .map(|_| {
                    let game = games[rng.gen_range(0..games.len())];
                    ScoreUpdate::new(member.as_str(), game, rng.gen_range(0..10_000) as f64, at(NOW))
                })
                .collect();
            per_member.insert(member, updates);
        }

        let config = EngineConfig {
            tie_break: TieBreak::MemberId,
            ..EngineConfig::default()
        };

        let (serial, _) = engine_with(config.clone(), &games);
        let mut members: Vec<&String> = per_member.keys().collect();
        members.sort();
        for member in members {
            for update in &per_member[member] {
                serial.submit(update).unwrap();
            }
        }

        let (parallel, _) = engine_with(config, &games);
        thread::scope(|scope| {
            for updates in per_member.values() {
                let engine = parallel.clone();
                scope.spawn(move || {
                    for update in updates {
                        // Distinct members can still share a lock stripe.
                        while let Err(e) = engine.submit(update) {
                            assert!(e.is_retryable());
                        }
                    }
                });
            }
        });

        let mut keys: Vec<IndexKey> = games.iter().map(|g| IndexKey::game(*g)).collect();
        keys.push(IndexKey::global());
        keys.push(IndexKey::window("g1", WindowKind::Monthly, at(NOW)));
        for key in &keys {
            assert_eq!(dump(&serial, key), dump(&parallel, key), "index {} diverged", key);
        }
    }

    #[test]
    fn test_same_member_across_games_keeps_global_sum() {
        let games: Vec<String> = (0..8).map(|i| format!("g{}", i)).collect();
        let game_refs: Vec<&str> = games.iter().map(String::as_str).collect();
        let config = EngineConfig {
            game_policy: ScoreUpdatePolicy::Cumulative,
            windows: Vec::new(),
            lock_retries: 64,
            ..EngineConfig::default()
        };
        let (engine, _) = engine_with(config, &game_refs);

        thread::scope(|scope| {
            for game in &games {
                let engine = engine.clone();
                scope.spawn(move || {
                    for _ in 0..200 {
                        let update = ScoreUpdate::new("shared", game.as_str(), 1.0, at(NOW));
                        // Retry contention; nothing is applied on TransientFailure.
                        while let Err(e) = engine.submit(&update) {
                            assert!(e.is_retryable());
                        }
                    }
                });
            }
        });

        let global = engine.queries().score_of(&IndexKey::global(), "shared");
        assert_eq!(global, Some(pts(8 * 200)));
        assert_eq!(engine.reconcile_all().corrected, 0);
    }

    #[test]
    fn test_reconcile_all_during_concurrent_submissions() {
        let games = ["g1", "g2", "g3", "g4"];
        let members: Vec<String> = (0..7).map(|i| format!("m{}", i)).collect();
        let config = EngineConfig {
            game_policy: ScoreUpdatePolicy::Cumulative,
            windows: Vec::new(),
            lock_stripes: 4,
            lock_retries: 64,
            ..EngineConfig::default()
        };
        let (engine, _) = engine_with(config, &games);
        let writers_done = AtomicBool::new(false);

        thread::scope(|scope| {
            let reconciler = scope.spawn(|| {
                let mut passes = 0u32;
                while !writers_done.load(Ordering::SeqCst) {
                    engine.reconcile_all();
                    passes += 1;
                }
                passes
            });

            let writers: Vec<_> = games
                .iter()
                .enumerate()
                .map(|(seed, game)| {
                    let engine = engine.clone();
                    let members = &members;
                    scope.spawn(move || {
                        let mut rng = StdRng::seed_from_u64(seed as u64);
                        for _ in 0..150 {
                            for member in members {
                                let points = rng.gen_range(1..20) as f64;
                                let update = ScoreUpdate::new(member.as_str(), *game, points, at(NOW));
                                while let Err(e) = engine.submit(&update) {
                                    assert!(e.is_retryable());
                                }
                            }
                        }
                    })
                })
                .collect();
            for writer in writers {
                writer.join().unwrap();
            }
            writers_done.store(true, Ordering::SeqCst);
            assert!(reconciler.join().unwrap() > 0);
        });

        for member in &members {
            let expected = games
                .iter()
                .filter_map(|g| engine.queries().score_of(&IndexKey::game(*g), member))
                .fold(pts(0), Score::saturating_add);
            assert_eq!(
                engine.queries().score_of(&IndexKey::global(), member),
                Some(expected),
                "global drifted for {}",
                member
            );
        }
        assert_eq!(engine.reconcile_all().corrected, 0);
    }

    #[test]
    fn test_reconcile_all_restores_invariant() {
        let (engine, _) = engine_with(EngineConfig::default(), &["g1", "g2"]);
        submit(&engine, "a", "g1", 10.0);
        submit(&engine, "a", "g2", 20.0);
        submit(&engine, "b", "g2", 5.0);

        // Corrupt the global index the way a lost delta would.
        engine
            .aggregator()
            .global_slot()
            .write()
            .upsert("a", pts(999), 0);

        let report = engine.reconcile_all();
        assert_eq!(report.corrected, 1);
        assert_eq!(engine.queries().score_of(&IndexKey::global(), "a"), Some(pts(30)));
        assert_eq!(engine.queries().score_of(&IndexKey::global(), "b"), Some(pts(5)));

        let again = engine.reconcile_all();
        assert_eq!(again.corrected, 0);
    }

    #[test]
    fn test_events_are_sequenced_per_index() {
        let (engine, sink) = engine_with(EngineConfig::default(), &["g1"]);
        for i in 1..=5 {
            submit(&engine, "m", "g1", i as f64);
            submit(&engine, "n", "g1", i as f64 + 0.5);
        }

        let events = sink.drain();
        let mut last: HashMap<IndexKey, u64> = HashMap::new();
        for event in &events {
            assert_eq!(event.kind, ChangeKind::Updated);
            let prev = last.insert(event.index_key.clone(), event.sequence).unwrap_or(0);
            assert_eq!(event.sequence, prev + 1);
        }
        // Every submission improved the score: 5 indices × 10 submissions.
        assert_eq!(events.len(), 50);
    }

    #[tokio::test]
    async fn test_pipeline_end_to_end() {
        let temp = tempfile::NamedTempFile::new().unwrap();
        let db_path = temp.path().to_str().unwrap().to_string();
        let mut conn = Connection::open(&db_path).unwrap();
        run_schema_migrations(&mut conn, concat!(env!("CARGO_MANIFEST_DIR"), "/sql")).unwrap();
        drop(conn);

        let (sink, mut events) = ChannelSink::channel();
        let engine = Arc::new(LeaderboardEngine::new(
            EngineConfig::default(),
            Arc::new(InMemoryCatalog::new(["g1", "g2"])),
            Arc::new(sink),
        ));
        let recorder = Arc::new(SqliteHistoryRecorder::new(&db_path).unwrap());

        let (tx, rx) = mpsc::channel(64);
        let ingestion = tokio::spawn(start_ingestion(rx, engine.clone(), recorder.clone(), 4, 64));

        let now = Utc::now();
        for (member, game, score) in [("a", "g1", 50.0), ("a", "g2", 70.0), ("b", "g1", 60.0), ("a", "g1", 40.0)] {
            tx.send(ScoreUpdate::new(member, game, score, now)).await.unwrap();
        }
        tx.send(ScoreUpdate::new("a", "missing", 1.0, now)).await.unwrap();
        drop(tx);

        let stats = ingestion.await.unwrap();
        assert_eq!(stats.accepted, 4);
        assert_eq!(stats.rejected, 1);
        assert_eq!(recorder.count_for("a").unwrap(), 3);

        let global = engine.queries().top_n(&IndexKey::global(), 10);
        assert_eq!(global[0].member, "a");
        assert_eq!(global[0].score, pts(120));
        assert_eq!(global[1].score, pts(60));

        let mut received = 0;
        while let Ok(event) = events.try_recv() {
            assert_eq!(event.kind, ChangeKind::Updated);
            received += 1;
        }
        assert_eq!(received as u64, engine.stats().events_emitted);
    }
}
