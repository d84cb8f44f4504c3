//! Change event emission
//!
//! The engine reports every applied mutation as a `ChangeEvent` handed to a
//! `ChangeSink`. Delivery to subscribers is somebody else's job; the sink is just the
//! hand-off point (a channel, a buffer, a file writer).
//!
//! Ordering: events are emitted while the mutated index's write guard is held, and
//! each carries that index's next `sequence`, so per-index order is total and gaps are
//! detectable. Delivery is at-least-once from the engine's point of view; consumers
//! dedupe on `(index_key, sequence)`.

use crate::keyspace::IndexKey;
use crate::locks;
use crate::registry::IndexSlot;
use crate::types::RankEntry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Member inserted or its score changed.
    Updated,
    /// Member removed by an explicit reset.
    Removed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub index_key: IndexKey,
    pub entry: RankEntry,
    pub kind: ChangeKind,
    /// Per-index, strictly increasing from 1.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Error)]
#[error("change sink closed")]
pub struct SinkClosed;

/// Hand-off point to the external notification layer.
///
/// `deliver` is called with an index write guard held and must not block.
pub trait ChangeSink: Send + Sync {
    fn deliver(&self, event: ChangeEvent) -> Result<(), SinkClosed>;
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl ChangeSink for NullSink {
    fn deliver(&self, _event: ChangeEvent) -> Result<(), SinkClosed> {
        Ok(())
    }
}

/// Collects events in memory until drained.
#[derive(Debug, Default)]
pub struct BufferedSink {
    events: Mutex<Vec<ChangeEvent>>,
}

impl BufferedSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<ChangeEvent> {
        std::mem::take(&mut *locks::lock(&self.events))
    }

    pub fn len(&self) -> usize {
        locks::lock(&self.events).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ChangeSink for BufferedSink {
    fn deliver(&self, event: ChangeEvent) -> Result<(), SinkClosed> {
        locks::lock(&self.events).push(event);
        Ok(())
    }
}

/// Forwards events into an unbounded tokio channel (non-blocking send).
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ChangeEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<ChangeEvent>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ChangeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ChangeSink for ChannelSink {
    fn deliver(&self, event: ChangeEvent) -> Result<(), SinkClosed> {
        self.tx.send(event).map_err(|_| SinkClosed)
    }
}

/// Stamps and forwards change events.
pub struct ChangeEventEmitter {
    sink: Arc<dyn ChangeSink>,
    emitted: AtomicU64,
    dropped: AtomicU64,
}

impl ChangeEventEmitter {
    pub fn new(sink: Arc<dyn ChangeSink>) -> Self {
        Self {
            sink,
            emitted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Emit one event for `slot`. The caller must hold `slot`'s write guard.
    pub(crate) fn emit(
        &self,
        slot: &IndexSlot,
        entry: RankEntry,
        kind: ChangeKind,
        timestamp: DateTime<Utc>,
    ) {
        let event = ChangeEvent {
            index_key: slot.key().clone(),
            entry,
            kind,
            sequence: slot.next_sequence(),
            timestamp,
        };

        match self.sink.deliver(event) {
            Ok(()) => {
                self.emitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                // First drop, then every 1000th.
                if dropped == 1 || dropped % 1000 == 0 {
                    log::warn!("change event dropped for {}: {} (total dropped: {})", slot.key(), e, dropped);
                }
            }
        }
    }

    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for ChangeEventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeEventEmitter")
            .field("emitted", &self.emitted())
            .field("dropped", &self.dropped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::TieBreak;
    use crate::registry::IndexRegistry;
    use crate::types::Score;

    fn entry(member: &str, rank: usize) -> RankEntry {
        RankEntry {
            member: member.to_string(),
            rank,
            score: Score::from_points(1),
            changed: true,
        }
    }

    #[test]
    fn test_sequences_are_per_index() {
        let registry = IndexRegistry::new(TieBreak::MemberId);
        let g1 = registry.get_or_create(&IndexKey::game("g1"));
        let g2 = registry.get_or_create(&IndexKey::game("g2"));

        let sink = Arc::new(BufferedSink::new());
        let emitter = ChangeEventEmitter::new(sink.clone());
        let now = Utc::now();

        emitter.emit(&g1, entry("a", 1), ChangeKind::Updated, now);
        emitter.emit(&g1, entry("b", 2), ChangeKind::Updated, now);
        emitter.emit(&g2, entry("a", 1), ChangeKind::Updated, now);

        let events = sink.drain();
        let seqs: Vec<(String, u64)> = events
            .iter()
            .map(|e| (e.index_key.name(), e.sequence))
            .collect();
        assert_eq!(
            seqs,
            vec![
                ("lb:game:g1".to_string(), 1),
                ("lb:game:g1".to_string(), 2),
                ("lb:game:g2".to_string(), 1),
            ]
        );
        assert_eq!(emitter.emitted(), 3);
        assert!(sink.is_empty());
    }

    #[test]
    fn test_closed_channel_counts_drops() {
        let (sink, rx) = ChannelSink::channel();
        drop(rx);

        let registry = IndexRegistry::new(TieBreak::MemberId);
        let slot = registry.get_or_create(&IndexKey::global());
        let emitter = ChangeEventEmitter::new(Arc::new(sink));
        emitter.emit(&slot, entry("a", 1), ChangeKind::Updated, Utc::now());

        assert_eq!(emitter.emitted(), 0);
        assert_eq!(emitter.dropped(), 1);
    }

    #[test]
    fn test_event_serializes_to_json() {
        let event = ChangeEvent {
            index_key: IndexKey::game("g1"),
            entry: entry("a", 1),
            kind: ChangeKind::Updated,
            sequence: 7,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["index_key"]["scope"], "game");
        assert_eq!(json["kind"], "updated");
        assert_eq!(json["sequence"], 7);
    }
}
