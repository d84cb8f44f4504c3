//! Index registry: IndexKey → live index slot
//!
//! Slots are created on first use and handed out as `Arc`s. Transactions take a
//! `SlotPin` for every index they touch; the pin count is raised while the registry
//! lock is held, so the retention manager (which needs the registry write lock to
//! evict) can never remove a window a transaction has already pinned.
//!
//! Each eviction pass records the instant it swept at. Window pins are checked against
//! the later of the caller's "now" and that watermark, so a transaction that resolved a
//! window before a pass can't re-create it after the pass evicted it.

use crate::index::{OrderedScoreIndex, TieBreak};
use crate::keyspace::IndexKey;
use crate::locks;
use crate::retention::RetentionPolicy;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// One live index plus its bookkeeping.
#[derive(Debug)]
pub struct IndexSlot {
    key: IndexKey,
    index: RwLock<OrderedScoreIndex>,
    pins: AtomicUsize,
    sequence: AtomicU64,
}

impl IndexSlot {
    fn new(key: IndexKey, tie_break: TieBreak) -> Self {
        let index = OrderedScoreIndex::new(key.name(), tie_break);
        Self {
            key,
            index: RwLock::new(index),
            pins: AtomicUsize::new(0),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn key(&self) -> &IndexKey {
        &self.key
    }

    pub fn read(&self) -> RwLockReadGuard<'_, OrderedScoreIndex> {
        locks::read(&self.index)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, OrderedScoreIndex> {
        locks::write(&self.index)
    }

    /// Number of in-flight transactions referencing this slot.
    pub fn pinned(&self) -> usize {
        self.pins.load(Ordering::Acquire)
    }

    /// Next change-event sequence number. Call with the write guard held so
    /// sequence order matches mutation order.
    pub(crate) fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Keeps a slot alive and un-evictable for the duration of a transaction.
#[derive(Debug)]
pub struct SlotPin {
    slot: Arc<IndexSlot>,
}

impl SlotPin {
    fn new(slot: Arc<IndexSlot>) -> Self {
        slot.pins.fetch_add(1, Ordering::AcqRel);
        Self { slot }
    }
}

impl Deref for SlotPin {
    type Target = IndexSlot;

    fn deref(&self) -> &IndexSlot {
        &self.slot
    }
}

impl Drop for SlotPin {
    fn drop(&mut self) {
        self.slot.pins.fetch_sub(1, Ordering::AcqRel);
    }
}

/// All live indices.
#[derive(Debug)]
pub struct IndexRegistry {
    slots: RwLock<HashMap<IndexKey, Arc<IndexSlot>>>,
    tie_break: TieBreak,
    /// Latest eviction instant (ms). Written only under the `slots` write lock.
    swept_at_ms: AtomicI64,
}

impl IndexRegistry {
    pub fn new(tie_break: TieBreak) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            tie_break,
            swept_at_ms: AtomicI64::new(i64::MIN),
        }
    }

    /// Instant of the most recent eviction pass, if any ran.
    pub fn swept_at(&self) -> Option<DateTime<Utc>> {
        match self.swept_at_ms.load(Ordering::Acquire) {
            i64::MIN => None,
            ms => DateTime::from_timestamp_millis(ms),
        }
    }

    /// `now`, moved forward to the last sweep if that is later.
    fn effective_now(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.swept_at().map_or(now, |swept| swept.max(now))
    }

    pub fn tie_break(&self) -> TieBreak {
        self.tie_break
    }

    pub fn get(&self, key: &IndexKey) -> Option<Arc<IndexSlot>> {
        locks::read(&self.slots).get(key).cloned()
    }

    pub fn get_or_create(&self, key: &IndexKey) -> Arc<IndexSlot> {
        if let Some(slot) = self.get(key) {
            return slot;
        }
        let mut slots = locks::write(&self.slots);
        slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(IndexSlot::new(key.clone(), self.tie_break)))
            .clone()
    }

    /// Resolve (creating if needed) and pin `key` in one registry critical section.
    pub fn pin(&self, key: &IndexKey) -> SlotPin {
        {
            let slots = locks::read(&self.slots);
            if let Some(slot) = slots.get(key) {
                return SlotPin::new(slot.clone());
            }
        }

        let mut slots = locks::write(&self.slots);
        let slot = slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(IndexSlot::new(key.clone(), self.tie_break)))
            .clone();
        SlotPin::new(slot)
    }

    /// Pin `key` unless it is expired at `now` or at the last sweep.
    ///
    /// The check runs under the registry lock, so an index a pass already evicted is
    /// never re-created here.
    pub fn pin_live(&self, key: &IndexKey, retention: &RetentionPolicy, now: DateTime<Utc>) -> Option<SlotPin> {
        {
            let slots = locks::read(&self.slots);
            if retention.is_expired(key, self.effective_now(now)) {
                return None;
            }
            if let Some(slot) = slots.get(key) {
                return Some(SlotPin::new(slot.clone()));
            }
        }

        let mut slots = locks::write(&self.slots);
        if retention.is_expired(key, self.effective_now(now)) {
            return None;
        }
        let slot = slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(IndexSlot::new(key.clone(), self.tie_break)))
            .clone();
        Some(SlotPin::new(slot))
    }

    pub fn keys(&self) -> Vec<IndexKey> {
        locks::read(&self.slots).keys().cloned().collect()
    }

    /// Per-game keys currently registered.
    pub fn game_keys(&self) -> Vec<IndexKey> {
        locks::read(&self.slots)
            .keys()
            .filter(|key| matches!(key, IndexKey::Game { .. }))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        locks::read(&self.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every slot expired at `now` that no transaction has pinned, and record
    /// `now` as the sweep watermark.
    ///
    /// Returns `(evicted, deferred)`; deferred slots were expired but pinned.
    pub(crate) fn evict_expired(
        &self,
        retention: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> (Vec<IndexKey>, Vec<IndexKey>) {
        let mut slots = locks::write(&self.slots);
        self.swept_at_ms
            .fetch_max(now.timestamp_millis(), Ordering::AcqRel);
        let mut evicted = Vec::new();
        let mut deferred = Vec::new();

        slots.retain(|key, slot| {
            if !retention.is_expired(key, now) {
                return true;
            }
            if slot.pinned() > 0 {
                deferred.push(key.clone());
                true
            } else {
                evicted.push(key.clone());
                false
            }
        });

        (evicted, deferred)
    }
}
