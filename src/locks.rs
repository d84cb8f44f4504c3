//! Per-member critical sections
//!
//! Every transaction for a member runs under that member's stripe lock, which covers
//! the per-game write, window writes, the GlobalContribution update and the global
//! index write. Members hash onto a fixed number of stripes; two members sharing a
//! stripe are serialized, which is safe (only slower).

use crate::error::{RankingError, Result};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{
    Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError,
};
use std::time::Duration;

/// Stable shard for `member` among `shards` buckets.
///
/// Also used by the ingestion pipeline so one worker owns each member.
pub fn shard_for(member: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    member.hash(&mut hasher);
    (hasher.finish() % shards.max(1) as u64) as usize
}

/// Read guard that ignores poisoning: index state is only written in short,
/// non-panicking sections.
pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Bounded exponential backoff for lock contention.
#[derive(Debug)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    max_retries: u32,
    current_attempt: u32,
}

#[derive(Debug)]
pub struct MaxRetriesExceeded;

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration, retries: u32) -> Self {
        Self {
            initial_delay: initial,
            max_delay: max,
            max_retries: retries,
            current_attempt: 0,
        }
    }

    /// Sleep for the next delay, or fail once the retry budget is spent.
    pub fn sleep(&mut self) -> std::result::Result<(), MaxRetriesExceeded> {
        if self.current_attempt >= self.max_retries {
            return Err(MaxRetriesExceeded);
        }

        let factor = 2u32.saturating_pow(self.current_attempt);
        let delay = std::cmp::min(self.initial_delay.saturating_mul(factor), self.max_delay);

        std::thread::sleep(delay);
        self.current_attempt += 1;
        Ok(())
    }

    pub fn attempts(&self) -> u32 {
        self.current_attempt
    }

    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }
}

/// Striped lock table keyed by member identity.
#[derive(Debug)]
pub struct MemberLocks {
    stripes: Vec<Mutex<()>>,
    retries: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl MemberLocks {
    pub fn new(stripes: usize, retries: u32, initial_backoff: Duration) -> Self {
        let stripes = stripes.max(1);
        Self {
            stripes: (0..stripes).map(|_| Mutex::new(())).collect(),
            retries,
            initial_backoff,
            max_backoff: initial_backoff.saturating_mul(64),
        }
    }

    pub fn stripe_count(&self) -> usize {
        self.stripes.len()
    }

    pub fn stripe_of(&self, member: &str) -> usize {
        shard_for(member, self.stripes.len())
    }

    /// Enter `member`'s critical section.
    ///
    /// Contended stripes are retried with bounded backoff; exhaustion returns
    /// `TransientFailure`. A poisoned stripe is recovered, since it guards no data.
    pub fn acquire(&self, member: &str) -> Result<MutexGuard<'_, ()>> {
        let stripe = &self.stripes[self.stripe_of(member)];
        let mut backoff = ExponentialBackoff::new(self.initial_backoff, self.max_backoff, self.retries);

        loop {
            match stripe.try_lock() {
                Ok(guard) => return Ok(guard),
                Err(TryLockError::Poisoned(poisoned)) => return Ok(poisoned.into_inner()),
                Err(TryLockError::WouldBlock) => {
                    if backoff.sleep().is_err() {
                        log::warn!(
                            "member {} still locked after {} retries",
                            member,
                            backoff.attempts()
                        );
                        return Err(RankingError::TransientFailure {
                            member: member.to_string(),
                            attempts: backoff.attempts() + 1,
                        });
                    }
                }
            }
        }
    }
}
