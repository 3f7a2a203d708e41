//! Per-turn message sequence allocation.
//!
//! Each turn gets a small mutex-guarded counter, seeded on first use from
//! the highest sequence already persisted for that turn. Locks are held
//! only for the read-and-increment, never across storage I/O, so two
//! writers can still race at insert time. The storage unique index on
//! `(turn_id, sequence)` is the real guarantee; the counter just keeps
//! conflicts rare. The message store retries on conflict.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;

use cs_domain::error::{Error, Result};
use cs_domain::StorageError;

use crate::storage::Storage;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Counter map
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One lazily seeded counter. `None` until the first allocation.
#[derive(Default)]
struct Counter {
    next: Mutex<Option<i64>>,
}

impl Counter {
    fn take(&self) -> Option<i64> {
        let mut next = self.next.lock();
        let value = (*next)?;
        *next = Some(value + 1);
        Some(value)
    }

    /// Seed with `seed` unless a concurrent caller already did, then take.
    fn seed_and_take(&self, seed: i64) -> i64 {
        let mut next = self.next.lock();
        let value = next.unwrap_or(seed);
        *next = Some(value + 1);
        value
    }

    fn observe(&self, used: i64) {
        let mut next = self.next.lock();
        if let Some(n) = *next {
            if n <= used {
                *next = Some(used + 1);
            }
        }
    }
}

/// Keyed monotonic counters shared by sequence and queue allocation.
#[derive(Default)]
pub(crate) struct CounterMap {
    counters: Mutex<HashMap<String, Arc<Counter>>>,
}

impl CounterMap {
    fn counter(&self, key: &str) -> Arc<Counter> {
        self.counters
            .lock()
            .entry(key.to_owned())
            .or_default()
            .clone()
    }

    /// Next value for `key`. On first use `max_persisted` is awaited
    /// (without holding any lock) to find where counting resumes.
    pub(crate) async fn next<F>(&self, key: &str, max_persisted: F) -> Result<i64>
    where
        F: Future<Output = Result<Option<i64>>>,
    {
        let counter = self.counter(key);
        if let Some(value) = counter.take() {
            return Ok(value);
        }
        let max = max_persisted.await?;
        Ok(counter.seed_and_take(max.unwrap_or(0) + 1))
    }

    pub(crate) fn observe(&self, key: &str, used: i64) {
        if let Some(counter) = self.counters.lock().get(key) {
            counter.observe(used);
        }
    }

    pub(crate) fn forget(&self, key: &str) -> bool {
        self.counters.lock().remove(key).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.counters.lock().len()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sequence allocator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Process-wide allocator of per-turn message sequences.
///
/// Assumes this process owns the turn's writes. With several writer
/// processes it still stays correct (conflicts are retried), it just
/// conflicts more often.
pub struct SequenceAllocator {
    storage: Arc<dyn Storage>,
    turns: CounterMap,
}

impl SequenceAllocator {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            turns: CounterMap::default(),
        }
    }

    /// Allocate the next sequence for `turn_id`.
    pub async fn next(&self, turn_id: &str) -> Result<i64> {
        let storage = self.storage.clone();
        let turn = turn_id.to_owned();
        self.turns
            .next(turn_id, async move {
                storage
                    .max_sequence(&turn)
                    .await
                    .map_err(|e: StorageError| {
                        Error::storage(format!("reading max sequence of turn {turn}"), e)
                    })
            })
            .await
    }

    /// Record that `sequence` was persisted explicitly so later
    /// allocations skip past it.
    pub fn observe(&self, turn_id: &str, sequence: i64) {
        self.turns.observe(turn_id, sequence);
    }

    /// Drop the counter for a turn; the next allocation reseeds from storage.
    pub fn forget(&self, turn_id: &str) -> bool {
        self.turns.forget(turn_id)
    }

    /// Number of turns with a live counter.
    pub fn tracked_turns(&self) -> usize {
        self.turns.len()
    }
}
