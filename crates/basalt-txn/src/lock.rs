//! Minimal lock-table collaborator.
//!
//! The full lock manager (its hash table, range locks, hierarchy) lives
//! outside the core; transactions only need this contract: acquire with a
//! timeout, release in the early-lock-release phases, and per-bucket commit
//! tags feeding the readers' watermark. This table implements exactly that
//! contract over fixed buckets.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use basalt_error::{BasaltError, Result};
use basalt_types::{Lsn, TxnId};
use parking_lot::{Condvar, Mutex};
use tracing::trace;

/// A lockable resource, already hashed by the caller (key, page, store...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockId(pub u64);

/// Lock strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockMode {
    IntentShared,
    IntentExclusive,
    Shared,
    Update,
    Exclusive,
}

impl LockMode {
    /// Classic multi-granularity compatibility.
    #[must_use]
    pub const fn compatible(self, other: Self) -> bool {
        use LockMode::{Exclusive, IntentExclusive, IntentShared, Shared, Update};
        match (self, other) {
            (Exclusive, _) | (_, Exclusive) => false,
            (IntentShared, _) | (_, IntentShared) => true,
            (IntentExclusive, IntentExclusive) => true,
            (IntentExclusive, _) | (_, IntentExclusive) => false,
            (Shared, Shared) | (Shared, Update) => true,
            (Update, Shared) => true,
            (Update, Update) => false,
        }
    }

    /// Released at pre-commit under ELR mode `s`.
    #[must_use]
    pub const fn is_read_side(self) -> bool {
        matches!(self, Self::Shared | Self::Update | Self::IntentShared | Self::IntentExclusive)
    }
}

#[derive(Debug, Default)]
struct Bucket {
    holders: Vec<(TxnId, LockId, LockMode)>,
}

const BUCKET_COUNT: usize = 1024;

/// Fixed-bucket lock table with per-bucket commit tags.
pub struct LockTable {
    buckets: Vec<Mutex<Bucket>>,
    released: Vec<Condvar>,
    /// Per-bucket tag: the highest `last_lsn` of any transaction that
    /// released an exclusive lock here early. Readers fold this into their
    /// commit watermark.
    tags: Vec<AtomicU64>,
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}

impl LockTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buckets: (0..BUCKET_COUNT).map(|_| Mutex::new(Bucket::default())).collect(),
            released: (0..BUCKET_COUNT).map(|_| Condvar::new()).collect(),
            tags: (0..BUCKET_COUNT).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    #[inline]
    fn bucket_of(&self, lock: LockId) -> usize {
        ((lock.0.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32) as usize) % BUCKET_COUNT
    }

    /// The current commit tag of the lock's bucket.
    #[must_use]
    pub fn bucket_tag(&self, lock: LockId) -> Lsn {
        Lsn::from_data(self.tags[self.bucket_of(lock)].load(Ordering::Acquire))
    }

    /// Acquire `lock` in `mode` for `txn`, waiting up to `timeout`.
    ///
    /// `poisoned` is sampled on every wakeup: a transaction made
    /// non-blocking fails immediately with `Deadlock` and must abort.
    /// Returns the bucket tag for the caller's watermark.
    pub fn acquire(
        &self,
        txn: TxnId,
        lock: LockId,
        mode: LockMode,
        timeout: Duration,
        poisoned: &std::sync::atomic::AtomicBool,
    ) -> Result<Lsn> {
        let b = self.bucket_of(lock);
        let deadline = Instant::now() + timeout;
        let mut bucket = self.buckets[b].lock();
        loop {
            if poisoned.load(Ordering::Acquire) {
                return Err(BasaltError::Deadlock { txn });
            }
            let conflict = bucket
                .holders
                .iter()
                .any(|&(holder, id, held)| id == lock && holder != txn && !held.compatible(mode));
            if !conflict {
                bucket.holders.push((txn, lock, mode));
                return Ok(Lsn::from_data(self.tags[b].load(Ordering::Acquire)));
            }
            if Instant::now() >= deadline {
                trace!(target: "basalt.txn", txn = %txn, lock = lock.0, "lock wait timed out");
                return Err(BasaltError::Timeout {
                    millis: timeout.as_millis() as u64,
                });
            }
            self.released[b].wait_until(&mut bucket, deadline);
        }
    }

    /// Release the subset of `txn`'s locks selected by `filter`. `tag` is
    /// recorded on buckets where an exclusive lock is dropped (early
    /// release): readers landing there afterwards will stall on it.
    pub fn release_where(
        &self,
        txn: TxnId,
        tag: Lsn,
        mut filter: impl FnMut(LockMode) -> bool,
    ) -> usize {
        let mut released = 0;
        for b in 0..BUCKET_COUNT {
            let mut bucket = self.buckets[b].lock();
            let before = bucket.holders.len();
            let mut dropped_exclusive = false;
            bucket.holders.retain(|&(holder, _, mode)| {
                let drop_it = holder == txn && filter(mode);
                if drop_it && mode == LockMode::Exclusive {
                    dropped_exclusive = true;
                }
                !drop_it
            });
            let dropped = before - bucket.holders.len();
            if dropped > 0 {
                if dropped_exclusive && !tag.is_null() {
                    self.tags[b].fetch_max(tag.data(), Ordering::AcqRel);
                }
                drop(bucket);
                self.released[b].notify_all();
                released += dropped;
            }
        }
        released
    }

    /// Release everything `txn` holds.
    pub fn release_all(&self, txn: TxnId, tag: Lsn) -> usize {
        self.release_where(txn, tag, |_| true)
    }

    /// Count of locks held by `txn` (tests).
    #[must_use]
    pub fn held_by(&self, txn: TxnId) -> usize {
        self.buckets
            .iter()
            .map(|b| b.lock().holders.iter().filter(|&&(h, _, _)| h == txn).count())
            .sum()
    }
}

impl std::fmt::Debug for LockTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockTable").field("buckets", &BUCKET_COUNT).finish_non_exhaustive()
    }
}
