//! FIFO queue lock.
//!
//! Ticket-based: each contender takes the next ticket and spins until the
//! serving counter reaches it, so waiters are granted strictly in arrival
//! order. The consolidation array relies on this ordering for its insert
//! lock (log-buffer reservations happen in LSN order) and uses `try_lock`
//! on the expose side to detect a busy predecessor it can delegate to.

use std::sync::atomic::{AtomicU64, Ordering};

/// Spins before falling back to `yield_now`.
const SPIN_BEFORE_YIELD: u32 = 256;

/// A FIFO spin lock handing out tickets in arrival order.
#[derive(Debug, Default)]
pub struct QueueLock {
    next: AtomicU64,
    serving: AtomicU64,
}

/// Guard released on drop.
#[must_use = "the lock is released when the guard drops"]
pub struct QueueLockGuard<'a> {
    lock: &'a QueueLock,
}

impl QueueLock {
    #[must_use]
    pub const fn new() -> Self {
        Self { next: AtomicU64::new(0), serving: AtomicU64::new(0) }
    }

    /// Acquire, spinning (then yielding) until it is this caller's turn.
    pub fn lock(&self) -> QueueLockGuard<'_> {
        let ticket = self.next.fetch_add(1, Ordering::Relaxed);
        let mut spins = 0u32;
        while self.serving.load(Ordering::Acquire) != ticket {
            spins += 1;
            if spins < SPIN_BEFORE_YIELD {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
        QueueLockGuard { lock: self }
    }

    /// Acquire only if no one holds or awaits the lock.
    pub fn try_lock(&self) -> Option<QueueLockGuard<'_>> {
        let serving = self.serving.load(Ordering::Acquire);
        if self
            .next
            .compare_exchange(serving, serving + 1, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            Some(QueueLockGuard { lock: self })
        } else {
            None
        }
    }

    /// Whether someone currently holds (or queues for) the lock. Advisory.
    #[must_use]
    pub fn is_contended(&self) -> bool {
        self.next.load(Ordering::Relaxed) != self.serving.load(Ordering::Relaxed)
    }
}

impl Drop for QueueLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.serving.fetch_add(1, Ordering::Release);
    }
}
