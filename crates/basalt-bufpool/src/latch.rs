//! Multi-mode page latch with an optimistic Q mode.
//!
//! Modes form a total order of strength: `None < Q < Shared < Exclusive`.
//! Shared and exclusive behave like a reader/writer spin lock. Q mode is a
//! version ticket: it costs one atomic load, never blocks writers, and the
//! holder must re-validate the ticket after every dereference into the page
//! — a failed validation means a writer intervened and the read is garbage.
//!
//! The version counter is seqlock-shaped: odd while a writer holds the
//! latch, bumped once on exclusive acquire and once on release. Shared
//! acquisitions do not touch it, so concurrent readers never invalidate each
//! other's tickets.

use std::sync::atomic::{AtomicU64, Ordering};

// ---------------------------------------------------------------------------
// LatchMode
// ---------------------------------------------------------------------------

/// Latch strength, totally ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LatchMode {
    /// Not held.
    None,
    /// Optimistic ticket; page reads must be validated.
    Q,
    /// Shared reader.
    Shared,
    /// Exclusive writer.
    Exclusive,
}

/// A Q-mode version ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QTicket(u64);

// ---------------------------------------------------------------------------
// Latch
// ---------------------------------------------------------------------------

const WRITER: u64 = 1 << 63;
const SPIN_BEFORE_YIELD: u32 = 512;

/// The latch: a reader/writer word plus the Q version counter.
#[derive(Debug, Default)]
pub struct Latch {
    /// Bit 63: writer held. Low bits: reader count. The writer bit is only
    /// set when the reader count is zero, and readers never enter while it
    /// is set.
    state: AtomicU64,
    /// Seqlock version: odd while exclusive is held.
    version: AtomicU64,
}

impl Latch {
    #[must_use]
    pub const fn new() -> Self {
        Self { state: AtomicU64::new(0), version: AtomicU64::new(0) }
    }

    // --- shared ---

    /// Try to acquire shared without blocking.
    pub fn try_shared(&self) -> bool {
        let mut state = self.state.load(Ordering::Relaxed);
        loop {
            if state & WRITER != 0 {
                return false;
            }
            match self.state.compare_exchange_weak(
                state,
                state + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => state = actual,
            }
        }
    }

    /// Acquire shared, spinning (then yielding) past writers.
    pub fn shared(&self) {
        let mut spins = 0u32;
        while !self.try_shared() {
            spins += 1;
            if spins < SPIN_BEFORE_YIELD {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }

    pub fn release_shared(&self) {
        let prev = self.state.fetch_sub(1, Ordering::Release);
        debug_assert!(prev & WRITER == 0 && prev > 0, "release_shared without holders");
    }

    // --- exclusive ---

    /// Try to acquire exclusive without blocking.
    pub fn try_exclusive(&self) -> bool {
        if self
            .state
            .compare_exchange(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            let v = self.version.fetch_add(1, Ordering::AcqRel);
            debug_assert!(v % 2 == 0, "version must be even while unlatched");
            true
        } else {
            false
        }
    }

    /// Acquire exclusive, spinning (then yielding) past other holders.
    pub fn exclusive(&self) {
        let mut spins = 0u32;
        while !self.try_exclusive() {
            spins += 1;
            if spins < SPIN_BEFORE_YIELD {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }

    pub fn release_exclusive(&self) {
        let v = self.version.fetch_add(1, Ordering::Release);
        debug_assert!(v % 2 == 1, "release_exclusive without the writer bit");
        let prev = self.state.swap(0, Ordering::Release);
        debug_assert_eq!(prev, WRITER);
    }

    // --- transitions ---

    /// Upgrade shared to exclusive. Never blocks: fails when any other
    /// holder (reader or writer) is present.
    pub fn try_upgrade(&self) -> bool {
        if self
            .state
            .compare_exchange(1, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.version.fetch_add(1, Ordering::AcqRel);
            true
        } else {
            false
        }
    }

    /// Downgrade exclusive to shared. Always succeeds.
    pub fn downgrade(&self) {
        let v = self.version.fetch_add(1, Ordering::Release);
        debug_assert!(v % 2 == 1);
        let prev = self.state.swap(1, Ordering::Release);
        debug_assert_eq!(prev, WRITER);
    }

    // --- Q mode ---

    /// Take a Q ticket. Fails (returns `None`) while a writer holds the
    /// latch; never blocks anyone.
    #[must_use]
    pub fn acquire_q(&self) -> Option<QTicket> {
        let v = self.version.load(Ordering::Acquire);
        if v % 2 == 1 { None } else { Some(QTicket(v)) }
    }

    /// True iff no writer committed to the page since the ticket was taken.
    #[must_use]
    pub fn validate(&self, ticket: QTicket) -> bool {
        self.version.load(Ordering::Acquire) == ticket.0
    }

    /// Current version; the parent-change check compares this across a
    /// child fix.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    // --- introspection ---

    #[must_use]
    pub fn is_write_held(&self) -> bool {
        self.state.load(Ordering::Relaxed) & WRITER != 0
    }

    #[must_use]
    pub fn reader_count(&self) -> u64 {
        let s = self.state.load(Ordering::Relaxed);
        if s & WRITER != 0 { 0 } else { s }
    }

    /// Release whatever `mode` was held. `None` and `Q` hold nothing.
    pub fn release_mode(&self, mode: LatchMode) {
        match mode {
            LatchMode::None | LatchMode::Q => {}
            LatchMode::Shared => self.release_shared(),
            LatchMode::Exclusive => self.release_exclusive(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn mode_order() {
        assert!(LatchMode::None < LatchMode::Q);
        assert!(LatchMode::Q < LatchMode::Shared);
        assert!(LatchMode::Shared < LatchMode::Exclusive);
    }

    #[test]
    fn shared_excludes_writer() {
        let latch = Latch::new();
        latch.shared();
        latch.shared();
        assert_eq!(latch.reader_count(), 2);
        assert!(!latch.try_exclusive());
        latch.release_shared();
        assert!(!latch.try_exclusive());
        latch.release_shared();
        assert!(latch.try_exclusive());
        latch.release_exclusive();
    }

    #[test]
    fn upgrade_only_as_sole_reader() {
        let latch = Latch::new();
        latch.shared();
        latch.shared();
        assert!(!latch.try_upgrade());
        latch.release_shared();
        assert!(latch.try_upgrade());
        assert!(latch.is_write_held());
        latch.downgrade();
        assert_eq!(latch.reader_count(), 1);
        latch.release_shared();
    }

    #[test]
    fn q_ticket_invalidated_by_writer() {
        let latch = Latch::new();
        let ticket = latch.acquire_q().unwrap();
        assert!(latch.validate(ticket));

        latch.exclusive();
        assert!(latch.acquire_q().is_none(), "no tickets while a writer holds");
        assert!(!latch.validate(ticket));
        latch.release_exclusive();

        assert!(!latch.validate(ticket), "ticket stays dead after the writer");
        let fresh = latch.acquire_q().unwrap();
        assert!(latch.validate(fresh));
    }

    #[test]
    fn q_ticket_survives_readers() {
        let latch = Latch::new();
        let ticket = latch.acquire_q().unwrap();
        latch.shared();
        latch.release_shared();
        assert!(latch.validate(ticket), "shared holders must not kill tickets");
    }

    #[test]
    fn writers_serialize_under_contention() {
        let latch = Arc::new(Latch::new());
        let counter = Arc::new(AtomicU64::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let latch = Arc::clone(&latch);
            let counter = Arc::clone(&counter);
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                barrier.wait();
                for _ in 0..2000 {
                    latch.exclusive();
                    let v = counter.load(Ordering::Relaxed);
                    counter.store(v + 1, Ordering::Relaxed);
                    latch.release_exclusive();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 16_000);
        // One bump per acquire and release.
        assert_eq!(latch.version(), 32_000);
    }

    #[test]
    fn torn_reads_are_caught_by_validation() {
        // A reader samples two values under a Q ticket while a writer
        // updates both; whenever validation passes, the pair is consistent.
        let latch = Arc::new(Latch::new());
        let a = Arc::new(AtomicU64::new(0));
        let b = Arc::new(AtomicU64::new(0));
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let w_latch = Arc::clone(&latch);
        let (wa, wb) = (Arc::clone(&a), Arc::clone(&b));
        let w_stop = Arc::clone(&stop);
        let writer = thread::spawn(move || {
            let mut v = 0u64;
            while !w_stop.load(Ordering::Relaxed) {
                v += 1;
                w_latch.exclusive();
                wa.store(v, Ordering::Release);
                wb.store(v, Ordering::Release);
                w_latch.release_exclusive();
            }
        });

        let mut validated = 0u64;
        for _ in 0..100_000 {
            let Some(ticket) = latch.acquire_q() else { continue };
            let ra = a.load(Ordering::Acquire);
            let rb = b.load(Ordering::Acquire);
            if latch.validate(ticket) {
                assert_eq!(ra, rb, "validated read must be consistent");
                validated += 1;
            }
        }
        stop.store(true, Ordering::Relaxed);
        writer.join().unwrap();
        assert!(validated > 0, "at least some optimistic reads must validate");
    }
}
