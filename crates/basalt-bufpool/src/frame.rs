//! Buffer frames: the page image plus its control block.
//!
//! The control block and the latch sit in separate [`CacheAligned`] cells so
//! they never share a 64-byte line: latch writes would otherwise pull the
//! control block into the writer's cache in exclusive mode even though most
//! control-block traffic is read-only.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU16, AtomicU32, AtomicU64, Ordering};

use basalt_types::{CacheAligned, FrameId, Lsn, Page, PageId, StoreId, VolumeId, resident_key};
use parking_lot::RwLock;

use crate::latch::Latch;

/// Sentinel pin count meaning "exclusively owned by the evictor".
pub const PIN_EVICTING: i32 = -1;

// ---------------------------------------------------------------------------
// ControlBlock
// ---------------------------------------------------------------------------

/// Per-frame control metadata. All fields are atomics: the control block is
/// read and written without holding the frame latch.
#[derive(Debug, Default)]
pub struct ControlBlock {
    /// Signed pin count; [`PIN_EVICTING`] marks a frame mid-eviction.
    pin_count: AtomicI32,
    /// Reference counter for eviction heuristics, capped to stay off the
    /// coherence fast path once a page is clearly hot.
    refcount: AtomicU16,
    /// Hint: number of swizzled pointers stored in this frame's page. Merges
    /// can desynchronize it; eviction treats it as advisory.
    swizzled_children: AtomicU16,

    used: AtomicBool,
    dirty: AtomicBool,
    in_doubt: AtomicBool,
    recovery_access: AtomicBool,

    /// Identity mirror, checkable without latching the page.
    vol: AtomicU32,
    pid: AtomicU32,
    store: AtomicU32,

    /// Parent frame hint, used only by eviction; stale values are tolerated
    /// and revalidated under latches.
    parent: AtomicU32,

    /// First LSN that dirtied the page since it was last clean.
    rec_lsn: AtomicU64,
    /// Mirror of the page header LSN.
    page_lsn: AtomicU64,
    /// LSN at which the page first became dirty ever (recovery bookkeeping).
    initial_dirty_lsn: AtomicU64,

    /// Write-order dependency: this frame must not be written before
    /// `dep_frame` (captured with that frame's `rec_lsn` to detect that the
    /// dependency has since been satisfied).
    dep_frame: AtomicU32,
    dep_rec_lsn: AtomicU64,
}

impl ControlBlock {
    // --- pinning ---

    /// Add a pin. Fails when the evictor owns the frame.
    pub fn pin(&self) -> bool {
        let mut cur = self.pin_count.load(Ordering::Relaxed);
        loop {
            if cur < 0 {
                return false;
            }
            match self.pin_count.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    pub fn unpin(&self) {
        let prev = self.pin_count.fetch_sub(1, Ordering::Release);
        debug_assert!(prev > 0, "unpin without pin");
    }

    #[must_use]
    pub fn pin_count(&self) -> i32 {
        self.pin_count.load(Ordering::Acquire)
    }

    /// Claim the frame for eviction: only succeeds at pin count zero.
    pub fn try_mark_evicting(&self) -> bool {
        self.pin_count
            .compare_exchange(0, PIN_EVICTING, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Abort an eviction claim.
    pub fn clear_evicting(&self) {
        let prev = self.pin_count.swap(0, Ordering::Release);
        debug_assert_eq!(prev, PIN_EVICTING);
    }

    // --- refcount ---

    /// Bump the reference hint, saturating at `max`.
    pub fn touch(&self, max: u16) {
        let cur = self.refcount.load(Ordering::Relaxed);
        if cur < max {
            // Racy add is fine; this is a heuristic.
            self.refcount.store(cur.saturating_add(1), Ordering::Relaxed);
        }
    }

    pub fn decay(&self) {
        let cur = self.refcount.load(Ordering::Relaxed);
        if cur > 0 {
            self.refcount.store(cur - 1, Ordering::Relaxed);
        }
    }

    #[must_use]
    pub fn refcount(&self) -> u16 {
        self.refcount.load(Ordering::Relaxed)
    }

    // --- swizzle hint ---

    pub fn swizzled_child_added(&self) {
        self.swizzled_children.fetch_add(1, Ordering::Relaxed);
    }

    pub fn swizzled_child_removed(&self) {
        let mut cur = self.swizzled_children.load(Ordering::Relaxed);
        while cur > 0 {
            match self.swizzled_children.compare_exchange_weak(
                cur,
                cur - 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }

    #[must_use]
    pub fn swizzled_children(&self) -> u16 {
        self.swizzled_children.load(Ordering::Relaxed)
    }

    // --- flags ---

    #[must_use]
    pub fn is_used(&self) -> bool {
        self.used.load(Ordering::Acquire)
    }

    pub fn set_used(&self, used: bool) {
        self.used.store(used, Ordering::Release);
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Mark dirty, capturing `page_lsn` as the recovery LSN if the page was
    /// clean before.
    pub fn set_dirty(&self) {
        if !self.dirty.swap(true, Ordering::AcqRel) {
            let lsn = self.page_lsn.load(Ordering::Acquire);
            self.rec_lsn.store(lsn, Ordering::Release);
            if self.initial_dirty_lsn.load(Ordering::Relaxed) == 0 {
                self.initial_dirty_lsn.store(lsn, Ordering::Release);
            }
        }
    }

    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
        self.rec_lsn.store(0, Ordering::Release);
    }

    #[must_use]
    pub fn is_in_doubt(&self) -> bool {
        self.in_doubt.load(Ordering::Acquire)
    }

    pub fn set_in_doubt(&self, v: bool) {
        self.in_doubt.store(v, Ordering::Release);
    }

    #[must_use]
    pub fn is_recovery_access(&self) -> bool {
        self.recovery_access.load(Ordering::Acquire)
    }

    pub fn set_recovery_access(&self, v: bool) {
        self.recovery_access.store(v, Ordering::Release);
    }

    // --- identity ---

    pub fn set_identity(&self, vol: VolumeId, pid: PageId, store: StoreId) {
        debug_assert!(!pid.is_swizzled());
        self.vol.store(vol.get(), Ordering::Release);
        self.pid.store(pid.bits(), Ordering::Release);
        self.store.store(store.get(), Ordering::Release);
    }

    #[must_use]
    pub fn vol(&self) -> VolumeId {
        VolumeId::new(self.vol.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn pid(&self) -> PageId {
        PageId::from_bits(self.pid.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn store(&self) -> StoreId {
        StoreId::new(self.store.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn key(&self) -> u64 {
        resident_key(self.vol(), self.pid())
    }

    /// True when this frame currently holds `(vol, pid)`.
    #[must_use]
    pub fn matches(&self, vol: VolumeId, pid: PageId) -> bool {
        self.is_used() && self.vol() == vol && self.pid() == pid
    }

    // --- parent hint ---

    #[must_use]
    pub fn parent(&self) -> FrameId {
        FrameId::new(self.parent.load(Ordering::Acquire))
    }

    pub fn set_parent(&self, parent: FrameId) {
        self.parent.store(parent.get(), Ordering::Release);
    }

    // --- LSNs ---

    #[must_use]
    pub fn rec_lsn(&self) -> Lsn {
        Lsn::from_data(self.rec_lsn.load(Ordering::Acquire))
    }

    pub fn set_rec_lsn(&self, lsn: Lsn) {
        self.rec_lsn.store(lsn.data(), Ordering::Release);
    }

    #[must_use]
    pub fn page_lsn(&self) -> Lsn {
        Lsn::from_data(self.page_lsn.load(Ordering::Acquire))
    }

    pub fn set_page_lsn(&self, lsn: Lsn) {
        self.page_lsn.store(lsn.data(), Ordering::Release);
    }

    #[must_use]
    pub fn initial_dirty_lsn(&self) -> Lsn {
        Lsn::from_data(self.initial_dirty_lsn.load(Ordering::Acquire))
    }

    pub fn set_initial_dirty_lsn(&self, lsn: Lsn) {
        self.initial_dirty_lsn.store(lsn.data(), Ordering::Release);
    }

    // --- write-order dependency ---

    pub fn set_dependency(&self, frame: FrameId, rec_lsn: Lsn) {
        self.dep_frame.store(frame.get(), Ordering::Release);
        self.dep_rec_lsn.store(rec_lsn.data(), Ordering::Release);
    }

    pub fn clear_dependency(&self) {
        self.dep_frame.store(0, Ordering::Release);
        self.dep_rec_lsn.store(0, Ordering::Release);
    }

    #[must_use]
    pub fn dependency(&self) -> Option<(FrameId, Lsn)> {
        let frame = self.dep_frame.load(Ordering::Acquire);
        if frame == 0 {
            None
        } else {
            Some((
                FrameId::new(frame),
                Lsn::from_data(self.dep_rec_lsn.load(Ordering::Acquire)),
            ))
        }
    }

    /// Reset everything for a frame returning to the free list.
    pub fn reset(&self) {
        self.pin_count.store(0, Ordering::Release);
        self.refcount.store(0, Ordering::Release);
        self.swizzled_children.store(0, Ordering::Release);
        self.used.store(false, Ordering::Release);
        self.dirty.store(false, Ordering::Release);
        self.in_doubt.store(false, Ordering::Release);
        self.recovery_access.store(false, Ordering::Release);
        self.vol.store(0, Ordering::Release);
        self.pid.store(0, Ordering::Release);
        self.store.store(0, Ordering::Release);
        self.parent.store(0, Ordering::Release);
        self.rec_lsn.store(0, Ordering::Release);
        self.page_lsn.store(0, Ordering::Release);
        self.initial_dirty_lsn.store(0, Ordering::Release);
        self.dep_frame.store(0, Ordering::Release);
        self.dep_rec_lsn.store(0, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// One buffer slot: control block, latch, page image.
///
/// The page image lives behind its own `RwLock`; accessors take short guards
/// scoped to a closure. The latch, not the `RwLock`, carries the protocol:
/// the guard is uncontended for latched access and only overlaps briefly
/// with optimistic readers.
#[derive(Debug, Default)]
pub struct Frame {
    pub cb: CacheAligned<ControlBlock>,
    pub latch: CacheAligned<Latch>,
    page: RwLock<Page>,
}

impl Frame {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read access to the page image.
    pub fn with_page<R>(&self, f: impl FnOnce(&Page) -> R) -> R {
        f(&self.page.read())
    }

    /// Write access to the page image.
    pub fn with_page_mut<R>(&self, f: impl FnOnce(&mut Page) -> R) -> R {
        f(&mut self.page.write())
    }

    /// Replace the whole image (load, recovery).
    pub fn install_page(&self, page: Page) {
        self.cb.set_page_lsn(page.lsn());
        *self.page.write() = page;
    }

    /// Clone the current image (write-out path).
    #[must_use]
    pub fn snapshot_page(&self) -> Page {
        self.page.read().clone()
    }
}
