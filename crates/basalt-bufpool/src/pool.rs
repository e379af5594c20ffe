//! The buffer pool: frame ownership, the fix contract, swizzling, volume
//! mounting, write-back, and the recovery-side hooks.
//!
//! Frame index 0 is reserved as null. The free list is a singly linked list
//! threaded through a side array under a spin-style mutex; eviction is a
//! separate sequential sweep guarded by its own mutex (one evictor at a
//! time, see [`crate::evict`]).

use std::collections::HashMap;
use std::sync::Arc;

use basalt_error::{BasaltError, Result};
use basalt_log::{LogManager, LogRecord, recover_page};
use basalt_types::{
    EngineOptions, FrameId, Lsn, Page, PageFlags, PageId, StoreId, VolumeId, resident_key,
};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::Ordering;
use tracing::{debug, trace, warn};

use crate::frame::Frame;
use crate::handle::PageHandle;
use crate::hashtable::{Insert, ResidentTable};
use crate::latch::LatchMode;
use crate::metrics::{
    BP_FIXES_TOTAL, BP_HITS_TOTAL, BP_MISSES_TOTAL, BP_SPR_TOTAL, BP_SWIZZLES_TOTAL,
    BP_UNSWIZZLES_TOTAL, BP_WRITEBACKS_TOTAL,
};
use crate::volume::Volume;

// ---------------------------------------------------------------------------
// Free list
// ---------------------------------------------------------------------------

/// Singly linked free list threaded through a side array; slot 0 is the head.
#[derive(Debug)]
pub(crate) struct FreeList {
    next: Vec<u32>,
    len: u32,
}

impl FreeList {
    fn new(frames: usize) -> Self {
        // All frames except 0 start free, linked in ascending order.
        let mut next = vec![0u32; frames];
        for i in 1..frames {
            next[i - 1] = i as u32;
        }
        if frames > 1 {
            next[frames - 1] = 0;
            next[0] = 1;
        }
        Self { next, len: frames.saturating_sub(1) as u32 }
    }

    fn pop(&mut self) -> Option<FrameId> {
        let head = self.next[0];
        if head == 0 {
            return None;
        }
        self.next[0] = self.next[head as usize];
        self.next[head as usize] = 0;
        self.len -= 1;
        Some(FrameId::new(head))
    }

    fn push(&mut self, idx: FrameId) {
        let i = idx.get();
        debug_assert_ne!(i, 0);
        self.next[i as usize] = self.next[0];
        self.next[0] = i;
        self.len += 1;
    }

    fn len(&self) -> u32 {
        self.len
    }
}

/// Sequential eviction cursor. Guarded by the eviction mutex.
#[derive(Debug, Default)]
pub(crate) struct EvictionHand {
    pub(crate) hand: u32,
}

/// Checkpoint view of one dirty or in-doubt frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyPageInfo {
    pub vol: VolumeId,
    pub pid: PageId,
    pub store: StoreId,
    pub rec_lsn: Lsn,
    pub page_lsn: Lsn,
    pub in_doubt: bool,
}

// ---------------------------------------------------------------------------
// BufferPool
// ---------------------------------------------------------------------------

/// The buffer pool. Process-wide singleton owned by the engine.
pub struct BufferPool {
    frames: Vec<Frame>,
    table: ResidentTable,
    freelist: Mutex<FreeList>,
    pub(crate) eviction: Mutex<EvictionHand>,
    volumes: RwLock<HashMap<u32, Arc<Volume>>>,
    pub(crate) log: Arc<LogManager>,
    enable_swizzling: bool,
    pub(crate) eviction_batch_ratio: f64,
    max_refcount: u16,
}

impl BufferPool {
    #[must_use]
    pub fn new(opts: &EngineOptions, log: Arc<LogManager>) -> Self {
        let frames = opts.bufferpool_frames.max(8);
        Self {
            frames: (0..frames).map(|_| Frame::new()).collect(),
            table: ResidentTable::new(frames),
            freelist: Mutex::new(FreeList::new(frames)),
            eviction: Mutex::new(EvictionHand::default()),
            volumes: RwLock::new(HashMap::new()),
            log,
            enable_swizzling: opts.enable_swizzling,
            eviction_batch_ratio: opts.eviction_batch_ratio,
            max_refcount: opts.max_refcount,
        }
    }

    // --- introspection ---

    /// Total frames, including the reserved null slot.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn free_frames(&self) -> u32 {
        self.freelist.lock().len()
    }

    #[must_use]
    pub fn used_frames(&self) -> usize {
        self.frames[1..].iter().filter(|f| f.cb.is_used()).count()
    }

    #[must_use]
    pub fn dirty_frames(&self) -> usize {
        self.frames[1..]
            .iter()
            .filter(|f| f.cb.is_used() && f.cb.is_dirty())
            .count()
    }

    #[must_use]
    pub fn is_swizzling_enabled(&self) -> bool {
        self.enable_swizzling
    }

    pub(crate) fn frame_ref(&self, idx: FrameId) -> &Frame {
        &self.frames[idx.index()]
    }

    pub(crate) fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Resolve a possibly swizzled id to the disk page id.
    #[must_use]
    pub fn normalize_pid(&self, pid: PageId) -> PageId {
        match pid.frame() {
            Some(frame) => self.frame_ref(frame).cb.pid(),
            None => pid,
        }
    }

    // --- volumes ---

    pub fn install_volume(&self, volume: Arc<Volume>) -> Result<()> {
        let mut volumes = self.volumes.write();
        if volumes.contains_key(&volume.id().get()) {
            return Err(BasaltError::internal(format!(
                "volume {} already mounted",
                volume.id()
            )));
        }
        volumes.insert(volume.id().get(), volume);
        Ok(())
    }

    /// Write back everything dirty on the volume, drop its root pins, and
    /// free every resident frame. The caller must have quiesced access.
    pub fn uninstall_volume(&self, vol: VolumeId) -> Result<()> {
        let volume = self.volume(vol)?;
        self.force_volume(vol)?;
        for (store, frame) in volume.all_root_frames() {
            self.frame_ref(frame).cb.unpin();
            volume.clear_root_frame(store);
        }
        for idx in 1..self.frames.len() {
            let frame = &self.frames[idx];
            if !frame.cb.is_used() || frame.cb.vol() != vol {
                continue;
            }
            if frame.cb.pin_count() != 0 {
                return Err(BasaltError::internal(format!(
                    "unmount of {vol} with pinned page {}",
                    frame.cb.pid()
                )));
            }
            self.table.remove_if_matches(frame.cb.key(), FrameId::new(idx as u32));
            frame.cb.reset();
            self.add_free_frame(FrameId::new(idx as u32));
        }
        self.volumes.write().remove(&vol.get());
        debug!(target: "basalt.bufpool", vol = %vol, "volume uninstalled");
        Ok(())
    }

    pub fn volume(&self, vol: VolumeId) -> Result<Arc<Volume>> {
        self.volumes
            .read()
            .get(&vol.get())
            .cloned()
            .ok_or_else(|| BasaltError::internal(format!("volume {vol} not mounted")))
    }

    // --- root fixes ---

    /// Preload and register an existing root page for `store`. The root
    /// frame stays pinned until unmount.
    pub fn register_root(&self, vol: VolumeId, store: StoreId, root_pid: PageId) -> Result<()> {
        let volume = self.volume(vol)?;
        if volume.root_frame(store).is_some() {
            return Ok(());
        }
        let handle = self.fix_direct(vol, root_pid, LatchMode::Shared, false, false)?;
        let frame = handle.frame();
        // One extra pin held by the volume descriptor.
        assert!(self.frame_ref(frame).cb.pin());
        volume.set_root_frame(store, frame);
        Ok(())
    }

    /// Fix an existing root page. Always resolves through the volume
    /// descriptor's root index; never misses.
    pub fn fix_root(
        &self,
        vol: VolumeId,
        store: StoreId,
        mode: LatchMode,
        conditional: bool,
    ) -> Result<PageHandle<'_>> {
        BP_FIXES_TOTAL.fetch_add(1, Ordering::Relaxed);
        let volume = self.volume(vol)?;
        let idx = volume
            .root_frame(store)
            .ok_or(BasaltError::NoSuchStore { vol, store })?;
        let frame = self.frame_ref(idx);
        assert!(frame.cb.pin(), "root frames are permanently pinned");
        if let Err(e) = self.latch_frame(idx, mode, conditional) {
            frame.cb.unpin();
            return Err(e);
        }
        frame.cb.touch(self.max_refcount);
        BP_HITS_TOTAL.fetch_add(1, Ordering::Relaxed);
        Ok(PageHandle::new_latched(self, idx, mode, true))
    }

    /// Fix a fresh root page for a new store, exclusive and unconditional.
    pub fn fix_virgin_root(
        &self,
        vol: VolumeId,
        store: StoreId,
        root_pid: PageId,
    ) -> Result<PageHandle<'_>> {
        let volume = self.volume(vol)?;
        let handle = self.fix_direct(vol, root_pid, LatchMode::Exclusive, false, true)?;
        handle.set_store(store);
        assert!(self.frame_ref(handle.frame()).cb.pin());
        volume.set_root_frame(store, handle.frame());
        Ok(handle)
    }

    /// Drop a store's root registration, releasing the volume's pin on the
    /// frame. Used when a store is deleted or its creation rolled back.
    pub fn deregister_root(&self, vol: VolumeId, store: StoreId) -> Result<()> {
        let volume = self.volume(vol)?;
        if let Some(frame) = volume.clear_root_frame(store) {
            self.frame_ref(frame).cb.unpin();
        }
        Ok(())
    }

    /// Optimistic root fix: returns a Q-ticketed handle.
    pub fn fix_with_q_root(&self, vol: VolumeId, store: StoreId) -> Result<PageHandle<'_>> {
        BP_FIXES_TOTAL.fetch_add(1, Ordering::Relaxed);
        let volume = self.volume(vol)?;
        let idx = volume
            .root_frame(store)
            .ok_or(BasaltError::NoSuchStore { vol, store })?;
        let frame = self.frame_ref(idx);
        let ticket = frame
            .latch
            .acquire_q()
            .ok_or(BasaltError::LatchQFail { pid: frame.cb.pid() })?;
        Ok(PageHandle::new_q(self, idx, ticket))
    }

    // --- non-root fixes ---

    /// Fix a child page through its (latched) parent. The fast path decodes
    /// a swizzled pointer straight to the frame; the slow path goes through
    /// the resident table and, on a miss, loads from disk. May swizzle the
    /// parent's pointer on the way out.
    pub fn fix_nonroot(
        &self,
        parent: &PageHandle<'_>,
        vol: VolumeId,
        pid: PageId,
        mode: LatchMode,
        conditional: bool,
        virgin: bool,
    ) -> Result<PageHandle<'_>> {
        BP_FIXES_TOTAL.fetch_add(1, Ordering::Relaxed);
        debug_assert!(!pid.is_null());

        if mode == LatchMode::Q || parent.mode() == LatchMode::Q {
            // Optimistic descent demands a swizzled pointer to a resident,
            // non-virgin page; anything else must retry with a stronger
            // latch.
            if virgin || !pid.is_swizzled() {
                return Err(BasaltError::LatchQFail { pid });
            }
            return self.fix_swizzled_q(parent, pid, mode);
        }

        if let Some(idx) = pid.frame() {
            // Swizzled fast path: the parent latch plus the swizzle pin keep
            // the frame alive and bound to this child.
            let frame = self.frame_ref(idx);
            if !frame.cb.pin() {
                return Err(BasaltError::FrameGone { frame: idx });
            }
            debug_assert!(frame.cb.is_used(), "swizzled pointer to an unused frame");
            if let Err(e) = self.latch_frame(idx, mode, conditional) {
                frame.cb.unpin();
                return Err(e);
            }
            frame.cb.touch(self.max_refcount);
            BP_HITS_TOTAL.fetch_add(1, Ordering::Relaxed);
            return Ok(PageHandle::new_latched(self, idx, mode, true));
        }

        let store_hint = parent.store();
        let handle = self.fix_nonswizzled(Some(parent), vol, pid, mode, conditional, virgin, store_hint)?;
        if self.enable_swizzling && !virgin && parent.mode() >= LatchMode::Shared {
            self.maybe_swizzle(parent, pid, handle.frame());
        }
        Ok(handle)
    }

    /// Q-mode fix through a swizzled pointer, with the parent-change check.
    fn fix_swizzled_q(
        &self,
        parent: &PageHandle<'_>,
        pid: PageId,
        mode: LatchMode,
    ) -> Result<PageHandle<'_>> {
        let idx = pid.frame().expect("caller checked is_swizzled");
        let parent_frame = self.frame_ref(parent.frame());
        let parent_version = parent_frame.latch.version();

        let frame = self.frame_ref(idx);
        let ticket = frame
            .latch
            .acquire_q()
            .ok_or(BasaltError::LatchQFail { pid })?;
        if !frame.cb.is_used() {
            return Err(BasaltError::LatchQFail { pid });
        }

        // The parent must not have changed observably across the child fix:
        // its latch version is the change detector, and a Q-held parent must
        // additionally still validate its own ticket.
        if parent_frame.latch.version() != parent_version || !parent.validate_ticket() {
            return Err(BasaltError::ParentLatchQFail { pid });
        }
        if mode != LatchMode::Q {
            // The descent was optimistic but the caller wants a real latch;
            // it must redo the descent with a stronger parent latch.
            return Err(BasaltError::ParentLatchQFail { pid });
        }
        Ok(PageHandle::new_q(self, idx, ticket))
    }

    /// Fix without a parent. Rejects swizzled pointers (the frame behind one
    /// is only guaranteed while the parent is latched) and Q mode.
    pub fn fix_direct(
        &self,
        vol: VolumeId,
        pid: PageId,
        mode: LatchMode,
        conditional: bool,
        virgin: bool,
    ) -> Result<PageHandle<'_>> {
        BP_FIXES_TOTAL.fetch_add(1, Ordering::Relaxed);
        if pid.is_swizzled() {
            return Err(BasaltError::DirectFixSwizzledPointer { pid });
        }
        if mode == LatchMode::Q {
            return Err(BasaltError::LatchQFail { pid });
        }
        self.fix_nonswizzled(None, vol, pid, mode, conditional, virgin, StoreId::RESERVED)
    }

    /// Fix through a swizzled pointer that may be stale (no parent held).
    /// The page actually fixed may differ from the one the pointer meant;
    /// the caller must revalidate identity afterwards.
    pub fn fix_unsafely_nonroot(&self, pid: PageId, mode: LatchMode) -> Result<PageHandle<'_>> {
        BP_FIXES_TOTAL.fetch_add(1, Ordering::Relaxed);
        let idx = pid
            .frame()
            .ok_or(BasaltError::LatchQFail { pid })?;
        let frame = self.frame_ref(idx);
        match mode {
            LatchMode::Q => {
                let ticket = frame
                    .latch
                    .acquire_q()
                    .ok_or(BasaltError::LatchQFail { pid })?;
                if !frame.cb.is_used() {
                    return Err(BasaltError::LatchQFail { pid });
                }
                Ok(PageHandle::new_q(self, idx, ticket))
            }
            LatchMode::Shared | LatchMode::Exclusive => {
                if !frame.cb.pin() {
                    return Err(BasaltError::FrameGone { frame: idx });
                }
                if let Err(e) = self.latch_frame(idx, mode, true) {
                    frame.cb.unpin();
                    return Err(e);
                }
                if !frame.cb.is_used() {
                    frame.latch.release_mode(mode);
                    frame.cb.unpin();
                    return Err(BasaltError::FrameGone { frame: idx });
                }
                Ok(PageHandle::new_latched(self, idx, mode, true))
            }
            LatchMode::None => Err(BasaltError::internal("fix with mode None")),
        }
    }

    // --- refix ---

    /// Add a pin so the page can be re-fixed later without a parent.
    #[must_use]
    pub fn pin_for_refix(&self, handle: &PageHandle<'_>) -> FrameId {
        let idx = handle.frame();
        assert!(self.frame_ref(idx).cb.pin());
        idx
    }

    /// Re-fix a page by frame index; the extra pin from
    /// [`pin_for_refix`](Self::pin_for_refix) guarantees the frame was not
    /// recycled.
    pub fn refix_direct(
        &self,
        idx: FrameId,
        mode: LatchMode,
        conditional: bool,
    ) -> Result<PageHandle<'_>> {
        BP_FIXES_TOTAL.fetch_add(1, Ordering::Relaxed);
        if mode == LatchMode::Q {
            return Err(BasaltError::LatchQFail { pid: PageId::NULL });
        }
        let frame = self.frame_ref(idx);
        if !frame.cb.is_used() || !frame.cb.pin() {
            return Err(BasaltError::FrameGone { frame: idx });
        }
        if let Err(e) = self.latch_frame(idx, mode, conditional) {
            frame.cb.unpin();
            return Err(e);
        }
        frame.cb.touch(self.max_refcount);
        Ok(PageHandle::new_latched(self, idx, mode, true))
    }

    /// Drop the pin added by [`pin_for_refix`](Self::pin_for_refix).
    pub fn unpin_for_refix(&self, idx: FrameId) {
        self.frame_ref(idx).cb.unpin();
    }

    // --- internals ---

    fn latch_frame(&self, idx: FrameId, mode: LatchMode, conditional: bool) -> Result<()> {
        let latch = &self.frame_ref(idx).latch;
        match mode {
            LatchMode::Shared => {
                if conditional {
                    if !latch.try_shared() {
                        return Err(BasaltError::WouldBlock { what: "shared page latch" });
                    }
                } else {
                    latch.shared();
                }
            }
            LatchMode::Exclusive => {
                if conditional {
                    if !latch.try_exclusive() {
                        return Err(BasaltError::WouldBlock { what: "exclusive page latch" });
                    }
                } else {
                    latch.exclusive();
                }
            }
            LatchMode::Q | LatchMode::None => {
                return Err(BasaltError::internal("latch_frame handles SH/EX only"));
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn fix_nonswizzled(
        &self,
        parent: Option<&PageHandle<'_>>,
        vol: VolumeId,
        pid: PageId,
        mode: LatchMode,
        conditional: bool,
        virgin: bool,
        store_hint: StoreId,
    ) -> Result<PageHandle<'_>> {
        debug_assert!(mode == LatchMode::Shared || mode == LatchMode::Exclusive);
        let key = resident_key(vol, pid);
        loop {
            if let Some(handle) = self.try_fix_resident(key, vol, pid, mode, conditional)? {
                BP_HITS_TOTAL.fetch_add(1, Ordering::Relaxed);
                return Ok(handle);
            }

            BP_MISSES_TOTAL.fetch_add(1, Ordering::Relaxed);
            let idx = self.grab_free_frame(true)?;
            let frame = self.frame_ref(idx);
            frame.cb.reset();
            frame.cb.set_identity(vol, pid, store_hint);
            frame.cb.set_used(true);
            assert!(frame.cb.pin());
            let latched = frame.latch.try_exclusive();
            debug_assert!(latched, "fresh frames are uncontended");

            let parent_idx = parent.map_or(FrameId::NULL, PageHandle::frame);
            match self.table.insert_if_absent(key, idx, parent_idx) {
                Insert::Present(_) => {
                    // Lost the load race; retry on the resident path.
                    frame.latch.release_exclusive();
                    frame.cb.reset();
                    self.add_free_frame(idx);
                    continue;
                }
                Insert::Inserted => {}
            }
            frame.cb.set_parent(parent_idx);

            let load = if virgin {
                frame.install_page(Page::new(vol, pid, store_hint));
                Ok(())
            } else {
                let emlsn = parent.map_or(Lsn::NULL, |p| p.child_emlsn_for(pid));
                self.read_and_check(vol, pid, emlsn).map(|page| {
                    frame.cb.set_identity(vol, pid, page.store());
                    frame.install_page(page);
                })
            };
            if let Err(e) = load {
                self.table.remove_if_matches(key, idx);
                frame.latch.release_exclusive();
                frame.cb.reset();
                self.add_free_frame(idx);
                return Err(e);
            }

            frame.cb.touch(self.max_refcount);
            if mode == LatchMode::Shared {
                frame.latch.downgrade();
            }
            return Ok(PageHandle::new_latched(self, idx, mode, true));
        }
    }

    fn try_fix_resident(
        &self,
        key: u64,
        vol: VolumeId,
        pid: PageId,
        mode: LatchMode,
        conditional: bool,
    ) -> Result<Option<PageHandle<'_>>> {
        let Some((idx, _parent)) = self.table.lookup(key) else {
            return Ok(None);
        };
        let frame = self.frame_ref(idx);
        if !frame.cb.pin() {
            // Mid-eviction; the entry will disappear shortly.
            std::thread::yield_now();
            return Ok(None);
        }
        if !frame.cb.matches(vol, pid) {
            frame.cb.unpin();
            return Ok(None);
        }
        if frame.cb.is_in_doubt() {
            // Concurrent access to an in-doubt page blocks until recovery
            // releases it; conditional callers get the non-blocking answer.
            frame.cb.unpin();
            if conditional {
                return Err(BasaltError::WouldBlock { what: "page in doubt" });
            }
            std::thread::yield_now();
            return Ok(None);
        }
        if let Err(e) = self.latch_frame(idx, mode, conditional) {
            frame.cb.unpin();
            return Err(e);
        }
        // Re-check identity: the pin landed after the lookup.
        if !frame.cb.matches(vol, pid) {
            frame.latch.release_mode(mode);
            frame.cb.unpin();
            return Ok(None);
        }
        frame.cb.touch(self.max_refcount);
        Ok(Some(PageHandle::new_latched(self, idx, mode, true)))
    }

    fn read_and_check(&self, vol: VolumeId, pid: PageId, emlsn: Lsn) -> Result<Page> {
        let volume = self.volume(vol)?;
        let image = volume.device().read_page(pid)?;
        let base = match image {
            Some(bytes) if Page::checksum_ok(&bytes) => {
                let page = Page::decode_unchecked(&bytes);
                if page.vol() == vol && page.pid() == pid {
                    if emlsn.is_null() || page.lsn() >= emlsn {
                        return Ok(page);
                    }
                    trace!(
                        target: "basalt.bufpool",
                        vol = %vol, pid = %pid, page_lsn = %page.lsn(), emlsn = %emlsn,
                        "stale page image, invoking single-page recovery"
                    );
                    Some(page)
                } else {
                    warn!(
                        target: "basalt.bufpool",
                        vol = %vol, pid = %pid, "page image identity mismatch, rebuilding"
                    );
                    None
                }
            }
            Some(_) => {
                warn!(target: "basalt.bufpool", vol = %vol, pid = %pid, "corrupt page image, rebuilding");
                None
            }
            None => None,
        };
        BP_SPR_TOTAL.fetch_add(1, Ordering::Relaxed);
        recover_page(&self.log, vol, pid, base, emlsn)
    }

    pub(crate) fn grab_free_frame(&self, evict: bool) -> Result<FrameId> {
        use crate::evict::EvictUrgency;
        const LADDER: [EvictUrgency; 4] = [
            EvictUrgency::Normal,
            EvictUrgency::Eager,
            EvictUrgency::Urgent,
            EvictUrgency::Urgent,
        ];
        for attempt in 0..=LADDER.len() {
            if let Some(idx) = self.freelist.lock().pop() {
                return Ok(idx);
            }
            if !evict || attempt == LADDER.len() {
                break;
            }
            self.evict_blocks(LADDER[attempt], 1)?;
        }
        Err(BasaltError::FreelistExhausted)
    }

    pub(crate) fn add_free_frame(&self, idx: FrameId) {
        self.freelist.lock().push(idx);
    }

    pub(crate) fn remove_resident(&self, key: u64, idx: FrameId) -> bool {
        self.table.remove_if_matches(key, idx)
    }

    // --- swizzling ---

    /// Swizzle the parent's pointer to `child_pid` if the slot still holds
    /// the disk id. Requires the parent latched at least shared; the store
    /// itself is a single pointer-slot update and the resident-table entry
    /// is kept, so concurrent readers of the stale disk id stay correct.
    pub(crate) fn maybe_swizzle(&self, parent: &PageHandle<'_>, child_pid: PageId, child: FrameId) {
        debug_assert!(!child_pid.is_swizzled());
        let child_frame = self.frame_ref(child);
        // Pin for the swizzle relation before publishing the pointer.
        if !child_frame.cb.pin() {
            return;
        }
        let parent_frame = self.frame_ref(parent.frame());
        let swizzled = PageId::swizzled(child);
        let done = parent_frame.with_page_mut(|p| match p.find_child(child_pid) {
            Some(slot) => {
                p.set_child(slot, swizzled);
                true
            }
            None => false,
        });
        if done {
            parent_frame.cb.swizzled_child_added();
            child_frame.cb.set_parent(parent.frame());
            BP_SWIZZLES_TOTAL.fetch_add(1, Ordering::Relaxed);
            trace!(target: "basalt.bufpool", parent = %parent.frame(), child = %child, "swizzled");
        } else {
            child_frame.cb.unpin();
        }
    }

    /// Swizzle one child slot of a latched parent, if that child is already
    /// resident. Children not in the pool are ignored.
    pub fn swizzle_child(&self, parent: &PageHandle<'_>, slot: usize) {
        if !self.enable_swizzling {
            return;
        }
        let child_pid = parent.with_page(|p| {
            if slot < p.child_count() { Some(p.child(slot)) } else { None }
        });
        let Some(child_pid) = child_pid else { return };
        if child_pid.is_swizzled() || child_pid.is_null() {
            return;
        }
        let key = resident_key(parent.vol(), child_pid);
        if let Some((child, _)) = self.table.lookup(key) {
            if self.frame_ref(child).cb.matches(parent.vol(), child_pid) {
                self.maybe_swizzle(parent, child_pid, child);
            }
        }
    }

    /// Batch form of [`swizzle_child`](Self::swizzle_child).
    pub fn swizzle_children(&self, parent: &PageHandle<'_>, slots: &[usize]) {
        for &slot in slots {
            self.swizzle_child(parent, slot);
        }
    }

    /// Unswizzle one slot of an exclusively latched parent, dropping the
    /// swizzle pin on the child. Returns whether the slot was swizzled.
    pub(crate) fn unswizzle_slot(&self, parent_idx: FrameId, slot: usize) -> bool {
        let parent_frame = self.frame_ref(parent_idx);
        let child = parent_frame.with_page_mut(|p| {
            let ptr = p.child(slot);
            ptr.frame().map(|child| {
                p.set_child(slot, self.frame_ref(child).cb.pid());
                child
            })
        });
        match child {
            Some(child) => {
                self.frame_ref(child).cb.unpin();
                parent_frame.cb.swizzled_child_removed();
                BP_UNSWIZZLES_TOTAL.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Accurate scan for swizzled pointers in a frame's page, as opposed to
    /// the control-block counter hint.
    #[must_use]
    pub fn has_swizzled_child(&self, handle: &PageHandle<'_>) -> bool {
        handle.with_page(|p| (0..p.child_count()).any(|i| p.child(i).is_swizzled()))
    }

    /// Re-point the resident-table parent hint after an adoption. Both
    /// pages must be latched by the caller.
    pub fn switch_parent(&self, vol: VolumeId, pid: PageId, new_parent: FrameId) {
        debug_assert!(!pid.is_swizzled());
        let key = resident_key(vol, pid);
        if self.table.update_parent(key, new_parent) {
            if let Some((idx, _)) = self.table.lookup(key) {
                self.frame_ref(idx).cb.set_parent(new_parent);
            }
        }
    }

    // --- write-order dependencies ---

    /// Register "write `page` only after `dependency`". Rejected when the
    /// dependency target is already clean, when `page` already carries an
    /// edge, or when the edge would close a cycle; the caller must then give
    /// up its logging shortcut.
    pub fn register_write_order_dependency(
        &self,
        page: &PageHandle<'_>,
        dependency: &PageHandle<'_>,
    ) -> bool {
        let frame = self.frame_ref(page.frame());
        let dep_frame = self.frame_ref(dependency.frame());
        if !dep_frame.cb.is_dirty() {
            return false;
        }
        if frame.cb.dependency().is_some() {
            return false;
        }
        // Bounded DFS along the (single-edge) chain from the dependency.
        let mut cursor = dependency.frame();
        for _ in 0..self.frames.len() {
            if cursor == page.frame() {
                return false; // would close a cycle
            }
            match self.frame_ref(cursor).cb.dependency() {
                Some((next, _)) => cursor = next,
                None => break,
            }
        }
        frame.cb.set_dependency(dependency.frame(), dep_frame.cb.rec_lsn());
        true
    }

    // --- write-back ---

    /// Write one dirty frame, honoring write-ahead logging, write-order
    /// dependencies, and un-swizzling pointers in the on-disk image.
    pub(crate) fn write_out_frame(&self, idx: FrameId, depth: u32) -> Result<bool> {
        if depth > 8 {
            return Err(BasaltError::DependencyRejected { detail: "dependency chain too deep" });
        }
        let frame = self.frame_ref(idx);
        if !frame.cb.is_used() || !frame.cb.is_dirty() || frame.cb.is_in_doubt() {
            return Ok(false);
        }
        frame.latch.shared();
        let result = self.write_out_locked(idx, depth);
        frame.latch.release_shared();
        result
    }

    fn write_out_locked(&self, idx: FrameId, depth: u32) -> Result<bool> {
        let frame = self.frame_ref(idx);
        if !frame.cb.is_dirty() {
            return Ok(false);
        }
        // A page scheduled for deletion is reclaimed, never written.
        let deleted = frame.with_page(|p| p.flags().contains(PageFlags::TO_BE_DELETED));
        if deleted {
            return Ok(false);
        }
        if let Some((dep, dep_rec)) = frame.cb.dependency() {
            let dep_frame = self.frame_ref(dep);
            if dep_frame.cb.is_used()
                && dep_frame.cb.is_dirty()
                && dep_frame.cb.rec_lsn() == dep_rec
            {
                self.write_out_frame(dep, depth + 1)?;
            }
            frame.cb.clear_dependency();
        }
        // WAL: the page's last update must be durable before the image.
        let page_lsn = frame.cb.page_lsn();
        if !page_lsn.is_null() {
            self.log.wait_durable(page_lsn.advance(1))?;
        }
        let mut image = frame.snapshot_page();
        for slot in 0..image.child_count() {
            if let Some(child) = image.child(slot).frame() {
                image.set_child(slot, self.frame_ref(child).cb.pid());
            }
        }
        let volume = self.volume(frame.cb.vol())?;
        volume.device().write_page(image.pid(), &image.encode())?;
        frame.cb.clear_dirty();
        BP_WRITEBACKS_TOTAL.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    /// Write back every dirty page with `rec_lsn <= lsn`. Returns the count
    /// written.
    pub fn force_until_lsn(&self, lsn: Lsn) -> Result<usize> {
        let mut written = 0;
        for idx in 1..self.frames.len() {
            let frame = &self.frames[idx];
            if frame.cb.is_used()
                && frame.cb.is_dirty()
                && !frame.cb.is_in_doubt()
                && frame.cb.rec_lsn() <= lsn
                && self.write_out_frame(FrameId::new(idx as u32), 0)?
            {
                written += 1;
            }
        }
        Ok(written)
    }

    /// Write back every dirty page.
    pub fn force_all(&self) -> Result<usize> {
        self.force_until_lsn(Lsn::MAX)
    }

    /// Write back every dirty page of one volume.
    pub fn force_volume(&self, vol: VolumeId) -> Result<usize> {
        let mut written = 0;
        for idx in 1..self.frames.len() {
            let frame = &self.frames[idx];
            if frame.cb.is_used()
                && frame.cb.vol() == vol
                && frame.cb.is_dirty()
                && !frame.cb.is_in_doubt()
                && self.write_out_frame(FrameId::new(idx as u32), 0)?
            {
                written += 1;
            }
        }
        Ok(written)
    }

    // --- checkpoint support ---

    /// Snapshot of all dirty and in-doubt frames, plus the pool-wide minimum
    /// recovery LSN.
    #[must_use]
    pub fn dirty_page_table(&self) -> (Vec<DirtyPageInfo>, Lsn) {
        let mut out = Vec::new();
        let mut min_rec = Lsn::MAX;
        for frame in &self.frames[1..] {
            let cb = &frame.cb;
            if !cb.is_used() || (!cb.is_dirty() && !cb.is_in_doubt()) {
                continue;
            }
            let rec = cb.rec_lsn();
            if !rec.is_null() && rec < min_rec {
                min_rec = rec;
            }
            out.push(DirtyPageInfo {
                vol: cb.vol(),
                pid: cb.pid(),
                store: cb.store(),
                rec_lsn: rec,
                page_lsn: cb.page_lsn(),
                in_doubt: cb.is_in_doubt(),
            });
        }
        if out.is_empty() {
            min_rec = Lsn::NULL;
        }
        (out, min_rec)
    }

    /// Clamp a frame's recovery LSN when it has run ahead of the page LSN
    /// (unlogged updates, or an exclusive fix that never wrote).
    pub fn repair_rec_lsn(&self, handle: &PageHandle<'_>, was_dirty: bool, new_rlsn: Lsn) {
        let cb = &self.frame_ref(handle.frame()).cb;
        if cb.rec_lsn() <= cb.page_lsn() {
            return;
        }
        if was_dirty {
            debug_assert!(!new_rlsn.is_null());
            cb.set_rec_lsn(new_rlsn);
        } else {
            cb.clear_dirty();
        }
    }

    // --- recovery hooks ---

    /// Bind an already-populated frame to a handle without fix semantics
    /// (recovery REDO only; takes the exclusive latch for page application).
    pub fn associate_page(&self, idx: FrameId) -> Result<PageHandle<'_>> {
        let frame = self.frame_ref(idx);
        if !frame.cb.is_used() {
            return Err(BasaltError::FrameGone { frame: idx });
        }
        assert!(frame.cb.pin());
        frame.latch.exclusive();
        Ok(PageHandle::new_latched(self, idx, LatchMode::Exclusive, true))
    }

    /// Log-analysis hook: ensure `(vol, pid)` has an in-doubt control block,
    /// allocating a frame without eviction. Returns the frame and whether it
    /// was newly registered.
    pub fn register_and_mark(
        &self,
        vol: VolumeId,
        pid: PageId,
        store: StoreId,
        first_lsn: Lsn,
        last_lsn: Lsn,
    ) -> Result<(FrameId, bool)> {
        let key = resident_key(vol, pid);
        if let Some((idx, _)) = self.table.lookup(key) {
            let cb = &self.frame_ref(idx).cb;
            cb.set_used(true);
            cb.set_in_doubt(true);
            if cb.rec_lsn().is_null() || first_lsn < cb.rec_lsn() {
                cb.set_rec_lsn(first_lsn);
            }
            if last_lsn > cb.page_lsn() {
                cb.set_page_lsn(last_lsn);
            }
            return Ok((idx, false));
        }
        let idx = self.grab_free_frame(false)?;
        let frame = self.frame_ref(idx);
        frame.cb.reset();
        frame.cb.set_identity(vol, pid, store);
        frame.cb.set_used(true);
        frame.cb.set_in_doubt(true);
        frame.cb.set_rec_lsn(first_lsn);
        frame.cb.set_page_lsn(last_lsn);
        frame.cb.set_initial_dirty_lsn(first_lsn);
        match self.table.insert_if_absent(key, idx, FrameId::NULL) {
            Insert::Inserted => Ok((idx, true)),
            Insert::Present(existing) => {
                frame.cb.reset();
                self.add_free_frame(idx);
                Ok((existing, false))
            }
        }
    }

    /// REDO hook: load the actual page image for an in-doubt frame.
    pub fn load_for_redo(&self, idx: FrameId) -> Result<()> {
        let frame = self.frame_ref(idx);
        debug_assert!(frame.cb.is_in_doubt());
        let (vol, pid) = (frame.cb.vol(), frame.cb.pid());
        let target = frame.cb.page_lsn();
        let volume = self.volume(vol)?;
        let page = match volume.device().read_page(pid)? {
            Some(bytes) if Page::checksum_ok(&bytes) => Page::decode_unchecked(&bytes),
            _ => {
                BP_SPR_TOTAL.fetch_add(1, Ordering::Relaxed);
                recover_page(&self.log, vol, pid, None, target)?
            }
        };
        frame.install_page(page);
        Ok(())
    }

    pub fn set_in_doubt(&self, idx: FrameId, first_lsn: Lsn, last_lsn: Lsn) {
        let cb = &self.frame_ref(idx).cb;
        cb.set_used(true);
        cb.set_in_doubt(true);
        cb.set_rec_lsn(first_lsn);
        cb.set_page_lsn(last_lsn);
    }

    /// Drop the in-doubt mark; when the page turned out not to be needed,
    /// the frame goes back to the free list.
    pub fn clear_in_doubt(&self, idx: FrameId, still_used: bool, key: u64) {
        let cb = &self.frame_ref(idx).cb;
        cb.set_in_doubt(false);
        if !still_used {
            self.table.remove_if_matches(key, idx);
            cb.reset();
            self.add_free_frame(idx);
        }
    }

    /// The in-doubt page's image is loaded; it is now an ordinary dirty page.
    pub fn in_doubt_to_dirty(&self, idx: FrameId) {
        let cb = &self.frame_ref(idx).cb;
        debug_assert!(cb.is_in_doubt());
        cb.set_in_doubt(false);
        // Straight to dirty, keeping the recovery LSN from log analysis.
        let rec = cb.rec_lsn();
        cb.set_dirty();
        cb.set_rec_lsn(rec);
    }

    #[must_use]
    pub fn is_in_doubt(&self, idx: FrameId) -> bool {
        self.frame_ref(idx).cb.is_in_doubt()
    }

    /// Find the in-doubt frame registered under `key`, if any.
    #[must_use]
    pub fn lookup_in_doubt(&self, key: u64) -> Option<FrameId> {
        let (idx, _) = self.table.lookup(key)?;
        self.frame_ref(idx).cb.is_in_doubt().then_some(idx)
    }

    /// Append a system log record (EMLSN updates from eviction).
    pub(crate) fn append_sys_record(&self, record: LogRecord) -> Result<Lsn> {
        self.log.append(record)
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("capacity", &self.capacity())
            .field("free", &self.free_frames())
            .field("used", &self.used_frames())
            .field("dirty", &self.dirty_frames())
            .field("swizzling", &self.enable_swizzling)
            .finish_non_exhaustive()
    }
}
