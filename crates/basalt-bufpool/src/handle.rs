//! The page handle: a scoped owner of one fix.
//!
//! A handle binds `(frame, latch mode, optional Q ticket)`. Dropping it
//! unfixes: the latch is released and the pin returned. State transitions
//! follow `unfix -> fix_* -> [upgrade | downgrade | set_dirty |
//! set_to_be_deleted | unset_to_be_deleted] -> unfix`.

use basalt_error::{BasaltError, Result};
use basalt_log::{LogPayload, LogRecord, RecordSink};
use basalt_types::{FrameId, Lsn, Page, PageFlags, PageId, StoreId, VolumeId};

use crate::latch::{LatchMode, QTicket};
use crate::pool::BufferPool;

/// A fixed page. Must not outlive the fix: drop (or [`unfix`](Self::unfix))
/// releases the latch and pin.
pub struct PageHandle<'a> {
    pool: &'a BufferPool,
    frame: FrameId,
    mode: LatchMode,
    ticket: Option<QTicket>,
    pinned: bool,
}

impl<'a> PageHandle<'a> {
    pub(crate) fn new_latched(
        pool: &'a BufferPool,
        frame: FrameId,
        mode: LatchMode,
        pinned: bool,
    ) -> Self {
        debug_assert!(mode >= LatchMode::Shared || mode == LatchMode::None);
        Self { pool, frame, mode, ticket: None, pinned }
    }

    pub(crate) fn new_q(pool: &'a BufferPool, frame: FrameId, ticket: QTicket) -> Self {
        Self { pool, frame, mode: LatchMode::Q, ticket: Some(ticket), pinned: false }
    }

    // --- identity / state ---

    #[must_use]
    pub fn frame(&self) -> FrameId {
        self.frame
    }

    #[must_use]
    pub fn mode(&self) -> LatchMode {
        self.mode
    }

    #[must_use]
    pub fn vol(&self) -> VolumeId {
        self.pool.frame_ref(self.frame).cb.vol()
    }

    #[must_use]
    pub fn pid(&self) -> PageId {
        self.pool.frame_ref(self.frame).cb.pid()
    }

    #[must_use]
    pub fn store(&self) -> StoreId {
        self.pool.frame_ref(self.frame).cb.store()
    }

    /// LSN of the page's last update (control-block mirror).
    #[must_use]
    pub fn page_lsn(&self) -> Lsn {
        self.pool.frame_ref(self.frame).cb.page_lsn()
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        debug_assert!(self.mode > LatchMode::Q);
        self.pool.frame_ref(self.frame).cb.is_dirty()
    }

    // --- page access ---

    /// Read the page. Requires at least a shared latch.
    pub fn with_page<R>(&self, f: impl FnOnce(&Page) -> R) -> R {
        assert!(self.mode >= LatchMode::Shared, "page read needs SH or EX");
        self.pool.frame_ref(self.frame).with_page(f)
    }

    /// Mutate the page. Requires the exclusive latch.
    pub fn with_page_mut<R>(&self, f: impl FnOnce(&mut Page) -> R) -> R {
        assert_eq!(self.mode, LatchMode::Exclusive, "page write needs EX");
        self.pool.frame_ref(self.frame).with_page_mut(f)
    }

    /// Optimistic read: run `f` against the page, then check the ticket.
    /// A failed check means a writer intervened; the observation is garbage
    /// and the caller retries with a stronger latch.
    pub fn read_optimistic<R>(&self, f: impl FnOnce(&Page) -> R) -> Result<R> {
        assert_eq!(self.mode, LatchMode::Q);
        let frame = self.pool.frame_ref(self.frame);
        let out = frame.with_page(f);
        if self.validate_ticket() {
            Ok(out)
        } else {
            Err(BasaltError::LatchQFail { pid: frame.cb.pid() })
        }
    }

    /// True iff no writer committed to the page since the Q fix.
    #[must_use]
    pub fn validate_ticket(&self) -> bool {
        match self.ticket {
            Some(ticket) => self.pool.frame_ref(self.frame).latch.validate(ticket),
            None => true,
        }
    }

    // --- mutation protocol ---

    /// Stamp a new page LSN (page header and control-block mirror).
    pub fn set_page_lsn(&self, lsn: Lsn) {
        assert_eq!(self.mode, LatchMode::Exclusive);
        let frame = self.pool.frame_ref(self.frame);
        frame.with_page_mut(|p| p.set_lsn(lsn));
        frame.cb.set_page_lsn(lsn);
    }

    /// Mark the page dirty. Illegal in Q mode.
    pub fn set_dirty(&self) {
        assert!(self.mode >= LatchMode::Shared, "set_dirty is illegal under Q");
        self.pool.frame_ref(self.frame).cb.set_dirty();
    }

    /// Schedule the page for deletion: logs the flag flip through `sink`
    /// before applying it.
    pub fn set_to_be_deleted(&self, sink: &dyn RecordSink) -> Result<()> {
        assert_eq!(self.mode, LatchMode::Exclusive);
        let frame = self.pool.frame_ref(self.frame);
        let already = frame.with_page(|p| p.flags().contains(PageFlags::TO_BE_DELETED));
        if already {
            return Ok(());
        }
        let rec = LogRecord::transactional(
            basalt_types::TxnId::NULL,
            self.vol(),
            self.pid(),
            true,
            LogPayload::SetDeleted { deleted: true },
        );
        let lsn = sink.sink_append(rec)?;
        frame.with_page_mut(|p| {
            p.flags_mut().insert(PageFlags::TO_BE_DELETED);
            p.set_lsn(lsn);
        });
        frame.cb.set_page_lsn(lsn);
        frame.cb.set_dirty();
        Ok(())
    }

    /// Clear the to-be-deleted flag (UNDO side). The page is necessarily
    /// still dirty when this runs, so no re-marking is needed.
    pub fn unset_to_be_deleted(&self) {
        assert_eq!(self.mode, LatchMode::Exclusive);
        self.pool
            .frame_ref(self.frame)
            .with_page_mut(|p| p.flags_mut().remove(PageFlags::TO_BE_DELETED));
    }

    #[must_use]
    pub fn is_to_be_deleted(&self) -> bool {
        assert!(self.mode >= LatchMode::Shared);
        self.with_page(|p| p.flags().contains(PageFlags::TO_BE_DELETED))
    }

    /// Set the owning store on a virgin page.
    pub fn set_store(&self, store: StoreId) {
        assert_eq!(self.mode, LatchMode::Exclusive);
        let frame = self.pool.frame_ref(self.frame);
        let (vol, pid) = (frame.cb.vol(), frame.cb.pid());
        frame.with_page_mut(|p| p.set_identity(vol, pid, store));
        frame.cb.set_identity(vol, pid, store);
    }

    // --- latch transitions ---

    /// Conditionally upgrade SH to EX. Never blocks.
    pub fn upgrade_latch_conditional(&mut self) -> bool {
        assert_eq!(self.mode, LatchMode::Shared);
        if self.pool.frame_ref(self.frame).latch.try_upgrade() {
            self.mode = LatchMode::Exclusive;
            true
        } else {
            false
        }
    }

    /// Downgrade EX to SH. Always succeeds.
    pub fn downgrade_latch(&mut self) {
        assert_eq!(self.mode, LatchMode::Exclusive);
        self.pool.frame_ref(self.frame).latch.downgrade();
        self.mode = LatchMode::Shared;
    }

    /// The expected-minimum LSN this page records for child `pid`, or null
    /// when the child slot is unknown.
    #[must_use]
    pub fn child_emlsn_for(&self, pid: PageId) -> Lsn {
        assert!(self.mode >= LatchMode::Shared);
        self.with_page(|p| p.find_child(pid).map_or(Lsn::NULL, |slot| p.child_emlsn(slot)))
    }

    /// Explicitly unfix (equivalent to drop).
    pub fn unfix(self) {}
}

impl Drop for PageHandle<'_> {
    fn drop(&mut self) {
        let frame = self.pool.frame_ref(self.frame);
        frame.latch.release_mode(self.mode);
        if self.pinned {
            frame.cb.unpin();
        }
    }
}

impl std::fmt::Debug for PageHandle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageHandle")
            .field("frame", &self.frame)
            .field("mode", &self.mode)
            .field("pid", &self.pid())
            .finish_non_exhaustive()
    }
}
