//! The transaction object.
//!
//! Split into a *core* (identity, state, locks, thread bookkeeping — state
//! any attached thread may consult) and a *stream* (the open log chain:
//! first/last/undo-next LSN, reservation counters, rollback anchor,
//! deferred single-log system-transaction buffer). A transaction is driven
//! by one update thread at a time; hand-off is allowed, and the
//! single-writer discipline is asserted rather than enforced with a mutex.
//!
//! # Log-space reservation
//!
//! Every undoable forward record reserves its own size twice: once for the
//! record and once for the compensation that rollback might need
//! (`reserved_for_rollback`). Rollback draws compensations from that pot,
//! so an abort can always complete without asking the log for more space.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Duration;

use basalt_error::{BasaltError, Result};
use basalt_log::{LogManager, LogPayload, LogRecord, RecordSink};
use basalt_types::{Lsn, StoreId, TxnId, VolumeId};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::lock::{LockId, LockMode, LockTable};
use crate::state::{ElrMode, TxnState};

/// Granularity of log-space reservation requests.
const RESERVE_CHUNK: u64 = 64 << 10;

/// Applies a compensation record to its page. Implemented by the engine,
/// which owns the buffer pool; rollback calls it once per compensation
/// after the record is in the log.
pub trait UndoApplicator {
    fn apply_compensation(&self, record: &LogRecord) -> Result<()>;
}

/// Observer notified when a transaction changes state.
pub trait TxnDependent: Send + Sync {
    fn txn_state_changed(&self, tid: TxnId, state: TxnState);
}

/// A buffered single-log system transaction: the record plus the closure
/// that applies it to its (still exclusively latched) target page.
struct DeferredSsx {
    record: LogRecord,
    apply: Box<dyn FnOnce(Lsn) -> Result<()> + Send>,
}

/// Per-attached-thread log stream state.
struct TxnStream {
    first_lsn: Lsn,
    last_lsn: Lsn,
    undo_nxt: Lsn,
    read_watermark: Lsn,
    elr: ElrMode,
    /// Bytes reserved against future rollback.
    rsvd: u64,
    /// Bytes ready for insertion without asking the log manager.
    ready: u64,
    /// Bytes actually inserted.
    used: u64,
    in_compensated_op: u32,
    anchor: Lsn,
    rolling_back: bool,
    log_disabled: bool,
    deferred: Option<DeferredSsx>,
}

impl TxnStream {
    fn new(elr: ElrMode) -> Self {
        Self {
            first_lsn: Lsn::NULL,
            last_lsn: Lsn::NULL,
            undo_nxt: Lsn::NULL,
            read_watermark: Lsn::NULL,
            elr,
            rsvd: 0,
            ready: 0,
            used: 0,
            in_compensated_op: 0,
            anchor: Lsn::NULL,
            rolling_back: false,
            log_disabled: false,
            deferred: None,
        }
    }
}

/// What the engine needs to finish a commit: stores scheduled for freeing
/// and load stores to convert to regular.
#[derive(Debug, Default)]
pub struct CommitOutcome {
    pub last_lsn: Lsn,
    pub stores_to_free: Vec<(VolumeId, StoreId)>,
    pub load_stores: Vec<(VolumeId, StoreId)>,
}

// ---------------------------------------------------------------------------
// Txn
// ---------------------------------------------------------------------------

/// One transaction. Shared as `Arc<Txn>`; threads attach and detach.
pub struct Txn {
    tid: TxnId,
    log: Arc<LogManager>,
    locks: Arc<LockTable>,
    timeout: Duration,
    sys: bool,
    single_log_sys: bool,

    state: Mutex<TxnState>,
    poisoned: AtomicBool,
    threads_attached: AtomicI32,
    updating_ops: AtomicI32,

    stores_to_free: Mutex<Vec<(VolumeId, StoreId)>>,
    load_stores: Mutex<Vec<(VolumeId, StoreId)>>,
    dependents: Mutex<Vec<Arc<dyn TxnDependent>>>,

    stream: Mutex<TxnStream>,
}

impl Txn {
    pub(crate) fn new(
        tid: TxnId,
        log: Arc<LogManager>,
        locks: Arc<LockTable>,
        elr: ElrMode,
        timeout: Duration,
        sys: bool,
        single_log_sys: bool,
    ) -> Self {
        Self {
            tid,
            log,
            locks,
            timeout,
            sys,
            single_log_sys,
            state: Mutex::new(TxnState::Active),
            poisoned: AtomicBool::new(false),
            threads_attached: AtomicI32::new(0),
            updating_ops: AtomicI32::new(0),
            stores_to_free: Mutex::new(Vec::new()),
            load_stores: Mutex::new(Vec::new()),
            dependents: Mutex::new(Vec::new()),
            stream: Mutex::new(TxnStream::new(elr)),
        }
    }

    // --- identity / state ---

    #[must_use]
    pub fn tid(&self) -> TxnId {
        self.tid
    }

    #[must_use]
    pub fn state(&self) -> TxnState {
        *self.state.lock()
    }

    #[must_use]
    pub fn is_sys_xct(&self) -> bool {
        self.sys
    }

    #[must_use]
    pub fn is_single_log_sys_xct(&self) -> bool {
        self.single_log_sys
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[must_use]
    pub fn first_lsn(&self) -> Lsn {
        self.stream.lock().first_lsn
    }

    #[must_use]
    pub fn last_lsn(&self) -> Lsn {
        self.stream.lock().last_lsn
    }

    #[must_use]
    pub fn undo_nxt(&self) -> Lsn {
        self.stream.lock().undo_nxt
    }

    #[must_use]
    pub fn read_watermark(&self) -> Lsn {
        self.stream.lock().read_watermark
    }

    #[must_use]
    pub fn elr_mode(&self) -> ElrMode {
        self.stream.lock().elr
    }

    #[must_use]
    pub fn log_bytes_reserved_for_rollback(&self) -> u64 {
        self.stream.lock().rsvd
    }

    #[must_use]
    pub fn log_bytes_used(&self) -> u64 {
        self.stream.lock().used
    }

    #[must_use]
    pub fn is_rolling_back(&self) -> bool {
        self.stream.lock().rolling_back
    }

    fn change_state(&self, next: TxnState) -> Result<()> {
        let mut state = self.state.lock();
        *state = state.transition(next)?;
        drop(state);
        for dep in self.dependents.lock().iter() {
            dep.txn_state_changed(self.tid, next);
        }
        trace!(target: "basalt.txn", txn = %self.tid, state = ?next, "state change");
        Ok(())
    }

    // --- threads ---

    pub fn attach_thread(&self) {
        self.threads_attached.fetch_add(1, Ordering::AcqRel);
    }

    pub fn detach_thread(&self) {
        let prev = self.threads_attached.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
    }

    #[must_use]
    pub fn threads_attached(&self) -> i32 {
        self.threads_attached.load(Ordering::Acquire)
    }

    /// Mark this thread as the update thread. At most one may be active; the
    /// discipline is a correctness check, not a mutex.
    pub fn attach_update_thread(&self) -> UpdateGuard<'_> {
        let prev = self.updating_ops.fetch_add(1, Ordering::AcqRel);
        assert_eq!(prev, 0, "transaction driven by more than one update thread");
        UpdateGuard { txn: self }
    }

    #[must_use]
    pub fn update_threads(&self) -> i32 {
        self.updating_ops.load(Ordering::Acquire)
    }

    // --- locks ---

    /// Acquire a lock, folding the bucket's commit tag into the read
    /// watermark. Fails with `Deadlock` once the transaction is poisoned.
    pub fn lock(&self, lock: LockId, mode: LockMode) -> Result<()> {
        let tag = self
            .locks
            .acquire(self.tid, lock, mode, self.timeout, &self.poisoned)?;
        if !tag.is_null() {
            let mut s = self.stream.lock();
            if s.read_watermark < tag {
                s.read_watermark = tag;
            }
        }
        Ok(())
    }

    /// Poison the transaction: every current and future lock wait fails with
    /// `Deadlock` immediately. Checkpointing uses this to unstick victims
    /// that hold up log space.
    pub fn force_nonblocking(&self) {
        self.poisoned.store(true, Ordering::Release);
        // Waiters re-check the flag on every wakeup; nudging every bucket is
        // unnecessary because releases and timeouts already do.
    }

    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    // --- log switch ---

    /// Turn logging off for this stream (top-level actions). Returns the
    /// previous value.
    pub fn set_log_disabled(&self, off: bool) -> bool {
        let mut s = self.stream.lock();
        std::mem::replace(&mut s.log_disabled, off)
    }

    #[must_use]
    pub fn is_log_disabled(&self) -> bool {
        self.stream.lock().log_disabled
    }

    // --- append path ---

    /// Append a forward log record through the consolidation array.
    ///
    /// Fills the transaction chain fields, draws from the reservation
    /// counters (asking the log manager for more when `ready` runs dry), and
    /// grows the rollback reserve for undoable records.
    pub fn append(&self, record: LogRecord) -> Result<Lsn> {
        debug_assert!(self.update_threads() <= 1);
        let mut s = self.stream.lock();
        if s.log_disabled {
            return Ok(Lsn::NULL);
        }
        Self::flush_deferred_locked(&self.log, &mut s)?;
        self.append_locked(&mut s, record, None)
    }

    /// Append a compensation during rollback, preserving its pre-set
    /// `prev_lsn` (the undo-next pointer).
    fn append_clr(&self, s: &mut TxnStream, record: LogRecord) -> Result<Lsn> {
        let prev = record.prev_lsn;
        self.append_locked(s, record, Some(prev))
    }

    fn append_locked(
        &self,
        s: &mut TxnStream,
        mut record: LogRecord,
        chain_override: Option<Lsn>,
    ) -> Result<Lsn> {
        record.txn = self.tid;
        record.prev_lsn = chain_override.unwrap_or(s.last_lsn);
        let undoable = record.undoable && !s.rolling_back;
        record.undoable = undoable;
        self.reserve_locked(s, record.encoded_size() as u64, undoable)?;

        let lsn = self.log.append(record)?;
        if s.first_lsn.is_null() {
            s.first_lsn = lsn;
        }
        s.last_lsn = lsn;
        match chain_override {
            // Compensations point the undo scan past what they undid.
            Some(undo_next) => s.undo_nxt = undo_next,
            None if undoable => s.undo_nxt = lsn,
            None => {}
        }
        Ok(lsn)
    }

    /// Draw `size` bytes (twice that for undoable records) from the
    /// reservation counters. During rollback, compensations consume the
    /// rollback reserve instead of asking for new space.
    fn reserve_locked(&self, s: &mut TxnStream, size: u64, undoable: bool) -> Result<()> {
        debug_assert!(!(undoable && s.rolling_back));
        if s.rolling_back {
            if s.rsvd >= size {
                s.rsvd -= size;
                s.used += size;
                return Ok(());
            }
            // The reserve was undersized (outsized compensation); fall
            // through and try the ledger, which may legitimately fail.
        }
        let needed = if undoable { size * 2 } else { size };
        if s.ready < needed {
            let ask = (needed - s.ready).max(RESERVE_CHUNK);
            match self.log.reserve_space(ask) {
                Ok(()) => s.ready += ask,
                Err(e) => {
                    // One bounded wait; if space still does not materialize
                    // the transaction must roll back rather than wedge.
                    drop(e);
                    self.log.wait_for_space(ask, self.timeout)?;
                    s.ready += ask;
                }
            }
        }
        s.ready -= needed;
        s.used += size;
        if undoable {
            s.rsvd += size;
        }
        Ok(())
    }

    // --- anchors / compensation ---

    /// Open (or nest into) a compensated operation; returns the anchor LSN.
    pub fn anchor(&self) -> Lsn {
        let mut s = self.stream.lock();
        s.in_compensated_op += 1;
        if s.in_compensated_op == 1 {
            s.anchor = s.last_lsn;
        }
        s.anchor
    }

    /// Close a compensated operation. With `compensate`, emits a
    /// compensation record that makes rollback skip everything logged since
    /// the matching [`anchor`](Self::anchor).
    pub fn release_anchor(&self, compensate: bool) -> Result<()> {
        let mut s = self.stream.lock();
        debug_assert!(s.in_compensated_op > 0);
        if compensate && s.in_compensated_op == 1 && s.last_lsn != s.anchor {
            let anchor = s.anchor;
            let rec = LogRecord::transactional(
                self.tid,
                VolumeId::new(0),
                basalt_types::PageId::NULL,
                false,
                LogPayload::Compensate { undo_next: anchor },
            );
            self.append_locked(&mut s, rec, None)?;
            s.undo_nxt = anchor;
        }
        s.in_compensated_op -= 1;
        Ok(())
    }

    #[must_use]
    pub fn compensated_op_depth(&self) -> u32 {
        self.stream.lock().in_compensated_op
    }

    // --- deferred single-log system transactions ---

    /// Buffer a single-log system transaction (for example an EMLSN bump)
    /// instead of appending it eagerly. It is flushed before any further
    /// record of this transaction, or at the latest when the enclosing
    /// [`SsxDeferSection`] closes — which must happen before the target
    /// page's exclusive latch is released.
    pub fn defer_ssx(
        &self,
        record: LogRecord,
        apply: Box<dyn FnOnce(Lsn) -> Result<()> + Send>,
    ) -> Result<()> {
        let mut s = self.stream.lock();
        if s.deferred.is_some() {
            Self::flush_deferred_locked(&self.log, &mut s)?;
        }
        s.deferred = Some(DeferredSsx { record, apply });
        Ok(())
    }

    /// Flush the deferred record, if any: append it (as a system record
    /// outside this transaction's chain) and apply it to its page.
    pub fn flush_deferred(&self) -> Result<()> {
        let mut s = self.stream.lock();
        Self::flush_deferred_locked(&self.log, &mut s)
    }

    fn flush_deferred_locked(log: &LogManager, s: &mut TxnStream) -> Result<()> {
        if let Some(ssx) = s.deferred.take() {
            let lsn = log.append(ssx.record)?;
            (ssx.apply)(lsn)?;
        }
        Ok(())
    }

    /// Scope guard that flushes the deferred record on exit.
    #[must_use]
    pub fn defer_section(&self) -> SsxDeferSection<'_> {
        SsxDeferSection { txn: self }
    }

    // --- stores ---

    /// Schedule a store for freeing after commit.
    pub fn add_store_to_free(&self, vol: VolumeId, store: StoreId) {
        self.stores_to_free.lock().push((vol, store));
    }

    /// Register a load store, converted to a regular store at commit.
    pub fn add_load_store(&self, vol: VolumeId, store: StoreId) {
        self.load_stores.lock().push((vol, store));
    }

    // --- dependents ---

    pub fn add_dependent(&self, dep: Arc<dyn TxnDependent>) {
        self.dependents.lock().push(dep);
    }

    // --- savepoints / rollback ---

    /// Record a savepoint for partial rollback.
    #[must_use]
    pub fn save_point(&self) -> Lsn {
        self.stream.lock().last_lsn
    }

    /// Roll back to `save_pt`, emitting compensations through the log and
    /// applying them via `undo`. The transaction stays active.
    pub fn rollback(&self, save_pt: Lsn, undo: &dyn UndoApplicator) -> Result<()> {
        let mut s = self.stream.lock();
        let was = s.rolling_back;
        s.rolling_back = true;
        let result = self.rollback_locked(&mut s, save_pt, undo);
        s.rolling_back = was;
        result
    }

    fn rollback_locked(
        &self,
        s: &mut TxnStream,
        stop: Lsn,
        undo: &dyn UndoApplicator,
    ) -> Result<()> {
        Self::flush_deferred_locked(&self.log, s)?;
        let mut cursor = s.undo_nxt;
        while !cursor.is_null() && cursor > stop {
            let rec = self.log.read_record(cursor)?;
            debug_assert_eq!(rec.txn, self.tid, "undo walked into a foreign chain");
            if let LogPayload::Compensate { undo_next } = rec.payload {
                cursor = undo_next;
                continue;
            }
            if rec.undoable {
                let clr = rec
                    .undo_record(rec.prev_lsn)
                    .ok_or_else(|| BasaltError::internal("undoable record without an undo"))?;
                let mut stamped = clr;
                let lsn = self.append_clr(s, stamped.clone())?;
                stamped.lsn = lsn;
                undo.apply_compensation(&stamped)?;
            }
            cursor = rec.prev_lsn;
        }
        s.undo_nxt = cursor;
        Ok(())
    }

    // --- commit / abort / end ---

    /// Commit: flush the deferred system transaction, log the commit point,
    /// release locks per the early-lock-release mode, and wait for the log
    /// to be durable up to the last record. Leaves the transaction in
    /// `FreeingSpace`; the engine frees the listed stores and then calls
    /// [`end`](Self::end).
    pub fn commit(&self) -> Result<CommitOutcome> {
        self.commit_with(false)
    }

    /// Commit without waiting for durability. The caller owns the flush
    /// (group commit batches several of these behind one wait).
    pub fn commit_lazy(&self) -> Result<CommitOutcome> {
        self.commit_with(true)
    }

    fn commit_with(&self, lazy: bool) -> Result<CommitOutcome> {
        self.change_state(TxnState::Committing)?;
        self.flush_deferred()?;

        let (read_only, watermark, elr) = {
            let s = self.stream.lock();
            (s.first_lsn.is_null(), s.read_watermark, s.elr)
        };

        let mut commit_lsn = Lsn::NULL;
        if !read_only {
            let rec = LogRecord::transactional(
                self.tid,
                VolumeId::new(0),
                basalt_types::PageId::NULL,
                false,
                LogPayload::Commit,
            );
            let mut s = self.stream.lock();
            commit_lsn = self.append_locked(&mut s, rec, None)?;
        }

        // Early lock release happens before the durability wait; that is the
        // entire point of the optimization.
        match elr {
            ElrMode::None => {}
            ElrMode::S => {
                self.locks.release_where(self.tid, Lsn::NULL, LockMode::is_read_side);
            }
            ElrMode::Sx | ElrMode::Clv => {
                self.locks.release_all(self.tid, commit_lsn);
            }
        }

        if !lazy {
            if !read_only {
                self.log.wait_durable(commit_lsn.advance(1))?;
            } else if elr.readers_check_watermark() && !watermark.is_null() {
                // Read-only commit under sx/clv: stall until everything this
                // transaction read from early releasers is durable.
                self.log.wait_durable(watermark.advance(1))?;
            }
        }

        self.change_state(TxnState::FreeingSpace)?;
        self.locks.release_all(self.tid, commit_lsn);

        debug!(target: "basalt.txn", txn = %self.tid, commit_lsn = %commit_lsn, read_only, "committed");
        Ok(CommitOutcome {
            last_lsn: commit_lsn,
            stores_to_free: std::mem::take(&mut self.stores_to_free.lock()),
            load_stores: std::mem::take(&mut self.load_stores.lock()),
        })
    }

    /// Abort: replay the chain backwards emitting compensations, then
    /// proceed like a commit with nothing to commit.
    pub fn abort(&self, undo: &dyn UndoApplicator) -> Result<()> {
        self.change_state(TxnState::Aborting)?;
        {
            let mut s = self.stream.lock();
            Self::flush_deferred_locked(&self.log, &mut s)?;
            s.rolling_back = true;
            if !s.first_lsn.is_null() {
                let rec = LogRecord::transactional(
                    self.tid,
                    VolumeId::new(0),
                    basalt_types::PageId::NULL,
                    false,
                    LogPayload::Abort,
                );
                self.append_locked(&mut s, rec, None)?;
            }
            self.rollback_locked(&mut s, Lsn::NULL, undo)?;
        }
        self.change_state(TxnState::FreeingSpace)?;
        self.locks.release_all(self.tid, Lsn::NULL);
        self.stores_to_free.lock().clear();
        self.load_stores.lock().clear();
        debug!(target: "basalt.txn", txn = %self.tid, "aborted");
        Ok(())
    }

    /// Final step: log the end record, return unused reservations, mark
    /// `Ended`.
    pub fn end(&self) -> Result<()> {
        {
            let mut s = self.stream.lock();
            if !s.first_lsn.is_null() {
                let rec = LogRecord::transactional(
                    self.tid,
                    VolumeId::new(0),
                    basalt_types::PageId::NULL,
                    false,
                    LogPayload::TxnEnd,
                );
                let rolling = s.rolling_back;
                s.rolling_back = false;
                self.append_locked(&mut s, rec, None)?;
                s.rolling_back = rolling;
            }
            let outstanding = s.ready + s.rsvd + s.used;
            if outstanding > 0 {
                self.log.release_space(outstanding);
            }
            s.ready = 0;
            s.rsvd = 0;
            s.used = 0;
        }
        self.change_state(TxnState::Ended)
    }
}

impl RecordSink for Txn {
    fn sink_append(&self, record: LogRecord) -> Result<Lsn> {
        self.append(record)
    }
}

impl std::fmt::Debug for Txn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Txn")
            .field("tid", &self.tid)
            .field("state", &self.state())
            .field("first_lsn", &self.first_lsn())
            .field("last_lsn", &self.last_lsn())
            .finish_non_exhaustive()
    }
}

/// Guard from [`Txn::attach_update_thread`].
pub struct UpdateGuard<'a> {
    txn: &'a Txn,
}

impl Drop for UpdateGuard<'_> {
    fn drop(&mut self) {
        self.txn.updating_ops.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Guard from [`Txn::defer_section`]: flushes the deferred single-log
/// system transaction on scope exit.
pub struct SsxDeferSection<'a> {
    txn: &'a Txn,
}

impl Drop for SsxDeferSection<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.txn.flush_deferred() {
            tracing::warn!(target: "basalt.txn", txn = %self.txn.tid, error = %e, "deferred ssx flush failed");
        }
    }
}
