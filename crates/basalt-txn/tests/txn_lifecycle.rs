//! Transaction lifecycle: forward logging, abort with compensation,
//! savepoints, anchors, reservation accounting, and early lock release.

use std::collections::HashMap;
use std::sync::Arc;

use basalt_error::BasaltError;
use basalt_log::{LogManager, LogPayload, LogRecord, RecordSink};
use basalt_txn::{ElrMode, LockId, LockMode, TxnManager, TxnState, UndoApplicator};
use basalt_types::{EngineOptions, Lsn, Page, PageId, StoreId, TxnId, VolumeId};
use parking_lot::Mutex;

const VOL: VolumeId = VolumeId::new(1);

/// In-memory page store standing in for the engine's buffer pool on the
/// rollback path.
#[derive(Default)]
struct PageStore {
    pages: Mutex<HashMap<u32, Page>>,
}

impl PageStore {
    fn page(&self, pid: PageId) -> Page {
        self.pages
            .lock()
            .entry(pid.bits())
            .or_insert_with(|| Page::new(VOL, pid, StoreId::new(1)))
            .clone()
    }

    fn apply(&self, rec: &LogRecord) {
        let mut pages = self.pages.lock();
        let page = pages
            .entry(rec.pid.bits())
            .or_insert_with(|| Page::new(VOL, rec.pid, StoreId::new(1)));
        rec.redo(page).unwrap();
    }
}

impl UndoApplicator for PageStore {
    fn apply_compensation(&self, record: &LogRecord) -> basalt_error::Result<()> {
        self.apply(record);
        Ok(())
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    log: Arc<LogManager>,
    mgr: TxnManager,
    store: PageStore,
}

fn fixture(elr: ElrMode) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(LogManager::open(dir.path(), &EngineOptions::default()).unwrap());
    let mgr = TxnManager::new(Arc::clone(&log), elr);
    Fixture { _dir: dir, log, mgr, store: PageStore::default() }
}

/// Log a payload write through `txn` and mirror it into the page store.
fn write(fx: &Fixture, txn: &basalt_txn::Txn, pid: PageId, offset: u32, byte: u8) -> Lsn {
    let before = {
        let page = fx.store.page(pid);
        page.payload()[offset as usize..offset as usize + 4].to_vec()
    };
    let mut rec = LogRecord::transactional(
        TxnId::NULL,
        VOL,
        pid,
        true,
        LogPayload::PageWrite { offset, before, after: vec![byte; 4] },
    );
    rec.txn = txn.tid();
    let lsn = txn.sink_append(rec.clone()).unwrap();
    rec.lsn = lsn;
    fx.store.apply(&rec);
    lsn
}

#[test]
fn commit_waits_for_durability() {
    let fx = fixture(ElrMode::None);
    let txn = fx.mgr.begin().unwrap();
    let _u = txn.attach_update_thread();

    write(&fx, &txn, PageId::new(4), 0, 0xAA);
    let last = txn.last_lsn();
    assert!(txn.first_lsn() <= last, "first_lsn <= last_lsn must hold");

    let outcome = txn.commit().unwrap();
    assert!(outcome.last_lsn > last, "the commit record extends the chain");
    assert!(
        fx.log.durable_lsn() > outcome.last_lsn,
        "commit must not return before its record is durable"
    );
    txn.end().unwrap();
    assert_eq!(txn.state(), TxnState::Ended);
    fx.mgr.finish(&txn);
    assert_eq!(fx.mgr.active_count(), 0);
}

#[test]
fn abort_undoes_in_reverse_with_compensations() {
    let fx = fixture(ElrMode::None);
    let txn = fx.mgr.begin().unwrap();
    let _u = txn.attach_update_thread();

    let pid = PageId::new(7);
    write(&fx, &txn, pid, 0, 1);
    write(&fx, &txn, pid, 8, 2);
    write(&fx, &txn, pid, 16, 3);
    assert_eq!(fx.store.page(pid).payload()[16], 3);

    txn.abort(&fx.store).unwrap();
    txn.end().unwrap();

    let page = fx.store.page(pid);
    assert_eq!(&page.payload()[0..4], &[0; 4], "first write undone");
    assert_eq!(&page.payload()[8..12], &[0; 4], "second write undone");
    assert_eq!(&page.payload()[16..20], &[0; 4], "third write undone");

    // The log carries abort + three compensations, all forward records.
    fx.log.flush_all().unwrap();
    let records = fx.log.scan_from(Lsn::NULL).unwrap();
    let clrs = records
        .iter()
        .filter(|r| {
            r.txn == txn.tid() && !r.undoable && matches!(r.payload, LogPayload::PageWrite { .. })
        })
        .count();
    assert_eq!(clrs, 3);
    assert!(records.iter().any(|r| matches!(r.payload, LogPayload::Abort)));
}

#[test]
fn savepoint_rolls_back_partially() {
    let fx = fixture(ElrMode::None);
    let txn = fx.mgr.begin().unwrap();
    let _u = txn.attach_update_thread();

    let pid = PageId::new(9);
    write(&fx, &txn, pid, 0, 1);
    let sp = txn.save_point();
    write(&fx, &txn, pid, 8, 2);
    write(&fx, &txn, pid, 16, 3);

    txn.rollback(sp, &fx.store).unwrap();
    assert_eq!(txn.state(), TxnState::Active, "partial rollback keeps the txn alive");

    let page = fx.store.page(pid);
    assert_eq!(&page.payload()[0..4], &[1; 4], "pre-savepoint write survives");
    assert_eq!(&page.payload()[8..12], &[0; 4]);
    assert_eq!(&page.payload()[16..20], &[0; 4]);

    // A full abort afterwards undoes the remainder exactly once.
    txn.abort(&fx.store).unwrap();
    txn.end().unwrap();
    assert_eq!(&fx.store.page(pid).payload()[0..4], &[0; 4]);
}

#[test]
fn anchored_operation_is_skipped_by_rollback() {
    let fx = fixture(ElrMode::None);
    let txn = fx.mgr.begin().unwrap();
    let _u = txn.attach_update_thread();

    let pid = PageId::new(11);
    write(&fx, &txn, pid, 0, 1);

    // A compensated multi-record operation: rollback must treat it as
    // already undone (its effects stand).
    let anchor = txn.anchor();
    write(&fx, &txn, pid, 8, 2);
    write(&fx, &txn, pid, 16, 3);
    txn.release_anchor(true).unwrap();
    assert!(txn.undo_nxt() <= anchor);

    txn.abort(&fx.store).unwrap();
    txn.end().unwrap();

    let page = fx.store.page(pid);
    assert_eq!(&page.payload()[0..4], &[0; 4], "unanchored write undone");
    assert_eq!(&page.payload()[8..12], &[2; 4], "compensated op survives rollback");
    assert_eq!(&page.payload()[16..20], &[3; 4]);
}

#[test]
fn rollback_reserve_tracks_undoable_bytes() {
    let fx = fixture(ElrMode::None);
    let txn = fx.mgr.begin().unwrap();
    let _u = txn.attach_update_thread();

    assert_eq!(txn.log_bytes_reserved_for_rollback(), 0);
    let pid = PageId::new(12);
    write(&fx, &txn, pid, 0, 1);
    let after_one = txn.log_bytes_reserved_for_rollback();
    assert!(after_one > 0, "undoable writes must grow the rollback reserve");
    write(&fx, &txn, pid, 8, 2);
    assert!(txn.log_bytes_reserved_for_rollback() > after_one);

    // Rollback consumes the reserve rather than new space.
    let space_before = fx.log.space_used();
    txn.abort(&fx.store).unwrap();
    assert!(
        fx.log.space_used() <= space_before,
        "compensations must come out of the rollback reserve"
    );
    txn.end().unwrap();
    assert_eq!(txn.log_bytes_reserved_for_rollback(), 0);
}

#[test]
fn deferred_ssx_flushes_before_next_record() {
    let fx = fixture(ElrMode::None);
    let txn = fx.mgr.begin().unwrap();
    let _u = txn.attach_update_thread();

    let applied = Arc::new(Mutex::new(Lsn::NULL));
    let seen = Arc::clone(&applied);
    let ssx = LogRecord::system(
        VOL,
        PageId::new(20),
        LogPayload::ChildEmlsn { slot: 0, emlsn: Lsn::new(1, 64) },
    );
    txn.defer_ssx(ssx, Box::new(move |lsn| {
        *seen.lock() = lsn;
        Ok(())
    }))
    .unwrap();
    assert_eq!(*applied.lock(), Lsn::NULL, "deferred record must not apply eagerly");

    // The next user record forces the flush, in order.
    let user_lsn = write(&fx, &txn, PageId::new(21), 0, 5);
    let ssx_lsn = *applied.lock();
    assert!(!ssx_lsn.is_null());
    assert!(ssx_lsn < user_lsn, "deferred record lands before the user record");

    txn.commit().unwrap();
    txn.end().unwrap();
}

#[test]
fn defer_section_flushes_on_drop() {
    let fx = fixture(ElrMode::None);
    let txn = fx.mgr.begin().unwrap();
    let applied = Arc::new(Mutex::new(false));
    {
        let _section = txn.defer_section();
        let seen = Arc::clone(&applied);
        let ssx = LogRecord::system(
            VOL,
            PageId::new(22),
            LogPayload::ChildEmlsn { slot: 1, emlsn: Lsn::new(1, 128) },
        );
        txn.defer_ssx(ssx, Box::new(move |_| {
            *seen.lock() = true;
            Ok(())
        }))
        .unwrap();
        assert!(!*applied.lock());
    }
    assert!(*applied.lock(), "scope exit must flush the deferred record");
}

#[test]
fn elr_mode_mismatch_is_rejected() {
    let fx = fixture(ElrMode::Sx);
    let err = fx
        .mgr
        .begin_with(basalt_txn::DEFAULT_TIMEOUT, ElrMode::None)
        .unwrap_err();
    assert!(matches!(err, BasaltError::ElrModeMismatch { .. }));
}

#[test]
fn sx_elr_releases_before_durability_and_readers_stall() {
    let fx = fixture(ElrMode::Sx);
    let locks = Arc::clone(fx.mgr.lock_table());
    let resource = LockId(77);

    // Writer: takes X, writes, commits. Under sx its locks go at
    // pre-commit, tagging the bucket with its commit LSN.
    let writer = fx.mgr.begin().unwrap();
    {
        let _u = writer.attach_update_thread();
        writer.lock(resource, LockMode::Exclusive).unwrap();
        write(&fx, &writer, PageId::new(30), 0, 9);
        writer.commit().unwrap();
        writer.end().unwrap();
        fx.mgr.finish(&writer);
    }
    let tag = locks.bucket_tag(resource);
    assert!(!tag.is_null(), "early X release must tag the bucket");

    // Reader: acquires the same resource, reads, commits read-only. It must
    // stall until the log is durable past the writer's tag.
    let reader = fx.mgr.begin().unwrap();
    reader.lock(resource, LockMode::Shared).unwrap();
    assert!(reader.read_watermark() >= tag);
    reader.commit().unwrap();
    assert!(
        fx.log.durable_lsn() > reader.read_watermark(),
        "read-only commit under sx waits for the watermark"
    );
    reader.end().unwrap();
}

#[test]
fn force_nonblocking_poisons_lock_waits() {
    let fx = fixture(ElrMode::None);
    let holder = fx.mgr.begin().unwrap();
    holder.lock(LockId(5), LockMode::Exclusive).unwrap();

    let victim = fx.mgr.begin().unwrap();
    victim.force_nonblocking();
    let err = victim.lock(LockId(5), LockMode::Shared).unwrap_err();
    assert!(matches!(err, BasaltError::Deadlock { .. }));

    // The poisoned victim aborts cleanly.
    victim.abort(&fx.store).unwrap();
    victim.end().unwrap();
}

#[test]
fn group_commit_flushes_once_past_every_member() {
    let fx = fixture(ElrMode::None);
    let a = fx.mgr.begin().unwrap();
    let b = fx.mgr.begin().unwrap();
    write(&fx, &a, PageId::new(40), 0, 1);
    write(&fx, &b, PageId::new(41), 0, 2);

    let outcomes = fx.mgr.group_commit(&[a.clone(), b.clone()]).unwrap();
    assert_eq!(outcomes.len(), 2);
    let high = outcomes.iter().map(|o| o.last_lsn).max().unwrap();
    assert!(
        fx.log.durable_lsn() > high,
        "the single group flush must cover every member's commit record"
    );
    for txn in [a, b] {
        txn.end().unwrap();
        fx.mgr.finish(&txn);
    }
    assert_eq!(fx.mgr.active_count(), 0);
}

#[test]
fn read_only_commit_is_trivial() {
    let fx = fixture(ElrMode::None);
    let txn = fx.mgr.begin().unwrap();
    let durable_before = fx.log.durable_lsn();
    let outcome = txn.commit().unwrap();
    assert!(outcome.last_lsn.is_null());
    assert_eq!(fx.log.durable_lsn(), durable_before, "no flush for read-only commit");
    txn.end().unwrap();
}
