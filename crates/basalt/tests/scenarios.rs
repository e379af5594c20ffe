//! Engine-level scenarios: clean start/stop, commit and crash-restart REDO,
//! in-flight abort via crash, single-page recovery under a store, and
//! massively concurrent log appends.
//!
//! The recovery analysis/REDO/UNDO *driver* is an external collaborator;
//! where a scenario crosses a crash, the test plays that role using the
//! engine's recovery hooks (`register_and_mark`, `load_for_redo`,
//! `in_doubt_to_dirty`, `associate_page`).

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use basalt::{Engine, catalog::StoreOperation};
use basalt_bufpool::{EvictUrgency, LatchMode, MemDevice, PageDevice};
use basalt_log::{LogPayload, LogRecord, RecordSink};
use basalt_types::{EngineOptions, Lsn, PageId, StoreId, TxnId, VolumeId};

const VOL: VolumeId = VolumeId::new(1);

/// Device wrapper so tests can keep corrupting/restarting the same backing
/// store the engine mounted.
#[derive(Clone)]
struct SharedDevice(Arc<MemDevice>);

impl PageDevice for SharedDevice {
    fn read_page(&self, pid: PageId) -> basalt::Result<Option<Vec<u8>>> {
        self.0.read_page(pid)
    }
    fn write_page(&self, pid: PageId, image: &[u8]) -> basalt::Result<()> {
        self.0.write_page(pid, image)
    }
    fn sync(&self) -> basalt::Result<()> {
        self.0.sync()
    }
}

fn small_opts() -> EngineOptions {
    EngineOptions { bufferpool_frames: 128, ..EngineOptions::default() }
}

/// Minimal restart driver: ARIES-style REDO of every logged page update,
/// then UNDO of transactions that never committed.
fn recover(engine: &Engine) -> basalt::Result<()> {
    let log = engine.log();
    let pool = engine.pool();
    let records = log.scan_from(Lsn::NULL)?;

    let committed: HashSet<TxnId> = records
        .iter()
        .filter(|r| matches!(r.payload, LogPayload::Commit))
        .map(|r| r.txn)
        .collect();

    // Analysis: group page records, tracking first/last LSN per page.
    let mut pages: BTreeMap<u64, Vec<&LogRecord>> = BTreeMap::new();
    for rec in records.iter().filter(|r| r.has_page()) {
        pages.entry(basalt_types::resident_key(rec.vol, rec.pid)).or_default().push(rec);
    }

    // REDO: load each touched page and roll it forward through every record
    // (losers included, ARIES-style).
    for chain in pages.values() {
        let first = chain.first().expect("non-empty chain");
        let last = chain.last().expect("non-empty chain");
        let (frame, _) = pool.register_and_mark(
            first.vol,
            first.pid,
            StoreId::RESERVED,
            first.lsn,
            last.lsn,
        )?;
        pool.load_for_redo(frame)?;
        pool.in_doubt_to_dirty(frame);
        let handle = pool.associate_page(frame)?;
        for rec in chain {
            if rec.lsn > handle.page_lsn() {
                handle.with_page_mut(|p| rec.redo(p))?;
                handle.set_page_lsn(rec.lsn);
            }
        }
        handle.set_dirty();
    }

    // UNDO: walk loser transactions backwards, logging compensations and
    // applying them.
    let mut losers: BTreeMap<u64, Vec<&LogRecord>> = BTreeMap::new();
    for rec in &records {
        if rec.txn != TxnId::NULL && !committed.contains(&rec.txn) {
            losers.entry(rec.txn.get()).or_default().push(rec);
        }
    }
    for chain in losers.values() {
        for rec in chain.iter().rev() {
            let Some(mut clr) = rec.undo_record(rec.prev_lsn) else { continue };
            clr.lsn = log.append(clr.clone())?;
            let handle = pool
                .fix_direct(clr.vol, clr.pid, LatchMode::Exclusive, false, false)?;
            handle.with_page_mut(|p| clr.redo(p))?;
            handle.set_page_lsn(clr.lsn);
            handle.set_dirty();
        }
    }
    Ok(())
}

/// Register the roots of every store the (recovered) catalog knows about.
fn reload_roots(engine: &Engine) -> basalt::Result<Vec<StoreId>> {
    let catalog = engine.catalog(VOL)?;
    let stores = catalog.all_used_store_ids()?;
    for &store in &stores {
        let root = catalog.root_pid(store)?;
        engine.pool().register_root(VOL, store, root)?;
    }
    Ok(stores)
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn empty_start_stop() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::start(
        dir.path(),
        EngineOptions { bufferpool_frames: 100, ..EngineOptions::default() },
    )
    .unwrap();
    assert_eq!(engine.pool().dirty_frames(), 0);
    assert_eq!(engine.txns().active_count(), 0);
    engine.shutdown().unwrap();
    assert_eq!(engine.pool().dirty_frames(), 0);
}

#[test]
fn committed_update_survives_crash() {
    let dir = tempfile::tempdir().unwrap();
    let device = Arc::new(MemDevice::new());

    let (store, root) = {
        let engine = Engine::start(dir.path(), small_opts()).unwrap();
        engine.mount_volume(VOL, Box::new(SharedDevice(Arc::clone(&device)))).unwrap();

        let txn = engine.txns().begin().unwrap();
        let _u = txn.attach_update_thread();
        let (store, root) = engine.create_store(&txn, VOL).unwrap();
        {
            let page = engine.pool().fix_root(VOL, store, LatchMode::Exclusive, false).unwrap();
            engine.update_page(&txn, &page, 0, b"aa3data3").unwrap();
        }
        engine.commit(&txn).unwrap();
        engine.log().flush_all().unwrap();
        (store, root)
        // Dropping the engine without shutdown: dirty pages are lost, the
        // log survives. That is the crash.
    };

    let engine = Engine::start(dir.path(), small_opts()).unwrap();
    engine.mount_volume(VOL, Box::new(SharedDevice(Arc::clone(&device)))).unwrap();
    recover(&engine).unwrap();
    let stores = reload_roots(&engine).unwrap();
    assert_eq!(stores, vec![store]);
    assert_eq!(engine.catalog(VOL).unwrap().root_pid(store).unwrap(), root);

    let page = engine.pool().fix_root(VOL, store, LatchMode::Shared, false).unwrap();
    page.with_page(|p| assert_eq!(&p.payload()[..8], b"aa3data3"));
}

#[test]
fn in_flight_txn_is_undone_after_crash() {
    let dir = tempfile::tempdir().unwrap();
    let device = Arc::new(MemDevice::new());

    let store = {
        let engine = Engine::start(dir.path(), small_opts()).unwrap();
        engine.mount_volume(VOL, Box::new(SharedDevice(Arc::clone(&device)))).unwrap();

        // Committed work: rows aa1, aa2, aa3 at fixed slots.
        let txn = engine.txns().begin().unwrap();
        let (store, _root) = engine.create_store(&txn, VOL).unwrap();
        {
            let page = engine.pool().fix_root(VOL, store, LatchMode::Exclusive, false).unwrap();
            engine.update_page(&txn, &page, 0, b"aa1").unwrap();
            engine.update_page(&txn, &page, 16, b"aa2").unwrap();
            engine.update_page(&txn, &page, 32, b"aa3").unwrap();
        }
        engine.commit(&txn).unwrap();

        // In-flight work: aa4, never committed.
        let loser = engine.txns().begin().unwrap();
        {
            let page = engine.pool().fix_root(VOL, store, LatchMode::Exclusive, false).unwrap();
            engine.update_page(&loser, &page, 48, b"aa4").unwrap();
        }
        engine.log().flush_all().unwrap();
        store
        // Crash with the loser still active.
    };

    let engine = Engine::start(dir.path(), small_opts()).unwrap();
    engine.mount_volume(VOL, Box::new(SharedDevice(Arc::clone(&device)))).unwrap();
    recover(&engine).unwrap();
    reload_roots(&engine).unwrap();

    let page = engine.pool().fix_root(VOL, store, LatchMode::Shared, false).unwrap();
    page.with_page(|p| {
        assert_eq!(&p.payload()[0..3], b"aa1");
        assert_eq!(&p.payload()[16..19], b"aa2");
        assert_eq!(&p.payload()[32..35], b"aa3");
        assert_eq!(&p.payload()[48..51], &[0, 0, 0], "uncommitted row must be gone");
    });
}

#[test]
fn corrupted_leaf_recovers_during_lookup() {
    let dir = tempfile::tempdir().unwrap();
    let device = Arc::new(MemDevice::new());
    let engine = Engine::start(dir.path(), small_opts()).unwrap();
    engine.mount_volume(VOL, Box::new(SharedDevice(Arc::clone(&device)))).unwrap();

    // A store with one leaf under the root, populated with 30 keys.
    let txn = engine.txns().begin().unwrap();
    let (store, _root) = engine.create_store(&txn, VOL).unwrap();
    let leaf_pid = engine.allocate_page(VOL).unwrap();
    {
        let root = engine.pool().fix_root(VOL, store, LatchMode::Exclusive, false).unwrap();
        let slot = root.with_page(|p| p.child_count());
        let rec = LogRecord::transactional(
            txn.tid(),
            VOL,
            root.pid(),
            true,
            LogPayload::ChildPointer { slot: slot as u16, before: PageId::NULL, after: leaf_pid },
        );
        let lsn = txn.sink_append(rec).unwrap();
        root.with_page_mut(|p| {
            p.push_child(leaf_pid);
        });
        root.set_page_lsn(lsn);
        root.set_dirty();

        let leaf = engine
            .pool()
            .fix_nonroot(&root, VOL, leaf_pid, LatchMode::Exclusive, false, true)
            .unwrap();
        leaf.set_store(store);
        let fmt = LogRecord::transactional(
            txn.tid(),
            VOL,
            leaf_pid,
            false,
            LogPayload::PageFormat { store },
        );
        let lsn = txn.sink_append(fmt).unwrap();
        leaf.set_page_lsn(lsn);
        for i in 0..30usize {
            let key = format!("key{i:03}");
            engine.update_page(&txn, &leaf, i * 16, key.as_bytes()).unwrap();
        }
        leaf.set_dirty();
    }
    engine.commit(&txn).unwrap();

    // Checkpoint-ish: everything to disk, then out of the pool.
    engine.pool().force_all().unwrap();
    engine.pool().evict_blocks(EvictUrgency::Complete, 0).unwrap();

    // Smash a byte range in the middle of the leaf image.
    device.corrupt_page(leaf_pid, 1234..2220);

    // Any lookup on the page succeeds; recovery is invoked transparently.
    let root = engine.pool().fix_root(VOL, store, LatchMode::Shared, false).unwrap();
    let ptr = root.with_page(|p| p.child(0));
    let leaf = engine
        .pool()
        .fix_nonroot(&root, VOL, ptr, LatchMode::Shared, false, false)
        .unwrap();
    leaf.with_page(|p| {
        for i in 0..30usize {
            let key = format!("key{i:03}");
            assert_eq!(&p.payload()[i * 16..i * 16 + 6], key.as_bytes(), "key {i}");
        }
    });
}

#[test]
fn concurrent_log_insert_is_gapless() {
    const THREADS: usize = 64;
    const PER_THREAD: usize = 100;
    const RECORD_SIZE: usize = 256;

    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(Engine::start(dir.path(), small_opts()).unwrap());
    let start = engine.log().curr_lsn();
    let barrier = Arc::new(std::sync::Barrier::new(THREADS));

    let mut handles = Vec::new();
    for t in 0..THREADS {
        let engine = Arc::clone(&engine);
        let barrier = Arc::clone(&barrier);
        handles.push(std::thread::spawn(move || {
            barrier.wait();
            for i in 0..PER_THREAD {
                let mut text = format!("t{t:02}i{i:03}:");
                while text.len() < RECORD_SIZE - basalt_log::record::RECORD_HEADER_SIZE {
                    text.push('x');
                }
                let mut rec = LogRecord::system(
                    VOL,
                    PageId::NULL,
                    LogPayload::Comment { text },
                );
                rec.txn = TxnId::new(t as u64 + 1);
                assert_eq!(rec.encoded_size(), RECORD_SIZE);
                engine.log().append(rec).unwrap();
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    engine.log().flush_all().unwrap();

    let records = engine.log().scan_from(start).unwrap();
    assert_eq!(records.len(), THREADS * PER_THREAD);
    for w in records.windows(2) {
        assert!(w[0].lsn < w[1].lsn, "LSNs must be strictly increasing");
    }
    let total: u64 = records.iter().map(|r| r.encoded_size() as u64).sum();
    assert_eq!(total, (THREADS * PER_THREAD * RECORD_SIZE) as u64);
    // Contiguous LSN space: exactly the payload bytes were reserved.
    assert_eq!(engine.log().curr_lsn().data() - start.data(), total);
}

#[test]
fn store_lifecycle_free_at_commit() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::start(dir.path(), small_opts()).unwrap();
    engine.mount_mem_volume(VOL).unwrap();

    let txn = engine.txns().begin().unwrap();
    let (store, _root) = engine.create_store(&txn, VOL).unwrap();
    engine.commit(&txn).unwrap();

    let catalog = engine.catalog(VOL).unwrap();
    assert_eq!(catalog.all_used_store_ids().unwrap(), vec![store]);

    // Drop the store through a second transaction.
    let txn = engine.txns().begin().unwrap();
    catalog
        .apply(
            StoreOperation::SetDeleting {
                store,
                state: basalt::DeletingState::Deleting,
            },
            &*txn,
        )
        .unwrap();
    txn.add_store_to_free(VOL, store);
    engine.commit(&txn).unwrap();

    assert!(catalog.all_used_store_ids().unwrap().is_empty());
    assert!(catalog.root_pid(store).unwrap().is_null());
}

#[test]
fn aborted_store_creation_reverts_the_catalog() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::start(dir.path(), small_opts()).unwrap();
    engine.mount_mem_volume(VOL).unwrap();

    let txn = engine.txns().begin().unwrap();
    let (store, _root) = engine.create_store(&txn, VOL).unwrap();
    let catalog = engine.catalog(VOL).unwrap();
    assert_eq!(catalog.all_used_store_ids().unwrap(), vec![store]);

    engine.abort(&txn).unwrap();
    assert!(
        catalog.all_used_store_ids().unwrap().is_empty(),
        "abort must roll the catalog entry back"
    );
}
