//! The engine handle: the process-wide singletons (buffer pool, log,
//! transaction manager, store catalogs) wired together and passed
//! explicitly to everything that needs them.

use std::collections::HashMap;
use std::sync::Arc;

use basalt_bufpool::{BufferPool, Cleaner, LatchMode, MemDevice, PageDevice, PageHandle, Volume};
use basalt_error::{BasaltError, Result};
use basalt_log::{LogManager, LogPayload, LogRecord, RecordSink};
use basalt_txn::{ElrMode, Txn, TxnManager, UndoApplicator};
use basalt_types::{EngineOptions, Lsn, PageId, StoreId, VolumeId};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::catalog::{StoreCatalog, StoreFlags, StoreOperation};
use crate::volume_format::{self, ALLOC_PAGE};

/// The engine. One per process; everything hangs off it.
pub struct Engine {
    opts: EngineOptions,
    log: Arc<LogManager>,
    pool: Arc<BufferPool>,
    txns: TxnManager,
    catalogs: RwLock<HashMap<u32, Arc<StoreCatalog>>>,
    /// Serializes page allocation per engine; allocations are rare and
    /// short.
    alloc_lock: Mutex<()>,
    cleaner: Mutex<Option<Cleaner>>,
}

impl Engine {
    /// Bring up the engine: open (or resume) the log and build the buffer
    /// pool. Volumes are mounted separately.
    pub fn start(log_dir: impl AsRef<std::path::Path>, opts: EngineOptions) -> Result<Self> {
        Self::start_with_elr(log_dir, opts, ElrMode::None)
    }

    /// [`start`](Self::start) with an explicit engine-wide early-lock-release
    /// mode.
    pub fn start_with_elr(
        log_dir: impl AsRef<std::path::Path>,
        opts: EngineOptions,
        elr: ElrMode,
    ) -> Result<Self> {
        let opts = opts.validated();
        let log = Arc::new(LogManager::open(log_dir, &opts)?);
        let pool = Arc::new(BufferPool::new(&opts, Arc::clone(&log)));
        let txns = TxnManager::new(Arc::clone(&log), elr);
        let cleaner = if opts.cleaner_interval_ms > 0 {
            Some(Cleaner::start(
                Arc::clone(&pool),
                std::time::Duration::from_millis(opts.cleaner_interval_ms),
            ))
        } else {
            None
        };
        info!(
            target: "basalt.engine",
            frames = opts.bufferpool_frames,
            swizzling = opts.enable_swizzling,
            elr = elr.name(),
            "engine started"
        );
        Ok(Self {
            opts,
            log,
            pool,
            txns,
            catalogs: RwLock::new(HashMap::new()),
            alloc_lock: Mutex::new(()),
            cleaner: Mutex::new(cleaner),
        })
    }

    // --- accessors ---

    #[must_use]
    pub fn options(&self) -> &EngineOptions {
        &self.opts
    }

    #[must_use]
    pub fn log(&self) -> &Arc<LogManager> {
        &self.log
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    #[must_use]
    pub fn txns(&self) -> &TxnManager {
        &self.txns
    }

    pub fn catalog(&self, vol: VolumeId) -> Result<Arc<StoreCatalog>> {
        self.catalogs
            .read()
            .get(&vol.get())
            .cloned()
            .ok_or_else(|| BasaltError::internal(format!("volume {vol} not mounted")))
    }

    // --- volumes ---

    /// Mount a volume from `device`, formatting it first if it is fresh.
    /// Existing store roots are preloaded and pinned.
    pub fn mount_volume(&self, vol: VolumeId, device: Box<dyn PageDevice>) -> Result<()> {
        if !volume_format::is_formatted(&*device)? {
            volume_format::format_volume(&*device, vol)?;
            debug!(target: "basalt.engine", vol = %vol, "volume formatted");
        }
        self.pool.install_volume(Arc::new(Volume::new(vol, device)))?;
        let catalog = Arc::new(StoreCatalog::new(vol, Arc::clone(&self.pool)));
        for store in catalog.all_used_store_ids()? {
            let root = catalog.root_pid(store)?;
            self.pool.register_root(vol, store, root)?;
        }
        self.catalogs.write().insert(vol.get(), catalog);
        info!(target: "basalt.engine", vol = %vol, "volume mounted");
        Ok(())
    }

    /// Mount a scratch in-memory volume (tests, temporary stores).
    pub fn mount_mem_volume(&self, vol: VolumeId) -> Result<()> {
        self.mount_volume(vol, Box::new(MemDevice::new()))
    }

    /// Write back, unpin, and drop a volume.
    pub fn unmount_volume(&self, vol: VolumeId) -> Result<()> {
        self.catalogs.write().remove(&vol.get());
        self.pool.uninstall_volume(vol)
    }

    // --- page allocation ---

    /// Allocate a page id from the volume's bitmap. Logged as a system
    /// record against the bitmap page.
    pub fn allocate_page(&self, vol: VolumeId) -> Result<PageId> {
        let _g = self.alloc_lock.lock();
        let page = self
            .pool
            .fix_direct(vol, ALLOC_PAGE, LatchMode::Exclusive, false, false)?;
        let found = page.with_page(|p| volume_format::first_free_bit(p.payload()));
        let Some((byte, mask, pid)) = found else {
            return Err(BasaltError::internal(format!("volume {vol} is full")));
        };
        let before = page.with_page(|p| p.payload()[byte]);
        let rec = LogRecord::system(
            vol,
            ALLOC_PAGE,
            LogPayload::PageWrite {
                offset: byte as u32,
                before: vec![before],
                after: vec![before | mask],
            },
        );
        let lsn = self.log.append(rec)?;
        page.with_page_mut(|p| {
            p.payload_mut()[byte] |= mask;
        });
        page.set_page_lsn(lsn);
        page.set_dirty();
        Ok(pid)
    }

    /// Return a page id to the volume's bitmap.
    pub fn free_page(&self, vol: VolumeId, pid: PageId) -> Result<()> {
        let _g = self.alloc_lock.lock();
        let page = self
            .pool
            .fix_direct(vol, ALLOC_PAGE, LatchMode::Exclusive, false, false)?;
        let (byte, mask) = volume_format::bit_of(pid);
        let before = page.with_page(|p| p.payload()[byte]);
        if before & mask == 0 {
            return Ok(());
        }
        let rec = LogRecord::system(
            vol,
            ALLOC_PAGE,
            LogPayload::PageWrite {
                offset: byte as u32,
                before: vec![before],
                after: vec![before & !mask],
            },
        );
        let lsn = self.log.append(rec)?;
        page.with_page_mut(|p| {
            p.payload_mut()[byte] &= !mask;
        });
        page.set_page_lsn(lsn);
        page.set_dirty();
        Ok(())
    }

    // --- stores ---

    /// Create a store in `vol`: allocate a root page, record it in the
    /// catalog (logged through `txn`, so an abort reverts the entry), and
    /// format the virgin root.
    pub fn create_store(&self, txn: &Txn, vol: VolumeId) -> Result<(StoreId, PageId)> {
        let catalog = self.catalog(vol)?;
        let store = catalog.min_unused_store_id()?;
        let root = self.allocate_page(vol)?;
        catalog.apply(
            StoreOperation::Create { store, root, flags: StoreFlags::REGULAR },
            txn,
        )?;
        let handle = self.pool.fix_virgin_root(vol, store, root)?;
        let rec = LogRecord::transactional(
            txn.tid(),
            vol,
            root,
            false,
            LogPayload::PageFormat { store },
        );
        let lsn = txn.sink_append(rec)?;
        handle.set_page_lsn(lsn);
        handle.set_dirty();
        debug!(target: "basalt.engine", vol = %vol, store = %store, root = %root, "store created");
        Ok((store, root))
    }

    // --- transactional page updates ---

    /// Log and apply a byte-range update to an exclusively fixed page.
    /// The record goes through the transaction's reservation accounting
    /// first; the page is patched and stamped with the record's LSN.
    pub fn update_page(
        &self,
        txn: &Txn,
        page: &PageHandle<'_>,
        offset: usize,
        after: &[u8],
    ) -> Result<Lsn> {
        let before = page.with_page(|p| p.payload()[offset..offset + after.len()].to_vec());
        let rec = LogRecord::transactional(
            txn.tid(),
            page.vol(),
            page.pid(),
            true,
            LogPayload::PageWrite {
                offset: offset as u32,
                before,
                after: after.to_vec(),
            },
        );
        let lsn = txn.sink_append(rec)?;
        if lsn.is_null() {
            // Logging is switched off for this stream; apply unlogged.
            page.with_page_mut(|p| {
                p.payload_mut()[offset..offset + after.len()].copy_from_slice(after);
            });
            return Ok(lsn);
        }
        page.with_page_mut(|p| {
            p.payload_mut()[offset..offset + after.len()].copy_from_slice(after);
        });
        page.set_page_lsn(lsn);
        page.set_dirty();
        Ok(lsn)
    }

    // --- commit / abort ---

    /// Drive a transaction through commit: log and wait per the ELR policy,
    /// then free scheduled stores, convert load stores, and end it.
    pub fn commit(&self, txn: &Arc<Txn>) -> Result<Lsn> {
        let outcome = txn.commit()?;
        for (vol, store) in outcome.stores_to_free {
            let catalog = self.catalog(vol)?;
            let root = catalog.root_pid(store)?;
            catalog.apply(StoreOperation::Delete { store }, &**self.log())?;
            self.pool.deregister_root(vol, store)?;
            if !root.is_null() {
                self.free_page(vol, root)?;
            }
        }
        for (vol, store) in outcome.load_stores {
            let catalog = self.catalog(vol)?;
            catalog.apply(
                StoreOperation::SetFlags { store, flags: StoreFlags::REGULAR },
                &**self.log(),
            )?;
        }
        txn.end()?;
        self.txns.finish(txn);
        Ok(outcome.last_lsn)
    }

    /// Drive a transaction through abort: UNDO with compensations applied
    /// through the buffer pool, then end it.
    pub fn abort(&self, txn: &Arc<Txn>) -> Result<()> {
        txn.abort(self)?;
        txn.end()?;
        self.txns.finish(txn);
        Ok(())
    }

    // --- shutdown ---

    /// Wake the background cleaner for an immediate pass.
    pub fn wakeup_cleaner(&self) {
        if let Some(cleaner) = self.cleaner.lock().as_ref() {
            cleaner.wakeup();
        }
    }

    /// Clean shutdown: stop the cleaner, write back every dirty page, and
    /// flush the log.
    pub fn shutdown(&self) -> Result<()> {
        if let Some(mut cleaner) = self.cleaner.lock().take() {
            cleaner.stop();
        }
        let written = self.pool.force_all()?;
        self.log.flush_all()?;
        if self.pool.dirty_frames() != 0 {
            return Err(BasaltError::internal("dirty pages survived shutdown"));
        }
        info!(target: "basalt.engine", written, "engine shut down");
        Ok(())
    }
}

impl UndoApplicator for Engine {
    /// Apply a compensation to its page: fix exclusive, replay the record,
    /// stamp and dirty.
    fn apply_compensation(&self, record: &LogRecord) -> Result<()> {
        if !record.has_page() {
            return Ok(());
        }
        let page = self
            .pool
            .fix_direct(record.vol, record.pid, LatchMode::Exclusive, false, false)?;
        page.with_page_mut(|p| record.redo(p))?;
        page.set_page_lsn(record.lsn);
        page.set_dirty();
        drop(page);
        // A compensated store creation must also drop the root pin taken
        // when the virgin root was registered.
        if let LogPayload::StoreOp { store, after, .. } = &record.payload {
            if after.root == 0 {
                self.pool.deregister_root(record.vol, *store)?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("pool", &self.pool)
            .field("log", &self.log)
            .field("txns", &self.txns)
            .finish_non_exhaustive()
    }
}
