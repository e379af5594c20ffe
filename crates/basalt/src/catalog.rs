//! Per-volume store catalog.
//!
//! Wraps the store-node page (volume page 3): a flat array of fixed-size
//! records, one per possible store id, entry 0 reserved. Holds one lock
//! across every operation — they are all short — and fixes the page
//! exclusively for mutation, logging each change before applying it.

use std::sync::Arc;

use basalt_bufpool::{BufferPool, LatchMode};
use basalt_error::{BasaltError, Result};
use basalt_log::{LogPayload, LogRecord, RecordSink, StnodeImage};
use basalt_types::{PAGE_PAYLOAD_SIZE, PageId, StoreId, VolumeId};
use parking_lot::Mutex;
use tracing::debug;

/// Volume page holding the store-node array.
pub const STNODE_PAGE: PageId = PageId::new(3);

/// Maximum stores per volume: one entry each on the store-node page.
pub const MAX_STORES: usize = PAGE_PAYLOAD_SIZE / StnodeImage::ENCODED_SIZE;

// ---------------------------------------------------------------------------
// Store flags / deleting state
// ---------------------------------------------------------------------------

/// Logging discipline of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct StoreFlags(pub u16);

impl StoreFlags {
    /// Fully logged.
    pub const REGULAR: Self = Self(0);
    /// Temporary: contents discarded at shutdown.
    pub const TMP: Self = Self(1);
    /// Bulk-load store: minimal logging until converted to regular.
    pub const LOAD: Self = Self(2);
    /// Insert-optimized logging.
    pub const INSERT: Self = Self(4);
}

/// Deletion state of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeletingState {
    #[default]
    NotDeleting,
    Deleting,
    Unknown,
}

impl DeletingState {
    #[must_use]
    pub const fn to_u16(self) -> u16 {
        match self {
            Self::NotDeleting => 0,
            Self::Deleting => 1,
            Self::Unknown => 2,
        }
    }

    #[must_use]
    pub const fn from_u16(v: u16) -> Self {
        match v {
            0 => Self::NotDeleting,
            1 => Self::Deleting,
            _ => Self::Unknown,
        }
    }
}

/// One store's catalog record, decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stnode {
    pub root: PageId,
    pub flags: StoreFlags,
    pub deleting: DeletingState,
}

impl Stnode {
    fn from_image(img: StnodeImage) -> Self {
        Self {
            root: PageId::from_bits(img.root),
            flags: StoreFlags(img.flags),
            deleting: DeletingState::from_u16(img.deleting),
        }
    }

    fn to_image(self) -> StnodeImage {
        StnodeImage {
            root: self.root.bits(),
            flags: self.flags.0,
            deleting: self.deleting.to_u16(),
        }
    }
}

/// A catalog mutation. Each is logged as a `StoreOp` record carrying the
/// before and after entry images, then applied to the exclusively fixed
/// store-node page.
#[derive(Debug, Clone, Copy)]
pub enum StoreOperation {
    Create { store: StoreId, root: PageId, flags: StoreFlags },
    Delete { store: StoreId },
    SetDeleting { store: StoreId, state: DeletingState },
    SetFlags { store: StoreId, flags: StoreFlags },
}

impl StoreOperation {
    #[must_use]
    pub const fn store(&self) -> StoreId {
        match self {
            Self::Create { store, .. }
            | Self::Delete { store }
            | Self::SetDeleting { store, .. }
            | Self::SetFlags { store, .. } => *store,
        }
    }
}

// ---------------------------------------------------------------------------
// StoreCatalog
// ---------------------------------------------------------------------------

/// Store create/destroy/query interface for one volume.
pub struct StoreCatalog {
    vol: VolumeId,
    pool: Arc<BufferPool>,
    /// All operations are short; one lock covers them all.
    lock: Mutex<()>,
}

impl StoreCatalog {
    #[must_use]
    pub fn new(vol: VolumeId, pool: Arc<BufferPool>) -> Self {
        Self { vol, pool, lock: Mutex::new(()) }
    }

    fn read_entry(&self, store: StoreId) -> Result<Stnode> {
        debug_assert!(store.index() > 0 && store.index() < MAX_STORES);
        let page = self
            .pool
            .fix_direct(self.vol, STNODE_PAGE, LatchMode::Shared, false, false)?;
        let at = store.index() * StnodeImage::ENCODED_SIZE;
        let img = page.with_page(|p| StnodeImage::decode(&p.payload()[at..at + 8]));
        Ok(Stnode::from_image(img))
    }

    /// Root page id of `store`, or null when the store is unused.
    pub fn root_pid(&self, store: StoreId) -> Result<PageId> {
        let _g = self.lock.lock();
        Ok(self.read_entry(store)?.root)
    }

    /// Copy of the full catalog record for `store`.
    pub fn copy_stnode(&self, store: StoreId) -> Result<Stnode> {
        let _g = self.lock.lock();
        self.read_entry(store)
    }

    /// Smallest store id not currently in use.
    pub fn min_unused_store_id(&self) -> Result<StoreId> {
        let _g = self.lock.lock();
        let page = self
            .pool
            .fix_direct(self.vol, STNODE_PAGE, LatchMode::Shared, false, false)?;
        let found = page.with_page(|p| {
            (1..MAX_STORES).find(|&i| {
                let at = i * StnodeImage::ENCODED_SIZE;
                StnodeImage::decode(&p.payload()[at..at + 8]).root == 0
            })
        });
        found
            .map(|i| StoreId::new(i as u32))
            .ok_or(BasaltError::StoreExhausted { vol: self.vol })
    }

    /// All store ids currently in use.
    pub fn all_used_store_ids(&self) -> Result<Vec<StoreId>> {
        let _g = self.lock.lock();
        let page = self
            .pool
            .fix_direct(self.vol, STNODE_PAGE, LatchMode::Shared, false, false)?;
        Ok(page.with_page(|p| {
            (1..MAX_STORES)
                .filter(|&i| {
                    let at = i * StnodeImage::ENCODED_SIZE;
                    StnodeImage::decode(&p.payload()[at..at + 8]).root != 0
                })
                .map(|i| StoreId::new(i as u32))
                .collect()
        }))
    }

    /// Apply one catalog mutation: fix the store-node page exclusive, log
    /// the change through `sink`, then mutate the page.
    pub fn apply(&self, op: StoreOperation, sink: &dyn RecordSink) -> Result<()> {
        let _g = self.lock.lock();
        let store = op.store();
        if store.index() == 0 || store.index() >= MAX_STORES {
            return Err(BasaltError::internal(format!("store id {store} out of range")));
        }
        let page = self
            .pool
            .fix_direct(self.vol, STNODE_PAGE, LatchMode::Exclusive, false, false)?;
        let at = store.index() * StnodeImage::ENCODED_SIZE;
        let before_img = page.with_page(|p| StnodeImage::decode(&p.payload()[at..at + 8]));
        let before = Stnode::from_image(before_img);

        let after = match op {
            StoreOperation::Create { root, flags, .. } => {
                if before.root != PageId::NULL {
                    return Err(BasaltError::internal(format!("store {store} already exists")));
                }
                Stnode { root, flags, deleting: DeletingState::NotDeleting }
            }
            StoreOperation::Delete { .. } => {
                if before.root == PageId::NULL {
                    return Err(BasaltError::NoSuchStore { vol: self.vol, store });
                }
                Stnode {
                    root: PageId::NULL,
                    flags: StoreFlags::REGULAR,
                    deleting: DeletingState::NotDeleting,
                }
            }
            StoreOperation::SetDeleting { state, .. } => {
                if before.root == PageId::NULL {
                    return Err(BasaltError::NoSuchStore { vol: self.vol, store });
                }
                Stnode { deleting: state, ..before }
            }
            StoreOperation::SetFlags { flags, .. } => {
                if before.root == PageId::NULL {
                    return Err(BasaltError::NoSuchStore { vol: self.vol, store });
                }
                Stnode { flags, ..before }
            }
        };

        let rec = LogRecord::transactional(
            basalt_types::TxnId::NULL,
            self.vol,
            STNODE_PAGE,
            true,
            LogPayload::StoreOp { store, before: before_img, after: after.to_image() },
        );
        let lsn = sink.sink_append(rec)?;
        page.with_page_mut(|p| {
            p.patch_payload(at, &after.to_image().encode())
                .map_err(|e| BasaltError::internal(e.to_string()))
        })?;
        page.set_page_lsn(lsn);
        page.set_dirty();
        debug!(target: "basalt.catalog", vol = %self.vol, store = %store, op = ?op, "store operation");
        Ok(())
    }
}

impl std::fmt::Debug for StoreCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreCatalog").field("vol", &self.vol).finish_non_exhaustive()
    }
}
