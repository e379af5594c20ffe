//! basalt: a transactional B-tree storage core.
//!
//! The heavy machinery lives in the member crates — the swizzling buffer
//! pool (`basalt-bufpool`), the consolidation-array log (`basalt-log`), and
//! the transaction object (`basalt-txn`). This crate wires them into an
//! [`Engine`], adds the per-volume store catalog and volume format, and
//! drives commit/abort end to end.
//!
//! ```no_run
//! use basalt::{Engine, catalog::StoreOperation};
//! use basalt_types::{EngineOptions, VolumeId};
//!
//! let engine = Engine::start("/tmp/basalt-log", EngineOptions::default())?;
//! engine.mount_mem_volume(VolumeId::new(1))?;
//! let txn = engine.txns().begin()?;
//! let (store, _root) = engine.create_store(&txn, VolumeId::new(1))?;
//! engine.commit(&txn)?;
//! # let _ = store;
//! # Ok::<(), basalt_error::BasaltError>(())
//! ```

pub mod catalog;
pub mod engine;
pub mod volume_format;

pub use catalog::{DeletingState, MAX_STORES, Stnode, StoreCatalog, StoreFlags, StoreOperation};
pub use engine::Engine;

pub use basalt_bufpool as bufpool;
pub use basalt_error::{BasaltError, Result};
pub use basalt_log as log;
pub use basalt_txn as txn;
pub use basalt_types as types;
