//! Write-ahead log for basalt.
//!
//! Appends funnel through a consolidation array so that N concurrent log
//! inserts cost one CAS each plus one shared reservation per batch, instead
//! of N acquisitions of a global buffer mutex. The log itself is a directory
//! of fixed-size partition files; durability is tracked by a monotone
//! watermark that group-commit waiters block on.

pub mod carray;
pub mod manager;
pub mod queue_lock;
pub mod record;
pub mod spr;

pub use carray::{CarrayMetrics, ConsolidationArray, LogReserve, carray_metrics, reset_carray_metrics};
pub use manager::LogManager;
pub use queue_lock::QueueLock;
pub use record::{LogPayload, LogRecord, RecordSink, StnodeImage};
pub use spr::recover_page;
