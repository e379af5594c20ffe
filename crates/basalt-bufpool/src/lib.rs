//! Buffer pool with pointer swizzling for the basalt storage engine.
//!
//! The pool exploits the tree structure of the stores it caches: a fix is
//! normally performed through the already-fixed parent page, and once a
//! child is resident the parent's stored pointer is *swizzled* — atomically
//! replaced by the child's frame index with the high bit set — so subsequent
//! descents skip the resident table entirely. Eviction reverses the
//! swizzle, records an expected-minimum LSN for the child in the parent, and
//! returns the frame to the free list.

pub mod cleaner;
pub mod evict;
pub mod frame;
pub mod handle;
pub mod hashtable;
pub mod latch;
pub mod metrics;
pub mod pool;
pub mod volume;

pub use cleaner::Cleaner;
pub use evict::{EvictStats, EvictUrgency};
pub use frame::{ControlBlock, Frame, PIN_EVICTING};
pub use handle::PageHandle;
pub use hashtable::{Insert, ResidentTable};
pub use latch::{Latch, LatchMode, QTicket};
pub use metrics::{BufferPoolMetrics, bufferpool_metrics, reset_bufferpool_metrics};
pub use pool::{BufferPool, DirtyPageInfo};
pub use volume::{FileDevice, MemDevice, PageDevice, Volume};
