//! Buffer-pool counters.

use std::sync::atomic::{AtomicU64, Ordering};

pub(crate) static BP_FIXES_TOTAL: AtomicU64 = AtomicU64::new(0);
pub(crate) static BP_HITS_TOTAL: AtomicU64 = AtomicU64::new(0);
pub(crate) static BP_MISSES_TOTAL: AtomicU64 = AtomicU64::new(0);
pub(crate) static BP_EVICTIONS_TOTAL: AtomicU64 = AtomicU64::new(0);
pub(crate) static BP_SWIZZLES_TOTAL: AtomicU64 = AtomicU64::new(0);
pub(crate) static BP_UNSWIZZLES_TOTAL: AtomicU64 = AtomicU64::new(0);
pub(crate) static BP_SPR_TOTAL: AtomicU64 = AtomicU64::new(0);
pub(crate) static BP_WRITEBACKS_TOTAL: AtomicU64 = AtomicU64::new(0);

/// Snapshot of buffer-pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct BufferPoolMetrics {
    pub basalt_bp_fixes_total: u64,
    pub basalt_bp_hits_total: u64,
    pub basalt_bp_misses_total: u64,
    pub basalt_bp_evictions_total: u64,
    pub basalt_bp_swizzles_total: u64,
    pub basalt_bp_unswizzles_total: u64,
    pub basalt_bp_spr_total: u64,
    pub basalt_bp_writebacks_total: u64,
}

/// Read current counters.
#[must_use]
pub fn bufferpool_metrics() -> BufferPoolMetrics {
    BufferPoolMetrics {
        basalt_bp_fixes_total: BP_FIXES_TOTAL.load(Ordering::Relaxed),
        basalt_bp_hits_total: BP_HITS_TOTAL.load(Ordering::Relaxed),
        basalt_bp_misses_total: BP_MISSES_TOTAL.load(Ordering::Relaxed),
        basalt_bp_evictions_total: BP_EVICTIONS_TOTAL.load(Ordering::Relaxed),
        basalt_bp_swizzles_total: BP_SWIZZLES_TOTAL.load(Ordering::Relaxed),
        basalt_bp_unswizzles_total: BP_UNSWIZZLES_TOTAL.load(Ordering::Relaxed),
        basalt_bp_spr_total: BP_SPR_TOTAL.load(Ordering::Relaxed),
        basalt_bp_writebacks_total: BP_WRITEBACKS_TOTAL.load(Ordering::Relaxed),
    }
}

/// Reset counters (tests).
pub fn reset_bufferpool_metrics() {
    for counter in [
        &BP_FIXES_TOTAL,
        &BP_HITS_TOTAL,
        &BP_MISSES_TOTAL,
        &BP_EVICTIONS_TOTAL,
        &BP_SWIZZLES_TOTAL,
        &BP_UNSWIZZLES_TOTAL,
        &BP_SPR_TOTAL,
        &BP_WRITEBACKS_TOTAL,
    ] {
        counter.store(0, Ordering::Relaxed);
    }
}
