//! Eviction: a single-threaded sequential sweep over the frame array.
//!
//! Not as precise as LRU, but thread-safe by construction: exactly one
//! evictor runs at a time (the eviction mutex), every latch it takes is
//! conditional, and a frame is only reclaimed after its pin count is
//! compare-and-set from zero to the eviction sentinel, so no fix can
//! observe a frame mid-teardown.
//!
//! Before a frame is freed, the parent's expected-minimum LSN for the child
//! is brought up to the child's page LSN through a tiny non-transactional
//! system record; single-page recovery depends on that bound to know how far
//! forward to roll the child when it is next fixed.

use std::sync::atomic::Ordering;

use basalt_error::Result;
use basalt_log::{LogPayload, LogRecord};
use basalt_types::{FrameId, PageFlags};
use tracing::{debug, trace};

use crate::metrics::BP_EVICTIONS_TOTAL;
use crate::pool::BufferPool;

/// How hard to try. Order matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EvictUrgency {
    /// Single pass, leaves only, no unswizzling.
    Normal,
    /// Multiple passes.
    Eager,
    /// Permit unswizzling and inner nodes.
    Urgent,
    /// Force everything out (tests, unmount).
    Complete,
}

/// Result of one eviction call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictStats {
    pub evicted: u32,
    pub unswizzled: u32,
}

/// Sweep rounds cap per call.
const EVICT_MAX_ROUNDS: u32 = 20;

impl BufferPool {
    /// Evict frames until roughly `eviction_batch_ratio` of the pool (or
    /// `preferred_count`, whichever is larger) has been freed, or the sweep
    /// gives up.
    pub fn evict_blocks(&self, urgency: EvictUrgency, preferred_count: u32) -> Result<EvictStats> {
        let mut guard = self.eviction.lock();
        let capacity = (self.frame_count() - 1) as u32;
        let batch = ((f64::from(capacity) * self.eviction_batch_ratio).ceil() as u32).max(1);
        let target = match urgency {
            EvictUrgency::Complete => capacity,
            _ => preferred_count.max(batch),
        };
        let rounds = match urgency {
            EvictUrgency::Normal => 1,
            _ => EVICT_MAX_ROUNDS,
        };

        let mut stats = EvictStats::default();
        for round in 0..rounds {
            let mut progressed = false;
            for _ in 0..capacity {
                guard.hand = if guard.hand >= capacity { 1 } else { guard.hand + 1 };
                let idx = FrameId::new(guard.hand);
                if self.try_evict_frame(idx, urgency, &mut stats)? {
                    progressed = true;
                }
                if stats.evicted >= target && urgency != EvictUrgency::Complete {
                    debug!(
                        target: "basalt.bufpool",
                        evicted = stats.evicted, unswizzled = stats.unswizzled, round,
                        "eviction batch done"
                    );
                    return Ok(stats);
                }
            }
            if !progressed {
                break;
            }
        }
        debug!(
            target: "basalt.bufpool",
            evicted = stats.evicted, unswizzled = stats.unswizzled, ?urgency,
            "eviction sweep ended"
        );
        Ok(stats)
    }

    /// Attempt to evict one frame. Every step is conditional; any conflict
    /// means skip, the sweep moves on.
    fn try_evict_frame(
        &self,
        idx: FrameId,
        urgency: EvictUrgency,
        stats: &mut EvictStats,
    ) -> Result<bool> {
        let frame = self.frame_ref(idx);
        let cb = &frame.cb;
        if !cb.is_used() || cb.is_in_doubt() {
            return Ok(false);
        }
        // Second-chance: hot pages decay instead of going out.
        if urgency == EvictUrgency::Normal && cb.refcount() > 0 {
            cb.decay();
            return Ok(false);
        }
        if !frame.latch.try_exclusive() {
            return Ok(false);
        }

        match self.try_evict_latched(idx, urgency, stats) {
            Ok(true) => Ok(true),
            // Not evicted (or failed): the victim latch is still ours.
            other => {
                frame.latch.release_exclusive();
                other
            }
        }
    }

    /// Steps 2..7 with the victim's exclusive latch held. On success the
    /// victim latch has been released and the frame freed.
    fn try_evict_latched(
        &self,
        idx: FrameId,
        urgency: EvictUrgency,
        stats: &mut EvictStats,
    ) -> Result<bool> {
        let frame = self.frame_ref(idx);
        let cb = &frame.cb;

        // Victims holding swizzled pointers to children: skip, or strip them
        // first when urgent.
        if cb.swizzled_children() > 0 || self.frame_page_has_swizzled(idx) {
            if urgency < EvictUrgency::Urgent {
                return Ok(false);
            }
            let count = frame.with_page(|p| p.child_count());
            for slot in 0..count {
                if self.unswizzle_slot(idx, slot) {
                    stats.unswizzled += 1;
                }
            }
        }

        // Leaves only, unless urgency permits inner nodes.
        let is_leaf = frame.with_page(|p| p.child_count() == 0);
        if !is_leaf && urgency < EvictUrgency::Urgent {
            return Ok(false);
        }

        // The parent hint must be valid; revalidate under its latch.
        let parent_idx = cb.parent();
        if parent_idx.is_null() || parent_idx == idx {
            return Ok(false);
        }
        let parent = self.frame_ref(parent_idx);
        let parent_exclusive = urgency >= EvictUrgency::Urgent;
        let parent_latched = if parent_exclusive {
            parent.latch.try_exclusive()
        } else {
            parent.latch.try_shared()
        };
        if !parent_latched {
            return Ok(false);
        }

        let outcome = self.try_evict_with_parent(idx, parent_idx, parent_exclusive, stats);
        if parent_exclusive {
            parent.latch.release_exclusive();
        } else {
            parent.latch.release_shared();
        }
        outcome
    }

    fn try_evict_with_parent(
        &self,
        idx: FrameId,
        parent_idx: FrameId,
        parent_exclusive: bool,
        stats: &mut EvictStats,
    ) -> Result<bool> {
        let frame = self.frame_ref(idx);
        let parent = self.frame_ref(parent_idx);
        let cb = &frame.cb;
        let (vol, pid) = (cb.vol(), cb.pid());

        // Locate the child slot in the parent; a stale hint means skip.
        let swizzled_form = basalt_types::PageId::swizzled(idx);
        let slot = parent.with_page(|p| {
            p.find_child(swizzled_form).or_else(|| p.find_child(pid))
        });
        let Some(slot) = slot else { return Ok(false) };

        // A swizzled slot still present here means the pointer pin is live;
        // strip it now (requires the parent exclusive) or give up.
        let slot_swizzled = parent.with_page(|p| p.child(slot).is_swizzled());
        if slot_swizzled {
            if !parent_exclusive {
                return Ok(false);
            }
            if self.unswizzle_slot(parent_idx, slot) {
                stats.unswizzled += 1;
            }
        }

        // Claim the frame: no pins, and no fix may land afterwards.
        if !cb.try_mark_evicting() {
            return Ok(false);
        }

        // From here on, an error must relinquish the eviction claim so the
        // frame stays fixable.
        let staged: Result<()> = (|| {
            let reclaim_only =
                frame.with_page(|p| p.flags().contains(PageFlags::TO_BE_DELETED));
            if cb.is_dirty() && !reclaim_only {
                // Write-ahead: last update durable, then the image goes out.
                let page_lsn = cb.page_lsn();
                if !page_lsn.is_null() {
                    self.log.wait_durable(page_lsn.advance(1))?;
                }
                let mut image = frame.snapshot_page();
                for s in 0..image.child_count() {
                    if let Some(child) = image.child(s).frame() {
                        image.set_child(s, self.frame_ref(child).cb.pid());
                    }
                }
                let volume = self.volume(vol)?;
                volume.device().write_page(pid, &image.encode())?;
                cb.clear_dirty();
            }

            // Bring the parent's expected-minimum LSN up to the child's page
            // LSN so single-page recovery knows how far to roll. One system
            // record, non-transactional.
            let child_lsn = cb.page_lsn();
            let old_emlsn = parent.with_page(|p| p.child_emlsn(slot));
            if old_emlsn < child_lsn {
                let rec = LogRecord::system(
                    parent.cb.vol(),
                    parent.cb.pid(),
                    LogPayload::ChildEmlsn { slot: slot as u16, emlsn: child_lsn },
                );
                let lsn = self.append_sys_record(rec)?;
                parent.with_page_mut(|p| {
                    p.set_child_emlsn(slot, child_lsn);
                    p.set_lsn(lsn);
                });
                parent.cb.set_page_lsn(lsn);
                parent.cb.set_dirty();
                trace!(
                    target: "basalt.bufpool",
                    parent = %parent_idx, child = %idx, emlsn = %child_lsn,
                    "child emlsn updated before eviction"
                );
            }
            Ok(())
        })();
        if let Err(e) = staged {
            cb.clear_evicting();
            return Err(e);
        }

        // Unhook and free.
        let key = cb.key();
        self.remove_resident(key, idx);
        frame.latch.release_exclusive();
        cb.reset();
        self.add_free_frame(idx);
        stats.evicted += 1;
        BP_EVICTIONS_TOTAL.fetch_add(1, Ordering::Relaxed);
        trace!(target: "basalt.bufpool", frame = %idx, vol = %vol, pid = %pid, "evicted");
        Ok(true)
    }

    fn frame_page_has_swizzled(&self, idx: FrameId) -> bool {
        self.frame_ref(idx)
            .with_page(|p| (0..p.child_count()).any(|i| p.child(i).is_swizzled()))
    }
}
