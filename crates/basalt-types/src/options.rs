//! Engine configuration.

/// Tunables for the buffer pool, log, and transaction subsystems.
///
/// Construct with [`EngineOptions::default`] and adjust fields, then call
/// [`validated`](EngineOptions::validated) to clamp out-of-range values.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Number of buffer frames (index 0 is reserved, so usable capacity is
    /// one less). Default: 1024.
    pub bufferpool_frames: usize,

    /// Master switch for swizzling of non-root child pointers.
    pub enable_swizzling: bool,

    /// Fraction of the pool one eviction call tries to free. Default: 0.01.
    pub eviction_batch_ratio: f64,

    /// Cap on the per-frame reference counter. Small on purpose: the counter
    /// only needs enough resolution to separate cold pages from hot ones.
    /// Default: 16.
    pub max_refcount: u16,

    /// In-memory log buffer segment size in bytes. Default: 1 MiB.
    pub log_buffer_size: usize,

    /// Target size of one log partition file in bytes. Default: 16 MiB.
    pub log_partition_size: u64,

    /// Total log space the reservation ledger will hand out before
    /// `OutOfLogSpace`. Default: 64 MiB.
    pub log_space_limit: u64,

    /// Number of consolidation-array slots open for joins at any time.
    /// Default: 5.
    pub carray_active_slots: usize,

    /// Background cleaner sweep interval in milliseconds; 0 disables the
    /// cleaner thread. Default: 250.
    pub cleaner_interval_ms: u64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            bufferpool_frames: 1024,
            enable_swizzling: true,
            eviction_batch_ratio: 0.01,
            max_refcount: 16,
            log_buffer_size: 1 << 20,
            log_partition_size: 16 << 20,
            log_space_limit: 64 << 20,
            carray_active_slots: 5,
            cleaner_interval_ms: 250,
        }
    }
}

impl EngineOptions {
    /// Clamp values into workable ranges.
    #[must_use]
    pub fn validated(mut self) -> Self {
        if self.bufferpool_frames < 8 {
            self.bufferpool_frames = 8;
        }
        if !(0.001..=1.0).contains(&self.eviction_batch_ratio) {
            self.eviction_batch_ratio = 0.01;
        }
        if self.max_refcount == 0 {
            self.max_refcount = 16;
        }
        if self.log_buffer_size < 64 << 10 {
            self.log_buffer_size = 64 << 10;
        }
        if self.log_partition_size < self.log_buffer_size as u64 {
            self.log_partition_size = self.log_buffer_size as u64;
        }
        if self.carray_active_slots == 0 {
            self.carray_active_slots = 1;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_already_valid() {
        let opts = EngineOptions::default();
        let clamped = opts.clone().validated();
        assert_eq!(opts.bufferpool_frames, clamped.bufferpool_frames);
        assert_eq!(opts.max_refcount, clamped.max_refcount);
    }

    #[test]
    fn validated_clamps_nonsense() {
        let opts = EngineOptions {
            bufferpool_frames: 0,
            eviction_batch_ratio: 7.5,
            max_refcount: 0,
            log_buffer_size: 1,
            log_partition_size: 0,
            carray_active_slots: 0,
            ..EngineOptions::default()
        }
        .validated();
        assert_eq!(opts.bufferpool_frames, 8);
        assert!((opts.eviction_batch_ratio - 0.01).abs() < f64::EPSILON);
        assert_eq!(opts.max_refcount, 16);
        assert!(opts.log_partition_size >= opts.log_buffer_size as u64);
        assert_eq!(opts.carray_active_slots, 1);
    }
}
