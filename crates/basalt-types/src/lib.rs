//! Identifier newtypes, log sequence numbers, and the fixed-size page image
//! shared by every basalt crate.
//!
//! The types here are deliberately small and dependency-free: everything that
//! touches a page, a frame, or the log speaks in terms of this crate.

pub mod align;
pub mod options;
pub mod page;

pub use align::{CACHE_LINE_BYTES, CacheAligned};
pub use options::EngineOptions;
pub use page::{
    MAX_CHILD_SLOTS, PAGE_PAYLOAD_SIZE, PAGE_SIZE, Page, PageDecodeError, PageFlags,
};

use std::fmt;

// ---------------------------------------------------------------------------
// PageId
// ---------------------------------------------------------------------------

/// Bit set in a [`PageId`] when the value is a buffer-frame index rather than
/// an on-disk page id.
pub const SWIZZLED_PID_BIT: u32 = 0x8000_0000;

/// A 32-bit page identifier.
///
/// The high bit distinguishes the two encodings: clear means an on-disk page
/// id, set means the low 31 bits are the index of the buffer frame currently
/// holding the page (a *swizzled* pointer). Swizzled values only ever exist
/// inside resident parent pages; they are converted back to disk ids before a
/// page image is written out.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, serde::Serialize, serde::Deserialize)]
#[repr(transparent)]
pub struct PageId(u32);

impl PageId {
    /// The null page id. No real page has id 0.
    pub const NULL: Self = Self(0);

    /// Wrap a raw on-disk page id. The swizzle bit must be clear.
    #[inline]
    #[must_use]
    pub const fn new(pid: u32) -> Self {
        debug_assert!(pid & SWIZZLED_PID_BIT == 0);
        Self(pid)
    }

    /// Build a swizzled pointer referring to `frame`.
    #[inline]
    #[must_use]
    pub const fn swizzled(frame: FrameId) -> Self {
        Self(frame.0 | SWIZZLED_PID_BIT)
    }

    /// Reconstruct from raw bits (either encoding). Used by the page codec.
    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// The raw 32-bit value, including the swizzle bit if set.
    #[inline]
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// True when this value encodes a frame index.
    #[inline]
    #[must_use]
    pub const fn is_swizzled(self) -> bool {
        self.0 & SWIZZLED_PID_BIT != 0
    }

    /// The frame index, if this is a swizzled pointer.
    #[inline]
    #[must_use]
    pub const fn frame(self) -> Option<FrameId> {
        if self.is_swizzled() {
            Some(FrameId(self.0 & !SWIZZLED_PID_BIT))
        } else {
            None
        }
    }

    /// True for the null id.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_swizzled() {
            write!(f, "PageId(frame {})", self.0 & !SWIZZLED_PID_BIT)
        } else {
            write!(f, "PageId({})", self.0)
        }
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_swizzled() {
            write!(f, "@{}", self.0 & !SWIZZLED_PID_BIT)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

// ---------------------------------------------------------------------------
// FrameId
// ---------------------------------------------------------------------------

/// Index of a slot in the buffer pool. Index 0 is reserved as null.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct FrameId(u32);

impl FrameId {
    /// The reserved null frame.
    pub const NULL: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn new(idx: u32) -> Self {
        Self(idx)
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// VolumeId / StoreId / TxnId
// ---------------------------------------------------------------------------

/// Identifier of a mounted volume.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct VolumeId(u32);

impl VolumeId {
    #[inline]
    #[must_use]
    pub const fn new(vid: u32) -> Self {
        Self(vid)
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a store (a named B-tree) within a volume. Store 0 is
/// reserved; the store-node page uses it to mean "no store".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct StoreId(u32);

impl StoreId {
    pub const RESERVED: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn new(snum: u32) -> Self {
        Self(snum)
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction identifier, allocated in ascending order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct TxnId(u64);

impl TxnId {
    pub const NULL: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn new(tid: u64) -> Self {
        Self(tid)
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Lsn
// ---------------------------------------------------------------------------

/// A log sequence number: log partition in the high 32 bits, byte offset
/// within the partition in the low 32 bits.
///
/// Total order over (partition, offset); `Lsn::NULL` sorts before every real
/// position.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
#[repr(transparent)]
pub struct Lsn(u64);

impl Lsn {
    /// The null LSN, before the start of the log.
    pub const NULL: Self = Self(0);

    /// Largest representable LSN, used as an "infinite" recovery bound.
    pub const MAX: Self = Self(u64::MAX);

    #[inline]
    #[must_use]
    pub const fn new(partition: u32, offset: u32) -> Self {
        Self(((partition as u64) << 32) | offset as u64)
    }

    #[inline]
    #[must_use]
    pub const fn from_data(data: u64) -> Self {
        Self(data)
    }

    #[inline]
    #[must_use]
    pub const fn data(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn partition(self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[inline]
    #[must_use]
    pub const fn offset(self) -> u32 {
        self.0 as u32
    }

    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// The LSN `bytes` further into the same partition.
    #[inline]
    #[must_use]
    pub const fn advance(self, bytes: u32) -> Self {
        Self(self.0 + bytes as u64)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.partition(), self.offset())
    }
}

// ---------------------------------------------------------------------------
// Resident-table key
// ---------------------------------------------------------------------------

/// Key under which a resident page is registered: `(volume << 32) | page`.
///
/// Never built from a swizzled id — swizzled children are resolved without a
/// table lookup.
#[inline]
#[must_use]
pub fn resident_key(vol: VolumeId, pid: PageId) -> u64 {
    debug_assert!(!pid.is_swizzled());
    (u64::from(vol.get()) << 32) | u64::from(pid.bits())
}
