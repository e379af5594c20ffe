//! The fixed-size page image and its wire codec.
//!
//! A page is 8 KiB on disk. The header carries the identity of the page and
//! the LSN of its last update; the body is split into a fixed array of child
//! pointer slots (each pairing a child page id with the expected-minimum LSN
//! the parent vouches for) and an opaque payload region owned by the record
//! layer.
//!
//! # Layout
//!
//! ```text
//! [0..8)    xxh3 checksum of bytes [8..8192)
//! [8..12)   volume id
//! [12..16)  page id (never swizzled on disk)
//! [16..20)  store id
//! [20..22)  flags
//! [22..24)  child count
//! [24..32)  page LSN
//! [32..416) 32 child slots × (pid u32 + emlsn u64)
//! [416..)   payload
//! ```

use std::fmt;

use xxhash_rust::xxh3::xxh3_64;

use crate::{Lsn, PageId, StoreId, VolumeId};

/// Size of one page on disk and in a buffer frame.
pub const PAGE_SIZE: usize = 8192;

/// Number of child-pointer slots in a page.
pub const MAX_CHILD_SLOTS: usize = 32;

const HEADER_SIZE: usize = 32;
const CHILD_SLOT_SIZE: usize = 12;
const CHILD_AREA: usize = MAX_CHILD_SLOTS * CHILD_SLOT_SIZE;

/// Bytes available to the record layer.
pub const PAGE_PAYLOAD_SIZE: usize = PAGE_SIZE - HEADER_SIZE - CHILD_AREA;

// ---------------------------------------------------------------------------
// PageFlags
// ---------------------------------------------------------------------------

/// Page header flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[repr(transparent)]
pub struct PageFlags(u16);

impl PageFlags {
    /// The page is scheduled for deletion; the cleaner reclaims it instead of
    /// writing it back.
    pub const TO_BE_DELETED: Self = Self(1 << 0);
    /// Recovery analysis saw the page in the log but its image is not loaded.
    pub const IN_DOUBT: Self = Self(1 << 1);
    /// The frame holds (or is reserved for) a live page.
    pub const USED: Self = Self(1 << 2);
    /// The in-memory image differs from disk.
    pub const DIRTY: Self = Self(1 << 3);
    /// The page is being accessed by the recovery driver.
    pub const RECOVERY_ACCESS: Self = Self(1 << 4);

    #[inline]
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    #[inline]
    #[must_use]
    pub const fn bits(self) -> u16 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

// ---------------------------------------------------------------------------
// Page
// ---------------------------------------------------------------------------

/// Errors from the page codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageDecodeError {
    /// Input was not exactly [`PAGE_SIZE`] bytes.
    WrongLength { actual: usize },
    /// Stored checksum does not match the recomputed one.
    BadChecksum { stored: u64, computed: u64 },
    /// A payload patch fell outside the payload region.
    PatchOutOfBounds { offset: usize, len: usize },
}

impl fmt::Display for PageDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WrongLength { actual } => {
                write!(f, "page image has {actual} bytes, expected {PAGE_SIZE}")
            }
            Self::BadChecksum { stored, computed } => {
                write!(f, "page checksum mismatch: stored {stored:#x}, computed {computed:#x}")
            }
            Self::PatchOutOfBounds { offset, len } => {
                write!(f, "payload patch [{offset}, {offset}+{len}) out of bounds")
            }
        }
    }
}

impl std::error::Error for PageDecodeError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct ChildSlot {
    pid: PageId,
    emlsn: Lsn,
}

/// One 8 KiB page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    vol: VolumeId,
    pid: PageId,
    store: StoreId,
    flags: PageFlags,
    lsn: Lsn,
    child_count: u16,
    children: [ChildSlot; MAX_CHILD_SLOTS],
    payload: Box<[u8; PAGE_PAYLOAD_SIZE]>,
}

impl Default for Page {
    fn default() -> Self {
        Self::empty()
    }
}

impl Page {
    /// A zeroed page with null identity, used to initialize frames.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(VolumeId::new(0), PageId::NULL, StoreId::RESERVED)
    }

    /// A fresh zeroed page with the given identity.
    #[must_use]
    pub fn new(vol: VolumeId, pid: PageId, store: StoreId) -> Self {
        debug_assert!(!pid.is_swizzled());
        Self {
            vol,
            pid,
            store,
            flags: PageFlags::empty(),
            lsn: Lsn::NULL,
            child_count: 0,
            children: [ChildSlot::default(); MAX_CHILD_SLOTS],
            payload: Box::new([0u8; PAGE_PAYLOAD_SIZE]),
        }
    }

    // --- identity ---

    #[inline]
    #[must_use]
    pub fn vol(&self) -> VolumeId {
        self.vol
    }

    #[inline]
    #[must_use]
    pub fn pid(&self) -> PageId {
        self.pid
    }

    #[inline]
    #[must_use]
    pub fn store(&self) -> StoreId {
        self.store
    }

    pub fn set_identity(&mut self, vol: VolumeId, pid: PageId, store: StoreId) {
        debug_assert!(!pid.is_swizzled());
        self.vol = vol;
        self.pid = pid;
        self.store = store;
    }

    #[inline]
    #[must_use]
    pub fn lsn(&self) -> Lsn {
        self.lsn
    }

    #[inline]
    pub fn set_lsn(&mut self, lsn: Lsn) {
        self.lsn = lsn;
    }

    #[inline]
    #[must_use]
    pub fn flags(&self) -> PageFlags {
        self.flags
    }

    #[inline]
    pub fn flags_mut(&mut self) -> &mut PageFlags {
        &mut self.flags
    }

    // --- child slots ---

    #[inline]
    #[must_use]
    pub fn child_count(&self) -> usize {
        self.child_count as usize
    }

    pub fn set_child_count(&mut self, count: usize) {
        assert!(count <= MAX_CHILD_SLOTS);
        self.child_count = count as u16;
    }

    #[inline]
    #[must_use]
    pub fn child(&self, slot: usize) -> PageId {
        self.children[slot].pid
    }

    #[inline]
    pub fn set_child(&mut self, slot: usize, pid: PageId) {
        self.children[slot].pid = pid;
    }

    #[inline]
    #[must_use]
    pub fn child_emlsn(&self, slot: usize) -> Lsn {
        self.children[slot].emlsn
    }

    #[inline]
    pub fn set_child_emlsn(&mut self, slot: usize, emlsn: Lsn) {
        self.children[slot].emlsn = emlsn;
    }

    /// Append a child pointer, returning its slot.
    pub fn push_child(&mut self, pid: PageId) -> usize {
        let slot = self.child_count();
        self.set_child_count(slot + 1);
        self.children[slot] = ChildSlot { pid, emlsn: Lsn::NULL };
        slot
    }

    /// Find the slot holding exactly `pid` (bit-exact; a swizzled pointer
    /// does not match its disk id here).
    #[must_use]
    pub fn find_child(&self, pid: PageId) -> Option<usize> {
        (0..self.child_count()).find(|&i| self.children[i].pid == pid)
    }

    // --- payload ---

    #[inline]
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload[..]
    }

    #[inline]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.payload[..]
    }

    /// Overwrite payload bytes at `offset`. Used by log REDO.
    pub fn patch_payload(&mut self, offset: usize, bytes: &[u8]) -> Result<(), PageDecodeError> {
        let end = offset.checked_add(bytes.len()).filter(|&e| e <= PAGE_PAYLOAD_SIZE);
        let Some(end) = end else {
            return Err(PageDecodeError::PatchOutOfBounds { offset, len: bytes.len() });
        };
        self.payload[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    // --- codec ---

    /// Serialize to the fixed on-disk image, computing the checksum.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; PAGE_SIZE];
        buf[8..12].copy_from_slice(&self.vol.get().to_le_bytes());
        buf[12..16].copy_from_slice(&self.pid.bits().to_le_bytes());
        buf[16..20].copy_from_slice(&self.store.get().to_le_bytes());
        buf[20..22].copy_from_slice(&self.flags.bits().to_le_bytes());
        buf[22..24].copy_from_slice(&self.child_count.to_le_bytes());
        buf[24..32].copy_from_slice(&self.lsn.data().to_le_bytes());
        for (i, slot) in self.children.iter().enumerate() {
            let at = HEADER_SIZE + i * CHILD_SLOT_SIZE;
            buf[at..at + 4].copy_from_slice(&slot.pid.bits().to_le_bytes());
            buf[at + 4..at + 12].copy_from_slice(&slot.emlsn.data().to_le_bytes());
        }
        buf[HEADER_SIZE + CHILD_AREA..].copy_from_slice(&self.payload[..]);
        let sum = xxh3_64(&buf[8..]);
        buf[..8].copy_from_slice(&sum.to_le_bytes());
        buf
    }

    /// Deserialize, verifying length and checksum.
    pub fn decode(bytes: &[u8]) -> Result<Self, PageDecodeError> {
        if bytes.len() != PAGE_SIZE {
            return Err(PageDecodeError::WrongLength { actual: bytes.len() });
        }
        let stored = u64::from_le_bytes(bytes[..8].try_into().expect("8 bytes"));
        let computed = xxh3_64(&bytes[8..]);
        if stored != computed {
            return Err(PageDecodeError::BadChecksum { stored, computed });
        }
        Ok(Self::decode_unchecked(bytes))
    }

    /// Deserialize without checksum verification. Recovery paths use this to
    /// inspect an image that is known (or suspected) to be damaged.
    ///
    /// # Panics
    ///
    /// Panics if `bytes` is not exactly [`PAGE_SIZE`] long.
    #[must_use]
    pub fn decode_unchecked(bytes: &[u8]) -> Self {
        assert_eq!(bytes.len(), PAGE_SIZE);
        let mut children = [ChildSlot::default(); MAX_CHILD_SLOTS];
        for (i, slot) in children.iter_mut().enumerate() {
            let at = HEADER_SIZE + i * CHILD_SLOT_SIZE;
            slot.pid = PageId::from_bits(u32::from_le_bytes(
                bytes[at..at + 4].try_into().expect("4 bytes"),
            ));
            slot.emlsn = Lsn::from_data(u64::from_le_bytes(
                bytes[at + 4..at + 12].try_into().expect("8 bytes"),
            ));
        }
        let mut payload = Box::new([0u8; PAGE_PAYLOAD_SIZE]);
        payload.copy_from_slice(&bytes[HEADER_SIZE + CHILD_AREA..]);
        Self {
            vol: VolumeId::new(u32::from_le_bytes(bytes[8..12].try_into().expect("4 bytes"))),
            pid: PageId::from_bits(u32::from_le_bytes(
                bytes[12..16].try_into().expect("4 bytes"),
            )),
            store: StoreId::new(u32::from_le_bytes(bytes[16..20].try_into().expect("4 bytes"))),
            flags: PageFlags::from_bits(u16::from_le_bytes(
                bytes[20..22].try_into().expect("2 bytes"),
            )),
            child_count: u16::from_le_bytes(bytes[22..24].try_into().expect("2 bytes")),
            children,
            lsn: Lsn::from_data(u64::from_le_bytes(bytes[24..32].try_into().expect("8 bytes"))),
            payload,
        }
    }

    /// Whether a raw image's stored checksum matches its contents.
    #[must_use]
    pub fn checksum_ok(bytes: &[u8]) -> bool {
        if bytes.len() != PAGE_SIZE {
            return false;
        }
        let stored = u64::from_le_bytes(bytes[..8].try_into().expect("8 bytes"));
        stored == xxh3_64(&bytes[8..])
    }
}
